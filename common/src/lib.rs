//! 面板与代理进程之间共享的协议类型

pub mod protocol;
