//! 控制通道通信协议类型定义
//!
//! 此模块定义了面板和代理进程之间通信的共享类型，
//! 包括 ControlChannel trait、入站/用户载荷以及流量统计结构体。

pub mod control;
pub mod traffic;
