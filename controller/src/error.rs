//! 核心服务错误类型
//!
//! 面向调用方只暴露四类错误；控制通道错误在服务内部被降级为 needRestart。

use sea_orm::{DbErr, SqlErr};

/// 配置与流量服务的错误
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// 载荷格式错误、端口越界、客户端标签重复等
    #[error("参数校验失败: {0}")]
    Validation(String),

    /// 端口被其他启用的入站占用，或 tag 重复
    #[error("冲突: {0}")]
    Conflict(String),

    /// 目标入站或客户端不存在
    #[error("未找到: {0}")]
    NotFound(String),

    /// 事务失败或存储不可用
    #[error("持久化失败: {0}")]
    Persistence(String),
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

impl From<DbErr> for ServiceError {
    fn from(err: DbErr) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(detail)) => Self::Conflict(detail),
            _ => Self::Persistence(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("JSON 解析失败: {}", err))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// 控制通道调用错误
#[derive(Debug, thiserror::Error)]
pub enum LiveSyncError {
    /// 尚未绑定到代理进程
    #[error("控制通道未绑定")]
    NotBound,

    /// 调用超时
    #[error("控制通道调用超时: {0}")]
    Timeout(String),

    /// 连接失败或代理返回错误
    #[error("控制通道调用失败: {0}")]
    Transport(String),
}

impl LiveSyncError {
    pub fn transport<E: std::fmt::Display>(err: E) -> Self {
        Self::Transport(err.to_string())
    }
}
