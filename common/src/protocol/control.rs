//! 代理控制通道 trait 和相关类型
//!
//! 定义了面板对运行中的代理进程进行热更新的远程接口。

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 下发给代理进程的入站监听配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    pub port: u16,
    pub protocol: String,
    pub settings: Value,
    #[serde(rename = "streamSettings")]
    pub stream_settings: Value,
    pub sniffing: Value,
    pub tag: String,
}

/// 热添加到某个入站的用户账号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub email: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
}

/// 针对单个入站用户集合的变更操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AlterInboundOp {
    AddUser(UserAccount),
    RemoveUser { email: String },
}

impl AlterInboundOp {
    pub fn email(&self) -> &str {
        match self {
            AlterInboundOp::AddUser(user) => &user.email,
            AlterInboundOp::RemoveUser { email } => email,
        }
    }
}

/// 代理进程返回的原始统计计数器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatCounter {
    pub name: String,
    pub value: i64,
}

/// 统计查询响应
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsResponse {
    pub stats: Vec<StatCounter>,
}

/// 代理控制通道接口
///
/// 由代理进程侧的控制服务实现，面板通过 HTTP 远程调用。
/// 所有调用都以入站 tag 定位目标监听器。
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// 探测通道是否可用
    async fn ping(&self) -> Result<()>;

    /// 新增一个入站监听器
    async fn add_inbound(&self, inbound: &InboundConfig) -> Result<()>;

    /// 移除指定 tag 的入站监听器
    async fn remove_inbound(&self, tag: &str) -> Result<()>;

    /// 修改指定 tag 入站的用户集合
    async fn alter_inbound(&self, tag: &str, op: &AlterInboundOp) -> Result<()>;

    /// 查询统计计数器，`reset` 为 true 时读取后清零
    async fn query_stats(&self, reset: bool) -> Result<Vec<StatCounter>>;
}
