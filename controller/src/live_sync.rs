//! 运行中代理进程的控制通道封装
//!
//! 核心只依赖三个操作：添加入站、移除入站、修改入站用户。
//! 完整的远程接口（统计查询等）留在 [`ControlChannel`] 后面。

use async_trait::async_trait;
use common::protocol::control::{AlterInboundOp, ControlChannel, InboundConfig, StatCounter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::LiveSyncError;

/// 面向核心的最小热更新接口
#[async_trait]
pub trait LiveSync: Send + Sync {
    async fn apply_add_inbound(&self, inbound: &InboundConfig) -> Result<(), LiveSyncError>;

    async fn apply_remove_inbound(&self, tag: &str) -> Result<(), LiveSyncError>;

    async fn apply_alter_inbound(&self, tag: &str, op: &AlterInboundOp) -> Result<(), LiveSyncError>;
}

/// 建立到代理进程的控制通道
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> anyhow::Result<Arc<dyn ControlChannel>>;
}

#[derive(Default)]
struct BindState {
    endpoint: Option<String>,
    channel: Option<Arc<dyn ControlChannel>>,
}

pub struct LiveSyncClient {
    connector: Arc<dyn ChannelConnector>,
    state: RwLock<BindState>,
    call_timeout: Duration,
}

impl LiveSyncClient {
    pub fn new(connector: Arc<dyn ChannelConnector>, call_timeout: Duration) -> Self {
        Self {
            connector,
            state: RwLock::new(BindState::default()),
            call_timeout,
        }
    }

    /// 连接到指定地址，替换已有的通道；连接失败时仍记住地址，供 rebind 使用
    pub async fn bind(&self, endpoint: &str) -> Result<(), LiveSyncError> {
        {
            let mut state = self.state.write().await;
            state.endpoint = Some(endpoint.to_string());
            state.channel = None;
        }
        let channel = self.connect(endpoint).await?;
        self.state.write().await.channel = Some(channel);
        info!("✅ 控制通道已绑定: {}", endpoint);
        Ok(())
    }

    /// 代理进程重启后重新连接上一次绑定的地址
    pub async fn rebind(&self) -> Result<(), LiveSyncError> {
        let endpoint = {
            let mut state = self.state.write().await;
            // 旧句柄在代理重启后已失效
            state.channel = None;
            state.endpoint.clone().ok_or(LiveSyncError::NotBound)?
        };
        let channel = self.connect(&endpoint).await?;
        self.state.write().await.channel = Some(channel);
        info!("🔄 控制通道已重新绑定: {}", endpoint);
        Ok(())
    }

    /// 释放通道，未绑定时调用也没有副作用
    pub async fn unbind(&self) {
        let mut state = self.state.write().await;
        if state.channel.take().is_some() {
            debug!("控制通道已解绑");
        }
        state.endpoint = None;
    }

    pub async fn is_bound(&self) -> bool {
        self.state.read().await.channel.is_some()
    }

    /// 拉取流量计数器，供流量轮询任务使用
    pub async fn query_traffic(&self, reset: bool) -> Result<Vec<StatCounter>, LiveSyncError> {
        self.call("查询统计", "", |channel| async move { channel.query_stats(reset).await })
            .await
    }

    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ControlChannel>, LiveSyncError> {
        match tokio::time::timeout(self.call_timeout, self.connector.connect(endpoint)).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(e)) => {
                warn!("⚠️ 连接控制通道失败: {} - {}", endpoint, e);
                Err(LiveSyncError::transport(e))
            }
            Err(_) => {
                warn!("⚠️ 连接控制通道超时: {}", endpoint);
                Err(LiveSyncError::Timeout(format!("连接 {}", endpoint)))
            }
        }
    }

    async fn channel(&self) -> Result<Arc<dyn ControlChannel>, LiveSyncError> {
        // 只在克隆句柄时持有锁，远程调用期间不持锁
        self.state
            .read()
            .await
            .channel
            .clone()
            .ok_or(LiveSyncError::NotBound)
    }

    async fn call<T, F, Fut>(&self, what: &str, tag: &str, f: F) -> Result<T, LiveSyncError>
    where
        F: FnOnce(Arc<dyn ControlChannel>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let channel = self.channel().await?;
        debug!("调用控制通道{}: tag={}", what, tag);
        match tokio::time::timeout(self.call_timeout, f(channel)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(LiveSyncError::Transport(format!("{}: {}", what, e))),
            Err(_) => Err(LiveSyncError::Timeout(format!("{} tag={}", what, tag))),
        }
    }
}

#[async_trait]
impl LiveSync for LiveSyncClient {
    async fn apply_add_inbound(&self, inbound: &InboundConfig) -> Result<(), LiveSyncError> {
        self.call("添加入站", &inbound.tag, |channel| async move {
            channel.add_inbound(inbound).await
        })
        .await
    }

    async fn apply_remove_inbound(&self, tag: &str) -> Result<(), LiveSyncError> {
        self.call("移除入站", tag, |channel| async move {
            channel.remove_inbound(tag).await
        })
        .await
    }

    async fn apply_alter_inbound(&self, tag: &str, op: &AlterInboundOp) -> Result<(), LiveSyncError> {
        self.call("修改入站用户", tag, |channel| async move {
            channel.alter_inbound(tag, op).await
        })
        .await
    }
}
