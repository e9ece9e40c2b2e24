//! 后台任务：流量拉取与重启检查

use async_trait::async_trait;
use common::protocol::traffic::{parse_stats, TrafficReport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{LiveSyncError, ServiceError};
use crate::live_sync::LiveSyncClient;
use crate::restart::RestartCoordinator;
use crate::traffic::TrafficAccountant;

/// 流量来源
#[async_trait]
pub trait TrafficFeed: Send + Sync {
    async fn pull(&self) -> Result<Vec<TrafficReport>, LiveSyncError>;
}

#[async_trait]
impl TrafficFeed for LiveSyncClient {
    async fn pull(&self) -> Result<Vec<TrafficReport>, LiveSyncError> {
        let counters = self.query_traffic(true).await?;
        Ok(parse_stats(&counters))
    }
}

/// 拉取到的计数器已在代理侧清零，合并失败的批次留到下一轮重试。
/// 存在待重试批次时不再拉取，新增量留在代理侧累积，待重试批次不会无限增长。
pub struct TrafficPoller {
    feed: Arc<dyn TrafficFeed>,
    accountant: Arc<TrafficAccountant>,
    pending: Vec<TrafficReport>,
}

impl TrafficPoller {
    pub fn new(feed: Arc<dyn TrafficFeed>, accountant: Arc<TrafficAccountant>) -> Self {
        Self {
            feed,
            accountant,
            pending: Vec::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// 执行一轮，返回 need_restart
    pub async fn poll_once(&mut self) -> bool {
        if self.pending.is_empty() {
            match self.feed.pull().await {
                Ok(reports) => self.pending = reports,
                Err(LiveSyncError::NotBound) => debug!("控制通道未绑定，跳过流量拉取"),
                Err(e) => warn!("⚠️ 拉取流量失败: {}", e),
            }
        } else {
            debug!("重试 {} 条待合并的流量记录", self.pending.len());
        }
        if self.pending.is_empty() {
            return false;
        }

        match self.accountant.add_traffic(&self.pending).await {
            Ok(need_restart) => {
                self.pending.clear();
                need_restart
            }
            Err(ServiceError::Validation(msg)) => {
                error!("流量数据无效，丢弃 {} 条记录: {}", self.pending.len(), msg);
                self.pending.clear();
                false
            }
            Err(e) => {
                warn!("⚠️ 合并流量失败，{} 条记录留待下次重试: {}", self.pending.len(), e);
                false
            }
        }
    }
}

/// 启动流量拉取后台任务
pub fn start_traffic_poller(
    mut poller: TrafficPoller,
    coordinator: Arc<RestartCoordinator>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if poller.poll_once().await {
                coordinator.request();
            }
        }
    })
}

/// 启动重启检查后台任务
pub fn start_restart_job(coordinator: Arc<RestartCoordinator>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if let Err(e) = coordinator.restart_if_needed().await {
                error!("重启代理失败: {}", e);
            }
        }
    })
}
