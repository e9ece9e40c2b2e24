//! 状态变化通知
//!
//! 核心只负责投递事件，不等待送达；聊天机器人或前端推送在接收端订阅。

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PanelEvent {
    InboundAdded { id: i64, tag: String },
    InboundUpdated { id: i64, tag: String },
    InboundDeleted { id: i64, tag: String },
    InboundDisabled { id: i64, tag: String },
    ClientAdded { inbound_id: i64, email: String },
    ClientUpdated { inbound_id: i64, email: String },
    ClientDeleted { inbound_id: i64, email: String },
    ClientDepleted { inbound_id: i64, email: String },
    RestartRequested,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: PanelEvent);
}

/// 广播到所有订阅者，没有订阅者时直接丢弃
pub struct BroadcastNotifier {
    sender: broadcast::Sender<PanelEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.sender.subscribe()
    }
}

impl NotificationSink for BroadcastNotifier {
    fn notify(&self, event: PanelEvent) {
        let _ = self.sender.send(event);
    }
}

/// 只写日志
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, event: PanelEvent) {
        info!("📣 {:?}", event);
    }
}
