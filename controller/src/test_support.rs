//! 测试用的内存数据库和可记录调用的假控制通道

use async_trait::async_trait;
use common::protocol::control::{AlterInboundOp, InboundConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::db::Datastore;
use crate::error::LiveSyncError;
use crate::live_sync::LiveSync;
use crate::migration::init_memory;

pub async fn memory_datastore() -> Arc<Datastore> {
    let conn = init_memory().await.unwrap();
    Arc::new(Datastore::new(conn, Duration::from_secs(5)))
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveCall {
    AddInbound(String),
    RemoveInbound(String),
    AddUser { tag: String, email: String },
    RemoveUser { tag: String, email: String },
}

#[derive(Default)]
pub struct RecordingLiveSync {
    calls: Mutex<Vec<LiveCall>>,
    fail: AtomicBool,
}

impl RecordingLiveSync {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 之后的调用全部失败
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<LiveCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: LiveCall) -> Result<(), LiveSyncError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(LiveSyncError::Timeout("测试".to_string()));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl LiveSync for RecordingLiveSync {
    async fn apply_add_inbound(&self, inbound: &InboundConfig) -> Result<(), LiveSyncError> {
        self.record(LiveCall::AddInbound(inbound.tag.clone()))
    }

    async fn apply_remove_inbound(&self, tag: &str) -> Result<(), LiveSyncError> {
        self.record(LiveCall::RemoveInbound(tag.to_string()))
    }

    async fn apply_alter_inbound(&self, tag: &str, op: &AlterInboundOp) -> Result<(), LiveSyncError> {
        let call = match op {
            AlterInboundOp::AddUser(user) => LiveCall::AddUser {
                tag: tag.to_string(),
                email: user.email.clone(),
            },
            AlterInboundOp::RemoveUser { email } => LiveCall::RemoveUser {
                tag: tag.to_string(),
                email: email.clone(),
            },
        };
        self.record(call)
    }
}
