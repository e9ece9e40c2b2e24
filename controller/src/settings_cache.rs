//! 入站 settings 解析结果缓存
//!
//! 每个入站维护一个版本号，写操作先失效再提交。读路径在查库前记下版本号，
//! 回填时版本号已变化就放弃，避免旧数据在失效之后被重新放回缓存。

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::client_codec::ClientSet;

#[derive(Default)]
struct CacheState {
    entries: HashMap<i64, Arc<ClientSet>>,
    generations: HashMap<i64, u64>,
}

#[derive(Default)]
pub struct SettingsCache {
    state: RwLock<CacheState>,
}

impl SettingsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, inbound_id: i64) -> Option<Arc<ClientSet>> {
        self.state.read().await.entries.get(&inbound_id).cloned()
    }

    /// 当前版本号，查库之前调用
    pub async fn generation(&self, inbound_id: i64) -> u64 {
        self.state
            .read()
            .await
            .generations
            .get(&inbound_id)
            .copied()
            .unwrap_or(0)
    }

    /// 版本号未变时才写入，返回是否写入
    pub async fn insert_if_current(&self, inbound_id: i64, generation: u64, set: Arc<ClientSet>) -> bool {
        let mut state = self.state.write().await;
        let current = state.generations.get(&inbound_id).copied().unwrap_or(0);
        if current != generation {
            return false;
        }
        state.entries.insert(inbound_id, set);
        true
    }

    pub async fn invalidate(&self, inbound_id: i64) {
        let mut state = self.state.write().await;
        state.entries.remove(&inbound_id);
        *state.generations.entry(inbound_id).or_insert(0) += 1;
    }

    pub async fn invalidate_many(&self, inbound_ids: &[i64]) {
        let mut state = self.state.write().await;
        for id in inbound_ids {
            state.entries.remove(id);
            *state.generations.entry(*id).or_insert(0) += 1;
        }
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        let ids: Vec<i64> = state.entries.keys().copied().collect();
        state.entries.clear();
        for id in ids {
            *state.generations.entry(id).or_insert(0) += 1;
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }
}
