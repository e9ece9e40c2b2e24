//! 流量上报相关类型
//!
//! 代理进程的统计计数器按 `inbound>>>tag>>>traffic>>>uplink` 的格式命名，
//! 这里把它们聚合成面板使用的增量记录。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::control::StatCounter;

/// 单条流量增量
///
/// `email` 非空时表示入站内某个客户端的流量；
/// `tag` 为空时按 email 在所有入站里查找客户端。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficReport {
    #[serde(default)]
    pub tag: String,
    #[serde(rename = "isInbound", default)]
    pub is_inbound: bool,
    #[serde(rename = "isOutbound", default)]
    pub is_outbound: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub up: i64,
    pub down: i64,
}

impl TrafficReport {
    pub fn inbound(tag: impl Into<String>, up: i64, down: i64) -> Self {
        Self {
            tag: tag.into(),
            is_inbound: true,
            up,
            down,
            ..Default::default()
        }
    }

    pub fn outbound(tag: impl Into<String>, up: i64, down: i64) -> Self {
        Self {
            tag: tag.into(),
            is_outbound: true,
            up,
            down,
            ..Default::default()
        }
    }

    pub fn client(tag: impl Into<String>, email: impl Into<String>, up: i64, down: i64) -> Self {
        Self {
            tag: tag.into(),
            is_inbound: true,
            email: Some(email.into()),
            up,
            down,
            ..Default::default()
        }
    }
}

#[derive(Clone, Hash, PartialEq, Eq)]
enum StatKey {
    Inbound(String),
    Outbound(String),
    User(String),
}

/// 把原始计数器聚合为流量增量
///
/// 无法识别的名称会被忽略；零流量的条目不输出。
pub fn parse_stats(counters: &[StatCounter]) -> Vec<TrafficReport> {
    let mut order: Vec<StatKey> = Vec::new();
    let mut totals: HashMap<StatKey, (i64, i64)> = HashMap::new();

    for counter in counters {
        let parts: Vec<&str> = counter.name.split(">>>").collect();
        if parts.len() != 4 || parts[2] != "traffic" || parts[1].is_empty() {
            tracing::debug!("忽略无法识别的统计项: {}", counter.name);
            continue;
        }
        let key = match parts[0] {
            "inbound" => StatKey::Inbound(parts[1].to_string()),
            "outbound" => StatKey::Outbound(parts[1].to_string()),
            "user" => StatKey::User(parts[1].to_string()),
            _ => continue,
        };
        let is_up = match parts[3] {
            "uplink" => true,
            "downlink" => false,
            _ => continue,
        };

        if !totals.contains_key(&key) {
            order.push(key.clone());
        }
        let entry = totals.entry(key).or_insert((0, 0));
        if is_up {
            entry.0 += counter.value;
        } else {
            entry.1 += counter.value;
        }
    }

    order
        .into_iter()
        .filter_map(|key| {
            let (up, down) = totals.get(&key).copied()?;
            if up == 0 && down == 0 {
                return None;
            }
            Some(match key {
                StatKey::Inbound(tag) => TrafficReport::inbound(tag, up, down),
                StatKey::Outbound(tag) => TrafficReport::outbound(tag, up, down),
                StatKey::User(email) => TrafficReport::client(String::new(), email, up, down),
            })
        })
        .collect()
}
