//! 变更分类：能否通过控制通道热更新，还是必须重启代理进程

use serde_json::Value;

use crate::client_codec::{ClientDiff, ClientSet};
use crate::entity::{inbound, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    HotAppliable,
    RestartRequired,
}

impl Decision {
    pub fn requires_restart(self) -> bool {
        self == Decision::RestartRequired
    }
}

/// 更新前后两个入站的差异
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundDiff {
    pub was_enabled: bool,
    pub now_enabled: bool,
    pub port_changed: bool,
    pub listen_changed: bool,
    pub protocol_changed: bool,
    pub tag_changed: bool,
    pub stream_changed: bool,
    pub sniffing_changed: bool,
    /// clients 以外的 settings 字段变化
    pub settings_changed: bool,
    pub clients: ClientDiff,
}

impl InboundDiff {
    pub fn between(
        old: &inbound::Model,
        new: &inbound::Model,
        old_set: &ClientSet,
        new_set: &ClientSet,
    ) -> Self {
        Self {
            was_enabled: old.enable,
            now_enabled: new.enable,
            port_changed: old.port != new.port,
            listen_changed: old.listen != new.listen,
            protocol_changed: old.protocol != new.protocol,
            tag_changed: old.tag != new.tag,
            stream_changed: !same_json(&old.stream_settings, &new.stream_settings),
            sniffing_changed: !same_json(&old.sniffing, &new.sniffing),
            settings_changed: old_set.non_client_settings() != new_set.non_client_settings(),
            clients: ClientSet::diff(old_set, new_set),
        }
    }

    /// 是否只有客户端列表发生了变化
    pub fn only_clients_changed(&self) -> bool {
        !(self.port_changed
            || self.listen_changed
            || self.protocol_changed
            || self.tag_changed
            || self.stream_changed
            || self.sniffing_changed
            || self.settings_changed)
    }
}

fn same_json(a: &str, b: &str) -> bool {
    match (serde_json::from_str::<Value>(a), serde_json::from_str::<Value>(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a.trim() == b.trim(),
    }
}

pub enum Change<'a> {
    AddInbound { protocol: Protocol, enabled: bool },
    RemoveInbound { was_enabled: bool },
    Client,
    UpdateInbound(&'a InboundDiff),
}

/// 纯函数，不访问任何外部状态
pub fn classify(change: &Change<'_>) -> Decision {
    match change {
        Change::AddInbound { enabled: false, .. } => Decision::HotAppliable,
        // tun 需要创建网卡设备，控制通道无法热添加
        Change::AddInbound {
            protocol: Protocol::Tun,
            ..
        } => Decision::RestartRequired,
        Change::AddInbound { .. } => Decision::HotAppliable,
        Change::RemoveInbound { .. } => Decision::HotAppliable,
        Change::Client => Decision::HotAppliable,
        Change::UpdateInbound(diff) => match (diff.was_enabled, diff.now_enabled) {
            (false, false) => Decision::HotAppliable,
            (false, true) => Decision::RestartRequired,
            (true, false) => Decision::HotAppliable,
            (true, true) if diff.only_clients_changed() => Decision::HotAppliable,
            (true, true) => Decision::RestartRequired,
        },
    }
}
