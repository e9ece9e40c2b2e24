use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 入站协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[sea_orm(string_value = "vmess")]
    Vmess,
    #[sea_orm(string_value = "vless")]
    Vless,
    #[sea_orm(string_value = "trojan")]
    Trojan,
    #[sea_orm(string_value = "shadowsocks")]
    Shadowsocks,
    #[sea_orm(string_value = "socks")]
    Socks,
    #[sea_orm(string_value = "http")]
    Http,
    #[sea_orm(string_value = "tunnel")]
    Tunnel,
    #[sea_orm(string_value = "wireguard")]
    Wireguard,
    #[sea_orm(string_value = "tun")]
    Tun,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Socks => "socks",
            Protocol::Http => "http",
            Protocol::Tunnel => "tunnel",
            Protocol::Wireguard => "wireguard",
            Protocol::Tun => "tun",
        }
    }

    /// 该协议的 settings 中是否携带由面板管理的客户端列表
    pub fn manages_clients(&self) -> bool {
        matches!(
            self,
            Protocol::Vmess | Protocol::Vless | Protocol::Trojan | Protocol::Shadowsocks
        )
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vmess" => Ok(Protocol::Vmess),
            "vless" => Ok(Protocol::Vless),
            "trojan" => Ok(Protocol::Trojan),
            "shadowsocks" => Ok(Protocol::Shadowsocks),
            "socks" => Ok(Protocol::Socks),
            "http" => Ok(Protocol::Http),
            "tunnel" | "dokodemo-door" => Ok(Protocol::Tunnel),
            "wireguard" => Ok(Protocol::Wireguard),
            "tun" => Ok(Protocol::Tun),
            other => Err(format!("不支持的协议: {}", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inbound")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[serde(rename = "userId")]
    pub user_id: i64,
    pub up: i64,
    pub down: i64,
    pub total: i64,
    #[serde(rename = "allTime")]
    pub all_time: i64,
    pub remark: String,
    pub enable: bool,
    /// 到期时间（毫秒时间戳）
    #[serde(rename = "expiryTime")]
    pub expiry_time: Option<i64>,
    /// 流量上限（字节）
    #[serde(rename = "trafficLimit")]
    pub traffic_limit: Option<i64>,
    pub listen: String,
    pub port: i32,
    pub protocol: Protocol,
    pub settings: String,
    #[serde(rename = "streamSettings")]
    pub stream_settings: String,
    pub tag: String,
    pub sniffing: String,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Model {
    /// 流量或时间额度是否已耗尽
    pub fn is_depleted(&self, now_ms: i64) -> bool {
        let over_traffic = matches!(self.traffic_limit, Some(limit) if limit > 0 && self.up + self.down >= limit);
        let expired = matches!(self.expiry_time, Some(expiry) if expiry > 0 && expiry <= now_ms);
        over_traffic || expired
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::client_traffic::Entity")]
    ClientTraffic,
}

impl Related<super::client_traffic::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ClientTraffic.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
