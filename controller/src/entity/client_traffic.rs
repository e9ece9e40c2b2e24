use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 入站内单个客户端的流量计数
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "client_traffic")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[serde(rename = "inboundId")]
    pub inbound_id: i64,
    pub email: String,
    pub enable: bool,
    pub up: i64,
    pub down: i64,
    pub total: i64,
    /// 流量上限（字节），0 表示不限
    #[serde(rename = "trafficLimit")]
    pub traffic_limit: i64,
    /// 到期时间（毫秒时间戳），0 表示永不过期
    #[serde(rename = "expiryTime")]
    pub expiry_time: i64,
    pub reset: i32,
    #[serde(rename = "lastOnline")]
    pub last_online: i64,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Model {
    pub fn is_depleted(&self, now_ms: i64) -> bool {
        let over_traffic = self.traffic_limit > 0 && self.up + self.down >= self.traffic_limit;
        let expired = self.expiry_time > 0 && self.expiry_time <= now_ms;
        over_traffic || expired
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::inbound::Entity",
        from = "Column::InboundId",
        to = "super::inbound::Column::Id",
        on_delete = "Cascade"
    )]
    Inbound,
}

impl Related<super::inbound::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Inbound.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
