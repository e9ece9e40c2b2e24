//! 入站内客户端的增删改与流量重置

use chrono::Utc;
use common::protocol::control::AlterInboundOp;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use tracing::{info, warn};

use super::{
    delete_client_row, find_client_row, load_inbound, update_client_row, upsert_client_row,
    ConfigStore, ALL_INBOUNDS,
};
use crate::client_codec::{Client, ClientPatch, ClientSet};
use crate::entity::{client_traffic, inbound, ClientTraffic, Inbound};
use crate::error::{ServiceError, ServiceResult};
use crate::notify::PanelEvent;
use crate::restart_policy::{classify, Change};

impl ConfigStore {
    /// 向入站追加客户端，返回 (客户端, need_restart)
    pub async fn add_inbound_client(&self, inbound_id: i64, client: Client) -> ServiceResult<(Client, bool)> {
        let txn = self.db.begin_write().await?;
        let model = load_inbound(txn.conn(), inbound_id).await?;
        let mut set = ClientSet::parse(model.protocol, &model.settings)?;
        set.add(client.clone())?;

        save_settings(txn.conn(), model.clone(), &set).await?;
        let row = upsert_client_row(txn.conn(), inbound_id, &client).await?;

        self.cache.invalidate(inbound_id).await;
        txn.commit().await?;
        self.cache.invalidate(inbound_id).await;
        info!("✅ 入站 #{} 新增客户端: {}", inbound_id, client.email);

        let mut need_restart = classify(&Change::Client).requires_restart();
        if model.enable && client.enable && row.enable && !need_restart {
            let op = AlterInboundOp::AddUser(set.user_account(&client));
            need_restart = self.alter_or_flag(&model.tag, &op).await;
        }

        self.notifier.notify(PanelEvent::ClientAdded {
            inbound_id,
            email: client.email.clone(),
        });
        Ok((client, need_restart))
    }

    /// 按 email 合并更新客户端
    pub async fn update_inbound_client(
        &self,
        inbound_id: i64,
        label: &str,
        patch: &ClientPatch,
    ) -> ServiceResult<(Client, bool)> {
        let txn = self.db.begin_write().await?;
        let model = load_inbound(txn.conn(), inbound_id).await?;
        let mut set = ClientSet::parse(model.protocol, &model.settings)?;
        let (old, new) = set.update(label, patch)?;

        let was_live = old.enable
            && find_client_row(txn.conn(), inbound_id, &old.email)
                .await?
                .map_or(true, |row| row.enable);
        save_settings(txn.conn(), model.clone(), &set).await?;
        let row = update_client_row(txn.conn(), inbound_id, &old.email, &new).await?;

        self.cache.invalidate(inbound_id).await;
        txn.commit().await?;
        self.cache.invalidate(inbound_id).await;
        info!("✅ 入站 #{} 客户端已更新: {}", inbound_id, new.email);

        let mut need_restart = classify(&Change::Client).requires_restart();
        if model.enable && !need_restart {
            if was_live {
                let op = AlterInboundOp::RemoveUser {
                    email: old.email.clone(),
                };
                need_restart = self.alter_or_flag(&model.tag, &op).await;
            }
            if !need_restart && new.enable && row.enable {
                let op = AlterInboundOp::AddUser(set.user_account(&new));
                need_restart = self.alter_or_flag(&model.tag, &op).await;
            }
        }

        self.notifier.notify(PanelEvent::ClientUpdated {
            inbound_id,
            email: new.email.clone(),
        });
        Ok((new, need_restart))
    }

    /// 按 email 删除客户端，返回 need_restart
    pub async fn del_inbound_client(&self, inbound_id: i64, label: &str) -> ServiceResult<bool> {
        let txn = self.db.begin_write().await?;
        let model = load_inbound(txn.conn(), inbound_id).await?;
        let mut set = ClientSet::parse(model.protocol, &model.settings)?;
        let removed = set.remove(label)?;

        let was_live = removed.enable
            && find_client_row(txn.conn(), inbound_id, &removed.email)
                .await?
                .map_or(true, |row| row.enable);
        save_settings(txn.conn(), model.clone(), &set).await?;
        delete_client_row(txn.conn(), inbound_id, &removed.email).await?;

        self.cache.invalidate(inbound_id).await;
        txn.commit().await?;
        self.cache.invalidate(inbound_id).await;
        info!("🗑️ 入站 #{} 客户端已删除: {}", inbound_id, removed.email);

        let mut need_restart = classify(&Change::Client).requires_restart();
        if model.enable && was_live && !need_restart {
            let op = AlterInboundOp::RemoveUser {
                email: removed.email.clone(),
            };
            need_restart = self.alter_or_flag(&model.tag, &op).await;
        }

        self.notifier.notify(PanelEvent::ClientDeleted {
            inbound_id,
            email: removed.email,
        });
        Ok(need_restart)
    }

    /// 清零单个客户端的流量，之前因耗尽被移除的客户端会重新热添加
    pub async fn reset_client_traffic(&self, inbound_id: i64, label: &str) -> ServiceResult<bool> {
        let txn = self.db.begin_write().await?;
        let model = load_inbound(txn.conn(), inbound_id).await?;
        let set = ClientSet::parse(model.protocol, &model.settings)?;
        let client = set
            .find(label)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("客户端 {}", label)))?;

        let was_depleted = match find_client_row(txn.conn(), inbound_id, &client.email).await? {
            Some(row) => {
                let was_depleted = !row.enable;
                let mut active: client_traffic::ActiveModel = row.into();
                active.up = Set(0);
                active.down = Set(0);
                active.total = Set(0);
                active.enable = Set(true);
                active.updated_at = Set(Utc::now().naive_utc());
                active.update(txn.conn()).await?;
                was_depleted
            }
            None => {
                upsert_client_row(txn.conn(), inbound_id, &client).await?;
                false
            }
        };

        self.cache.invalidate(inbound_id).await;
        txn.commit().await?;
        info!("🔄 入站 #{} 客户端 {} 流量已重置", inbound_id, client.email);

        let mut need_restart = false;
        if model.enable && client.enable && was_depleted {
            let op = AlterInboundOp::AddUser(set.user_account(&client));
            need_restart = self.alter_or_flag(&model.tag, &op).await;
        }
        Ok(need_restart)
    }

    /// 清零某个入站（`ALL_INBOUNDS` 表示全部）下所有客户端的流量
    pub async fn reset_all_client_traffics(&self, inbound_id: i64) -> ServiceResult<bool> {
        let txn = self.db.begin_write().await?;
        if inbound_id != ALL_INBOUNDS {
            load_inbound(txn.conn(), inbound_id).await?;
        }
        let revived = zero_client_rows(txn.conn(), inbound_id).await?;
        txn.commit().await?;
        info!("🔄 客户端流量已重置: inbound_id={}", inbound_id);

        Ok(self.revive_clients(revived).await)
    }

    /// 清零所有入站及其客户端的流量计数（累计流量 all_time 保留）
    pub async fn reset_all_traffics(&self) -> ServiceResult<bool> {
        let txn = self.db.begin_write().await?;
        Inbound::update_many()
            .col_expr(inbound::Column::Up, Expr::value(0))
            .col_expr(inbound::Column::Down, Expr::value(0))
            .col_expr(inbound::Column::Total, Expr::value(0))
            .exec(txn.conn())
            .await?;
        let revived = zero_client_rows(txn.conn(), ALL_INBOUNDS).await?;
        txn.commit().await?;
        self.cache.clear().await;
        info!("🔄 所有入站流量已重置");

        Ok(self.revive_clients(revived).await)
    }

    async fn revive_clients(&self, revived: Vec<(String, AlterInboundOp)>) -> bool {
        let mut need_restart = false;
        for (tag, op) in revived {
            if self.alter_or_flag(&tag, &op).await {
                need_restart = true;
                break;
            }
        }
        need_restart
    }

    /// 返回是否需要重启
    async fn alter_or_flag(&self, tag: &str, op: &AlterInboundOp) -> bool {
        match self.live.apply_alter_inbound(tag, op).await {
            Ok(()) => false,
            Err(e) => {
                warn!("⚠️ 热更新入站 {} 用户 {} 失败，需要重启代理: {}", tag, op.email(), e);
                true
            }
        }
    }
}

async fn save_settings<C: sea_orm::ConnectionTrait>(
    conn: &C,
    model: inbound::Model,
    set: &ClientSet,
) -> ServiceResult<inbound::Model> {
    let mut active: inbound::ActiveModel = model.into();
    active.settings = Set(set.to_payload());
    active.updated_at = Set(Utc::now().naive_utc());
    Ok(active.update(conn).await?)
}

/// 清零并重新启用客户端流量行，返回需要重新热添加的用户
async fn zero_client_rows<C: sea_orm::ConnectionTrait>(
    conn: &C,
    inbound_id: i64,
) -> ServiceResult<Vec<(String, AlterInboundOp)>> {
    let mut depleted_query = ClientTraffic::find().filter(client_traffic::Column::Enable.eq(false));
    if inbound_id != ALL_INBOUNDS {
        depleted_query = depleted_query.filter(client_traffic::Column::InboundId.eq(inbound_id));
    }
    let depleted = depleted_query.all(conn).await?;

    let mut revived = Vec::new();
    for row in &depleted {
        let Some(model) = Inbound::find_by_id(row.inbound_id).one(conn).await? else {
            continue;
        };
        if !model.enable {
            continue;
        }
        let Ok(set) = ClientSet::parse(model.protocol, &model.settings) else {
            continue;
        };
        if let Some(client) = set.find(&row.email).filter(|c| c.enable) {
            revived.push((model.tag.clone(), AlterInboundOp::AddUser(set.user_account(client))));
        }
    }

    let mut update = ClientTraffic::update_many()
        .col_expr(client_traffic::Column::Up, Expr::value(0))
        .col_expr(client_traffic::Column::Down, Expr::value(0))
        .col_expr(client_traffic::Column::Total, Expr::value(0))
        .col_expr(client_traffic::Column::Enable, Expr::value(true))
        .col_expr(client_traffic::Column::UpdatedAt, Expr::value(Utc::now().naive_utc()));
    if inbound_id != ALL_INBOUNDS {
        update = update.filter(client_traffic::Column::InboundId.eq(inbound_id));
    }
    update.exec(conn).await?;
    Ok(revived)
}
