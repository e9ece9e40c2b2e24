//! 流量统计合并
//!
//! 一批流量增量在一个事务里合并，任意一条失败整批回滚。
//! 合并本身不做去重：调用方重发已提交的批次会被重复计数。

use chrono::Utc;
use common::protocol::control::AlterInboundOp;
use common::protocol::traffic::TrafficReport;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, NotSet, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config_store::{ci_eq, now_ms};
use crate::db::Datastore;
use crate::entity::{client_traffic, inbound, outbound_traffic, ClientTraffic, Inbound, OutboundTraffic};
use crate::error::{ServiceError, ServiceResult};
use crate::live_sync::LiveSync;
use crate::notify::{NotificationSink, PanelEvent};
use crate::settings_cache::SettingsCache;

/// 重置出站流量时表示"所有 tag"
pub const ALL_TAGS: &str = "-alltags-";

/// 本批次合并后需要停用的对象
#[derive(Default)]
struct Depleted {
    inbounds: Vec<(i64, String)>,
    /// (入站 id, 入站 tag, 客户端 email)
    clients: Vec<(i64, String, String)>,
}

pub struct TrafficAccountant {
    db: Arc<Datastore>,
    cache: Arc<SettingsCache>,
    live: Arc<dyn LiveSync>,
    notifier: Arc<dyn NotificationSink>,
}

impl TrafficAccountant {
    pub fn new(
        db: Arc<Datastore>,
        cache: Arc<SettingsCache>,
        live: Arc<dyn LiveSync>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            db,
            cache,
            live,
            notifier,
        }
    }

    /// 合并一批流量增量，返回 need_restart
    pub async fn add_traffic(&self, reports: &[TrafficReport]) -> ServiceResult<bool> {
        if reports.is_empty() {
            return Ok(false);
        }

        let txn = self.db.begin_write().await?;
        let mut touched_inbounds: Vec<i64> = Vec::new();
        let mut touched_clients: Vec<i64> = Vec::new();

        for report in reports {
            if report.up < 0 || report.down < 0 {
                return Err(ServiceError::validation(format!(
                    "流量增量不能为负: tag={}, up={}, down={}",
                    report.tag, report.up, report.down
                )));
            }
            if report.up == 0 && report.down == 0 {
                continue;
            }

            if report.is_outbound {
                merge_outbound(txn.conn(), &report.tag, report.up, report.down).await?;
            } else if let Some(email) = &report.email {
                if let Some(row) = merge_client(txn.conn(), &report.tag, email, report.up, report.down).await? {
                    if !touched_clients.contains(&row.id) {
                        touched_clients.push(row.id);
                    }
                }
            } else if report.is_inbound {
                if let Some(model) = merge_inbound(txn.conn(), &report.tag, report.up, report.down).await? {
                    if !touched_inbounds.contains(&model.id) {
                        touched_inbounds.push(model.id);
                    }
                }
            } else {
                warn!("忽略无方向的流量记录: tag={}", report.tag);
            }
        }

        let depleted = disable_depleted(txn.conn(), &touched_inbounds, &touched_clients).await?;

        let mut invalidated = touched_inbounds.clone();
        invalidated.extend(depleted.clients.iter().map(|(id, _, _)| *id));
        self.cache.invalidate_many(&invalidated).await;
        txn.commit().await?;
        self.cache.invalidate_many(&invalidated).await;
        debug!("流量合并完成: {} 条记录", reports.len());

        Ok(self.apply_depleted(depleted).await)
    }

    /// 把已停用的入站和客户端从运行中的代理移除
    async fn apply_depleted(&self, depleted: Depleted) -> bool {
        let mut need_restart = false;

        for (id, tag) in depleted.inbounds {
            info!("⚠️ 入站 #{} ({}) 流量或时间已耗尽，已停用", id, tag);
            if !need_restart {
                if let Err(e) = self.live.apply_remove_inbound(&tag).await {
                    warn!("⚠️ 热移除入站 {} 失败，需要重启代理: {}", tag, e);
                    need_restart = true;
                }
            }
            self.notifier.notify(PanelEvent::InboundDisabled { id, tag });
        }

        for (inbound_id, tag, email) in depleted.clients {
            info!("⚠️ 入站 #{} 客户端 {} 流量或时间已耗尽，已停用", inbound_id, email);
            if !need_restart {
                let op = AlterInboundOp::RemoveUser { email: email.clone() };
                if let Err(e) = self.live.apply_alter_inbound(&tag, &op).await {
                    warn!("⚠️ 热移除入站 {} 用户 {} 失败，需要重启代理: {}", tag, email, e);
                    need_restart = true;
                }
            }
            self.notifier.notify(PanelEvent::ClientDepleted { inbound_id, email });
        }

        need_restart
    }

    pub async fn get_outbounds_traffic(&self) -> ServiceResult<Vec<outbound_traffic::Model>> {
        self.db
            .read(
                OutboundTraffic::find()
                    .order_by_asc(outbound_traffic::Column::Id)
                    .all(self.db.conn()),
            )
            .await
    }

    /// 清零指定出站的流量，`ALL_TAGS` 表示全部
    pub async fn reset_outbound_traffic(&self, tag: &str) -> ServiceResult<()> {
        if tag == ALL_TAGS {
            return self.reset_all_traffics().await;
        }
        let txn = self.db.begin_write().await?;
        zero_outbounds()
            .filter(ci_eq(outbound_traffic::Column::Tag, tag))
            .exec(txn.conn())
            .await?;
        txn.commit().await?;
        info!("🔄 出站 {} 流量已重置", tag);
        Ok(())
    }

    /// 一条语句清零所有出站流量
    pub async fn reset_all_traffics(&self) -> ServiceResult<()> {
        let txn = self.db.begin_write().await?;
        zero_outbounds().exec(txn.conn()).await?;
        txn.commit().await?;
        info!("🔄 所有出站流量已重置");
        Ok(())
    }
}

fn zero_outbounds() -> sea_orm::UpdateMany<OutboundTraffic> {
    OutboundTraffic::update_many()
        .col_expr(outbound_traffic::Column::Up, Expr::value(0))
        .col_expr(outbound_traffic::Column::Down, Expr::value(0))
        .col_expr(outbound_traffic::Column::Total, Expr::value(0))
}

async fn merge_outbound<C: ConnectionTrait>(conn: &C, tag: &str, up: i64, down: i64) -> ServiceResult<()> {
    let existing = OutboundTraffic::find()
        .filter(ci_eq(outbound_traffic::Column::Tag, tag))
        .one(conn)
        .await?;

    match existing {
        Some(row) => {
            let new_up = row.up + up;
            let new_down = row.down + down;
            let mut active: outbound_traffic::ActiveModel = row.into();
            active.up = Set(new_up);
            active.down = Set(new_down);
            active.total = Set(new_up + new_down);
            active.update(conn).await?;
        }
        None => {
            outbound_traffic::ActiveModel {
                id: NotSet,
                tag: Set(tag.to_string()),
                up: Set(up),
                down: Set(down),
                total: Set(up + down),
            }
            .insert(conn)
            .await?;
        }
    }
    Ok(())
}

async fn merge_inbound<C: ConnectionTrait>(
    conn: &C,
    tag: &str,
    up: i64,
    down: i64,
) -> ServiceResult<Option<inbound::Model>> {
    let Some(model) = Inbound::find()
        .filter(ci_eq(inbound::Column::Tag, tag))
        .one(conn)
        .await?
    else {
        debug!("未知入站 tag，忽略流量: {}", tag);
        return Ok(None);
    };

    let new_up = model.up + up;
    let new_down = model.down + down;
    let all_time = model.all_time + up + down;
    let mut active: inbound::ActiveModel = model.into();
    active.up = Set(new_up);
    active.down = Set(new_down);
    active.total = Set(new_up + new_down);
    active.all_time = Set(all_time);
    Ok(Some(active.update(conn).await?))
}

async fn merge_client<C: ConnectionTrait>(
    conn: &C,
    tag: &str,
    email: &str,
    up: i64,
    down: i64,
) -> ServiceResult<Option<client_traffic::Model>> {
    let mut query = ClientTraffic::find().filter(ci_eq(client_traffic::Column::Email, email));
    if !tag.is_empty() {
        let Some(model) = Inbound::find()
            .filter(ci_eq(inbound::Column::Tag, tag))
            .one(conn)
            .await?
        else {
            debug!("未知入站 tag，忽略客户端流量: {} / {}", tag, email);
            return Ok(None);
        };
        query = query.filter(client_traffic::Column::InboundId.eq(model.id));
    }

    let mut rows = query.all(conn).await?;
    if rows.len() != 1 {
        if rows.is_empty() {
            debug!("未知客户端，忽略流量: {}", email);
        } else {
            warn!("客户端 {} 存在于多个入站，无法归属流量，已忽略", email);
        }
        return Ok(None);
    }

    let row = rows.remove(0);
    let new_up = row.up + up;
    let new_down = row.down + down;
    let mut active: client_traffic::ActiveModel = row.into();
    active.up = Set(new_up);
    active.down = Set(new_down);
    active.total = Set(new_up + new_down);
    active.last_online = Set(now_ms());
    active.updated_at = Set(Utc::now().naive_utc());
    Ok(Some(active.update(conn).await?))
}

async fn disable_depleted<C: ConnectionTrait>(
    conn: &C,
    inbound_ids: &[i64],
    client_row_ids: &[i64],
) -> ServiceResult<Depleted> {
    let now = now_ms();
    let mut depleted = Depleted::default();

    if !inbound_ids.is_empty() {
        let inbounds = Inbound::find()
            .filter(inbound::Column::Id.is_in(inbound_ids.to_vec()))
            .filter(inbound::Column::Enable.eq(true))
            .all(conn)
            .await?;
        for model in inbounds {
            if !model.is_depleted(now) {
                continue;
            }
            let (id, tag) = (model.id, model.tag.clone());
            let mut active: inbound::ActiveModel = model.into();
            active.enable = Set(false);
            active.updated_at = Set(Utc::now().naive_utc());
            active.update(conn).await?;
            depleted.inbounds.push((id, tag));
        }
    }

    if !client_row_ids.is_empty() {
        let rows = ClientTraffic::find()
            .filter(client_traffic::Column::Id.is_in(client_row_ids.to_vec()))
            .filter(client_traffic::Column::Enable.eq(true))
            .all(conn)
            .await?;
        for row in rows {
            if !row.is_depleted(now) {
                continue;
            }
            let (inbound_id, email) = (row.inbound_id, row.email.clone());
            let mut active: client_traffic::ActiveModel = row.into();
            active.enable = Set(false);
            active.updated_at = Set(Utc::now().naive_utc());
            active.update(conn).await?;

            // 整个入站已停用时不必再单独移除用户
            let Some(model) = Inbound::find_by_id(inbound_id).one(conn).await? else {
                continue;
            };
            if model.enable {
                depleted.clients.push((inbound_id, model.tag, email));
            }
        }
    }

    Ok(depleted)
}
