//! 入站配置的持久化与热同步
//!
//! 所有变更分两步：先在事务内写入数据库并提交，再在事务之外尝试通过
//! 控制通道热更新运行中的代理。热更新失败不会回滚已提交的数据，
//! 只会让返回的 need_restart 变为 true，由下一次重启对齐实际状态。

mod clients;

use chrono::Utc;
use common::protocol::control::{AlterInboundOp, InboundConfig};
use rand::Rng;
use sea_orm::sea_query::{Expr, Func, IntoColumnRef, SimpleExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, NotSet, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::client_codec::{Client, ClientSet};
use crate::db::Datastore;
use crate::entity::{client_traffic, inbound, ClientTraffic, Inbound, Protocol};
use crate::error::{ServiceError, ServiceResult};
use crate::live_sync::LiveSync;
use crate::notify::{NotificationSink, PanelEvent};
use crate::restart_policy::{classify, Change, InboundDiff};
use crate::settings_cache::SettingsCache;

pub use crate::client_codec::contains;

/// 表示"所有入站"的 inbound_id
pub const ALL_INBOUNDS: i64 = -1;

/// 新增或更新入站时提交的数据
#[derive(Debug, Clone, Deserialize)]
pub struct InboundDraft {
    #[serde(rename = "userId")]
    pub user_id: i64,
    #[serde(default)]
    pub remark: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(rename = "expiryTime", default)]
    pub expiry_time: Option<i64>,
    #[serde(rename = "trafficLimit", default)]
    pub traffic_limit: Option<i64>,
    #[serde(default)]
    pub listen: String,
    pub port: i64,
    pub protocol: String,
    #[serde(default)]
    pub settings: String,
    #[serde(rename = "streamSettings", default)]
    pub stream_settings: String,
    #[serde(default)]
    pub sniffing: String,
    #[serde(default)]
    pub tag: Option<String>,
}

fn default_enable() -> bool {
    true
}

/// 校验通过的入站数据
struct ValidDraft {
    protocol: Protocol,
    port: i32,
    set: ClientSet,
    stream_settings: String,
    sniffing: String,
    tag: Option<String>,
}

impl InboundDraft {
    fn validate(&self) -> ServiceResult<ValidDraft> {
        if !(1..=65535).contains(&self.port) {
            return Err(ServiceError::validation(format!("端口超出范围: {}", self.port)));
        }
        let protocol: Protocol = self.protocol.parse().map_err(ServiceError::Validation)?;
        if matches!(self.traffic_limit, Some(limit) if limit < 0) {
            return Err(ServiceError::validation("流量上限不能为负"));
        }
        if matches!(self.expiry_time, Some(expiry) if expiry < 0) {
            return Err(ServiceError::validation("到期时间不能为负"));
        }
        let set = ClientSet::parse(protocol, &self.settings)?;
        let tag = match self.tag.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(tag) => Some(tag.to_string()),
        };
        Ok(ValidDraft {
            protocol,
            port: self.port as i32,
            set,
            stream_settings: normalize_json("streamSettings", &self.stream_settings)?,
            sniffing: normalize_json("sniffing", &self.sniffing)?,
            tag,
        })
    }
}

fn normalize_json(field: &str, raw: &str) -> ServiceResult<String> {
    if raw.trim().is_empty() {
        return Ok("{}".to_string());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(_)) => Ok(raw.to_string()),
        Ok(_) => Err(ServiceError::validation(format!("{} 必须是 JSON 对象", field))),
        Err(e) => Err(ServiceError::validation(format!("{} 解析失败: {}", field, e))),
    }
}

/// 不区分大小写的字符串列比较
pub(crate) fn ci_eq(col: impl IntoColumnRef, value: &str) -> SimpleExpr {
    Expr::expr(Func::lower(Expr::col(col))).eq(value.to_ascii_lowercase())
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn random_suffix() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..6)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

fn json_or_empty(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(Default::default()))
}

/// 生成下发给代理的入站配置，`exclude` 中的客户端（已耗尽）不会下发
pub(crate) fn live_config(model: &inbound::Model, set: &ClientSet, exclude: &[String]) -> InboundConfig {
    let mut settings = json_or_empty(&set.to_payload());
    if let Some(Value::Array(items)) = settings.get_mut("clients") {
        items.retain(|item| {
            let enabled = item.get("enable").and_then(Value::as_bool).unwrap_or(true);
            let email = item.get("email").and_then(Value::as_str).unwrap_or_default();
            enabled && !contains(exclude, email)
        });
    }
    InboundConfig {
        listen: Some(model.listen.clone()).filter(|l| !l.is_empty()),
        port: u16::try_from(model.port).unwrap_or_default(),
        protocol: model.protocol.to_string(),
        settings,
        stream_settings: json_or_empty(&model.stream_settings),
        sniffing: json_or_empty(&model.sniffing),
        tag: model.tag.clone(),
    }
}

/// 入站配置服务
pub struct ConfigStore {
    db: Arc<Datastore>,
    cache: Arc<SettingsCache>,
    live: Arc<dyn LiveSync>,
    notifier: Arc<dyn NotificationSink>,
}

impl ConfigStore {
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

    /// 新增入站，返回 (入站, need_restart)
    pub async fn add_inbound(&self, draft: &InboundDraft) -> ServiceResult<(inbound::Model, bool)> {
        let valid = draft.validate()?;

        let txn = self.db.begin_write().await?;
        if draft.enable {
            ensure_port_free(txn.conn(), valid.port, None).await?;
        }
        let tag = match &valid.tag {
            Some(tag) => {
                ensure_tag_free(txn.conn(), tag, None).await?;
                tag.clone()
            }
            None => generate_tag(txn.conn(), valid.port).await?,
        };

        let now = Utc::now().naive_utc();
        let model = inbound::ActiveModel {
            id: NotSet,
            user_id: Set(draft.user_id),
            up: Set(0),
            down: Set(0),
            total: Set(0),
            all_time: Set(0),
            remark: Set(draft.remark.clone()),
            enable: Set(draft.enable),
            expiry_time: Set(draft.expiry_time),
            traffic_limit: Set(draft.traffic_limit),
            listen: Set(draft.listen.clone()),
            port: Set(valid.port),
            protocol: Set(valid.protocol),
            settings: Set(valid.set.to_payload()),
            stream_settings: Set(valid.stream_settings.clone()),
            tag: Set(tag),
            sniffing: Set(valid.sniffing.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(txn.conn())
        .await?;

        for client in valid.set.clients() {
            upsert_client_row(txn.conn(), model.id, client).await?;
        }

        self.cache.invalidate(model.id).await;
        txn.commit().await?;
        self.cache.invalidate(model.id).await;
        info!("✅ 入站 #{} 已创建: tag={}, port={}", model.id, model.tag, model.port);

        let decision = classify(&Change::AddInbound {
            protocol: valid.protocol,
            enabled: model.enable,
        });
        let mut need_restart = decision.requires_restart();
        if model.enable && !need_restart {
            let config = live_config(&model, &valid.set, &[]);
            if let Err(e) = self.live.apply_add_inbound(&config).await {
                warn!("⚠️ 热添加入站 {} 失败，需要重启代理: {}", model.tag, e);
                need_restart = true;
            }
        }

        self.notifier.notify(PanelEvent::InboundAdded {
            id: model.id,
            tag: model.tag.clone(),
        });
        Ok((model, need_restart))
    }

    /// 更新入站，计数器和所有者保持不变
    pub async fn update_inbound(&self, id: i64, draft: &InboundDraft) -> ServiceResult<(inbound::Model, bool)> {
        let valid = draft.validate()?;

        let txn = self.db.begin_write().await?;
        let old = load_inbound(txn.conn(), id).await?;
        if draft.enable {
            ensure_port_free(txn.conn(), valid.port, Some(id)).await?;
        }
        // 必须在改写流量行之前读取，代表代理当前实际服务的客户端
        let was_depleted = depleted_labels(txn.conn(), id).await?;
        let tag = match &valid.tag {
            Some(tag) if tag != &old.tag => {
                ensure_tag_free(txn.conn(), tag, Some(id)).await?;
                tag.clone()
            }
            _ => old.tag.clone(),
        };

        let mut active: inbound::ActiveModel = old.clone().into();
        active.remark = Set(draft.remark.clone());
        active.enable = Set(draft.enable);
        active.expiry_time = Set(draft.expiry_time);
        active.traffic_limit = Set(draft.traffic_limit);
        active.listen = Set(draft.listen.clone());
        active.port = Set(valid.port);
        active.protocol = Set(valid.protocol);
        active.settings = Set(valid.set.to_payload());
        active.stream_settings = Set(valid.stream_settings.clone());
        active.sniffing = Set(valid.sniffing.clone());
        active.tag = Set(tag);
        active.updated_at = Set(Utc::now().naive_utc());
        let updated = active.update(txn.conn()).await?;

        let diff = match ClientSet::parse(old.protocol, &old.settings) {
            Ok(old_set) => InboundDiff::between(&old, &updated, &old_set, &valid.set),
            Err(e) => {
                warn!("入站 #{} 原 settings 无法解析，按完整变更处理: {}", id, e);
                let mut diff = InboundDiff::between(&old, &updated, &valid.set, &valid.set);
                diff.settings_changed = true;
                diff
            }
        };

        for client in &diff.clients.removed {
            delete_client_row(txn.conn(), id, &client.email).await?;
        }
        let mut now_live = Vec::new();
        for (old_client, new_client) in &diff.clients.changed {
            let row = update_client_row(txn.conn(), id, &old_client.email, new_client).await?;
            if row.enable {
                now_live.push(row.email);
            }
        }
        for client in &diff.clients.added {
            let row = upsert_client_row(txn.conn(), id, client).await?;
            if row.enable {
                now_live.push(row.email);
            }
        }

        self.cache.invalidate(id).await;
        txn.commit().await?;
        self.cache.invalidate(id).await;
        info!("✅ 入站 #{} 已更新: tag={}", id, updated.tag);

        let mut need_restart = classify(&Change::UpdateInbound(&diff)).requires_restart();
        if !need_restart {
            need_restart = self
                .hot_apply_update(&old, &updated, &diff, &valid.set, &was_depleted, &now_live)
                .await;
        }

        self.notifier.notify(PanelEvent::InboundUpdated {
            id,
            tag: updated.tag.clone(),
        });
        Ok((updated, need_restart))
    }

    /// 返回热更新是否失败
    ///
    /// `was_depleted` 是更新前已停用的流量行，决定哪些旧客户端需要移除；
    /// `now_live` 是更新后仍启用的流量行，决定哪些新客户端需要添加。
    async fn hot_apply_update(
        &self,
        old: &inbound::Model,
        new: &inbound::Model,
        diff: &InboundDiff,
        new_set: &ClientSet,
        was_depleted: &[String],
        now_live: &[String],
    ) -> bool {
        match (diff.was_enabled, diff.now_enabled) {
            (true, false) => {
                if let Err(e) = self.live.apply_remove_inbound(&old.tag).await {
                    warn!("⚠️ 热移除入站 {} 失败，需要重启代理: {}", old.tag, e);
                    return true;
                }
                false
            }
            (true, true) => {
                let mut ops = Vec::new();
                let was_live = |c: &Client| c.enable && !contains(was_depleted, &c.email);
                let is_live = |c: &Client| c.enable && contains(now_live, &c.email);

                for client in &diff.clients.removed {
                    if was_live(client) {
                        ops.push(AlterInboundOp::RemoveUser {
                            email: client.email.clone(),
                        });
                    }
                }
                for (old_client, new_client) in &diff.clients.changed {
                    if was_live(old_client) {
                        ops.push(AlterInboundOp::RemoveUser {
                            email: old_client.email.clone(),
                        });
                    }
                    if is_live(new_client) {
                        ops.push(AlterInboundOp::AddUser(new_set.user_account(new_client)));
                    }
                }
                for client in &diff.clients.added {
                    if is_live(client) {
                        ops.push(AlterInboundOp::AddUser(new_set.user_account(client)));
                    }
                }
                for op in &ops {
                    if let Err(e) = self.live.apply_alter_inbound(&new.tag, op).await {
                        warn!("⚠️ 热更新入站 {} 用户 {} 失败，需要重启代理: {}", new.tag, op.email(), e);
                        return true;
                    }
                }
                false
            }
            _ => false,
        }
    }

    /// 删除入站，返回 need_restart
    pub async fn del_inbound(&self, id: i64) -> ServiceResult<bool> {
        let txn = self.db.begin_write().await?;
        let old = load_inbound(txn.conn(), id).await?;
        ClientTraffic::delete_many()
            .filter(client_traffic::Column::InboundId.eq(id))
            .exec(txn.conn())
            .await?;
        Inbound::delete_by_id(id).exec(txn.conn()).await?;

        self.cache.invalidate(id).await;
        txn.commit().await?;
        self.cache.invalidate(id).await;
        info!("🗑️ 入站 #{} 已删除: tag={}", id, old.tag);

        let mut need_restart = classify(&Change::RemoveInbound {
            was_enabled: old.enable,
        })
        .requires_restart();
        if old.enable && !need_restart {
            if let Err(e) = self.live.apply_remove_inbound(&old.tag).await {
                warn!("⚠️ 热移除入站 {} 失败，需要重启代理: {}", old.tag, e);
                need_restart = true;
            }
        }

        self.notifier.notify(PanelEvent::InboundDeleted { id, tag: old.tag });
        Ok(need_restart)
    }

    pub async fn get_inbound(&self, id: i64) -> ServiceResult<inbound::Model> {
        self.db
            .read(Inbound::find_by_id(id).one(self.db.conn()))
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("入站 #{}", id)))
    }

    pub async fn get_all_inbounds(&self) -> ServiceResult<Vec<inbound::Model>> {
        self.db
            .read(
                Inbound::find()
                    .order_by_asc(inbound::Column::Id)
                    .all(self.db.conn()),
            )
            .await
    }

    /// 只返回属于指定用户的入站
    pub async fn get_inbounds(&self, user_id: i64) -> ServiceResult<Vec<inbound::Model>> {
        self.db
            .read(
                Inbound::find()
                    .filter(inbound::Column::UserId.eq(user_id))
                    .order_by_asc(inbound::Column::Id)
                    .all(self.db.conn()),
            )
            .await
    }

    /// 解析后的客户端列表，优先读缓存
    pub async fn get_clients(&self, id: i64) -> ServiceResult<Arc<ClientSet>> {
        if let Some(set) = self.cache.get(id).await {
            return Ok(set);
        }
        let generation = self.cache.generation(id).await;
        let model = self.get_inbound(id).await?;
        let set = Arc::new(ClientSet::parse(model.protocol, &model.settings)?);
        self.cache.insert_if_current(id, generation, set.clone()).await;
        Ok(set)
    }

    pub async fn get_client_traffics(&self, id: i64) -> ServiceResult<Vec<client_traffic::Model>> {
        self.db
            .read(
                ClientTraffic::find()
                    .filter(client_traffic::Column::InboundId.eq(id))
                    .order_by_asc(client_traffic::Column::Id)
                    .all(self.db.conn()),
            )
            .await
    }

    /// 所有启用入站的完整配置，重启代理时据此重写配置文件
    pub async fn live_inbound_configs(&self) -> ServiceResult<Vec<InboundConfig>> {
        let inbounds = self
            .db
            .read(
                Inbound::find()
                    .filter(inbound::Column::Enable.eq(true))
                    .order_by_asc(inbound::Column::Id)
                    .all(self.db.conn()),
            )
            .await?;

        let mut configs = Vec::with_capacity(inbounds.len());
        for model in inbounds {
            let set = match ClientSet::parse(model.protocol, &model.settings) {
                Ok(set) => set,
                Err(e) => {
                    warn!("入站 #{} settings 无法解析，跳过: {}", model.id, e);
                    continue;
                }
            };
            let depleted = self.db.read(depleted_labels(self.db.conn(), model.id)).await?;
            configs.push(live_config(&model, &set, &depleted));
        }
        Ok(configs)
    }
}

pub(crate) async fn load_inbound<C: ConnectionTrait>(conn: &C, id: i64) -> ServiceResult<inbound::Model> {
    Inbound::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found(format!("入站 #{}", id)))
}

async fn ensure_port_free<C: ConnectionTrait>(conn: &C, port: i32, except: Option<i64>) -> ServiceResult<()> {
    let mut query = Inbound::find()
        .filter(inbound::Column::Port.eq(port))
        .filter(inbound::Column::Enable.eq(true));
    if let Some(id) = except {
        query = query.filter(inbound::Column::Id.ne(id));
    }
    if query.count(conn).await? > 0 {
        return Err(ServiceError::conflict(format!("端口 {} 已被占用", port)));
    }
    Ok(())
}

async fn tag_exists<C: ConnectionTrait>(conn: &C, tag: &str, except: Option<i64>) -> ServiceResult<bool> {
    let mut query = Inbound::find().filter(ci_eq(inbound::Column::Tag, tag));
    if let Some(id) = except {
        query = query.filter(inbound::Column::Id.ne(id));
    }
    Ok(query.count(conn).await? > 0)
}

async fn ensure_tag_free<C: ConnectionTrait>(conn: &C, tag: &str, except: Option<i64>) -> ServiceResult<()> {
    if tag_exists(conn, tag, except).await? {
        return Err(ServiceError::conflict(format!("tag 已存在: {}", tag)));
    }
    Ok(())
}

async fn generate_tag<C: ConnectionTrait>(conn: &C, port: i32) -> ServiceResult<String> {
    for _ in 0..8 {
        let tag = format!("inbound-{}-{}", port, random_suffix());
        if !tag_exists(conn, &tag, None).await? {
            return Ok(tag);
        }
    }
    Err(ServiceError::conflict(format!("无法为端口 {} 生成唯一 tag", port)))
}

async fn find_client_row<C: ConnectionTrait>(
    conn: &C,
    inbound_id: i64,
    email: &str,
) -> ServiceResult<Option<client_traffic::Model>> {
    Ok(ClientTraffic::find()
        .filter(client_traffic::Column::InboundId.eq(inbound_id))
        .filter(ci_eq(client_traffic::Column::Email, email))
        .one(conn)
        .await?)
}

/// 新建客户端流量行，已存在时只同步额度
async fn upsert_client_row<C: ConnectionTrait>(
    conn: &C,
    inbound_id: i64,
    client: &Client,
) -> ServiceResult<client_traffic::Model> {
    update_client_row(conn, inbound_id, &client.email, client).await
}

/// 按旧 email 找到流量行并同步额度和 email，找不到时新建
async fn update_client_row<C: ConnectionTrait>(
    conn: &C,
    inbound_id: i64,
    old_email: &str,
    client: &Client,
) -> ServiceResult<client_traffic::Model> {
    let now = Utc::now().naive_utc();
    let Some(row) = find_client_row(conn, inbound_id, old_email).await? else {
        let row = client_traffic::ActiveModel {
            id: NotSet,
            inbound_id: Set(inbound_id),
            email: Set(client.email.clone()),
            enable: Set(client.enable),
            up: Set(0),
            down: Set(0),
            total: Set(0),
            traffic_limit: Set(client.total_gb),
            expiry_time: Set(client.expiry_time),
            reset: Set(client.reset),
            last_online: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;
        return Ok(row);
    };

    // 额度放宽后重新启用
    let mut limits = row.clone();
    limits.traffic_limit = client.total_gb;
    limits.expiry_time = client.expiry_time;

    let mut active: client_traffic::ActiveModel = row.into();
    active.email = Set(client.email.clone());
    active.traffic_limit = Set(client.total_gb);
    active.expiry_time = Set(client.expiry_time);
    active.reset = Set(client.reset);
    active.enable = Set(client.enable && !limits.is_depleted(now_ms()));
    active.updated_at = Set(now);
    Ok(active.update(conn).await?)
}

async fn delete_client_row<C: ConnectionTrait>(conn: &C, inbound_id: i64, email: &str) -> ServiceResult<()> {
    ClientTraffic::delete_many()
        .filter(client_traffic::Column::InboundId.eq(inbound_id))
        .filter(ci_eq(client_traffic::Column::Email, email))
        .exec(conn)
        .await?;
    Ok(())
}

/// 流量行已被停用（耗尽）的客户端
async fn depleted_labels<C: ConnectionTrait>(conn: &C, inbound_id: i64) -> Result<Vec<String>, sea_orm::DbErr> {
    let rows = ClientTraffic::find()
        .filter(client_traffic::Column::InboundId.eq(inbound_id))
        .filter(client_traffic::Column::Enable.eq(false))
        .all(conn)
        .await?;
    Ok(rows.into_iter().map(|r| r.email).collect())
}

#[cfg(test)]
mod tests;
