//! 入站 settings 载荷中客户端列表的解析与合并
//!
//! 已知字段按类型解析，未知字段原样保留；客户端 email 在同一入站内
//! 不区分大小写唯一，未被操作的客户端保持原有顺序。

use common::protocol::control::UserAccount;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::entity::Protocol;
use crate::error::{ServiceError, ServiceResult};

/// 不区分大小写的成员判断，tag 和客户端 email 的比较都走这里
pub fn contains<S: AsRef<str>>(set: &[S], value: &str) -> bool {
    set.iter().any(|item| item.as_ref().eq_ignore_ascii_case(value))
}

fn default_enable() -> bool {
    true
}

/// settings.clients 中的一个客户端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
    /// 流量上限（字节），0 表示不限
    #[serde(rename = "totalGB", default)]
    pub total_gb: i64,
    /// 到期时间（毫秒时间戳），0 表示永不过期
    #[serde(rename = "expiryTime", default)]
    pub expiry_time: i64,
    #[serde(rename = "limitIp", default)]
    pub limit_ip: i64,
    #[serde(default)]
    pub reset: i32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Client {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: None,
            password: None,
            flow: None,
            email: email.into(),
            enable: true,
            total_gb: 0,
            expiry_time: 0,
            limit_ip: 0,
            reset: 0,
            extra: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// 客户端的部分更新，只覆盖出现的字段
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientPatch {
    pub id: Option<String>,
    pub password: Option<String>,
    pub flow: Option<String>,
    pub email: Option<String>,
    pub enable: Option<bool>,
    #[serde(rename = "totalGB")]
    pub total_gb: Option<i64>,
    #[serde(rename = "expiryTime")]
    pub expiry_time: Option<i64>,
    #[serde(rename = "limitIp")]
    pub limit_ip: Option<i64>,
    pub reset: Option<i32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClientPatch {
    fn apply_to(&self, client: &mut Client) {
        if let Some(id) = &self.id {
            client.id = Some(id.clone());
        }
        if let Some(password) = &self.password {
            client.password = Some(password.clone());
        }
        if let Some(flow) = &self.flow {
            client.flow = Some(flow.clone());
        }
        if let Some(email) = &self.email {
            client.email = email.clone();
        }
        if let Some(enable) = self.enable {
            client.enable = enable;
        }
        if let Some(total_gb) = self.total_gb {
            client.total_gb = total_gb;
        }
        if let Some(expiry_time) = self.expiry_time {
            client.expiry_time = expiry_time;
        }
        if let Some(limit_ip) = self.limit_ip {
            client.limit_ip = limit_ip;
        }
        if let Some(reset) = self.reset {
            client.reset = reset;
        }
        for (key, value) in &self.extra {
            client.extra.insert(key.clone(), value.clone());
        }
    }
}

/// 两个客户端集合之间的差异，按 email 匹配
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ClientDiff {
    pub added: Vec<Client>,
    pub removed: Vec<Client>,
    /// (旧, 新)
    pub changed: Vec<(Client, Client)>,
}

impl ClientDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// 解析后的入站 settings
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSet {
    protocol: Protocol,
    clients: Vec<Client>,
    rest: Map<String, Value>,
}

impl ClientSet {
    /// 解析 settings 载荷并校验
    pub fn parse(protocol: Protocol, payload: &str) -> ServiceResult<Self> {
        let value: Value = if payload.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(payload)?
        };
        let Value::Object(mut rest) = value else {
            return Err(ServiceError::validation("settings 必须是 JSON 对象"));
        };

        let mut clients = Vec::new();
        if protocol.manages_clients() {
            match rest.remove("clients") {
                None | Some(Value::Null) => {}
                Some(Value::Array(items)) => {
                    for item in items {
                        let client: Client = serde_json::from_value(item)?;
                        clients.push(client);
                    }
                }
                Some(_) => return Err(ServiceError::validation("settings.clients 必须是数组")),
            }
        }

        let set = Self {
            protocol,
            clients,
            rest,
        };
        set.validate()?;
        Ok(set)
    }

    /// 重新序列化为 settings 载荷
    pub fn to_payload(&self) -> String {
        let mut object = Map::new();
        if self.protocol.manages_clients() {
            let clients = self
                .clients
                .iter()
                .filter_map(|c| serde_json::to_value(c).ok())
                .collect();
            object.insert("clients".to_string(), Value::Array(clients));
        }
        for (key, value) in &self.rest {
            object.insert(key.clone(), value.clone());
        }
        serde_json::to_string_pretty(&Value::Object(object)).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    /// 除客户端列表以外的 settings 字段
    pub fn non_client_settings(&self) -> &Map<String, Value> {
        &self.rest
    }

    pub fn labels(&self) -> Vec<&str> {
        self.clients.iter().map(|c| c.email.as_str()).collect()
    }

    pub fn find(&self, label: &str) -> Option<&Client> {
        self.position(label).map(|idx| &self.clients[idx])
    }

    fn position(&self, label: &str) -> Option<usize> {
        self.clients
            .iter()
            .position(|c| c.email.eq_ignore_ascii_case(label))
    }

    fn ensure_managed(&self) -> ServiceResult<()> {
        if self.protocol.manages_clients() {
            Ok(())
        } else {
            Err(ServiceError::validation(format!(
                "{} 协议不支持客户端管理",
                self.protocol
            )))
        }
    }

    /// 追加一个客户端
    pub fn add(&mut self, client: Client) -> ServiceResult<()> {
        self.ensure_managed()?;
        if contains(&self.labels(), &client.email) {
            return Err(ServiceError::validation(format!(
                "客户端 email 已存在: {}",
                client.email
            )));
        }
        self.check_client(&client)?;
        self.clients.push(client);
        Ok(())
    }

    /// 按 email 合并更新，返回 (旧, 新)
    pub fn update(&mut self, label: &str, patch: &ClientPatch) -> ServiceResult<(Client, Client)> {
        self.ensure_managed()?;
        let idx = self
            .position(label)
            .ok_or_else(|| ServiceError::not_found(format!("客户端 {}", label)))?;

        let old = self.clients[idx].clone();
        let mut updated = old.clone();
        patch.apply_to(&mut updated);

        let clash = self
            .clients
            .iter()
            .enumerate()
            .any(|(i, c)| i != idx && c.email.eq_ignore_ascii_case(&updated.email));
        if clash {
            return Err(ServiceError::validation(format!(
                "客户端 email 已存在: {}",
                updated.email
            )));
        }
        self.check_client(&updated)?;

        self.clients[idx] = updated.clone();
        Ok((old, updated))
    }

    /// 按 email 删除
    pub fn remove(&mut self, label: &str) -> ServiceResult<Client> {
        self.ensure_managed()?;
        let idx = self
            .position(label)
            .ok_or_else(|| ServiceError::not_found(format!("客户端 {}", label)))?;
        Ok(self.clients.remove(idx))
    }

    /// 整体校验：协议要求的字段以及 email 唯一性
    pub fn validate(&self) -> ServiceResult<()> {
        if !self.protocol.manages_clients() {
            return Ok(());
        }
        if self.protocol == Protocol::Shadowsocks {
            self.shadowsocks_method()?;
        }
        let mut seen: Vec<&str> = Vec::with_capacity(self.clients.len());
        for client in &self.clients {
            if contains(&seen, &client.email) {
                return Err(ServiceError::validation(format!(
                    "客户端 email 重复: {}",
                    client.email
                )));
            }
            self.check_client(client)?;
            seen.push(&client.email);
        }
        Ok(())
    }

    fn shadowsocks_method(&self) -> ServiceResult<&str> {
        match self.rest.get("method").and_then(Value::as_str) {
            Some(method) if !method.is_empty() => Ok(method),
            _ => Err(ServiceError::validation("shadowsocks 入站缺少 method")),
        }
    }

    fn check_client(&self, client: &Client) -> ServiceResult<()> {
        if client.email.trim().is_empty() {
            return Err(ServiceError::validation("客户端 email 不能为空"));
        }
        if client.total_gb < 0 || client.expiry_time < 0 {
            return Err(ServiceError::validation(format!(
                "客户端 {} 的流量上限或到期时间不能为负",
                client.email
            )));
        }
        match self.protocol {
            Protocol::Vmess | Protocol::Vless => {
                let id = client.id.as_deref().unwrap_or_default();
                if uuid::Uuid::parse_str(id).is_err() {
                    return Err(ServiceError::validation(format!(
                        "客户端 {} 的 id 不是合法 UUID",
                        client.email
                    )));
                }
            }
            Protocol::Trojan | Protocol::Shadowsocks => {
                if client.password.as_deref().unwrap_or_default().is_empty() {
                    return Err(ServiceError::validation(format!(
                        "客户端 {} 缺少 password",
                        client.email
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// 生成热添加用户时下发的账号
    pub fn user_account(&self, client: &Client) -> UserAccount {
        let cipher = if self.protocol == Protocol::Shadowsocks {
            self.shadowsocks_method().ok().map(str::to_string)
        } else {
            None
        };
        let flow = client.flow.clone().filter(|f| !f.is_empty());
        UserAccount {
            email: client.email.clone(),
            protocol: self.protocol.to_string(),
            id: client.id.clone(),
            password: client.password.clone(),
            flow,
            cipher,
        }
    }

    /// 比较两个集合的客户端，结果按载荷顺序排列
    pub fn diff(old: &ClientSet, new: &ClientSet) -> ClientDiff {
        let old_by_label: HashMap<String, &Client> = old
            .clients
            .iter()
            .map(|c| (c.email.to_ascii_lowercase(), c))
            .collect();
        let new_by_label: HashMap<String, &Client> = new
            .clients
            .iter()
            .map(|c| (c.email.to_ascii_lowercase(), c))
            .collect();

        let mut diff = ClientDiff::default();
        for client in &old.clients {
            if !new_by_label.contains_key(&client.email.to_ascii_lowercase()) {
                diff.removed.push(client.clone());
            }
        }
        for client in &new.clients {
            match old_by_label.get(&client.email.to_ascii_lowercase()) {
                None => diff.added.push(client.clone()),
                Some(previous) if *previous != client => {
                    diff.changed.push(((*previous).clone(), client.clone()));
                }
                Some(_) => {}
            }
        }
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE_ID: &str = "2b5bc7a4-6f86-4d8f-9f5e-0b2c44f1a001";
    const BOB_ID: &str = "2b5bc7a4-6f86-4d8f-9f5e-0b2c44f1a002";

    fn vless_payload() -> String {
        serde_json::json!({
            "clients": [
                {"id": ALICE_ID, "email": "Alice", "flow": "xtls-rprx-vision", "subId": "s1"},
                {"id": BOB_ID, "email": "bob", "enable": false}
            ],
            "decryption": "none",
            "fallbacks": []
        })
        .to_string()
    }

    #[test]
    fn test_contains_ignores_case() {
        assert!(contains(&["Hello", "world"], "hello"));
        assert!(contains(&["Hello".to_string()], "HELLO"));
        assert!(!contains(&["Hello"], "hell"));
        assert!(!contains::<&str>(&[], "hello"));
    }

    #[test]
    fn test_parse_keeps_unknown_fields() {
        let set = ClientSet::parse(Protocol::Vless, &vless_payload()).unwrap();
        assert_eq!(set.clients().len(), 2);
        assert_eq!(set.clients()[0].extra.get("subId"), Some(&Value::from("s1")));
        assert!(!set.clients()[1].enable);

        // 重新解析序列化结果，未知字段和其他 settings 都应保留
        let again = ClientSet::parse(Protocol::Vless, &set.to_payload()).unwrap();
        assert_eq!(again, set);
        assert_eq!(
            again.non_client_settings().get("decryption"),
            Some(&Value::from("none"))
        );
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let mut set = ClientSet::parse(Protocol::Vless, &vless_payload()).unwrap();
        let dup = Client::new("ALICE").with_id(uuid::Uuid::new_v4().to_string());
        let err = set.add(dup).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(set.clients().len(), 2);
    }

    #[test]
    fn test_remove_then_readd_same_label() {
        let mut set = ClientSet::parse(Protocol::Vless, &vless_payload()).unwrap();
        let removed = set.remove("alice").unwrap();
        assert_eq!(removed.email, "Alice");

        set.add(Client::new("alice").with_id(ALICE_ID)).unwrap();
        assert_eq!(set.labels(), vec!["bob", "alice"]);
    }

    #[test]
    fn test_update_merges_only_present_fields() {
        let mut set = ClientSet::parse(Protocol::Vless, &vless_payload()).unwrap();
        let patch = ClientPatch {
            enable: Some(true),
            ..Default::default()
        };
        let (old, new) = set.update("BOB", &patch).unwrap();
        assert!(!old.enable);
        assert!(new.enable);
        assert_eq!(new.id.as_deref(), Some(BOB_ID));
        // 顺序不变
        assert_eq!(set.labels(), vec!["Alice", "bob"]);
    }

    #[test]
    fn test_update_rename_clash_rejected() {
        let mut set = ClientSet::parse(Protocol::Vless, &vless_payload()).unwrap();
        let patch = ClientPatch {
            email: Some("alice".to_string()),
            ..Default::default()
        };
        assert!(set.update("bob", &patch).unwrap_err().is_validation());

        // 改成自己的大小写变体是允许的
        let patch = ClientPatch {
            email: Some("BOB".to_string()),
            ..Default::default()
        };
        assert!(set.update("bob", &patch).is_ok());
    }

    #[test]
    fn test_missing_client_is_not_found() {
        let mut set = ClientSet::parse(Protocol::Vless, &vless_payload()).unwrap();
        assert!(set.remove("carol").unwrap_err().is_not_found());
        assert!(set
            .update("carol", &ClientPatch::default())
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_protocol_credentials() {
        let mut trojan = ClientSet::parse(Protocol::Trojan, r#"{"clients": []}"#).unwrap();
        assert!(trojan.add(Client::new("a")).unwrap_err().is_validation());
        trojan.add(Client::new("a").with_password("pw")).unwrap();

        let mut vmess = ClientSet::parse(Protocol::Vmess, "{}").unwrap();
        assert!(vmess
            .add(Client::new("a").with_id("not-a-uuid"))
            .unwrap_err()
            .is_validation());

        let err = ClientSet::parse(Protocol::Shadowsocks, r#"{"clients": []}"#).unwrap_err();
        assert!(err.is_validation());
        let ss = ClientSet::parse(
            Protocol::Shadowsocks,
            r#"{"method": "aes-256-gcm", "clients": [{"email": "a", "password": "pw"}]}"#,
        )
        .unwrap();
        let account = ss.user_account(&ss.clients()[0]);
        assert_eq!(account.cipher.as_deref(), Some("aes-256-gcm"));
        assert_eq!(account.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_unmanaged_protocol_keeps_settings() {
        let payload = r#"{"auth": "password", "accounts": [{"user": "u", "pass": "p"}]}"#;
        let mut set = ClientSet::parse(Protocol::Socks, payload).unwrap();
        assert!(set.clients().is_empty());
        assert!(set.add(Client::new("x")).unwrap_err().is_validation());

        let value: Value = serde_json::from_str(&set.to_payload()).unwrap();
        assert_eq!(value["accounts"][0]["user"], "u");
        assert!(value.get("clients").is_none());
    }

    #[test]
    fn test_malformed_payload() {
        assert!(ClientSet::parse(Protocol::Vless, "[1,2]").unwrap_err().is_validation());
        assert!(ClientSet::parse(Protocol::Vless, "{").unwrap_err().is_validation());
        assert!(ClientSet::parse(Protocol::Vless, r#"{"clients": {}}"#)
            .unwrap_err()
            .is_validation());
        let dup = serde_json::json!({
            "clients": [
                {"id": ALICE_ID, "email": "x"},
                {"id": BOB_ID, "email": "X"}
            ]
        });
        assert!(ClientSet::parse(Protocol::Vless, &dup.to_string())
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_diff() {
        let old = ClientSet::parse(Protocol::Vless, &vless_payload()).unwrap();
        let mut new = old.clone();
        new.remove("bob").unwrap();
        new.add(Client::new("carol").with_id(uuid::Uuid::new_v4().to_string()))
            .unwrap();
        new.update(
            "alice",
            &ClientPatch {
                flow: Some(String::new()),
                ..Default::default()
            },
        )
        .unwrap();

        let diff = ClientSet::diff(&old, &new);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].email, "bob");
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].email, "carol");
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].0.email, "Alice");

        assert!(ClientSet::diff(&old, &old).is_empty());
    }

    #[test]
    fn test_non_ascii_labels_differ_only_by_case_are_distinct() {
        let mut old = ClientSet::parse(Protocol::Vless, r#"{"clients": []}"#).unwrap();
        old.add(Client::new("Ärger").with_id(ALICE_ID)).unwrap();
        old.add(Client::new("ärger").with_id(BOB_ID)).unwrap();
        assert!(contains(&old.labels(), "ärger"));

        let mut new = old.clone();
        new.remove("Ärger").unwrap();
        assert_eq!(new.labels(), vec!["ärger"]);

        let diff = ClientSet::diff(&old, &new);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].email, "Ärger");
        assert!(diff.added.is_empty());
        assert!(diff.changed.is_empty());
    }
}
