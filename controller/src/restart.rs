//! 代理重启协调
//!
//! 各个变更返回的 need_restart 汇总到这里。检查任务发现标记后，
//! 按数据库中的完整配置重写代理配置并重启，然后重新绑定控制通道。

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::protocol::control::InboundConfig;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config_store::ConfigStore;
use crate::live_sync::LiveSyncClient;
use crate::notify::{NotificationSink, PanelEvent};

/// 未配置模板时使用，控制通道监听在 api 入站上
const DEFAULT_TEMPLATE: &str = r#"{
  "log": { "loglevel": "warning" },
  "api": { "tag": "api", "services": ["HandlerService", "StatsService"] },
  "inbounds": [
    {
      "tag": "api",
      "listen": "127.0.0.1",
      "port": 62789,
      "protocol": "tunnel",
      "settings": { "address": "127.0.0.1" }
    }
  ],
  "outbounds": [
    { "tag": "direct", "protocol": "freedom", "settings": {} },
    { "tag": "blocked", "protocol": "blackhole", "settings": {} }
  ],
  "policy": {
    "levels": { "0": { "statsUserUplink": true, "statsUserDownlink": true } },
    "system": {
      "statsInboundUplink": true,
      "statsInboundDownlink": true,
      "statsOutboundUplink": true,
      "statsOutboundDownlink": true
    }
  },
  "routing": {
    "rules": [{ "type": "field", "inboundTag": ["api"], "outboundTag": "api" }]
  },
  "stats": {}
}"#;

/// 实际执行重启的动作
#[async_trait]
pub trait RestartHook: Send + Sync {
    async fn restart(&self, inbounds: &[InboundConfig]) -> Result<()>;
}

/// 把入站合并进配置模板写出，并执行可选的重启命令
pub struct ProxyConfigWriter {
    config_path: PathBuf,
    template_path: Option<PathBuf>,
    command: Option<String>,
}

impl ProxyConfigWriter {
    pub fn new(config_path: impl Into<PathBuf>, template_path: Option<PathBuf>, command: Option<String>) -> Self {
        Self {
            config_path: config_path.into(),
            template_path,
            command: command.filter(|c| !c.trim().is_empty()),
        }
    }

    async fn load_template(&self) -> Result<Map<String, Value>> {
        let raw = match &self.template_path {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("无法读取代理配置模板: {}", path.display()))?,
            None => DEFAULT_TEMPLATE.to_string(),
        };
        match serde_json::from_str::<Value>(&raw).with_context(|| "解析代理配置模板失败")? {
            Value::Object(map) => Ok(map),
            _ => Err(anyhow::anyhow!("代理配置模板必须是 JSON 对象")),
        }
    }

    /// 模板里的入站排在前面，面板入站追加在后；tag 相同时以面板入站为准
    pub async fn render(&self, inbounds: &[InboundConfig]) -> Result<Value> {
        let mut document = self.load_template().await?;
        let mut merged: Vec<Value> = match document.remove("inbounds") {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter(|item| {
                    let tag = item.get("tag").and_then(Value::as_str).unwrap_or_default();
                    let shadowed = inbounds.iter().any(|i| i.tag.eq_ignore_ascii_case(tag));
                    if shadowed {
                        warn!("模板入站 {} 与面板入站同名，已被覆盖", tag);
                    }
                    !shadowed
                })
                .collect(),
            _ => Vec::new(),
        };
        for inbound in inbounds {
            merged.push(serde_json::to_value(inbound)?);
        }
        document.insert("inbounds".to_string(), Value::Array(merged));
        Ok(Value::Object(document))
    }
}

#[async_trait]
impl RestartHook for ProxyConfigWriter {
    async fn restart(&self, inbounds: &[InboundConfig]) -> Result<()> {
        let document = self.render(inbounds).await?;
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.config_path, serde_json::to_vec_pretty(&document)?).await?;
        info!("📝 代理配置已写入: {} ({} 个入站)", self.config_path.display(), inbounds.len());

        if let Some(command) = &self.command {
            let mut parts = command.split_whitespace();
            let program = parts
                .next()
                .ok_or_else(|| anyhow::anyhow!("重启命令为空"))?;
            let status = tokio::process::Command::new(program)
                .args(parts)
                .status()
                .await?;
            if !status.success() {
                return Err(anyhow::anyhow!("重启命令执行失败: {} ({})", command, status));
            }
        }
        Ok(())
    }
}

pub struct RestartCoordinator {
    requested: AtomicBool,
    store: Arc<ConfigStore>,
    live: Arc<LiveSyncClient>,
    hook: Arc<dyn RestartHook>,
    notifier: Arc<dyn NotificationSink>,
}

impl RestartCoordinator {
    pub fn new(
        store: Arc<ConfigStore>,
        live: Arc<LiveSyncClient>,
        hook: Arc<dyn RestartHook>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            requested: AtomicBool::new(false),
            store,
            live,
            hook,
            notifier,
        }
    }

    /// 记录一次重启请求
    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("🔄 已标记需要重启代理");
            self.notifier.notify(PanelEvent::RestartRequested);
        }
    }

    /// 便于直接传入变更结果
    pub fn note(&self, need_restart: bool) {
        if need_restart {
            self.request();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// 有请求时执行重启，返回是否执行了重启
    pub async fn restart_if_needed(&self) -> Result<bool> {
        if !self.requested.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        if let Err(e) = self.restart_now().await {
            self.requested.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(true)
    }

    pub async fn restart_now(&self) -> Result<()> {
        let inbounds = self.store.live_inbound_configs().await?;
        self.hook.restart(&inbounds).await?;
        info!("✅ 代理已按数据库配置重启");

        // 旧句柄已失效，通道暂时不可用时由后续调用再次触发重启
        if let Err(e) = self.live.rebind().await {
            warn!("⚠️ 重启后重新绑定控制通道失败: {}", e);
        }
        Ok(())
    }
}
