//! Controller 配置模块

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Controller 配置
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// 数据库路径
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// 获取写锁、开启和提交事务的超时（秒）
    #[serde(default = "default_db_timeout")]
    pub db_timeout_secs: u64,

    /// 代理进程控制通道地址
    #[serde(default = "default_control_endpoint")]
    pub control_endpoint: String,

    /// 控制通道共享密钥
    #[serde(default)]
    pub control_secret: Option<String>,

    /// 每次控制通道调用的超时（秒）
    #[serde(default = "default_live_sync_timeout")]
    pub live_sync_timeout_secs: u64,

    /// 流量拉取间隔（秒）
    #[serde(default = "default_traffic_poll")]
    pub traffic_poll_secs: u64,

    /// 检查重启标记的间隔（秒）
    #[serde(default = "default_restart_check")]
    pub restart_check_secs: u64,

    /// 重启时写出的代理配置文件
    #[serde(default = "default_proxy_config_path")]
    pub proxy_config_path: String,

    /// 代理配置模板，面板入站追加到模板入站之后；为空时使用内置模板
    #[serde(default)]
    pub proxy_template_path: Option<String>,

    /// 重启代理进程的命令，为空时只重写配置文件
    #[serde(default)]
    pub restart_command: Option<String>,

    /// 日志目录，为空时只输出到终端
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_db_path() -> String {
    "./data/controller.db".to_string()
}

fn default_db_timeout() -> u64 {
    10
}

fn default_control_endpoint() -> String {
    "http://127.0.0.1:62789".to_string()
}

fn default_live_sync_timeout() -> u64 {
    5
}

fn default_traffic_poll() -> u64 {
    10
}

fn default_restart_check() -> u64 {
    30
}

fn default_proxy_config_path() -> String {
    "./bin/config.json".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            db_timeout_secs: default_db_timeout(),
            control_endpoint: default_control_endpoint(),
            control_secret: None,
            live_sync_timeout_secs: default_live_sync_timeout(),
            traffic_poll_secs: default_traffic_poll(),
            restart_check_secs: default_restart_check(),
            proxy_config_path: default_proxy_config_path(),
            proxy_template_path: None,
            restart_command: None,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_secs.max(1))
    }

    pub fn live_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.live_sync_timeout_secs.max(1))
    }

    pub fn traffic_poll_interval(&self) -> Duration {
        Duration::from_secs(self.traffic_poll_secs.max(1))
    }

    pub fn restart_check_interval(&self) -> Duration {
        Duration::from_secs(self.restart_check_secs.max(1))
    }

    pub fn control_secret(&self) -> String {
        self.control_secret.clone().unwrap_or_default()
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).with_context(|| "解析配置文件失败")
    }

    /// 加载配置：命令行指定的路径 > CONTROLLER_CONFIG 环境变量 > ./controller.toml > 默认值
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let candidate: Option<PathBuf> = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var("CONTROLLER_CONFIG")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        };

        if let Some(path) = candidate {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("无法读取配置文件: {}", path.display()))?;
            let config = Self::from_toml(&content)?;
            tracing::info!("📋 加载配置文件: {}", path.display());
            return Ok(config);
        }

        let fallback = Path::new("controller.toml");
        if fallback.exists() {
            let content = fs::read_to_string(fallback)
                .with_context(|| format!("无法读取配置文件: {}", fallback.display()))?;
            let config = Self::from_toml(&content)?;
            tracing::info!("📋 加载配置文件: {}", fallback.display());
            return Ok(config);
        }

        tracing::warn!("未找到配置文件，使用默认配置");
        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = Config::from_toml(
            r#"
            control_endpoint = "http://10.0.0.2:10085"
            control_secret = "abc"
            traffic_poll_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.control_endpoint, "http://10.0.0.2:10085");
        assert_eq!(config.control_secret(), "abc");
        assert_eq!(config.db_path, "./data/controller.db");
        // 间隔至少 1 秒
        assert_eq!(config.traffic_poll_interval(), Duration::from_secs(1));
        assert_eq!(config.live_sync_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_config_equals_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_invalid_config() {
        assert!(Config::from_toml("db_timeout_secs = \"soon\"").is_err());
        assert!(Config::load(Some(Path::new("/nonexistent/controller.toml"))).is_err());
    }
}
