//! 入站配置、热同步与流量统计核心
//!
//! 路由层通过 [`config_store::ConfigStore`] 和 [`traffic::TrafficAccountant`]
//! 调用核心操作，并根据返回的 need_restart 决定是否重启代理。

pub mod client_codec;
pub mod config;
pub mod config_store;
pub mod control_client;
pub mod db;
pub mod entity;
pub mod error;
pub mod jobs;
pub mod live_sync;
pub mod migration;
pub mod notify;
pub mod restart;
pub mod restart_policy;
pub mod settings_cache;
pub mod traffic;

#[cfg(test)]
mod test_support;
