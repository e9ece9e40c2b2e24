//! 代理进程控制通道的 HTTP 客户端
//!
//! 通过代理侧控制服务的 REST 接口实现 ControlChannel trait。

use anyhow::Result;
use async_trait::async_trait;
use common::protocol::control::{
    AlterInboundOp, ControlChannel, InboundConfig, StatCounter, StatsResponse,
};
use std::sync::Arc;
use tracing::debug;

use crate::live_sync::ChannelConnector;

/// 远程控制通道
pub struct HttpControlChannel {
    base_url: String,
    secret: String,
    client: reqwest::Client,
}

impl HttpControlChannel {
    pub fn new(base_url: String, secret: String, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `/inbounds/{tag}[/users]`，tag 作为单个路径段编码
    fn inbound_url(&self, tag: &str, users: bool) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("控制通道地址无效: {}", self.base_url))?;
            segments.pop_if_empty().push("inbounds").push(tag);
            if users {
                segments.push("users");
            }
        }
        Ok(url)
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(anyhow::anyhow!("{}失败: {} - {}", what, status, body))
        }
    }
}

#[async_trait]
impl ControlChannel for HttpControlChannel {
    async fn ping(&self) -> Result<()> {
        let resp = self.client
            .get(self.url("/ping"))
            .header("X-Internal-Secret", &self.secret)
            .send()
            .await?;
        Self::check(resp, "探测控制通道").await?;
        Ok(())
    }

    async fn add_inbound(&self, inbound: &InboundConfig) -> Result<()> {
        debug!("调用代理添加入站: tag={}, port={}", inbound.tag, inbound.port);

        let resp = self.client
            .post(self.url("/inbounds"))
            .header("X-Internal-Secret", &self.secret)
            .json(inbound)
            .send()
            .await?;
        Self::check(resp, "添加入站").await?;
        Ok(())
    }

    async fn remove_inbound(&self, tag: &str) -> Result<()> {
        debug!("调用代理移除入站: tag={}", tag);

        let resp = self.client
            .delete(self.inbound_url(tag, false)?)
            .header("X-Internal-Secret", &self.secret)
            .send()
            .await?;
        Self::check(resp, "移除入站").await?;
        Ok(())
    }

    async fn alter_inbound(&self, tag: &str, op: &AlterInboundOp) -> Result<()> {
        debug!("调用代理修改入站用户: tag={}, email={}", tag, op.email());

        let resp = self.client
            .post(self.inbound_url(tag, true)?)
            .header("X-Internal-Secret", &self.secret)
            .json(op)
            .send()
            .await?;
        Self::check(resp, "修改入站用户").await?;
        Ok(())
    }

    async fn query_stats(&self, reset: bool) -> Result<Vec<StatCounter>> {
        let resp = self.client
            .get(self.url("/stats"))
            .query(&[("reset", reset)])
            .header("X-Internal-Secret", &self.secret)
            .send()
            .await?;
        let stats: StatsResponse = Self::check(resp, "查询统计").await?.json().await?;
        Ok(stats.stats)
    }
}

/// 建立 HTTP 控制通道，连接时先探测一次
pub struct HttpConnector {
    secret: String,
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChannelConnector for HttpConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ControlChannel>> {
        let channel = HttpControlChannel::new(endpoint.to_string(), self.secret.clone(), self.client.clone());
        channel.ping().await?;
        Ok(Arc::new(channel))
    }
}
