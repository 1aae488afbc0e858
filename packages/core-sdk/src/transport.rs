use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Url;
use serde_json::Value;

use crate::error::QueryError;

/**
 * \brief 已构造完成的线上请求。
 */
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub status: u16,
    pub body: String,
}

impl WireResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/**
 * \brief 网络传输能力：发送 JSON POST 并返回状态码与原始响应体。
 */
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_json(&self, request: &WireRequest) -> Result<WireResponse, QueryError>;
}

/**
 * \brief 基于 reqwest 的默认实现。超时由调用方控制。
 */
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(&self, request: &WireRequest) -> Result<WireResponse, QueryError> {
        let resp = self
            .client
            .post(request.url.clone())
            .headers(request.headers.clone())
            .json(&request.body)
            .send()
            .await
            .map_err(|e| QueryError::Network(e.without_url().to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| QueryError::Network(e.without_url().to_string()))?;
        Ok(WireResponse { status, body })
    }
}
