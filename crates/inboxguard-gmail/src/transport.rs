//! HTTP transport behind the provider.
//!
//! [`GmailTransport`] is the seam tests replace; [`HttpTransport`] is the
//! reqwest implementation used in production.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use url::Url;

use crate::error::Result;
use crate::retry::parse_retry_after;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A request to the Gmail API, without credentials.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub content_type: Option<String>,
    pub body: Option<String>,
}

impl ApiRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::Get,
            url,
            content_type: None,
            body: None,
        }
    }

    pub fn post(url: Url, content_type: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            url,
            content_type: Some(content_type.into()),
            body: Some(body.into()),
        }
    }
}

/// Status, the headers the provider cares about, and the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one authenticated request. Non-success statuses are returned as
/// responses, not errors; only transport failures are `Err`.
#[async_trait]
pub trait GmailTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest, access_token: &str) -> Result<ApiResponse>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("InboxGuard/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl GmailTransport for HttpTransport {
    async fn send(&self, request: &ApiRequest, access_token: &str) -> Result<ApiResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(request.url.clone()),
            Method::Post => self.client.post(request.url.clone()),
        };
        builder = builder.header(AUTHORIZATION, format!("Bearer {access_token}"));
        if let Some(content_type) = &request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE);
        let retry_after = header(RETRY_AFTER).and_then(|v| parse_retry_after(&v, chrono::Utc::now()));
        let body = response.text().await?;

        tracing::trace!(status, url = %request.url.path(), "gmail api response");
        Ok(ApiResponse {
            status,
            content_type,
            retry_after,
            body,
        })
    }
}
