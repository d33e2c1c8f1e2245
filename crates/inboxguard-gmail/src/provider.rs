//! The Gmail provider.
//!
//! Every remote call fetches a live token from the [`AccessTokenSource`],
//! goes through the [`RetryHandler`], and feeds the consecutive-failure
//! counter that drives the `Connected` / `Degraded` / `Disconnected` states.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use crate::batch::{self, BatchItem, BatchPart, quota};
use crate::config::GmailConfig;
use crate::error::{ProviderError, Result};
use crate::models::{EmailMessage, ListPage, MessageBatch, MessageQuery, Profile};
use crate::retry::RetryHandler;
use crate::traits::{AccessTokenSource, EmailProvider, HealthStatus, ProviderHealth, ProviderState};
use crate::transport::{ApiRequest, ApiResponse, GmailTransport, HttpTransport};

#[derive(Debug)]
struct ConnectionStatus {
    state: ProviderState,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    email_address: Option<String>,
}

pub struct GmailProvider {
    config: GmailConfig,
    tokens: Arc<dyn AccessTokenSource>,
    transport: Arc<dyn GmailTransport>,
    retry: RetryHandler,
    status: Mutex<ConnectionStatus>,
    quota_units: AtomicU64,
}

impl GmailProvider {
    pub fn new(
        config: GmailConfig,
        tokens: Arc<dyn AccessTokenSource>,
        transport: Arc<dyn GmailTransport>,
    ) -> Self {
        let retry = RetryHandler::new(config.retry.clone());
        Self {
            config,
            tokens,
            transport,
            retry,
            status: Mutex::new(ConnectionStatus {
                state: ProviderState::Uninitialized,
                consecutive_failures: 0,
                last_success: None,
                last_error: None,
                email_address: None,
            }),
            quota_units: AtomicU64::new(0),
        }
    }

    /// Provider over the reqwest transport.
    pub fn with_http(config: GmailConfig, tokens: Arc<dyn AccessTokenSource>) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(config.request_timeout_secs))?;
        Ok(Self::new(config, tokens, Arc::new(transport)))
    }

    pub fn config(&self) -> &GmailConfig {
        &self.config
    }

    pub fn quota_units_used(&self) -> u64 {
        self.quota_units.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.status().consecutive_failures
    }

    fn status(&self) -> MutexGuard<'_, ConnectionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(status: &mut ConnectionStatus, provider: &str, to: ProviderState) {
        if status.state != to {
            tracing::info!(provider, from = %status.state, to = %to, "provider state changed");
            status.state = to;
        }
    }

    fn ensure_accepts_calls(&self, operation: &'static str) -> Result<()> {
        let state = self.status().state;
        if state.accepts_calls() {
            Ok(())
        } else {
            Err(ProviderError::InvalidState { state, operation })
        }
    }

    fn record_success(&self) {
        let mut status = self.status();
        status.consecutive_failures = 0;
        status.last_success = Some(Utc::now());
        status.last_error = None;
        if status.state == ProviderState::Degraded {
            Self::set_state(&mut status, &self.config.provider, ProviderState::Connected);
        }
    }

    fn record_failure(&self, error: &ProviderError) {
        self.note_failure(error.to_string(), error.requires_reauthentication());
    }

    /// Count a failed operation. `fatal` disconnects at once.
    fn note_failure(&self, error: String, fatal: bool) {
        let mut status = self.status();
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        if !status.state.accepts_calls() {
            status.last_error = Some(error);
            return;
        }

        let next = if fatal
            || status.consecutive_failures >= self.config.disconnected_after_failures
        {
            ProviderState::Disconnected
        } else if status.consecutive_failures >= self.config.degraded_after_failures {
            ProviderState::Degraded
        } else {
            status.state
        };
        if next != status.state {
            tracing::warn!(
                provider = %self.config.provider,
                failures = status.consecutive_failures,
                error = %error,
                "provider failing"
            );
        }
        status.last_error = Some(error);
        Self::set_state(&mut status, &self.config.provider, next);
    }

    /// Update the failure tracking from an operation's result.
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_failure(e),
        }
        result
    }

    async fn access_token(&self) -> Result<Zeroizing<String>> {
        Ok(self
            .tokens
            .access_token(&self.config.scopes, &self.config.provider)
            .await?)
    }

    /// One attempt: fresh token, one request, status mapped to an error.
    async fn send_once(&self, request: &ApiRequest, units: u64) -> Result<ApiResponse> {
        let token = self.access_token().await?;
        self.quota_units.fetch_add(units, Ordering::Relaxed);
        let response = self.transport.send(request, &token).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(ProviderError::from_status(
                response.status,
                response.retry_after,
                &response.body,
            ))
        }
    }

    async fn call(&self, operation: &str, request: ApiRequest, units: u32) -> Result<ApiResponse> {
        self.retry
            .execute(operation, || self.send_once(&request, u64::from(units)))
            .await
    }

    async fn fetch_profile(&self) -> Result<Profile> {
        let request = ApiRequest::get(self.config.user_url("profile")?);
        let response = self.call("get_profile", request, quota::GET_PROFILE).await?;
        Ok(serde_json::from_str(&response.body)?)
    }

    /// `messages/{id}?format={format}`, relative to the user resource.
    fn message_resource(&self, id: &str) -> String {
        let id: String = url::form_urlencoded::byte_serialize(id.as_bytes()).collect();
        let format: String =
            url::form_urlencoded::byte_serialize(self.config.message_format.as_bytes()).collect();
        format!("messages/{id}?format={format}")
    }

    async fn fetch_message(&self, id: &str) -> Result<EmailMessage> {
        let url = self.config.user_url(&self.message_resource(id))?;
        match self
            .call("get_message", ApiRequest::get(url), quota::MESSAGES_GET)
            .await
        {
            Ok(response) => Ok(serde_json::from_str(&response.body)?),
            Err(ProviderError::Api { status: 404, .. }) => Err(ProviderError::NotFound {
                id: id.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn fetch_page(&self, query: &MessageQuery, max_results: u32, page_token: Option<&str>) -> Result<ListPage> {
        let mut url = self.config.user_url("messages")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("maxResults", &max_results.to_string());
            if let Some(q) = &query.q {
                pairs.append_pair("q", q);
            }
            for label in &query.label_ids {
                pairs.append_pair("labelIds", label);
            }
            if query.include_spam_trash {
                pairs.append_pair("includeSpamTrash", "true");
            }
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
        }
        let response = self
            .call("list_messages", ApiRequest::get(url), quota::MESSAGES_LIST)
            .await?;
        Ok(serde_json::from_str(&response.body)?)
    }

    async fn collect_ids(&self, query: &MessageQuery) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let remaining = query.limit.map(|limit| limit.saturating_sub(ids.len()));
            if remaining == Some(0) {
                break;
            }
            let max_results = match remaining {
                Some(n) => self.config.page_size.min(u32::try_from(n).unwrap_or(u32::MAX)),
                None => self.config.page_size,
            };

            let page = self.fetch_page(query, max_results, page_token.as_deref()).await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));
            match page.next_page_token {
                Some(next) if Some(&next) != page_token.as_ref() => page_token = Some(next),
                _ => break,
            }
        }
        if let Some(limit) = query.limit {
            ids.truncate(limit);
        }
        Ok(ids)
    }

    async fn send_batch(&self, items: &[BatchItem], dispatches: &AtomicUsize) -> Result<Vec<BatchPart>> {
        let request = batch::build_batch(items)?;
        let units = batch::estimate_get_quota(items.len());
        let api_request = ApiRequest::post(self.config.batch_url()?, request.content_type(), request.body);

        dispatches.fetch_add(1, Ordering::Relaxed);
        let response = self.send_once(&api_request, units).await?;
        let content_type = response.content_type.as_deref().unwrap_or_default();
        batch::parse_batch_response(content_type, &response.body)
    }

    /// Fetch one chunk (at most one batch worth of ids). Items the batch
    /// endpoint throttles individually are re-sent in a smaller batch after
    /// a backoff.
    async fn fetch_chunk(
        &self,
        chunk: &[String],
        dispatches: &AtomicUsize,
        fetched: &mut BTreeMap<String, EmailMessage>,
        failures: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let mut pending: Vec<&String> = chunk.iter().collect();
        let mut round = 0;

        while !pending.is_empty() {
            let items: Vec<BatchItem> = pending
                .iter()
                .map(|id| BatchItem {
                    path: self.config.user_path(&self.message_resource(id)),
                })
                .collect();

            let parts = match self
                .retry
                .execute("batch_get", || self.send_batch(&items, dispatches))
                .await
            {
                Ok(parts) => parts,
                Err(e @ ProviderError::Authentication(_)) => return Err(e),
                Err(e) if e.requires_reauthentication() => return Err(e),
                Err(e) => {
                    for id in &pending {
                        failures.insert((*id).clone(), e.to_string());
                    }
                    return Ok(());
                }
            };

            let mut answered = vec![false; pending.len()];
            let mut throttled = Vec::new();
            let mut retry_after: Option<Duration> = None;
            for part in parts {
                let Some(&id) = pending.get(part.index) else {
                    tracing::warn!(index = part.index, "batch response part without matching request");
                    continue;
                };
                answered[part.index] = true;
                if part.is_success() {
                    match serde_json::from_str::<EmailMessage>(&part.body) {
                        Ok(message) => {
                            fetched.insert(id.clone(), message);
                        }
                        Err(e) => {
                            failures.insert(id.clone(), ProviderError::from(e).to_string());
                        }
                    }
                    continue;
                }
                let error = part.into_error(id);
                // A revoked grant fails every part; treat it like a rejected batch.
                if error.requires_reauthentication() {
                    return Err(error);
                }
                if error.is_retryable() {
                    retry_after = retry_after.max(error.retry_after());
                    throttled.push(id);
                } else {
                    failures.insert(id.clone(), error.to_string());
                }
            }
            for (id, answered) in pending.iter().zip(&answered) {
                if !answered {
                    failures.insert((*id).clone(), "missing from batch response".to_string());
                }
            }

            if throttled.is_empty() {
                break;
            }
            round += 1;
            let error = ProviderError::RateLimited { retry_after };
            let Some(delay) = self.retry.policy().delay_for(round, &error) else {
                for id in throttled {
                    failures.insert(id.clone(), error.to_string());
                }
                break;
            };
            tracing::debug!(
                provider = %self.config.provider,
                throttled = throttled.len(),
                delay_ms = delay.as_millis() as u64,
                "re-sending throttled batch items"
            );
            tokio::time::sleep(delay).await;
            pending = throttled;
        }
        Ok(())
    }

    async fn fetch_batched(&self, ids: &[String]) -> Result<MessageBatch> {
        let dispatches = AtomicUsize::new(0);
        let mut fetched = BTreeMap::new();
        let mut failures = BTreeMap::new();

        for chunk in batch::chunk_ids(ids, self.config.batch_size) {
            self.fetch_chunk(chunk, &dispatches, &mut fetched, &mut failures)
                .await?;
        }

        let mut result = MessageBatch {
            dispatches: dispatches.load(Ordering::Relaxed),
            ..MessageBatch::default()
        };
        for id in ids {
            match fetched.get(id) {
                Some(message) => {
                    result.messages.push(message.clone());
                    result.outcome.record::<String>(id, Ok(()));
                }
                None => {
                    let reason = failures
                        .get(id)
                        .cloned()
                        .unwrap_or_else(|| "not fetched".to_string());
                    result.outcome.record(id, Err(&reason));
                    result.failures.insert(id.clone(), reason);
                }
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl EmailProvider for GmailProvider {
    fn id(&self) -> &str {
        &self.config.provider
    }

    fn state(&self) -> ProviderState {
        self.status().state
    }

    async fn initialize(&self) -> Result<()> {
        let mut status = self.status();
        match status.state {
            ProviderState::Uninitialized => {
                self.config.validate()?;
                Self::set_state(&mut status, &self.config.provider, ProviderState::Initialized);
                Ok(())
            }
            ProviderState::Initialized => Ok(()),
            state => Err(ProviderError::InvalidState {
                state,
                operation: "initialize",
            }),
        }
    }

    async fn connect(&self) -> Result<()> {
        let state = self.state();
        if matches!(state, ProviderState::Uninitialized | ProviderState::Shutdown) {
            return Err(ProviderError::InvalidState {
                state,
                operation: "connect",
            });
        }

        let profile = match self.fetch_profile().await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(provider = %self.config.provider, error = %e, "connect failed");
                self.record_failure(&e);
                return Err(e);
            }
        };

        let mut status = self.status();
        if status.state == ProviderState::Shutdown {
            return Err(ProviderError::InvalidState {
                state: ProviderState::Shutdown,
                operation: "connect",
            });
        }
        status.consecutive_failures = 0;
        status.last_success = Some(Utc::now());
        status.last_error = None;
        Self::set_state(&mut status, &self.config.provider, ProviderState::Connected);
        tracing::info!(
            provider = %self.config.provider,
            messages_total = profile.messages_total,
            "connected to gmail"
        );
        status.email_address = Some(profile.email_address);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut status = self.status();
        Self::set_state(&mut status, &self.config.provider, ProviderState::Shutdown);
        Ok(())
    }

    async fn health_check(&self) -> ProviderHealth {
        let reachable = if self.state().accepts_calls() {
            let result = self.fetch_profile().await;
            Some(self.track(result).is_ok())
        } else {
            None
        };

        let status = self.status();
        let health = match (reachable, status.state) {
            (Some(true), ProviderState::Connected) => HealthStatus::Healthy,
            (Some(_), ProviderState::Connected | ProviderState::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        };
        ProviderHealth {
            provider: self.config.provider.clone(),
            status: health,
            state: status.state,
            consecutive_failures: status.consecutive_failures,
            last_success: status.last_success,
            last_error: status.last_error.clone(),
            email_address: status.email_address.clone(),
            quota_units_used: self.quota_units_used(),
        }
    }

    async fn profile(&self) -> Result<Profile> {
        self.ensure_accepts_calls("get profile")?;
        let result = self.fetch_profile().await;
        self.track(result)
    }

    async fn list_message_ids(&self, query: &MessageQuery) -> Result<Vec<String>> {
        self.ensure_accepts_calls("list messages")?;
        let result = self.collect_ids(query).await;
        self.track(result)
    }

    async fn get_message(&self, id: &str) -> Result<EmailMessage> {
        self.ensure_accepts_calls("get message")?;
        let result = self.fetch_message(id).await;
        // A missing message says nothing about the connection.
        match result {
            Err(ProviderError::NotFound { .. }) => result,
            _ => self.track(result),
        }
    }

    async fn get_messages(&self, ids: &[String]) -> Result<MessageBatch> {
        self.ensure_accepts_calls("get messages")?;
        if ids.is_empty() {
            return Ok(MessageBatch::default());
        }

        tracing::debug!(
            provider = %self.config.provider,
            count = ids.len(),
            quota_units = batch::estimate_get_quota(ids.len()),
            "batched message fetch"
        );
        let result = self.fetch_batched(ids).await;
        match result {
            Ok(batch) if !batch.outcome.is_success() => {
                self.note_failure(format!("batch fetch failed: {}", batch.outcome), false);
                Ok(batch)
            }
            other => self.track(other),
        }
    }
}
