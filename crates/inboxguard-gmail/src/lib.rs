//! Gmail provider for InboxGuard.
//!
//! [`GmailProvider`] implements [`EmailProvider`] over the Gmail REST API.
//! Tokens come from the vault through the OAuth service on every call;
//! failures go through a [`RetryHandler`] that backs off exponentially and
//! honors `Retry-After`, and bulk message fetches use the batch endpoint.

pub mod batch;
pub mod config;
pub mod error;
pub mod models;
pub mod provider;
pub mod retry;
pub mod traits;
pub mod transport;

pub use batch::{MAX_BATCH_SIZE, estimate_get_quota};
pub use config::{GMAIL_READONLY_SCOPE, GmailConfig};
pub use error::{ProviderError, Result};
pub use models::{EmailMessage, MessageBatch, MessageQuery, Profile};
pub use provider::GmailProvider;
pub use retry::{RetryHandler, RetryPolicy};
pub use traits::{AccessTokenSource, EmailProvider, HealthStatus, ProviderHealth, ProviderState};
pub use transport::{ApiRequest, ApiResponse, GmailTransport, HttpTransport, Method};
