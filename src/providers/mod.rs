//! Provider adapters: one variant per platform behind `ProviderAdapter`.
//!
//! Adapters only fetch and normalize. They never touch the store, so the
//! reconciler stays provider-agnostic.

pub mod gmail;
pub mod slack;

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::models::{NormalizedItem, Provider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use gmail::GmailAdapter;
pub use slack::SlackAdapter;

/// Default bound on a single provider fetch or send.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(120);
/// Maximum stored body length, in characters.
pub const MAX_BODY_CHARS: usize = 4000;
pub const TRUNCATION_MARKER: &str = "...";

pub type HttpsClient = hyper::Client<HttpsConnector<HttpConnector>, hyper::Body>;

/// Opened credentials, held only for the duration of one adapter call.
#[derive(Clone)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Per-account hints handed to `fetch_recent`.
#[derive(Debug, Clone)]
pub struct SyncHints {
    pub external_account_id: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub batch_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplyDraft {
    pub provider_thread_id: String,
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub in_reply_to: Option<String>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn fetch_recent(
        &self,
        credentials: &Credentials,
        hints: &SyncHints,
    ) -> Result<Vec<NormalizedItem>>;

    /// Sends a reply into the provider thread and returns the provider's
    /// message identifier for it.
    async fn send_reply(&self, credentials: &Credentials, draft: &ReplyDraft) -> Result<String>;
}

/// Closed set of adapters, dispatched on the account's provider tag.
#[derive(Clone)]
pub struct Adapters {
    gmail: Arc<dyn ProviderAdapter>,
    slack: Arc<dyn ProviderAdapter>,
}

impl Adapters {
    pub fn new(gmail: Arc<dyn ProviderAdapter>, slack: Arc<dyn ProviderAdapter>) -> Self {
        Self { gmail, slack }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let client = https_client()?;
        Ok(Self::new(
            Arc::new(GmailAdapter::new(client.clone(), config.gmail.clone())),
            Arc::new(SlackAdapter::new(client)),
        ))
    }

    pub fn for_provider(&self, provider: Provider) -> &dyn ProviderAdapter {
        match provider {
            Provider::Gmail => self.gmail.as_ref(),
            Provider::Slack => self.slack.as_ref(),
        }
    }
}

pub fn https_client() -> Result<HttpsClient> {
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| SyncError::ProviderTransient(format!("failed to load native roots: {}", e)))?
        .https_only()
        .enable_http1()
        .build();
    Ok(hyper::Client::builder().build(connector))
}

/// Bounds one adapter call. An elapsed deadline is a transient provider
/// error like any other network fault.
pub async fn with_deadline<T>(
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::ProviderTransient(format!(
            "provider call timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Caps `text` at `MAX_BODY_CHARS` characters, appending the marker when cut.
pub fn truncate_body(text: &str) -> String {
    match text.char_indices().nth(MAX_BODY_CHARS) {
        Some((cut, _)) => format!("{}{}", &text[..cut], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

/// Splits a comma-separated address header into trimmed, non-empty entries.
pub fn parse_address_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
