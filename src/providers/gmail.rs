use super::{
    Credentials, HttpsClient, ProviderAdapter, ReplyDraft, SyncHints, parse_address_list,
    truncate_body,
};
use crate::config::GmailSettings;
use crate::error::{Result, SyncError};
use crate::models::{Direction, NormalizedItem, Provider};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use google_gmail1::Gmail;
use google_gmail1::api::{Message, MessagePart};
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use std::io::Cursor;
use tracing::{debug, warn};
use yup_oauth2::authorized_user::AuthorizedUserSecret;

const EMPTY_BODY_PLACEHOLDER: &str = "(empty message)";

pub struct GmailAdapter {
    client: HttpsClient,
    settings: GmailSettings,
}

impl GmailAdapter {
    pub fn new(client: HttpsClient, settings: GmailSettings) -> Self {
        Self { client, settings }
    }

    /// Builds a hub for one account. With a refresh credential the hub
    /// refreshes on its own; otherwise the access credential is used as is.
    async fn hub(&self, credentials: &Credentials) -> Result<Gmail<HttpsConnector<HttpConnector>>> {
        let (client_id, client_secret) = client_credentials(&self.settings)?;

        match &credentials.refresh_token {
            Some(refresh_token) => {
                let secret = AuthorizedUserSecret {
                    client_id,
                    client_secret,
                    refresh_token: refresh_token.clone(),
                    key_type: "authorized_user".to_string(),
                };
                let auth = yup_oauth2::AuthorizedUserAuthenticator::builder(secret)
                    .build()
                    .await
                    .map_err(|e| SyncError::CredentialInvalid(e.to_string()))?;
                Ok(Gmail::new(self.client.clone(), auth))
            }
            None => Ok(Gmail::new(
                self.client.clone(),
                credentials.access_token.clone(),
            )),
        }
    }
}

#[async_trait]
impl ProviderAdapter for GmailAdapter {
    async fn fetch_recent(
        &self,
        credentials: &Credentials,
        hints: &SyncHints,
    ) -> Result<Vec<NormalizedItem>> {
        let hub = self.hub(credentials).await?;
        let query = format!("in:inbox newer_than:{}d", self.settings.recency_days);

        let (_, list) = hub
            .users()
            .messages_list("me")
            .max_results(hints.batch_size)
            .q(&query)
            .doit()
            .await
            .map_err(classify)?;

        let ids: Vec<String> = list
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .collect();
        debug!(
            account = %hints.external_account_id,
            count = ids.len(),
            "listed gmail messages"
        );

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let (_, message) = hub
                .users()
                .messages_get("me", &id)
                .format("full")
                .doit()
                .await
                .map_err(classify)?;
            items.push(normalize_message(&id, &message));
        }
        Ok(items)
    }

    async fn send_reply(&self, credentials: &Credentials, draft: &ReplyDraft) -> Result<String> {
        let recipient = reply_recipient(draft)?;
        let hub = self.hub(credentials).await?;
        let raw = compose_reply(recipient, draft);

        let request = Message {
            thread_id: Some(draft.provider_thread_id.clone()),
            ..Default::default()
        };
        let (_, sent) = hub
            .users()
            .messages_send(request, "me")
            .upload(
                Cursor::new(raw.into_bytes()),
                "message/rfc822"
                    .parse()
                    .map_err(|_| SyncError::InvalidInput("invalid upload mime type".to_string()))?,
            )
            .await
            .map_err(classify)?;

        sent.id.ok_or_else(|| {
            SyncError::ProviderTransient("gmail reply returned no message id".to_string())
        })
    }
}

/// Adapter-wide OAuth client credentials, checked when a Gmail account is
/// actually synced so deployments without Gmail need not configure them.
fn client_credentials(settings: &GmailSettings) -> Result<(String, String)> {
    let missing = |setting| SyncError::ProviderConfigMissing {
        provider: Provider::Gmail,
        setting,
    };
    let id = settings
        .client_id
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing("GMAIL_CLIENT_ID"))?;
    let secret = settings
        .client_secret
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing("GMAIL_CLIENT_SECRET"))?;
    Ok((id, secret))
}

fn reply_recipient(draft: &ReplyDraft) -> Result<&str> {
    draft
        .recipient
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or(SyncError::ReplyTargetMissing)
}

fn classify(err: google_gmail1::Error) -> SyncError {
    match err {
        google_gmail1::Error::MissingToken(e) => SyncError::CredentialInvalid(e.to_string()),
        google_gmail1::Error::Failure(response) => {
            let status = response.status();
            if status == hyper::StatusCode::UNAUTHORIZED || status == hyper::StatusCode::FORBIDDEN {
                SyncError::CredentialInvalid(format!("gmail responded {}", status))
            } else {
                SyncError::ProviderTransient(format!("gmail responded {}", status))
            }
        }
        other => SyncError::ProviderTransient(other.to_string()),
    }
}

pub(crate) fn normalize_message(fallback_id: &str, message: &Message) -> NormalizedItem {
    let payload = message.payload.as_ref();
    let message_id = message.id.clone().unwrap_or_else(|| fallback_id.to_string());
    let thread_id = message.thread_id.clone().unwrap_or_else(|| message_id.clone());
    let labels = message.label_ids.as_deref().unwrap_or_default();

    let body = extract_plain_text(payload);
    let body_text = if body.is_empty() {
        EMPTY_BODY_PLACEHOLDER.to_string()
    } else {
        truncate_body(&body)
    };

    NormalizedItem {
        provider_thread_id: thread_id,
        provider_message_id: message_id,
        subject: header(payload, "Subject"),
        sender: header(payload, "From").unwrap_or_else(|| "unknown".to_string()),
        recipients: parse_address_list(header(payload, "To").as_deref()),
        body_text,
        sent_at: sent_at(message.internal_date, header(payload, "Date").as_deref()),
        is_unread: labels.iter().any(|l| l == "UNREAD"),
        direction: if labels.iter().any(|l| l == "SENT") {
            Direction::Outbound
        } else {
            Direction::Inbound
        },
    }
}

fn header(payload: Option<&MessagePart>, name: &str) -> Option<String> {
    payload?
        .headers
        .as_ref()?
        .iter()
        .find(|h| h.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name)))
        .and_then(|h| h.value.clone())
}

fn sent_at(internal_date: Option<i64>, date_header: Option<&str>) -> DateTime<Utc> {
    if let Some(ms) = internal_date {
        if let Some(at) = Utc.timestamp_millis_opt(ms).single() {
            return at;
        }
    }
    if let Some(raw) = date_header {
        match DateTime::parse_from_rfc2822(raw.trim()) {
            Ok(at) => return at.with_timezone(&Utc),
            Err(e) => warn!(error = %e, "unparseable Date header"),
        }
    }
    Utc::now()
}

/// First `text/plain` body found depth-first, else the first part carrying
/// any body, else empty.
pub(crate) fn extract_plain_text(payload: Option<&MessagePart>) -> String {
    let Some(part) = payload else {
        return String::new();
    };
    find_part(part, &|p| p.mime_type.as_deref() == Some("text/plain"))
        .or_else(|| find_part(part, &|_| true))
        .unwrap_or_default()
}

fn find_part(part: &MessagePart, accept: &dyn Fn(&MessagePart) -> bool) -> Option<String> {
    if accept(part) {
        if let Some(text) = body_text(part) {
            return Some(text);
        }
    }
    part.parts
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find_map(|child| find_part(child, accept))
}

// The client has already undone Gmail's base64url transfer encoding.
fn body_text(part: &MessagePart) -> Option<String> {
    let data = part.body.as_ref()?.data.as_ref()?;
    if data.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(data).into_owned())
}

fn compose_reply(recipient: &str, draft: &ReplyDraft) -> String {
    let subject = match draft.subject.as_deref() {
        Some(s) if s.to_lowercase().starts_with("re:") => s.to_string(),
        Some(s) => format!("Re: {}", s),
        None => "Re: No Subject".to_string(),
    };

    let mut headers = vec![
        format!("To: {}", recipient),
        format!("Subject: {}", subject),
        "MIME-Version: 1.0".to_string(),
        "Content-Type: text/plain; charset=\"UTF-8\"".to_string(),
    ];
    if let Some(parent) = &draft.in_reply_to {
        headers.push(format!("In-Reply-To: <{}>", parent));
        headers.push(format!("References: <{}>", parent));
    }
    format!("{}\r\n\r\n{}", headers.join("\r\n"), draft.body)
}
