use super::{Credentials, HttpsClient, ProviderAdapter, ReplyDraft, SyncHints, truncate_body};
use crate::error::{Result, SyncError};
use crate::models::{Direction, NormalizedItem};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hyper::{Body, Method, Request, StatusCode, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

const API_BASE: &str = "https://slack.com/api";
const CONVERSATION_TYPES: &str = "public_channel,private_channel,im,mpim";
const CONVERSATION_PAGE: u32 = 50;
const HISTORY_PAGE: u32 = 25;

const AUTH_ERRORS: &[&str] = &[
    "invalid_auth",
    "not_authed",
    "token_revoked",
    "token_expired",
    "account_inactive",
];

const CHANNEL_ERRORS: &[&str] = &["not_in_channel", "channel_not_found"];

pub struct SlackAdapter {
    client: HttpsClient,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConversationList {
    #[serde(default)]
    channels: Vec<Channel>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_read: Option<String>,
    #[serde(default)]
    pub is_member: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct History {
    #[serde(default)]
    messages: Vec<HistoryItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HistoryItem {
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Posted {
    ts: String,
}

impl SlackAdapter {
    pub fn new(client: HttpsClient) -> Self {
        Self { client }
    }

    async fn call<T: DeserializeOwned>(&self, request: Request<Body>) -> Result<T> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| SyncError::ProviderTransient(format!("slack request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(SyncError::ProviderTransient(format!("slack responded {}", status)));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::CredentialInvalid(format!("slack responded {}", status)));
        }

        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| SyncError::ProviderTransient(format!("slack body read failed: {}", e)))?;
        decode_response(&bytes)
    }

    async fn get<T: DeserializeOwned>(&self, token: &str, method: &str, query: &str) -> Result<T> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("{}/{}?{}", API_BASE, method, query))
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .map_err(|e| SyncError::InvalidInput(e.to_string()))?;
        self.call(request).await
    }
}

#[async_trait]
impl ProviderAdapter for SlackAdapter {
    async fn fetch_recent(
        &self,
        credentials: &Credentials,
        hints: &SyncHints,
    ) -> Result<Vec<NormalizedItem>> {
        let token = credentials.access_token.as_str();
        let list: ConversationList = self
            .get(
                token,
                "users.conversations",
                &format!(
                    "types={}&exclude_archived=true&limit={}",
                    CONVERSATION_TYPES, CONVERSATION_PAGE
                ),
            )
            .await?;
        let channels = joined_channels(&list.channels);
        debug!(
            account = %hints.external_account_id,
            channels = channels.len(),
            "listed joined slack conversations"
        );

        let mut items = Vec::new();
        for channel in channels {
            let history: Result<History> = self
                .get(
                    token,
                    "conversations.history",
                    &format!("channel={}&limit={}&inclusive=true", channel.id, HISTORY_PAGE),
                )
                .await;
            let history = match history {
                Ok(history) => history,
                Err(e) if is_unreadable_channel(&e) => {
                    debug!(channel = %channel.id, error = %e, "skipping unreadable conversation");
                    continue;
                }
                Err(e) => return Err(e),
            };
            items.extend(normalize_history(
                channel,
                &history.messages,
                &hints.external_account_id,
            ));
        }
        Ok(items)
    }

    async fn send_reply(&self, credentials: &Credentials, draft: &ReplyDraft) -> Result<String> {
        let (channel, thread_ts) = split_thread_id(&draft.provider_thread_id)?;

        let mut payload = serde_json::json!({ "channel": channel, "text": draft.body });
        if let Some(ts) = thread_ts {
            payload["thread_ts"] = serde_json::Value::String(ts.to_string());
        }

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{}/chat.postMessage", API_BASE))
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", credentials.access_token),
            )
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(Body::from(payload.to_string()))
            .map_err(|e| SyncError::InvalidInput(e.to_string()))?;

        let posted: Posted = self.call(request).await?;
        Ok(format!("{}:{}", channel, posted.ts))
    }
}

/// Checks Slack's `ok` envelope before decoding the payload.
fn decode_response<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| SyncError::ProviderTransient(format!("malformed slack response: {}", e)))?;
    if !envelope.ok {
        let code = envelope.error.unwrap_or_else(|| "unknown_error".to_string());
        return Err(if AUTH_ERRORS.contains(&code.as_str()) {
            SyncError::CredentialInvalid(code)
        } else {
            SyncError::ProviderTransient(code)
        });
    }
    serde_json::from_slice(bytes)
        .map_err(|e| SyncError::ProviderTransient(format!("malformed slack response: {}", e)))
}

/// Conversations the account belongs to. IMs carry no membership flag.
fn joined_channels(channels: &[Channel]) -> Vec<&Channel> {
    channels
        .iter()
        .filter(|c| c.is_member != Some(false))
        .collect()
}

/// History errors that concern one conversation rather than the account.
fn is_unreadable_channel(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::ProviderTransient(code)
            if CHANNEL_ERRORS.contains(&code.as_str())
    )
}

fn split_thread_id(provider_thread_id: &str) -> Result<(&str, Option<&str>)> {
    let mut parts = provider_thread_id.splitn(2, ':');
    let channel = parts.next().filter(|c| !c.is_empty()).ok_or_else(|| {
        SyncError::InvalidInput(format!("invalid slack thread id '{}'", provider_thread_id))
    })?;
    Ok((channel, parts.next().filter(|ts| !ts.is_empty())))
}

fn parse_ts(ts: &str) -> Option<f64> {
    ts.parse::<f64>().ok()
}

fn ts_to_datetime(ts: f64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.floor() as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub(crate) fn normalize_history(
    channel: &Channel,
    messages: &[HistoryItem],
    own_external_id: &str,
) -> Vec<NormalizedItem> {
    let last_read = channel
        .last_read
        .as_deref()
        .and_then(parse_ts)
        .filter(|v| *v > 0.0);
    let topic = channel
        .name
        .as_ref()
        .map(|n| format!("#{}", n))
        .unwrap_or_else(|| channel.id.clone());

    messages
        .iter()
        .filter_map(|msg| {
            if msg.subtype.is_some() {
                return None;
            }
            let ts = msg.ts.as_deref()?;
            let text = msg.text.as_deref().filter(|t| !t.is_empty())?;
            let ts_value = parse_ts(ts)?;

            let sender = msg
                .user
                .clone()
                .or_else(|| msg.username.clone())
                .unwrap_or_else(|| "unknown".to_string());
            let root = msg.thread_ts.as_deref().unwrap_or(ts);
            let direction = if sender == own_external_id {
                Direction::Outbound
            } else {
                Direction::Inbound
            };

            Some(NormalizedItem {
                provider_thread_id: format!("{}:{}", channel.id, root),
                provider_message_id: format!("{}:{}", channel.id, ts),
                subject: Some(topic.clone()),
                sender,
                recipients: Vec::new(),
                body_text: truncate_body(text),
                sent_at: ts_to_datetime(ts_value),
                is_unread: last_read.is_none_or(|marker| ts_value > marker),
                direction,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(last_read: Option<&str>) -> Channel {
        Channel {
            id: "C1".to_string(),
            name: Some("general".to_string()),
            last_read: last_read.map(str::to_string),
            is_member: None,
        }
    }

    fn history(json: &str) -> Vec<HistoryItem> {
        decode_response::<History>(json.as_bytes()).unwrap().messages
    }

    #[test]
    fn skips_subtypes_and_empty_items() {
        let messages = history(
            r#"{"ok": true, "messages": [
                {"type": "message", "subtype": "channel_join", "ts": "1700000001.000100", "text": "joined"},
                {"type": "message", "ts": "1700000002.000200", "text": ""},
                {"type": "message", "text": "no ts"},
                {"type": "message", "user": "U2", "ts": "1700000003.000300", "text": "hello"}
            ]}"#,
        );
        let items = normalize_history(&channel(None), &messages, "U1");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].provider_message_id, "C1:1700000003.000300");
        assert_eq!(items[0].subject.as_deref(), Some("#general"));
        assert_eq!(items[0].sent_at.timestamp(), 1_700_000_003);
    }

    #[test]
    fn replies_share_their_root_thread() {
        let messages = history(
            r#"{"ok": true, "messages": [
                {"user": "U2", "ts": "1700000010.000001", "thread_ts": "1700000005.000001", "text": "reply"},
                {"user": "U2", "ts": "1700000005.000001", "thread_ts": "1700000005.000001", "text": "root"}
            ]}"#,
        );
        let items = normalize_history(&channel(None), &messages, "U1");
        assert_eq!(items[0].provider_thread_id, "C1:1700000005.000001");
        assert_eq!(items[1].provider_thread_id, "C1:1700000005.000001");
        assert_ne!(items[0].provider_message_id, items[1].provider_message_id);
    }

    #[test]
    fn unread_follows_last_read_marker() {
        let messages = history(
            r#"{"ok": true, "messages": [
                {"user": "U2", "ts": "1700000020.000000", "text": "new"},
                {"user": "U2", "ts": "1700000010.000000", "text": "old"}
            ]}"#,
        );
        let marked = normalize_history(&channel(Some("1700000015.000000")), &messages, "U1");
        assert!(marked[0].is_unread);
        assert!(!marked[1].is_unread);

        let unmarked = normalize_history(&channel(None), &messages, "U1");
        assert!(unmarked.iter().all(|i| i.is_unread));

        let zero = normalize_history(&channel(Some("0000000000.000000")), &messages, "U1");
        assert!(zero.iter().all(|i| i.is_unread));
    }

    #[test]
    fn own_messages_are_outbound() {
        let messages = history(
            r#"{"ok": true, "messages": [
                {"user": "U1", "ts": "1700000030.000000", "text": "mine"},
                {"username": "deploy-bot", "ts": "1700000031.000000", "text": "bot"}
            ]}"#,
        );
        let items = normalize_history(&channel(None), &messages, "U1");
        assert_eq!(items[0].direction, Direction::Outbound);
        assert_eq!(items[1].direction, Direction::Inbound);
        assert_eq!(items[1].sender, "deploy-bot");
    }

    #[test]
    fn error_envelopes_are_classified() {
        assert!(matches!(
            decode_response::<History>(br#"{"ok": false, "error": "token_revoked"}"#),
            Err(SyncError::CredentialInvalid(code)) if code == "token_revoked"
        ));
        assert!(matches!(
            decode_response::<History>(br#"{"ok": false, "error": "ratelimited"}"#),
            Err(SyncError::ProviderTransient(_))
        ));
        assert!(matches!(
            decode_response::<History>(b"<html>"),
            Err(SyncError::ProviderTransient(_))
        ));
    }

    #[test]
    fn thread_ids_split_into_channel_and_root() {
        assert_eq!(
            split_thread_id("C1:1700000005.000001").unwrap(),
            ("C1", Some("1700000005.000001"))
        );
        assert_eq!(split_thread_id("D9").unwrap(), ("D9", None));
        assert!(split_thread_id(":123").is_err());
    }

    #[test]
    fn only_joined_conversations_are_read() {
        let list = decode_response::<ConversationList>(
            br#"{"ok": true, "channels": [
                {"id": "C1", "name": "general", "is_member": true},
                {"id": "C2", "name": "random", "is_member": false},
                {"id": "D1", "is_im": true}
            ]}"#,
        )
        .unwrap();
        let ids: Vec<&str> = joined_channels(&list.channels)
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["C1", "D1"]);
    }

    #[test]
    fn channel_level_errors_do_not_fail_the_account() {
        let not_in_channel =
            decode_response::<History>(br#"{"ok": false, "error": "not_in_channel"}"#).unwrap_err();
        assert!(is_unreadable_channel(&not_in_channel));

        let rate_limited =
            decode_response::<History>(br#"{"ok": false, "error": "ratelimited"}"#).unwrap_err();
        assert!(!is_unreadable_channel(&rate_limited));

        let revoked =
            decode_response::<History>(br#"{"ok": false, "error": "token_revoked"}"#).unwrap_err();
        assert!(!is_unreadable_channel(&revoked));
    }
}
