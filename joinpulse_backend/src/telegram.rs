//! Telegram Bot API client.
//!
//! Outbound calls implement [`ChatTransport`]; failures are classified into
//! [`TransportError`] from the HTTP status and the API's own error payload.
//! Inbound updates are long-polled with `getUpdates` and forwarded as
//! [`InboundEvent`]s over a flume channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::{BotConfig, ButtonConfig};
use crate::inbound::{parse_command, InboundEvent};
use crate::supervisor::StopSignal;
use crate::transport::{ChatTransport, Destination, MessageId, PhotoPost, TransportError};

/// Pause after a failed poll before asking again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<TgMessage>,
    pub callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub chat: TgChat,
    pub message_thread_id: Option<i64>,
    pub from: Option<TgUser>,
    pub text: Option<String>,
    #[serde(default)]
    pub new_chat_members: Vec<TgUser>,
}

#[derive(Debug, Deserialize)]
pub struct TgChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TgCallbackQuery {
    pub id: String,
    pub from: TgUser,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

impl TgUser {
    /// "First Last", falling back to the username and then the numeric id.
    pub fn display_name(&self) -> String {
        let full = match &self.last_name {
            Some(last) if !last.trim().is_empty() => {
                format!("{} {}", self.first_name.trim(), last.trim())
            }
            _ => self.first_name.trim().to_string(),
        };
        let full = full.trim();
        if !full.is_empty() {
            return full.to_string();
        }
        match &self.username {
            Some(username) if !username.trim().is_empty() => username.trim().to_string(),
            _ => self.id.to_string(),
        }
    }
}

// ─── Error classification ────────────────────────────────────────────────────

/// Map a failed API call onto the transport error taxonomy.
pub fn classify_failure(
    status: Option<u16>,
    description: &str,
    retry_after: Option<u64>,
) -> TransportError {
    if let Some(secs) = retry_after {
        return TransportError::RateLimited {
            retry_after: Duration::from_secs(secs),
        };
    }
    match status {
        Some(429) => TransportError::RateLimited {
            retry_after: Duration::from_secs(1),
        },
        Some(401) | Some(403) => TransportError::PermissionDenied(description.to_string()),
        Some(code) if code >= 500 => TransportError::Transient(format!("HTTP {}: {}", code, description)),
        _ => TransportError::Malformed(description.to_string()),
    }
}

fn classify_request_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        return TransportError::Transient(err.to_string());
    }
    match err.status() {
        Some(status) => classify_failure(Some(status.as_u16()), &err.to_string(), None),
        None => TransportError::Transient(err.to_string()),
    }
}

fn reply_markup(buttons: &[ButtonConfig]) -> Option<serde_json::Value> {
    if buttons.is_empty() {
        return None;
    }
    let row: Vec<serde_json::Value> = buttons
        .iter()
        .map(|button| {
            let mut entry = serde_json::json!({ "text": button.text });
            if let Some(url) = &button.url {
                entry["url"] = serde_json::Value::String(url.clone());
            } else {
                let data = button.callback_data.as_deref().unwrap_or(&button.text);
                entry["callback_data"] = serde_json::Value::String(data.to_string());
            }
            entry
        })
        .collect();
    Some(serde_json::json!({ "inline_keyboard": [row] }))
}

/// Turn raw updates into events. Joins outside `group_chat_id` and joins of
/// bots are dropped here.
pub fn updates_to_events(updates: &[Update], group_chat_id: i64) -> Vec<InboundEvent> {
    let mut events = Vec::new();
    for update in updates {
        if let Some(query) = &update.callback_query {
            events.push(InboundEvent::ButtonPressed {
                callback_id: query.id.clone(),
                data: query.data.clone().unwrap_or_default(),
            });
        }

        let Some(msg) = &update.message else {
            continue;
        };

        if msg.chat.id == group_chat_id {
            for member in msg.new_chat_members.iter().filter(|m| !m.is_bot) {
                events.push(InboundEvent::MemberJoined {
                    chat_id: msg.chat.id,
                    display_name: member.display_name(),
                });
            }
        } else if !msg.new_chat_members.is_empty() {
            tracing::debug!("Telegram: ignoring join in chat {}", msg.chat.id);
        }

        if let Some(command) = msg.text.as_deref().and_then(parse_command) {
            events.push(InboundEvent::Command {
                chat_id: msg.chat.id,
                thread_id: msg.message_thread_id,
                command,
            });
        }
    }
    events
}

// ─── Client ──────────────────────────────────────────────────────────────────

pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    poll_timeout_secs: u64,
}

impl TelegramClient {
    pub fn new(config: &BotConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_base: format!("https://api.telegram.org/bot{}", config.bot_token),
            poll_timeout_secs: config.poll_timeout_secs,
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.api_base, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TransportError> {
        let resp = request.send().await.map_err(classify_request_error)?;
        let status = resp.status();

        let body: ApiResponse<T> = match resp.json().await {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                return Err(TransportError::Malformed(format!(
                    "{}: unreadable response: {}",
                    method, e
                )))
            }
            Err(e) => return Err(classify_failure(Some(status.as_u16()), &e.to_string(), None)),
        };

        if body.ok {
            return body
                .result
                .ok_or_else(|| TransportError::Malformed(format!("{}: missing result", method)));
        }

        let description = body
            .description
            .unwrap_or_else(|| format!("{} returned ok=false", method));
        Err(classify_failure(
            body.error_code.or(Some(status.as_u16())),
            &description,
            body.parameters.and_then(|p| p.retry_after),
        ))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<T, TransportError> {
        let request = self.http.post(self.url(method)).json(&payload);
        self.call(method, request).await
    }

    /// Remove any webhook and discard the backlog queued while we were down.
    pub async fn drop_pending_updates(&self) -> Result<(), TransportError> {
        let _: bool = self
            .post_json(
                "deleteWebhook",
                serde_json::json!({ "drop_pending_updates": true }),
            )
            .await?;
        tracing::info!("Telegram: pending updates dropped");
        Ok(())
    }

    pub async fn poll_updates(&self, offset: i64) -> Result<Vec<Update>, TransportError> {
        self.post_json(
            "getUpdates",
            serde_json::json!({
                "offset": offset,
                "timeout": self.poll_timeout_secs,
                "allowed_updates": ["message", "callback_query"]
            }),
        )
        .await
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send_text(&self, dest: Destination, text: &str) -> Result<MessageId, TransportError> {
        let mut payload = serde_json::json!({ "chat_id": dest.chat_id, "text": text });
        if let Some(thread_id) = dest.thread_id {
            payload["message_thread_id"] = thread_id.into();
        }
        let sent: SentMessage = self.post_json("sendMessage", payload).await?;
        Ok(sent.message_id)
    }

    async fn send_photo(
        &self,
        dest: Destination,
        photo: &PhotoPost,
    ) -> Result<MessageId, TransportError> {
        let bytes = tokio::fs::read(&photo.path).await.map_err(|e| {
            TransportError::Malformed(format!("cannot read {}: {}", photo.path.display(), e))
        })?;
        let file_name = photo
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "photo.jpg".to_string());

        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", dest.chat_id.to_string())
            .text("caption", photo.caption.clone())
            .part(
                "photo",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );
        if let Some(thread_id) = dest.thread_id {
            form = form.text("message_thread_id", thread_id.to_string());
        }
        if let Some(markup) = reply_markup(&photo.keyboard) {
            form = form.text("reply_markup", markup.to_string());
        }

        let request = self.http.post(self.url("sendPhoto")).multipart(form);
        let sent: SentMessage = self.call("sendPhoto", request).await?;
        Ok(sent.message_id)
    }

    async fn delete_message(
        &self,
        chat_id: i64,
        message_id: MessageId,
    ) -> Result<(), TransportError> {
        let _: bool = self
            .post_json(
                "deleteMessage",
                serde_json::json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await?;
        Ok(())
    }

    async fn pin_message(&self, chat_id: i64, message_id: MessageId) -> Result<(), TransportError> {
        let _: bool = self
            .post_json(
                "pinChatMessage",
                serde_json::json!({
                    "chat_id": chat_id,
                    "message_id": message_id,
                    "disable_notification": true
                }),
            )
            .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), TransportError> {
        let _: bool = self
            .post_json(
                "answerCallbackQuery",
                serde_json::json!({
                    "callback_query_id": callback_id,
                    "text": text,
                    "show_alert": true
                }),
            )
            .await?;
        Ok(())
    }
}

// ─── Poll loop ───────────────────────────────────────────────────────────────

/// Long-poll `getUpdates` and forward events until stopped or the receiver
/// goes away.
pub async fn run_update_poller(
    client: Arc<TelegramClient>,
    group_chat_id: i64,
    events: flume::Sender<InboundEvent>,
    mut stop: StopSignal,
) -> anyhow::Result<()> {
    tracing::info!("Telegram update polling active (group {})", group_chat_id);
    let mut offset: i64 = 0;

    loop {
        let polled = tokio::select! {
            polled = client.poll_updates(offset) => polled,
            _ = stop.stopped() => break,
        };

        let wait = match polled {
            Ok(updates) => {
                if let Some(last) = updates.iter().map(|u| u.update_id).max() {
                    offset = last + 1;
                }
                for event in updates_to_events(&updates, group_chat_id) {
                    if events.send(event).is_err() {
                        tracing::info!("Telegram: event receiver closed");
                        return Ok(());
                    }
                }
                continue;
            }
            Err(TransportError::RateLimited { retry_after }) => {
                tracing::warn!("Telegram getUpdates rate limited for {:?}", retry_after);
                retry_after
            }
            Err(e) => {
                tracing::warn!("Telegram getUpdates error: {}", e);
                POLL_ERROR_BACKOFF
            }
        };

        if !stop.sleep(wait).await {
            break;
        }
    }

    tracing::info!("Telegram update polling stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::Command;

    #[test]
    fn failures_are_classified() {
        assert_eq!(
            classify_failure(Some(429), "Too Many Requests", Some(17)),
            TransportError::RateLimited {
                retry_after: Duration::from_secs(17)
            }
        );
        assert!(matches!(
            classify_failure(Some(502), "Bad Gateway", None),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            classify_failure(Some(403), "bot was kicked", None),
            TransportError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_failure(Some(400), "message to delete not found", None),
            TransportError::Malformed(_)
        ));
        assert!(classify_failure(None, "ok=false", None).is_fatal());
    }

    #[test]
    fn display_name_falls_back_in_order() {
        let mut user = TgUser {
            id: 9,
            is_bot: false,
            first_name: "Eva".to_string(),
            last_name: Some("Jansen".to_string()),
            username: Some("evaj".to_string()),
        };
        assert_eq!(user.display_name(), "Eva Jansen");
        user.first_name.clear();
        user.last_name = None;
        assert_eq!(user.display_name(), "evaj");
        user.username = None;
        assert_eq!(user.display_name(), "9");
    }

    #[test]
    fn updates_become_events() {
        let raw = r#"[
            {"update_id": 1, "message": {"message_id": 10, "chat": {"id": -100123},
              "new_chat_members": [
                {"id": 1, "is_bot": false, "first_name": "Finn"},
                {"id": 2, "is_bot": true, "first_name": "Helper"}
              ]}},
            {"update_id": 2, "message": {"message_id": 11, "chat": {"id": -100123},
              "message_thread_id": 77, "text": "/used@joinpulse_bot Finn",
              "from": {"id": 3, "first_name": "Mod"}}},
            {"update_id": 3, "callback_query": {"id": "cb-9", "data": "rules",
              "from": {"id": 4, "first_name": "Gus"}}},
            {"update_id": 4, "message": {"message_id": 12, "chat": {"id": 555},
              "new_chat_members": [{"id": 5, "first_name": "Elsewhere"}]}}
        ]"#;
        let updates: Vec<Update> = serde_json::from_str(raw).unwrap();

        let events = updates_to_events(&updates, -100123);
        assert_eq!(
            events,
            vec![
                InboundEvent::MemberJoined {
                    chat_id: -100123,
                    display_name: "Finn".to_string()
                },
                InboundEvent::Command {
                    chat_id: -100123,
                    thread_id: Some(77),
                    command: Command::Used(Some("Finn".to_string())),
                },
                InboundEvent::ButtonPressed {
                    callback_id: "cb-9".to_string(),
                    data: "rules".to_string()
                },
            ]
        );
    }

    #[test]
    fn keyboard_prefers_url_over_callback() {
        let markup = reply_markup(&[
            ButtonConfig {
                text: "Rules".to_string(),
                callback_data: Some("rules".to_string()),
                url: None,
            },
            ButtonConfig {
                text: "Site".to_string(),
                callback_data: None,
                url: Some("https://example.org".to_string()),
            },
        ])
        .unwrap();
        let row = &markup["inline_keyboard"][0];
        assert_eq!(row[0]["callback_data"], "rules");
        assert_eq!(row[1]["url"], "https://example.org");
        assert!(row[1].get("callback_data").is_none());
        assert!(reply_markup(&[]).is_none());
    }

    #[test]
    fn api_error_payload_parses() {
        let raw = r#"{"ok": false, "error_code": 429, "description": "Too Many Requests: retry after 31",
                      "parameters": {"retry_after": 31}}"#;
        let body: ApiResponse<bool> = serde_json::from_str(raw).unwrap();
        assert!(!body.ok);
        let err = classify_failure(
            body.error_code,
            body.description.as_deref().unwrap_or_default(),
            body.parameters.and_then(|p| p.retry_after),
        );
        assert_eq!(
            err,
            TransportError::RateLimited {
                retry_after: Duration::from_secs(31)
            }
        );
    }

    #[test]
    fn client_builds_without_network() {
        let config = BotConfig {
            bot_token: "123:abc".to_string(),
            ..BotConfig::default()
        };
        let client = TelegramClient::new(&config).unwrap();
        assert_eq!(
            client.url("getMe"),
            "https://api.telegram.org/bot123:abc/getMe"
        );
    }
}
