//! Chat transport seam.
//!
//! The rest of the crate only sees [`ChatTransport`]: send text, send a photo,
//! delete, pin and answer a button press. Failures arrive already classified
//! so the sender can decide between cooldown and giving up.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ButtonConfig;

pub type MessageId = i64;

/// A chat plus an optional forum topic inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
}

impl Destination {
    pub fn new(chat_id: i64, thread_id: Option<i64>) -> Self {
        Self { chat_id, thread_id }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    /// The API asked us to back off for `retry_after`.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    /// Network hiccup, timeout or server-side 5xx.
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Fatal errors abort the current call and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::PermissionDenied(_) | TransportError::Malformed(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoPost {
    pub path: PathBuf,
    pub caption: String,
    pub keyboard: Vec<ButtonConfig>,
}

/// One outbound chat-API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundOp {
    Text {
        dest: Destination,
        text: String,
    },
    Photo {
        dest: Destination,
        photo: PhotoPost,
    },
    Delete {
        chat_id: i64,
        message_id: MessageId,
    },
    Pin {
        chat_id: i64,
        message_id: MessageId,
    },
    /// Popup reply to an inline-keyboard press.
    AnswerCallback {
        callback_id: String,
        text: String,
    },
}

impl OutboundOp {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundOp::Text { .. } => "send_text",
            OutboundOp::Photo { .. } => "send_photo",
            OutboundOp::Delete { .. } => "delete_message",
            OutboundOp::Pin { .. } => "pin_message",
            OutboundOp::AnswerCallback { .. } => "answer_callback",
        }
    }

    /// Destination of a message-creating call.
    pub fn destination(&self) -> Option<Destination> {
        match self {
            OutboundOp::Text { dest, .. } | OutboundOp::Photo { dest, .. } => Some(*dest),
            OutboundOp::Delete { .. }
            | OutboundOp::Pin { .. }
            | OutboundOp::AnswerCallback { .. } => None,
        }
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, dest: Destination, text: &str) -> Result<MessageId, TransportError>;

    async fn send_photo(
        &self,
        dest: Destination,
        photo: &PhotoPost,
    ) -> Result<MessageId, TransportError>;

    async fn delete_message(&self, chat_id: i64, message_id: MessageId)
        -> Result<(), TransportError>;

    async fn pin_message(&self, chat_id: i64, message_id: MessageId) -> Result<(), TransportError>;

    /// Popup reply to an inline-keyboard press.
    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), TransportError>;
}
