//! Single outbound path for every chat-API call.
//!
//! A rate-limit or transient failure does not retry in place: it arms a
//! process-wide cooldown and reports the call as suppressed. Until the
//! cooldown passes every loop's sends are suppressed without touching the
//! network, which keeps one throttled loop from stalling the others.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::tracker::MessageTracker;
use crate::transport::{ChatTransport, Destination, MessageId, OutboundOp, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The call went through; carries the new message id for sends.
    Sent(Option<MessageId>),
    /// Skipped or aborted because of an active or freshly armed cooldown.
    Suppressed,
}

impl SendOutcome {
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            SendOutcome::Sent(id) => *id,
            SendOutcome::Suppressed => None,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent(_))
    }
}

pub struct RateLimitedSender {
    transport: Arc<dyn ChatTransport>,
    tracker: Arc<MessageTracker>,
    verify_dest: Option<Destination>,
    /// Unix millis before which sends are suppressed.
    cooldown_until_ms: AtomicI64,
    margin: Duration,
    transient_cooldown: Duration,
}

impl RateLimitedSender {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        tracker: Arc<MessageTracker>,
        verify_dest: Option<Destination>,
        margin: Duration,
        transient_cooldown: Duration,
    ) -> Self {
        Self {
            transport,
            tracker,
            verify_dest,
            cooldown_until_ms: AtomicI64::new(0),
            margin,
            transient_cooldown,
        }
    }

    pub async fn send(&self, op: OutboundOp) -> Result<SendOutcome, TransportError> {
        self.send_at(op, Utc::now()).await
    }

    pub async fn send_at(
        &self,
        op: OutboundOp,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome, TransportError> {
        if let Some(remaining) = self.cooldown_remaining(now) {
            tracing::debug!(
                "Suppressed {} ({}s of cooldown left)",
                op.kind(),
                remaining.as_secs()
            );
            return Ok(SendOutcome::Suppressed);
        }

        let result = match &op {
            OutboundOp::Text { dest, text } => self.transport.send_text(*dest, text).await.map(Some),
            OutboundOp::Photo { dest, photo } => {
                self.transport.send_photo(*dest, photo).await.map(Some)
            }
            OutboundOp::Delete {
                chat_id,
                message_id,
            } => self
                .transport
                .delete_message(*chat_id, *message_id)
                .await
                .map(|_| None),
            OutboundOp::Pin {
                chat_id,
                message_id,
            } => self
                .transport
                .pin_message(*chat_id, *message_id)
                .await
                .map(|_| None),
            OutboundOp::AnswerCallback { callback_id, text } => self
                .transport
                .answer_callback(callback_id, text)
                .await
                .map(|_| None),
        };

        match result {
            Ok(message_id) => {
                if let (Some(id), Some(dest)) = (message_id, op.destination()) {
                    if Some(dest) == self.verify_dest {
                        if let Err(e) = self.tracker.track_at(id, now) {
                            tracing::warn!("Failed to track verify-thread message {}: {}", id, e);
                        }
                    }
                }
                Ok(SendOutcome::Sent(message_id))
            }
            Err(TransportError::RateLimited { retry_after }) => {
                let until = self.arm_cooldown(now, retry_after + self.margin);
                tracing::warn!(
                    "{} rate limited; suppressing sends until {}",
                    op.kind(),
                    until.to_rfc3339()
                );
                Ok(SendOutcome::Suppressed)
            }
            Err(TransportError::Transient(reason)) => {
                let until = self.arm_cooldown(now, self.transient_cooldown);
                tracing::warn!(
                    "{} failed transiently ({}); suppressing sends until {}",
                    op.kind(),
                    reason,
                    until.to_rfc3339()
                );
                Ok(SendOutcome::Suppressed)
            }
            Err(fatal) => {
                tracing::error!("{} failed: {}", op.kind(), fatal);
                Err(fatal)
            }
        }
    }

    pub async fn send_text(
        &self,
        dest: Destination,
        text: impl Into<String>,
    ) -> Result<SendOutcome, TransportError> {
        self.send(OutboundOp::Text {
            dest,
            text: text.into(),
        })
        .await
    }

    /// Delete and report plain success; suppression and errors count as failure.
    pub async fn delete(&self, chat_id: i64, message_id: MessageId) -> bool {
        matches!(
            self.send(OutboundOp::Delete {
                chat_id,
                message_id,
            })
            .await,
            Ok(SendOutcome::Sent(_))
        )
    }

    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let until = self.cooldown_until_ms.load(Ordering::Acquire);
        let now_ms = now.timestamp_millis();
        (now_ms < until).then(|| Duration::from_millis((until - now_ms) as u64))
    }

    /// Extend (never shorten) the shared cooldown.
    fn arm_cooldown(&self, now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
        let wait = chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::hours(1));
        let target = (now + wait).timestamp_millis();
        let previous = self.cooldown_until_ms.fetch_max(target, Ordering::AcqRel);
        let effective = previous.max(target);
        DateTime::<Utc>::from_timestamp_millis(effective).unwrap_or(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{cleanup, temp_db_path};
    use crate::database::BotDatabase;
    use crate::transport::fake::{Call, FakeTransport};
    use chrono::Duration as ChronoDuration;

    const CHAT: i64 = -100;
    const VERIFY: Destination = Destination {
        chat_id: CHAT,
        thread_id: Some(7),
    };

    fn build(name: &str) -> (RateLimitedSender, Arc<FakeTransport>, Arc<MessageTracker>, std::path::PathBuf) {
        let path = temp_db_path(name);
        let db = Arc::new(BotDatabase::new(&path, 2).expect("db init"));
        let tracker = Arc::new(MessageTracker::new(db, ChronoDuration::hours(72), 100, 50));
        let transport = Arc::new(FakeTransport::new());
        let sender = RateLimitedSender::new(
            transport.clone(),
            tracker.clone(),
            Some(VERIFY),
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        (sender, transport, tracker, path)
    }

    fn text(dest: Destination, body: &str) -> OutboundOp {
        OutboundOp::Text {
            dest,
            text: body.to_string(),
        }
    }

    #[tokio::test]
    async fn rate_limit_suppresses_until_retry_after_passes() {
        let (sender, transport, _tracker, path) = build("sender_rate_limit");
        let t = Utc::now();

        transport.fail_next(TransportError::RateLimited {
            retry_after: Duration::from_secs(30),
        });
        let first = sender.send_at(text(VERIFY, "a"), t).await.unwrap();
        assert_eq!(first, SendOutcome::Suppressed);

        let at_10 = sender
            .send_at(text(VERIFY, "b"), t + ChronoDuration::seconds(10))
            .await
            .unwrap();
        assert_eq!(at_10, SendOutcome::Suppressed);
        assert!(transport.calls().is_empty(), "no network call during cooldown");

        let at_31 = sender
            .send_at(text(VERIFY, "c"), t + ChronoDuration::seconds(31))
            .await
            .unwrap();
        assert!(at_31.is_sent());
        assert_eq!(transport.texts(), vec!["c"]);
        cleanup(&path);
    }

    #[tokio::test]
    async fn transient_failure_arms_short_cooldown() {
        let (sender, transport, _tracker, path) = build("sender_transient");
        let t = Utc::now();

        transport.fail_next(TransportError::Transient("timeout".to_string()));
        let outcome = sender.send_at(text(VERIFY, "a"), t).await.unwrap();
        assert_eq!(outcome, SendOutcome::Suppressed);
        assert!(sender.cooldown_remaining(t + ChronoDuration::seconds(4)).is_some());
        assert!(sender.cooldown_remaining(t + ChronoDuration::seconds(5)).is_none());
        cleanup(&path);
    }

    #[tokio::test]
    async fn fatal_errors_propagate_without_cooldown() {
        let (sender, transport, _tracker, path) = build("sender_fatal");
        let t = Utc::now();

        transport.fail_next(TransportError::PermissionDenied("not admin".to_string()));
        let err = sender
            .send_at(
                OutboundOp::Pin {
                    chat_id: CHAT,
                    message_id: 1,
                },
                t,
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(sender.cooldown_remaining(t).is_none());
        cleanup(&path);
    }

    #[tokio::test]
    async fn only_verify_thread_messages_are_tracked() {
        let (sender, transport, tracker, path) = build("sender_tracking");
        let elsewhere = Destination::new(CHAT, None);

        sender.send_text(VERIFY, "tracked").await.unwrap();
        sender.send_text(elsewhere, "not tracked").await.unwrap();
        assert_eq!(tracker.tracked_count().unwrap(), 1);

        assert!(sender.delete(CHAT, 1000).await);
        assert_eq!(transport.calls().last(), Some(&Call::Delete(CHAT, 1000)));
        cleanup(&path);
    }

    #[tokio::test]
    async fn shorter_cooldown_never_shrinks_longer_one() {
        let (sender, transport, _tracker, path) = build("sender_extend");
        let t = Utc::now();

        transport.fail_next(TransportError::RateLimited {
            retry_after: Duration::from_secs(60),
        });
        sender.send_at(text(VERIFY, "a"), t).await.unwrap();
        // Arm a shorter one directly.
        sender.arm_cooldown(t, Duration::from_secs(5));
        assert!(sender
            .cooldown_remaining(t + ChronoDuration::seconds(30))
            .is_some());
        cleanup(&path);
    }
}
