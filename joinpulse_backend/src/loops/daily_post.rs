use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::sync::oneshot;

use super::run_periodic;
use crate::runtime::BotContext;
use crate::supervisor::{StopSignal, TaskExit};
use crate::transport::{MessageId, OutboundOp, PhotoPost};

const LAST_POST_KEY: &str = "daily_post_message_id";

/// Headroom past the sender cooldown before the one retried delete.
const COOLDOWN_SLACK: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
pub struct DailyTick {
    pub posted: Option<MessageId>,
    /// Completion of the scheduled removal of the previous post.
    pub previous_deletion: Option<oneshot::Receiver<TaskExit>>,
}

/// Banner photo with caption and buttons, pinned, replacing the previous one.
pub struct DailyPost {
    ctx: Arc<BotContext>,
    previous: Mutex<Option<MessageId>>,
}

impl DailyPost {
    /// Picks up the banner left by a previous run so it still gets replaced.
    pub fn new(ctx: Arc<BotContext>) -> Self {
        let previous = ctx.db.get_state(LAST_POST_KEY).unwrap_or_else(|e| {
            tracing::warn!("daily-post: could not read last banner id: {:#}", e);
            None
        });
        Self {
            ctx,
            previous: Mutex::new(previous),
        }
    }

    pub async fn tick(&self) -> Result<DailyTick> {
        let config = &self.ctx.config;
        let path = PathBuf::from(&config.daily_photo_path);
        if !path.is_file() {
            bail!("Daily banner {:?} not found", path);
        }

        let dest = self.ctx.announce_dest();
        let outcome = self
            .ctx
            .sender
            .send(OutboundOp::Photo {
                dest,
                photo: PhotoPost {
                    path,
                    caption: config.daily_caption.clone(),
                    keyboard: config.daily_buttons.clone(),
                },
            })
            .await?;

        let Some(posted) = outcome.message_id() else {
            tracing::info!("daily-post: send suppressed, keeping previous post");
            return Ok(DailyTick::default());
        };

        if let Err(e) = self
            .ctx
            .sender
            .send(OutboundOp::Pin {
                chat_id: dest.chat_id,
                message_id: posted,
            })
            .await
        {
            tracing::warn!("daily-post: could not pin message {}: {}", posted, e);
        }

        let previous = self
            .previous
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(posted);

        if let Err(e) = self.ctx.db.set_state(LAST_POST_KEY, posted) {
            tracing::warn!("daily-post: could not persist banner id {}: {:#}", posted, e);
        }

        let previous_deletion = previous.map(|old| {
            let sender = self.ctx.sender.clone();
            let mut stop = self.ctx.supervisor.stop_signal();
            let chat_id = dest.chat_id;
            self.ctx.supervisor.supervise_after(
                format!("daily-post-delete:{}", old),
                Duration::from_secs(config.daily_delete_previous_after_secs),
                async move {
                    if sender.delete(chat_id, old).await {
                        return Ok(());
                    }
                    // Suppressed by a cooldown: try once more after it passes.
                    if let Some(wait) = sender.cooldown_remaining(Utc::now()) {
                        if stop.sleep(wait + COOLDOWN_SLACK).await
                            && sender.delete(chat_id, old).await
                        {
                            return Ok(());
                        }
                    }
                    tracing::warn!("daily-post: previous post {} was not deleted", old);
                    Ok(())
                },
            )
        });

        tracing::info!("daily-post: posted and pinned message {}", posted);
        Ok(DailyTick {
            posted: Some(posted),
            previous_deletion,
        })
    }

    pub async fn run(self, stop: StopSignal) -> Result<()> {
        let period = Duration::from_secs(self.ctx.config.daily_post_interval_secs);
        run_periodic(
            "daily-post",
            period,
            self.ctx.retry_delay(),
            stop,
            || async { self.tick().await.map(|_| ()) },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ButtonConfig;
    use crate::database::tests::cleanup;
    use crate::runtime::tests::{test_context_with, TEST_CHAT};
    use crate::transport::fake::Call;
    use crate::transport::{Destination, TransportError};

    #[tokio::test]
    async fn posts_pins_and_replaces_previous() {
        let banner = tempfile::NamedTempFile::new().unwrap();
        let banner_path = banner.path().display().to_string();
        let (ctx, transport, path) = test_context_with("daily_replace", |c| {
            c.daily_photo_path = banner_path;
            c.daily_delete_previous_after_secs = 0;
            c.daily_caption = "Daily".to_string();
            c.daily_buttons = vec![ButtonConfig {
                text: "Rules".to_string(),
                callback_data: Some("rules".to_string()),
                url: None,
            }];
        });
        let daily = DailyPost::new(ctx.clone());

        let first = daily.tick().await.unwrap();
        assert!(first.previous_deletion.is_none());
        let first_id = first.posted.unwrap();

        let second = daily.tick().await.unwrap();
        let exit = second.previous_deletion.expect("deletion scheduled");
        assert_eq!(exit.await.unwrap(), TaskExit::Completed);

        let calls = transport.calls();
        let general = Destination::new(TEST_CHAT, None);
        assert_eq!(calls[0], Call::Photo(general, "Daily".to_string()));
        assert_eq!(calls[1], Call::Pin(TEST_CHAT, first_id));
        assert!(calls.contains(&Call::Delete(TEST_CHAT, first_id)));
        // Daily posts are outside the verify thread.
        assert_eq!(ctx.tracker.tracked_count().unwrap(), 0);
        cleanup(&path);
    }

    #[tokio::test]
    async fn missing_banner_faults_the_tick() {
        let (ctx, transport, path) = test_context_with("daily_missing", |c| {
            c.daily_photo_path = "/nonexistent/banner.jpg".to_string();
        });

        let err = DailyPost::new(ctx).tick().await.unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(transport.calls().is_empty());
        cleanup(&path);
    }

    #[tokio::test]
    async fn throttled_delete_is_retried_after_cooldown() {
        let banner = tempfile::NamedTempFile::new().unwrap();
        let banner_path = banner.path().display().to_string();
        let (ctx, transport, path) = test_context_with("daily_throttled_delete", |c| {
            c.daily_photo_path = banner_path;
            c.daily_delete_previous_after_secs = 0;
            c.rate_limit_margin_secs = 0;
        });
        let daily = DailyPost::new(ctx.clone());

        let first_id = daily.tick().await.unwrap().posted.unwrap();
        let second = daily.tick().await.unwrap();
        // The scheduled delete has not run yet; throttle it.
        transport.fail_next(TransportError::RateLimited {
            retry_after: Duration::from_millis(200),
        });

        let exit = second.previous_deletion.expect("deletion scheduled");
        assert_eq!(exit.await.unwrap(), TaskExit::Completed);
        assert!(transport.calls().contains(&Call::Delete(TEST_CHAT, first_id)));
        cleanup(&path);
    }

    #[tokio::test]
    async fn banner_from_previous_run_is_replaced() {
        let banner = tempfile::NamedTempFile::new().unwrap();
        let banner_path = banner.path().display().to_string();
        let (ctx, transport, path) = test_context_with("daily_restart", |c| {
            c.daily_photo_path = banner_path;
            c.daily_delete_previous_after_secs = 0;
        });

        let first_id = DailyPost::new(ctx.clone()).tick().await.unwrap().posted.unwrap();

        // Fresh instance, as after a restart.
        let restarted = DailyPost::new(ctx.clone());
        let tick = restarted.tick().await.unwrap();
        let exit = tick.previous_deletion.expect("old banner scheduled for deletion");
        assert_eq!(exit.await.unwrap(), TaskExit::Completed);
        assert!(transport.calls().contains(&Call::Delete(TEST_CHAT, first_id)));
        cleanup(&path);
    }
}
