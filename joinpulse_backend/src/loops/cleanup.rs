use std::sync::Arc;

use anyhow::Result;

use super::run_at_boundaries;
use crate::runtime::BotContext;
use crate::supervisor::StopSignal;

/// At every cycle boundary, delete the bot's tracked verify-thread messages.
pub struct VerifyTopicCleanup {
    ctx: Arc<BotContext>,
}

impl VerifyTopicCleanup {
    pub fn new(ctx: Arc<BotContext>) -> Self {
        Self { ctx }
    }

    /// Returns how many messages stay tracked for the next sweep.
    pub async fn sweep(&self) -> Result<usize> {
        if let Ok(Some(oldest)) = self.ctx.db.oldest_tracked_at() {
            tracing::debug!("verify-topic-cleanup: oldest tracked message from {}", oldest);
        }
        let chat_id = self.ctx.config.group_chat_id;
        let sender = self.ctx.sender.clone();
        self.ctx
            .tracker
            .sweep_and_clear(|message_id| {
                let sender = sender.clone();
                async move { sender.delete(chat_id, message_id).await }
            })
            .await
    }

    pub async fn run(self, stop: StopSignal) -> Result<()> {
        let clock = self.ctx.clock;
        run_at_boundaries(
            "verify-topic-cleanup",
            clock,
            self.ctx.retry_delay(),
            stop,
            || async { self.sweep().await.map(|_| ()) },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::cleanup;
    use crate::runtime::tests::test_context;

    #[tokio::test]
    async fn failed_deletes_survive_until_next_sweep() {
        let (ctx, transport, path) = test_context("cleanup_sweep");
        let dest = ctx.verify_dest();
        let mut ids = Vec::new();
        for text in ["one", "two", "three"] {
            let outcome = ctx.sender.send_text(dest, text).await.unwrap();
            ids.push(outcome.message_id().unwrap());
        }

        transport.fail_deletes_of(&[ids[1]]);
        let cleanup_loop = VerifyTopicCleanup::new(ctx.clone());
        assert_eq!(cleanup_loop.sweep().await.unwrap(), 1);
        assert_eq!(ctx.db.tracked_message_ids().unwrap(), vec![ids[1]]);

        transport.fail_deletes_of(&[]);
        assert_eq!(cleanup_loop.sweep().await.unwrap(), 0);
        assert_eq!(ctx.tracker.tracked_count().unwrap(), 0);
        cleanup(&path);
    }
}
