use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::run_periodic;
use crate::alias::generate_alias;
use crate::runtime::BotContext;
use crate::supervisor::StopSignal;
use crate::transport::MessageId;

/// Posts an "unlocked" line for a synthetic alias every interval.
pub struct ActivitySimulate {
    ctx: Arc<BotContext>,
}

impl ActivitySimulate {
    pub fn new(ctx: Arc<BotContext>) -> Self {
        Self { ctx }
    }

    pub async fn tick(&self) -> Result<Option<MessageId>> {
        let known = self.ctx.registry.names();
        let alias = generate_alias(&known, &mut rand::thread_rng());
        let dest = self.ctx.verify_dest();

        let outcome = self
            .ctx
            .sender
            .send_text(dest, self.ctx.config.unlock_text(&alias))
            .await?;
        let Some(message_id) = outcome.message_id() else {
            return Ok(None);
        };
        tracing::debug!("activity-simulate: posted alias {:?}", alias);

        // Without a delay the message waits for the boundary sweep.
        if let Some(delay) = self.ctx.config.activity_delete_after() {
            let sender = self.ctx.sender.clone();
            self.ctx.supervisor.supervise_after(
                format!("activity-delete:{}", message_id),
                delay,
                async move {
                    sender.delete(dest.chat_id, message_id).await;
                    Ok(())
                },
            );
        }
        Ok(Some(message_id))
    }

    pub async fn run(self, stop: StopSignal) -> Result<()> {
        let period = Duration::from_secs(self.ctx.config.activity_interval_secs);
        run_periodic(
            "activity-simulate",
            period,
            self.ctx.retry_delay(),
            stop,
            || async { self.tick().await.map(|_| ()) },
        )
        .await
    }
}
