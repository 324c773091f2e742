use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::{announce_unlocked, run_periodic, AnnounceOutcome};
use crate::runtime::BotContext;
use crate::supervisor::StopSignal;

/// Every interval, pick one known name at random and announce it unless it
/// was already announced this cycle.
pub struct VerifyAnnounce {
    ctx: Arc<BotContext>,
}

impl VerifyAnnounce {
    pub fn new(ctx: Arc<BotContext>) -> Self {
        Self { ctx }
    }

    pub async fn tick(&self) -> Result<Option<AnnounceOutcome>> {
        let Some(name) = self.ctx.registry.pick_random(&mut rand::thread_rng()) else {
            tracing::debug!("verify-announce: no known names yet");
            return Ok(None);
        };
        announce_unlocked(&self.ctx, &name).await.map(Some)
    }

    pub async fn run(self, stop: StopSignal) -> Result<()> {
        let period = Duration::from_secs(self.ctx.config.verify_interval_secs);
        run_periodic(
            "verify-announce",
            period,
            self.ctx.retry_delay(),
            stop,
            || async { self.tick().await.map(|_| ()) },
        )
        .await
    }
}
