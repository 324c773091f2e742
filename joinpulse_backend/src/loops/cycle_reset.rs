use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use super::run_at_boundaries;
use crate::runtime::BotContext;
use crate::supervisor::StopSignal;

/// Marks each cycle rollover in the log. Used-name marks are keyed by cycle,
/// so nothing has to be migrated here.
pub struct CycleReset {
    ctx: Arc<BotContext>,
}

impl CycleReset {
    pub fn new(ctx: Arc<BotContext>) -> Self {
        Self { ctx }
    }

    pub fn on_boundary(&self) -> Result<()> {
        let now = Utc::now();
        let cycle = self.ctx.clock.cycle_id(now);
        let previous = self.ctx.clock.cycle_id(now - chrono::Duration::days(1));
        let announced = self
            .ctx
            .db
            .used_names_for_cycle(previous)
            .map(|names| names.len())
            .unwrap_or_default();
        tracing::info!(
            "Cycle rolled over to {} ({} name(s) announced in the previous cycle)",
            cycle,
            announced
        );
        Ok(())
    }

    pub async fn run(self, stop: StopSignal) -> Result<()> {
        let clock = self.ctx.clock;
        run_at_boundaries(
            "cycle-reset",
            clock,
            self.ctx.retry_delay(),
            stop,
            || async { self.on_boundary() },
        )
        .await
    }
}
