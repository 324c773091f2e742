//! The background behaviours. Each loop owns its cadence, does one unit of
//! work per wake-up and survives its own failures; the supervisor only sees
//! a fault if something escapes that.

pub mod activity;
pub mod cleanup;
pub mod cycle_reset;
pub mod daily_post;
pub mod join;
pub mod verify_announce;

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use crate::cycle::CycleClock;
use crate::runtime::BotContext;
use crate::supervisor::{StopSignal, Ticker};
use crate::transport::TransportError;

/// Consecutive failed attempts before an iteration is skipped.
pub const MAX_ITERATION_ATTEMPTS: usize = 3;

/// Extra wait past a boundary so a slightly early wake-up can't fire twice.
const BOUNDARY_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Sleeping,
    Working,
    Retrying { attempt: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    Announced,
    AlreadyUsed,
    Suppressed,
}

/// Post the "unlocked" line for `name` unless it was already announced this
/// cycle, then record the mark. Two callers racing on the same name may both
/// post; the store still keeps a single mark.
pub async fn announce_unlocked(ctx: &BotContext, name: &str) -> Result<AnnounceOutcome> {
    if ctx.registry.is_used_this_cycle(name)? {
        tracing::debug!("{:?} already announced this cycle", name);
        return Ok(AnnounceOutcome::AlreadyUsed);
    }

    let outcome = ctx
        .sender
        .send_text(ctx.verify_dest(), ctx.config.unlock_text(name))
        .await?;
    if !outcome.is_sent() {
        return Ok(AnnounceOutcome::Suppressed);
    }

    ctx.registry.mark_used_this_cycle(name).await;
    tracing::info!("Announced {:?} as unlocked", name);
    Ok(AnnounceOutcome::Announced)
}

/// A rejected send (permission or malformed request) won't succeed on retry.
fn is_fatal_send(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TransportError>()
        .is_some_and(TransportError::is_fatal)
}

/// Wait before retry `attempt` (1-based): `base`, then doubling.
fn retry_backoff(base: Duration, attempt: usize) -> Duration {
    base * (1u32 << (attempt.saturating_sub(1)).min(6))
}

/// Run `attempt` with bounded retries. Returns `false` if stop was requested.
async fn run_iteration<F, Fut>(
    name: &str,
    retry_delay: Duration,
    stop: &mut StopSignal,
    attempt: &mut F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut state = LoopState::Working;
    loop {
        match attempt().await {
            Ok(()) => return true,
            Err(e) if is_fatal_send(&e) => {
                tracing::error!("{}: send rejected, skipping iteration: {:#}", name, e);
                return true;
            }
            Err(e) => {
                let tries = match state {
                    LoopState::Retrying { attempt } => attempt + 1,
                    _ => 1,
                };
                if tries >= MAX_ITERATION_ATTEMPTS {
                    tracing::error!(
                        "{}: iteration failed {} times, skipping: {:#}",
                        name,
                        tries,
                        e
                    );
                    return true;
                }
                let delay = retry_backoff(retry_delay, tries);
                tracing::warn!(
                    "{}: iteration failed ({:#}); retry {} in {:?}",
                    name,
                    e,
                    tries,
                    delay
                );
                state = LoopState::Retrying { attempt: tries };
                if !stop.sleep(delay).await {
                    return false;
                }
            }
        }
    }
}

/// Do the work, then wait `period`; repeat until stopped.
pub async fn run_periodic<F, Fut>(
    name: &str,
    period: Duration,
    retry_delay: Duration,
    stop: StopSignal,
    mut tick: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    tracing::info!("{} loop started (every {:?})", name, period);
    let mut retry_stop = stop.clone();
    let mut ticker = Ticker::new(period, stop);

    while !ticker.stop_signal().is_stopped() {
        if !run_iteration(name, retry_delay, &mut retry_stop, &mut tick).await {
            break;
        }
        tracing::trace!("{} state {:?}", name, LoopState::Sleeping);
        if !ticker.tick().await {
            break;
        }
    }

    tracing::info!("{} loop stopped", name);
    Ok(())
}

/// Sleep until each cycle boundary, then run `on_boundary`; repeat until stopped.
pub async fn run_at_boundaries<F, Fut>(
    name: &str,
    clock: CycleClock,
    retry_delay: Duration,
    mut stop: StopSignal,
    mut on_boundary: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    tracing::info!("{} loop started (boundary {} {})", name, clock.boundary(), clock.timezone());
    loop {
        let wait = clock.until_next_boundary(Utc::now()) + BOUNDARY_SLACK;
        tracing::debug!("{}: next boundary in {:?}", name, wait);
        if !stop.sleep(wait).await {
            break;
        }
        if !run_iteration(name, retry_delay, &mut stop, &mut on_boundary).await {
            break;
        }
    }
    tracing::info!("{} loop stopped", name);
    Ok(())
}
