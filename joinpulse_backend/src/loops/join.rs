use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use super::announce_unlocked;
use crate::registry::normalize_name;
use crate::runtime::BotContext;
use crate::supervisor::TaskExit;

/// Record a new member right away and announce them after the join delay.
/// The delayed announcement goes through the same per-cycle gate as the
/// periodic loop, so whichever runs second finds the mark and stays quiet.
pub async fn on_member_joined(
    ctx: &Arc<BotContext>,
    display_name: &str,
) -> Option<oneshot::Receiver<TaskExit>> {
    let name = normalize_name(display_name)?;
    ctx.registry.remember(&name).await;

    let delay = Duration::from_secs(ctx.config.join_announce_delay_secs);
    let task_ctx = ctx.clone();
    tracing::info!("New member {:?}; announcing in {:?}", name, delay);
    Some(ctx.supervisor.supervise_after(
        format!("join-announce:{}", name),
        delay,
        async move {
            announce_unlocked(&task_ctx, &name).await?;
            Ok(())
        },
    ))
}
