use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::BotConfig;
use crate::cycle::CycleClock;
use crate::database::BotDatabase;
use crate::inbound::{run_dispatcher, InboundEvent};
use crate::loops::activity::ActivitySimulate;
use crate::loops::cleanup::VerifyTopicCleanup;
use crate::loops::cycle_reset::CycleReset;
use crate::loops::daily_post::DailyPost;
use crate::loops::verify_announce::VerifyAnnounce;
use crate::registry::NameRegistry;
use crate::sender::RateLimitedSender;
use crate::supervisor::TaskSupervisor;
use crate::telegram::{run_update_poller, TelegramClient};
use crate::tracker::MessageTracker;
use crate::transport::{ChatTransport, Destination};

/// Everything a loop or handler needs, owned once and shared by `Arc`.
pub struct BotContext {
    pub config: Arc<BotConfig>,
    pub clock: CycleClock,
    pub db: Arc<BotDatabase>,
    pub registry: Arc<NameRegistry>,
    pub tracker: Arc<MessageTracker>,
    pub sender: Arc<RateLimitedSender>,
    pub supervisor: Arc<TaskSupervisor>,
}

impl BotContext {
    pub fn new(config: BotConfig, transport: Arc<dyn ChatTransport>) -> Result<Self> {
        let clock = CycleClock::new(config.boundary_time()?, config.timezone()?);
        let db = Arc::new(
            BotDatabase::new(&config.database_path, config.db_pool_size)
                .context("Failed to open bot database")?,
        );
        let registry = Arc::new(NameRegistry::new(db.clone(), clock));
        let tracker = Arc::new(MessageTracker::new(
            db.clone(),
            config.retention(),
            config.bot_msg_max_rows,
            config.bot_msg_prune_every,
        ));
        let verify_dest = Destination::new(config.group_chat_id, config.verify_thread_id);
        let sender = Arc::new(RateLimitedSender::new(
            transport,
            tracker.clone(),
            Some(verify_dest),
            Duration::from_secs(config.rate_limit_margin_secs),
            Duration::from_secs(config.transient_cooldown_secs),
        ));

        Ok(Self {
            config: Arc::new(config),
            clock,
            db,
            registry,
            tracker,
            sender,
            supervisor: Arc::new(TaskSupervisor::new()),
        })
    }

    pub fn verify_dest(&self) -> Destination {
        Destination::new(self.config.group_chat_id, self.config.verify_thread_id)
    }

    pub fn announce_dest(&self) -> Destination {
        Destination::new(self.config.group_chat_id, self.config.announce_thread_id)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.config.loop_retry_secs)
    }
}

pub struct BotRuntimeBuilder {
    config: BotConfig,
    transport: Option<Arc<dyn ChatTransport>>,
}

impl BotRuntimeBuilder {
    pub fn new(config: BotConfig) -> Self {
        Self {
            config,
            transport: None,
        }
    }

    /// Replace the Telegram transport for outbound calls.
    pub fn with_transport(mut self, transport: Arc<dyn ChatTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub async fn build(self) -> Result<BotRuntime> {
        let telegram = Arc::new(TelegramClient::new(&self.config)?);
        let transport = self
            .transport
            .unwrap_or_else(|| telegram.clone() as Arc<dyn ChatTransport>);
        let ctx = Arc::new(BotContext::new(self.config, transport)?);

        ctx.registry
            .load_all()
            .await
            .context("Failed to load known participant names")?;

        Ok(BotRuntime { ctx, telegram })
    }
}

pub struct BotRuntime {
    ctx: Arc<BotContext>,
    telegram: Arc<TelegramClient>,
}

impl BotRuntime {
    pub async fn bootstrap(config: BotConfig) -> Result<Self> {
        BotRuntimeBuilder::new(config).build().await
    }

    pub fn context(&self) -> &Arc<BotContext> {
        &self.ctx
    }

    /// Start every enabled loop plus inbound polling under the supervisor.
    pub async fn start(&self) -> Result<()> {
        let ctx = &self.ctx;
        let config = &ctx.config;
        let supervisor = &ctx.supervisor;

        tracing::info!("ENABLE_DAILY={}", config.enable_daily as u8);
        tracing::info!("ENABLE_VERIFY={}", config.enable_verify as u8);
        tracing::info!("ENABLE_ACTIVITY={}", config.enable_activity as u8);
        tracing::info!("ENABLE_CLEANUP={}", config.enable_cleanup as u8);

        if config.drop_pending_updates {
            if let Err(e) = self.telegram.drop_pending_updates().await {
                tracing::warn!("Could not drop pending updates: {}", e);
            }
        }

        if config.enable_daily {
            let stop = supervisor.stop_signal();
            let daily = DailyPost::new(ctx.clone());
            supervisor.supervise("daily-post", async move { daily.run(stop).await });
        }
        if config.enable_verify {
            let stop = supervisor.stop_signal();
            let verify = VerifyAnnounce::new(ctx.clone());
            supervisor.supervise("verify-announce", async move { verify.run(stop).await });
        }
        if config.enable_activity {
            let stop = supervisor.stop_signal();
            let activity = ActivitySimulate::new(ctx.clone());
            supervisor.supervise("activity-simulate", async move { activity.run(stop).await });
        }
        if config.enable_cleanup {
            let stop = supervisor.stop_signal();
            let cleanup = VerifyTopicCleanup::new(ctx.clone());
            supervisor.supervise("verify-topic-cleanup", async move { cleanup.run(stop).await });
        }

        let stop = supervisor.stop_signal();
        let reset = CycleReset::new(ctx.clone());
        supervisor.supervise("cycle-reset", async move { reset.run(stop).await });

        let (event_tx, event_rx) = flume::unbounded::<InboundEvent>();
        let telegram = self.telegram.clone();
        let group_chat_id = config.group_chat_id;
        let stop = supervisor.stop_signal();
        supervisor.supervise("update-poller", async move {
            run_update_poller(telegram, group_chat_id, event_tx, stop).await
        });

        let dispatch_ctx = ctx.clone();
        let stop = supervisor.stop_signal();
        supervisor.supervise("inbound-dispatch", async move {
            run_dispatcher(dispatch_ctx, event_rx, stop).await
        });

        tracing::info!(
            "Bot running: {} supervised task(s), cycle {}",
            supervisor.active_tasks(),
            ctx.clock.current()
        );
        Ok(())
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.ctx.supervisor.shutdown(grace).await;
        tracing::info!("Bot stopped");
    }
}
