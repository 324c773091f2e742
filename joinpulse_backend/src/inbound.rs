//! Inbound events from the chat and what the bot does with them.

use std::sync::Arc;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};

use crate::loops::join::on_member_joined;
use crate::registry::normalize_name;
use crate::runtime::BotContext;
use crate::supervisor::StopSignal;
use crate::transport::{Destination, OutboundOp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Ping,
    /// `/used <name>`; `None` when the name is missing.
    Used(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    MemberJoined {
        chat_id: i64,
        display_name: String,
    },
    ButtonPressed {
        callback_id: String,
        data: String,
    },
    Command {
        chat_id: i64,
        thread_id: Option<i64>,
        command: Command,
    },
}

/// Parse `/start`, `/ping` and `/used <name>`, with or without `@botname`.
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    let rest = text.strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

    match name.as_str() {
        "start" => Some(Command::Start),
        "ping" => Some(Command::Ping),
        "used" => Some(Command::Used(normalize_name(args))),
        _ => None,
    }
}

async fn reply(ctx: &BotContext, dest: Destination, text: String) -> Result<()> {
    ctx.sender.send_text(dest, text).await?;
    Ok(())
}

async fn handle_command(ctx: &BotContext, dest: Destination, command: Command) -> Result<()> {
    match command {
        Command::Start => {
            reply(
                ctx,
                dest,
                "✅ Bot is running. Use /ping or /used <name>.".to_string(),
            )
            .await
        }
        Command::Ping => {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            reply(ctx, dest, format!("pong 🟢 {}", now)).await
        }
        Command::Used(None) => reply(ctx, dest, "Usage: /used <name>".to_string()).await,
        Command::Used(Some(name)) => {
            let text = if ctx.registry.is_used_this_cycle(&name)? {
                format!("⚠️ '{}' is already used this cycle.", name)
            } else {
                ctx.registry.mark_used_this_cycle(&name).await;
                format!("✅ '{}' marked as used for this cycle.", name)
            };
            reply(ctx, dest, text).await
        }
    }
}

pub async fn handle_event(ctx: &Arc<BotContext>, event: InboundEvent) -> Result<()> {
    match event {
        InboundEvent::MemberJoined {
            chat_id,
            display_name,
        } => {
            if chat_id != ctx.config.group_chat_id {
                tracing::debug!("Ignoring join in foreign chat {}", chat_id);
                return Ok(());
            }
            on_member_joined(ctx, &display_name).await;
            Ok(())
        }
        InboundEvent::ButtonPressed { callback_id, data } => {
            let text = ctx.config.popup_for(&data).to_string();
            ctx.sender
                .send(OutboundOp::AnswerCallback { callback_id, text })
                .await?;
            Ok(())
        }
        InboundEvent::Command {
            chat_id,
            thread_id,
            command,
        } => handle_command(ctx, Destination::new(chat_id, thread_id), command).await,
    }
}

/// Drain inbound events until the channel closes or stop is requested.
pub async fn run_dispatcher(
    ctx: Arc<BotContext>,
    events: flume::Receiver<InboundEvent>,
    mut stop: StopSignal,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            received = events.recv_async() => match received {
                Ok(event) => event,
                Err(_) => break,
            },
            _ = stop.stopped() => break,
        };

        if let Err(e) = handle_event(&ctx, event).await {
            tracing::warn!("Inbound event failed: {:#}", e);
        }
    }
    tracing::info!("Inbound dispatcher stopped");
    Ok(())
}
