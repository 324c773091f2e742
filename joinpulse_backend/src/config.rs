use anyhow::{Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Inline keyboard button attached to the daily post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonConfig {
    pub text: String,
    #[serde(default)]
    pub callback_data: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // Telegram connection
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub group_chat_id: i64,
    /// Forum topic that receives "unlocked" announcements and synthetic activity.
    #[serde(default)]
    pub verify_thread_id: Option<i64>,
    /// Forum topic for the daily post; `None` posts into the general chat.
    #[serde(default)]
    pub announce_thread_id: Option<i64>,

    // Feature switches
    #[serde(default)]
    pub enable_daily: bool,
    #[serde(default = "default_true")]
    pub enable_verify: bool,
    #[serde(default)]
    pub enable_activity: bool,
    #[serde(default)]
    pub enable_cleanup: bool,

    // Loop cadence
    #[serde(default = "default_daily_post_interval_secs")]
    pub daily_post_interval_secs: u64,
    #[serde(default = "default_daily_delete_previous_after_secs")]
    pub daily_delete_previous_after_secs: u64,
    #[serde(default = "default_verify_interval_secs")]
    pub verify_interval_secs: u64,
    #[serde(default = "default_join_announce_delay_secs")]
    pub join_announce_delay_secs: u64,
    #[serde(default = "default_activity_interval_secs")]
    pub activity_interval_secs: u64,
    /// 0 keeps synthetic activity messages until the next cleanup sweep.
    #[serde(default)]
    pub activity_delete_after_secs: u64,
    #[serde(default = "default_loop_retry_secs")]
    pub loop_retry_secs: u64,

    // Cycle boundary
    #[serde(default = "default_cycle_boundary")]
    pub cycle_boundary: String,
    #[serde(default = "default_cycle_timezone")]
    pub cycle_timezone: String,

    // Tracked message retention
    #[serde(default = "default_bot_msg_retention_hours")]
    pub bot_msg_retention_hours: u64,
    #[serde(default = "default_bot_msg_max_rows")]
    pub bot_msg_max_rows: u64,
    #[serde(default = "default_bot_msg_prune_every")]
    pub bot_msg_prune_every: u64,

    // Storage
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: usize,

    // Transport
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub drop_pending_updates: bool,
    #[serde(default = "default_rate_limit_margin_secs")]
    pub rate_limit_margin_secs: u64,
    #[serde(default = "default_transient_cooldown_secs")]
    pub transient_cooldown_secs: u64,

    // Content
    #[serde(default = "default_daily_photo_path")]
    pub daily_photo_path: String,
    #[serde(default = "default_daily_caption")]
    pub daily_caption: String,
    #[serde(default)]
    pub daily_buttons: Vec<ButtonConfig>,
    #[serde(default)]
    pub callback_responses: HashMap<String, String>,
    #[serde(default = "default_unlock_template")]
    pub unlock_template: String,
}

fn default_true() -> bool {
    true
}

fn default_daily_post_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_daily_delete_previous_after_secs() -> u64 {
    5
}

fn default_verify_interval_secs() -> u64 {
    60
}

fn default_join_announce_delay_secs() -> u64 {
    30
}

fn default_activity_interval_secs() -> u64 {
    900
}

fn default_loop_retry_secs() -> u64 {
    5
}

fn default_cycle_boundary() -> String {
    "05:00".to_string()
}

fn default_cycle_timezone() -> String {
    "Europe/Amsterdam".to_string()
}

fn default_bot_msg_retention_hours() -> u64 {
    72
}

fn default_bot_msg_max_rows() -> u64 {
    5000
}

fn default_bot_msg_prune_every() -> u64 {
    200
}

fn default_database_path() -> String {
    "joinpulse.db".to_string()
}

fn default_db_pool_size() -> usize {
    5
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_request_timeout_secs() -> u64 {
    45
}

fn default_rate_limit_margin_secs() -> u64 {
    1
}

fn default_transient_cooldown_secs() -> u64 {
    5
}

fn default_daily_photo_path() -> String {
    "banner.jpg".to_string()
}

fn default_daily_caption() -> String {
    "Welcome! Tap a button below to get started.".to_string()
}

fn default_unlock_template() -> String {
    "✅ {name} has been unlocked".to_string()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            group_chat_id: 0,
            verify_thread_id: None,
            announce_thread_id: None,
            enable_daily: false,
            enable_verify: true,
            enable_activity: false,
            enable_cleanup: false,
            daily_post_interval_secs: default_daily_post_interval_secs(),
            daily_delete_previous_after_secs: default_daily_delete_previous_after_secs(),
            verify_interval_secs: default_verify_interval_secs(),
            join_announce_delay_secs: default_join_announce_delay_secs(),
            activity_interval_secs: default_activity_interval_secs(),
            activity_delete_after_secs: 0,
            loop_retry_secs: default_loop_retry_secs(),
            cycle_boundary: default_cycle_boundary(),
            cycle_timezone: default_cycle_timezone(),
            bot_msg_retention_hours: default_bot_msg_retention_hours(),
            bot_msg_max_rows: default_bot_msg_max_rows(),
            bot_msg_prune_every: default_bot_msg_prune_every(),
            database_path: default_database_path(),
            db_pool_size: default_db_pool_size(),
            poll_timeout_secs: default_poll_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            drop_pending_updates: true,
            rate_limit_margin_secs: default_rate_limit_margin_secs(),
            transient_cooldown_secs: default_transient_cooldown_secs(),
            daily_photo_path: default_daily_photo_path(),
            daily_caption: default_daily_caption(),
            daily_buttons: Vec::new(),
            callback_responses: HashMap::new(),
            unlock_template: default_unlock_template(),
        }
    }
}

/// `1`, `true`, `yes`, `y` and `on` (any case) enable a flag; anything else disables it.
pub fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl BotConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `JOINPULSE_CONFIG` when set, otherwise `joinpulse.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        match env::var("JOINPULSE_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
            _ => Self::get_base_dir().join("joinpulse.toml"),
        }
    }

    /// Load the config file (if any), apply env overrides and validate.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => {
                let parsed = toml::from_str::<BotConfig>(&contents)
                    .with_context(|| format!("Failed to parse {:?}", path))?;
                tracing::info!("Loaded config from {:?}", path);
                parsed
            }
            Err(_) => {
                tracing::warn!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };

        config.apply_env(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables. `lookup` is injectable so tests never touch
    /// the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(token) = text("BOT_TOKEN") {
            self.bot_token = token;
        }
        if let Some(path) = text("DATABASE_PATH").or_else(|| text("DATABASE_URL")) {
            self.database_path = path;
        }
        if let Some(id) = text("GROUP_CHAT_ID").and_then(|v| v.parse().ok()) {
            self.group_chat_id = id;
        }
        if let Some(id) = text("VERIFY_THREAD_ID").and_then(|v| v.parse().ok()) {
            self.verify_thread_id = Some(id);
        }
        if let Some(id) = text("ANNOUNCE_THREAD_ID").and_then(|v| v.parse().ok()) {
            self.announce_thread_id = Some(id);
        }

        if let Some(v) = text("ENABLE_DAILY") {
            self.enable_daily = parse_flag(&v);
        }
        if let Some(v) = text("ENABLE_VERIFY") {
            self.enable_verify = parse_flag(&v);
        }
        if let Some(v) = text("ENABLE_ACTIVITY") {
            self.enable_activity = parse_flag(&v);
        }
        if let Some(v) = text("ENABLE_CLEANUP") {
            self.enable_cleanup = parse_flag(&v);
        }
        if let Some(v) = text("DROP_PENDING_UPDATES") {
            self.drop_pending_updates = parse_flag(&v);
        }

        let secs = |key: &str| text(key).and_then(|v| v.parse::<u64>().ok());
        if let Some(v) = secs("DAILY_POST_INTERVAL_SECS") {
            self.daily_post_interval_secs = v;
        }
        if let Some(v) = secs("VERIFY_INTERVAL_SECS") {
            self.verify_interval_secs = v;
        }
        if let Some(v) = secs("JOIN_ANNOUNCE_DELAY_SECS") {
            self.join_announce_delay_secs = v;
        }
        if let Some(v) = secs("ACTIVITY_INTERVAL_SECS") {
            self.activity_interval_secs = v;
        }
        if let Some(v) = secs("ACTIVITY_DELETE_AFTER_SECS") {
            self.activity_delete_after_secs = v;
        }
        if let Some(v) = secs("BOT_MSG_RETENTION_HOURS") {
            self.bot_msg_retention_hours = v;
        }
        if let Some(v) = secs("BOT_MSG_MAX_ROWS") {
            self.bot_msg_max_rows = v;
        }
        if let Some(v) = secs("BOT_MSG_PRUNE_EVERY") {
            self.bot_msg_prune_every = v;
        }
        if let Some(v) = secs("READ_TIMEOUT") {
            self.poll_timeout_secs = v;
        }
        if let Some(v) = secs("CONNECT_TIMEOUT") {
            self.connect_timeout_secs = v;
        }
        if let Some(v) = secs("WRITE_TIMEOUT") {
            self.request_timeout_secs = v;
        }
        if let Some(v) = text("DB_POOL_MAX").and_then(|v| v.parse::<usize>().ok()) {
            self.db_pool_size = v;
        }

        if let Some(v) = text("CYCLE_BOUNDARY") {
            self.cycle_boundary = v;
        }
        if let Some(v) = text("CYCLE_TIMEZONE") {
            self.cycle_timezone = v;
        }
        if let Some(v) = text("DAILY_PHOTO_PATH") {
            self.daily_photo_path = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bot_token.trim().is_empty() {
            return Err(ConfigError::Missing("bot_token"));
        }
        if self.database_path.trim().is_empty() {
            return Err(ConfigError::Missing("database_path"));
        }
        if self.group_chat_id == 0 {
            return Err(ConfigError::Missing("group_chat_id"));
        }
        if !self.unlock_template.contains("{name}") {
            return Err(ConfigError::Invalid {
                field: "unlock_template",
                reason: "must contain a {name} placeholder".to_string(),
            });
        }
        if self.bot_msg_prune_every == 0 {
            return Err(ConfigError::Invalid {
                field: "bot_msg_prune_every",
                reason: "must be at least 1".to_string(),
            });
        }
        self.boundary_time()?;
        self.timezone()?;
        Ok(())
    }

    pub fn boundary_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(self.cycle_boundary.trim(), "%H:%M").map_err(|e| {
            ConfigError::Invalid {
                field: "cycle_boundary",
                reason: e.to_string(),
            }
        })
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.cycle_timezone
            .trim()
            .parse::<Tz>()
            .map_err(|e| ConfigError::Invalid {
                field: "cycle_timezone",
                reason: e.to_string(),
            })
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.bot_msg_retention_hours as i64)
    }

    pub fn activity_delete_after(&self) -> Option<Duration> {
        match self.activity_delete_after_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn popup_for(&self, callback_data: &str) -> &str {
        self.callback_responses
            .get(callback_data)
            .map(String::as_str)
            .unwrap_or("✅")
    }

    /// Announcement text for `name` using the configured template.
    pub fn unlock_text(&self, name: &str) -> String {
        self.unlock_template.replace("{name}", name)
    }
}
