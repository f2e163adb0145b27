use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

const DEFAULT_CONFIG_FILES: &[&str] = &[
    "quadlink.toml",
    "config/quadlink.toml",
    "crates/config/quadlink.toml",
    "../quadlink.toml",
    "../config/quadlink.toml",
    "../crates/config/quadlink.toml",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub address: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 7070,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://quadlink.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "AuthConfig::default_session_ttl")]
    pub session_ttl_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: Self::default_session_ttl(),
        }
    }
}

impl AuthConfig {
    fn default_session_ttl() -> u64 {
        86_400
    }
}

/// Tunables for the real-time core: timers, queue bounds and validation limits.
///
/// ```
/// use quadlink_config::RealtimeConfig;
///
/// let realtime = RealtimeConfig::default();
/// assert_eq!(realtime.presence_grace().as_secs(), 5);
/// assert_eq!(realtime.ringing_timeout().as_secs(), 30);
/// assert!(realtime.idle_timeout().is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "RealtimeConfig::default_presence_grace_ms")]
    pub presence_grace_ms: u64,
    #[serde(default = "RealtimeConfig::default_typing_ttl_ms")]
    pub typing_ttl_ms: u64,
    #[serde(default = "RealtimeConfig::default_ringing_timeout_seconds")]
    pub ringing_timeout_seconds: u64,
    #[serde(default = "RealtimeConfig::default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "RealtimeConfig::default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "RealtimeConfig::default_receipt_flush_ms")]
    pub receipt_flush_ms: u64,
    #[serde(default = "RealtimeConfig::default_history_page_size")]
    pub history_page_size: u32,
    #[serde(default = "RealtimeConfig::default_dedup_window")]
    pub dedup_window: usize,
    /// Zero disables the idle sweeper.
    #[serde(default)]
    pub idle_timeout_seconds: u64,
}

impl RealtimeConfig {
    const fn default_presence_grace_ms() -> u64 {
        5_000
    }

    const fn default_typing_ttl_ms() -> u64 {
        4_000
    }

    const fn default_ringing_timeout_seconds() -> u64 {
        30
    }

    const fn default_outbound_queue_capacity() -> usize {
        256
    }

    const fn default_max_message_length() -> usize {
        4_000
    }

    const fn default_receipt_flush_ms() -> u64 {
        150
    }

    const fn default_history_page_size() -> u32 {
        50
    }

    const fn default_dedup_window() -> usize {
        512
    }

    pub fn presence_grace(&self) -> Duration {
        Duration::from_millis(self.presence_grace_ms)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    pub fn ringing_timeout(&self) -> Duration {
        Duration::from_secs(self.ringing_timeout_seconds)
    }

    pub fn receipt_flush(&self) -> Duration {
        Duration::from_millis(self.receipt_flush_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_seconds > 0).then(|| Duration::from_secs(self.idle_timeout_seconds))
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            presence_grace_ms: Self::default_presence_grace_ms(),
            typing_ttl_ms: Self::default_typing_ttl_ms(),
            ringing_timeout_seconds: Self::default_ringing_timeout_seconds(),
            outbound_queue_capacity: Self::default_outbound_queue_capacity(),
            max_message_length: Self::default_max_message_length(),
            receipt_flush_ms: Self::default_receipt_flush_ms(),
            history_page_size: Self::default_history_page_size(),
            dedup_window: Self::default_dedup_window(),
            idle_timeout_seconds: 0,
        }
    }
}

fn clamp_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Load the application configuration by combining defaults, files, and environment overrides.
///
/// ```
/// use quadlink_config::load;
///
/// std::env::remove_var("QUADLINK_CONFIG");
///
/// let config = load().expect("configuration should load with defaults");
/// assert!(!config.http.address.is_empty());
/// ```
pub fn load() -> anyhow::Result<AppConfig> {
    let defaults = AppConfig::default();
    let realtime = &defaults.realtime;

    let mut builder = config::Config::builder()
        .set_default("http.address", defaults.http.address.clone())?
        .set_default("http.port", i64::from(defaults.http.port))?
        .set_default("database.url", defaults.database.url.clone())?
        .set_default(
            "database.max_connections",
            i64::from(defaults.database.max_connections),
        )?
        .set_default(
            "auth.session_ttl_seconds",
            clamp_to_i64(defaults.auth.session_ttl_seconds),
        )?
        .set_default(
            "realtime.presence_grace_ms",
            clamp_to_i64(realtime.presence_grace_ms),
        )?
        .set_default("realtime.typing_ttl_ms", clamp_to_i64(realtime.typing_ttl_ms))?
        .set_default(
            "realtime.ringing_timeout_seconds",
            clamp_to_i64(realtime.ringing_timeout_seconds),
        )?
        .set_default(
            "realtime.outbound_queue_capacity",
            clamp_to_i64(realtime.outbound_queue_capacity as u64),
        )?
        .set_default(
            "realtime.max_message_length",
            clamp_to_i64(realtime.max_message_length as u64),
        )?
        .set_default(
            "realtime.receipt_flush_ms",
            clamp_to_i64(realtime.receipt_flush_ms),
        )?
        .set_default(
            "realtime.history_page_size",
            i64::from(realtime.history_page_size),
        )?
        .set_default(
            "realtime.dedup_window",
            clamp_to_i64(realtime.dedup_window as u64),
        )?
        .set_default(
            "realtime.idle_timeout_seconds",
            clamp_to_i64(realtime.idle_timeout_seconds),
        )?;

    let environment_overrides = config::Environment::with_prefix("QUADLINK").separator("__");

    let mut config_file_attached = false;

    if let Ok(path) = std::env::var("QUADLINK_CONFIG") {
        builder = builder.add_source(config::File::from(PathBuf::from(&path)));
        config_file_attached = true;
        debug!(path, "loading configuration via QUADLINK_CONFIG");
    } else if let Ok(cwd) = std::env::current_dir() {
        let fallback = DEFAULT_CONFIG_FILES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|path| path.exists());

        if let Some(path) = fallback {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path));
            config_file_attached = true;
        }
    }

    if !config_file_attached {
        debug!("no configuration file found, relying on defaults and environment overrides");
    }

    builder = builder.add_source(environment_overrides);

    let cfg = builder.build().context("unable to build configuration")?;

    let mut config = cfg
        .try_deserialize::<AppConfig>()
        .context("invalid configuration")?;

    if config.auth.session_ttl_seconds > i64::MAX as u64 {
        config.auth.session_ttl_seconds = i64::MAX as u64;
    }

    if config.realtime.outbound_queue_capacity == 0 {
        anyhow::bail!("invalid configuration: realtime.outbound_queue_capacity must be positive");
    }

    debug!(?config, "loaded backend configuration");
    Ok(config)
}
