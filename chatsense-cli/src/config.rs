//! Persistent configuration for the chatsense CLI.
//!
//! Config file lives at `~/.config/chatsense/config.toml`.
//! The last analysed channel is remembered in `~/.config/chatsense/session.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chatsense_sdk::{RetryPolicy, TransportKind};
use serde::{Deserialize, Serialize};

use crate::{Cli, Command};

/// Backend used when nothing else is configured.
pub const DEFAULT_API_URL: &str = "http://localhost:8000";
/// Seconds between periodic summaries in `watch`.
pub const DEFAULT_SUMMARY_SECS: u64 = 30;

/// User configuration (persisted in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Backend base URL.
    pub api_url: Option<String>,
    /// Login email. The password is never stored.
    pub email: Option<String>,
    /// Stream transport: "sse" or "ws".
    pub transport: Option<String>,
    /// Reconnect when retries are exhausted instead of stopping.
    pub auto_retry: Option<bool>,
    /// Save the analysis to history on exit.
    pub save_on_exit: Option<bool>,
    pub summary_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub open_timeout_secs: Option<u64>,
}

/// State saved on exit, restored on start.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Session {
    /// Last channel analysed.
    pub last_channel: Option<String>,
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatsense")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

fn session_path() -> PathBuf {
    config_dir().join("session.toml")
}

/// Read a TOML file, falling back to the default on any problem.
fn load_toml<T: for<'de> Deserialize<'de> + Default>(path: &Path, what: &str) -> T {
    if !path.exists() {
        return T::default();
    }
    match std::fs::read_to_string(path) {
        Ok(s) => match toml::from_str(&s) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Bad {what} file, using defaults");
                T::default()
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Can't read {what} file");
            T::default()
        }
    }
}

fn save_toml<T: Serialize>(value: &T, path: &Path, what: &str) {
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    match toml::to_string_pretty(value) {
        Ok(s) => {
            if let Err(e) = std::fs::write(path, s) {
                tracing::warn!(path = %path.display(), error = %e, "Can't save {what}");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Can't serialize {what}"),
    }
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        load_toml(path, "config")
    }

    pub fn save_to(&self, path: &Path) {
        save_toml(self, path, "config");
    }
}

impl Session {
    pub fn load() -> Self {
        Self::load_from(&session_path())
    }

    pub fn load_from(path: &Path) -> Self {
        load_toml(path, "session")
    }

    pub fn save(&self) {
        self.save_to(&session_path());
    }

    pub fn save_to(&self, path: &Path) {
        save_toml(self, path, "session");
    }
}

/// Effective settings after merging CLI args > config file > session state > defaults.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub api_url: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub channel: Option<String>,
    pub transport: TransportKind,
    pub auto_retry: bool,
    pub save_on_exit: bool,
    pub summary_interval: Duration,
    pub policy: RetryPolicy,
}

impl Resolved {
    pub fn merge(cli: &Cli, config: &Config, session: &Session) -> anyhow::Result<Self> {
        let watch = match &cli.command {
            Command::Watch(w) => Some(w),
            Command::History(_) => None,
        };

        let api_url = cli
            .api_url
            .clone()
            .or_else(|| config.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let email = cli.email.clone().or_else(|| config.email.clone());

        let channel = watch
            .and_then(|w| w.channel.clone())
            .or_else(|| session.last_channel.clone());

        let transport = match watch
            .and_then(|w| w.transport.clone())
            .or_else(|| config.transport.clone())
        {
            Some(name) => name.parse::<TransportKind>().map_err(anyhow::Error::msg)?,
            None => TransportKind::default(),
        };

        let auto_retry = watch.is_some_and(|w| w.auto_retry) || config.auto_retry.unwrap_or(false);
        let save_on_exit = watch.is_some_and(|w| w.save) || config.save_on_exit.unwrap_or(false);
        let summary_interval = Duration::from_secs(
            watch
                .and_then(|w| w.summary_secs)
                .or(config.summary_secs)
                .unwrap_or(DEFAULT_SUMMARY_SECS)
                .max(1),
        );

        let defaults = RetryPolicy::default();
        let policy = RetryPolicy {
            max_attempts: watch
                .and_then(|w| w.max_attempts)
                .or(config.max_attempts)
                .unwrap_or(defaults.max_attempts),
            base_delay: config
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: config
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            open_timeout: config
                .open_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.open_timeout),
            ..defaults
        };
        policy.validate().map_err(anyhow::Error::msg)?;

        Ok(Self {
            api_url,
            email,
            password: cli.password.clone(),
            channel,
            transport,
            auto_retry,
            save_on_exit,
            summary_interval,
            policy,
        })
    }
}
