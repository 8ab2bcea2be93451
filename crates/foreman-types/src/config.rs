//! Environment-driven configuration for the server and agent binaries.
//!
//! Every knob has a default; unset variables fall back, malformed values
//! are a hard configuration error rather than a silent fallback.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ForemanError;

/// Control server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on. `PORT`, default 3000.
    pub port: u16,
    /// SQLite database location. `DB_PATH`, default `./data/commands.db`.
    pub db_path: PathBuf,
    /// How long a Running command's owner may go without a heartbeat
    /// before reclamation. `COMMAND_TIMEOUT` (ms), default 60000.
    pub command_timeout: Duration,
    /// Period of the stale-reclaim task. `STALE_CHECK_INTERVAL` (ms),
    /// default 10000.
    pub stale_check_interval: Duration,
}

impl ServerConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ForemanError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary lookup function (testable seam).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ForemanError> {
        Ok(Self {
            port: parse_or(&lookup, "PORT", 3000)?,
            db_path: lookup("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/commands.db")),
            command_timeout: Duration::from_millis(parse_or(&lookup, "COMMAND_TIMEOUT", 60_000)?),
            stale_check_interval: Duration::from_millis(parse_or(
                &lookup,
                "STALE_CHECK_INTERVAL",
                10_000,
            )?),
        })
    }
}

/// Worker agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the control server. `SERVER_URL`,
    /// default `http://localhost:3000`.
    pub server_url: String,
    /// Idle sleep between polls. `POLL_INTERVAL` (ms), default 1000.
    pub poll_interval: Duration,
    /// Directory holding the persistent identity file. `AGENT_DATA_PATH`,
    /// default `./data`.
    pub data_path: PathBuf,
    /// Test hook: exit after this many polls. `KILL_AFTER`, unset by default.
    pub kill_after: Option<u64>,
    /// Test hook: 20% chance of process exit at labelled crash points.
    /// `RANDOM_FAILURES`, default false.
    pub random_failures: bool,
}

impl AgentConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ForemanError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary lookup function (testable seam).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ForemanError> {
        let kill_after = match lookup("KILL_AFTER") {
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                ForemanError::Config(format!("KILL_AFTER must be an integer, got {raw:?}"))
            })?),
            None => None,
        };

        let random_failures = match lookup("RANDOM_FAILURES").as_deref() {
            None | Some("false") | Some("0") | Some("") => false,
            Some("true") | Some("1") => true,
            Some(other) => {
                return Err(ForemanError::Config(format!(
                    "RANDOM_FAILURES must be true or false, got {other:?}"
                )))
            }
        };

        Ok(Self {
            server_url: lookup("SERVER_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            poll_interval: Duration::from_millis(parse_or(&lookup, "POLL_INTERVAL", 1000)?),
            data_path: lookup("AGENT_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            kill_after,
            random_failures,
        })
    }
}

/// Parse an env value as an integer, falling back to `default` when unset.
fn parse_or<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ForemanError> {
    match lookup(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ForemanError::Config(format!("{key} must be an integer, got {raw:?}"))),
        None => Ok(default),
    }
}
