//! Canary settings.
//!
//! Resolved once at startup and passed by `Arc` into every component — there
//! is no ambient global configuration and nothing here mutates after
//! [`Settings::resolve`] returns.
//!
//! Priority (highest to lowest):
//!   1. CLI / env — passed as `Some(value)` from clap
//!   2. TOML file (`--config`, default `canary.toml`)
//!   3. Built-in defaults

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_SAMPLE_SIZE: u64 = 1000;
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;
const DEFAULT_PORT: u16 = 4310;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── Sampling mode ────────────────────────────────────────────────────────────

/// Row-sampling strategy used by the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SamplingMode {
    /// `TABLESAMPLE SYSTEM_ROWS(n)` — bounded cost independent of table size.
    /// Requires the `tsm_system_rows` extension on the store.
    SystemRows,
    /// `COUNT(*)` plus a random `OFFSET` — portable, full-scan cost.
    RandomOffset,
}

impl std::str::FromStr for SamplingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system-rows" => Ok(SamplingMode::SystemRows),
            "random-offset" => Ok(SamplingMode::RandomOffset),
            other => Err(format!(
                "unknown sampling mode '{other}' (expected 'system-rows' or 'random-offset')"
            )),
        }
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// On-disk config file — all fields optional; CLI/env win over these.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Datastack being watched (e.g. `"minnie65_phase3"`).
    datastack: Option<String>,
    /// Base URL of the materialization service.
    server_address: Option<String>,
    /// Postgres connection string for the materialized store.
    database_url: Option<String>,
    /// Comparison table or view exposing expected vs. materialized values.
    table: Option<String>,
    /// Slack bot token (`xoxb-…`). Prefer the `CANARY_SLACK_TOKEN` env var.
    slack_token: Option<String>,
    /// Slack channel to alert (e.g. `"#data-infrastructure"`).
    slack_channel: Option<String>,
    /// Rows drawn per check cycle (default: 1000).
    sample_size: Option<u64>,
    /// Seconds between check cycles (default: 60).
    check_interval_secs: Option<u64>,
    /// Per-cycle time budget in seconds (default: check interval).
    cycle_timeout_secs: Option<u64>,
    /// Sampling strategy: "system-rows" | "random-offset" (default).
    sampling_mode: Option<SamplingMode>,
    /// Bind address for the /health endpoint (default: "127.0.0.1").
    bind_address: Option<String>,
    /// Port for the /health endpoint (default: 4310).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,canaryd=trace".
    log: Option<String>,
    /// Log output format: "pretty" (default) | "json".
    log_format: Option<String>,
}

fn load_toml(path: &Path, explicit: bool) -> Result<TomlConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        // A missing default-location file is fine; a missing --config file is not.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            return Ok(TomlConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            });
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        source: e,
    })
}

// ─── Settings ─────────────────────────────────────────────────────────────────

/// CLI/env overrides collected by clap in `main.rs`.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub datastack: Option<String>,
    pub server_address: Option<String>,
    pub database_url: Option<String>,
    pub table: Option<String>,
    pub slack_token: Option<String>,
    pub slack_channel: Option<String>,
    pub sample_size: Option<u64>,
    pub check_interval_secs: Option<u64>,
    pub sampling_mode: Option<SamplingMode>,
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub log: Option<String>,
    pub log_format: Option<String>,
}

/// Immutable process-lifetime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub datastack: String,
    pub server_address: String,
    pub database_url: String,
    pub table: String,
    pub slack_token: String,
    pub slack_channel: String,
    pub sample_size: u64,
    pub check_interval: Duration,
    pub cycle_timeout: Duration,
    pub sampling_mode: SamplingMode,
    pub bind_address: String,
    pub port: u16,
    pub log: String,
    pub log_format: String,
}

impl Settings {
    /// Layer CLI/env over the TOML file over defaults, then validate.
    ///
    /// Any [`ConfigError`] returned here is fatal — the caller exits non-zero.
    pub fn resolve(
        config_path: Option<&Path>,
        overrides: Overrides,
    ) -> Result<Settings, ConfigError> {
        let default_path = Path::new("canary.toml");
        let toml = load_toml(
            config_path.unwrap_or(default_path),
            config_path.is_some(),
        )?;

        let datastack = overrides
            .datastack
            .or(toml.datastack)
            .ok_or(ConfigError::Missing("datastack"))?;
        let server_address = overrides
            .server_address
            .or(toml.server_address)
            .ok_or(ConfigError::Missing("server_address"))?;
        let database_url = overrides
            .database_url
            .or(toml.database_url)
            .ok_or(ConfigError::Missing("database_url"))?;
        let table = overrides
            .table
            .or(toml.table)
            .ok_or(ConfigError::Missing("table"))?;
        let slack_token = overrides
            .slack_token
            .or(toml.slack_token)
            .ok_or(ConfigError::Missing("slack_token"))?;
        let slack_channel = overrides
            .slack_channel
            .or(toml.slack_channel)
            .ok_or(ConfigError::Missing("slack_channel"))?;

        let sample_size = overrides
            .sample_size
            .or(toml.sample_size)
            .unwrap_or(DEFAULT_SAMPLE_SIZE);
        let check_interval_secs = overrides
            .check_interval_secs
            .or(toml.check_interval_secs)
            .unwrap_or(DEFAULT_CHECK_INTERVAL_SECS);

        if sample_size < 1 {
            return Err(ConfigError::Invalid {
                field: "sample_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if check_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "check_interval_secs",
                reason: "must be greater than 0".to_string(),
            });
        }
        if !table_ident_ok(&table) {
            return Err(ConfigError::Invalid {
                field: "table",
                reason: format!("'{table}' is not a valid table identifier"),
            });
        }

        // The cycle budget must not exceed the interval — otherwise a slow
        // cycle would eat into the next tick.
        let cycle_timeout_secs = toml
            .cycle_timeout_secs
            .unwrap_or(check_interval_secs);
        if cycle_timeout_secs == 0 || cycle_timeout_secs > check_interval_secs {
            return Err(ConfigError::Invalid {
                field: "cycle_timeout_secs",
                reason: format!(
                    "must be in 1..={check_interval_secs} (the check interval)"
                ),
            });
        }

        let sampling_mode = overrides
            .sampling_mode
            .or(toml.sampling_mode)
            .unwrap_or(SamplingMode::RandomOffset);

        Ok(Settings {
            datastack,
            server_address,
            database_url,
            table,
            slack_token,
            slack_channel,
            sample_size,
            check_interval: Duration::from_secs(check_interval_secs),
            cycle_timeout: Duration::from_secs(cycle_timeout_secs),
            sampling_mode,
            bind_address: overrides
                .bind_address
                .or(toml.bind_address)
                .unwrap_or_else(default_bind_address),
            port: overrides.port.or(toml.port).unwrap_or(DEFAULT_PORT),
            log: overrides
                .log
                .or(toml.log)
                .unwrap_or_else(|| "info".to_string()),
            log_format: overrides
                .log_format
                .or(toml.log_format)
                .unwrap_or_else(|| "pretty".to_string()),
        })
    }
}

/// The table name is interpolated into SQL as an identifier, so restrict it
/// to `schema.table` shapes instead of trusting the config file.
fn table_ident_ok(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').count() <= 2
        && name.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !part.starts_with(|c: char| c.is_ascii_digit())
        })
}
