// SPDX-License-Identifier: MIT
//! Error taxonomy.
//!
//! Three tiers with different propagation policies:
//! - [`ConfigError`] — startup only, fatal. The process exits non-zero.
//! - [`CheckError`] — check-cycle failures. Never propagated out of the
//!   scheduler; absorbed into a [`CheckResult`](crate::validator::CheckResult)
//!   outcome and fed to the state machine.
//! - [`NotifyError`] — notification transport failures. Logged, never retried
//!   within the same cycle, never blocks the next cycle.

use std::time::Duration;

/// Fatal startup error. Invalid settings or an unparseable config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Recoverable check-cycle failure. Feeds the state machine, never crashes
/// the process.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckError {
    /// The store or service could not be reached at all.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The store was reachable but the query failed.
    #[error("query failed: {0}")]
    Query(String),
    /// The cycle exceeded its time budget and was cancelled.
    #[error("check cycle timed out after {0:?}")]
    Timeout(Duration),
    /// The table holds fewer rows than the requested sample size.
    /// A short sample is never returned.
    #[error("insufficient data: table has {available} rows, sample size is {requested}")]
    InsufficientData { available: u64, requested: u64 },
}

/// Notification transport failure. Reportable, non-fatal.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Transport(String),
    /// The service accepted the request but rejected the message
    /// (e.g. Slack `ok: false` with an error code).
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Map an sqlx error onto the check taxonomy, preserving the
/// unreachable-vs-failed distinction.
pub fn check_error_from_sqlx(err: sqlx::Error) -> CheckError {
    match err {
        sqlx::Error::Io(e) => CheckError::Connection(e.to_string()),
        sqlx::Error::PoolTimedOut => {
            CheckError::Connection("connection pool timed out".to_string())
        }
        sqlx::Error::PoolClosed => CheckError::Connection("connection pool closed".to_string()),
        sqlx::Error::Tls(e) => CheckError::Connection(e.to_string()),
        other => CheckError::Query(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_io_errors_map_to_connection() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(
            check_error_from_sqlx(io),
            CheckError::Connection(_)
        ));
        assert!(matches!(
            check_error_from_sqlx(sqlx::Error::PoolTimedOut),
            CheckError::Connection(_)
        ));
    }

    #[test]
    fn sqlx_other_errors_map_to_query() {
        assert!(matches!(
            check_error_from_sqlx(sqlx::Error::RowNotFound),
            CheckError::Query(_)
        ));
    }
}
