// SPDX-License-Identifier: MIT
//! Canary health state machine.
//!
//! Consumes successive [`CheckResult`]s and maintains the canary's health
//! state plus a short transition history.
//!
//! # State machine
//!
//! ```text
//!              Ok                 Ok
//!   Healthy ◄────── Degraded ◄──────── Down
//!      │               ▲   │             ▲
//!      └──(failure)────┘   └─(failure)───┘
//! ```
//!
//! - `Ok` always lands in `Healthy` and resets the consecutive-failure count.
//! - One failure → `Degraded`; two or more consecutive failures → `Down`.
//!   A single transient blip never pages anyone; corroboration does.
//! - A [`Transition`] is emitted only when the state changes value. Repeated
//!   failures while already `Down` update the counter and history but stay
//!   silent.
//!
//! The monitor is the single writer (the scheduler); the `/health` endpoint
//! and the notifier read snapshots. The `RwLock` guarantees readers never
//! observe a state mid-transition.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::validator::CheckResult;

/// Recent results kept for diagnostics. Bounded — the canary stores no
/// long-term history.
const HISTORY_LIMIT: usize = 16;

/// Observable health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Last check passed (or no check has run yet).
    Healthy,
    /// Exactly one consecutive failure — possibly transient.
    Degraded,
    /// Two or more consecutive failures — corroborated outage.
    Down,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Down => write!(f, "down"),
        }
    }
}

/// Emitted when the state changes value. Read once by the notifier.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Read-consistent view for the `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<CheckResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_detail: Option<String>,
}

// ─── Inner (lock-guarded) ─────────────────────────────────────────────────────

#[derive(Debug)]
struct MonitorInner {
    state: HealthState,
    consecutive_failures: u32,
    history: VecDeque<CheckResult>,
    last_failure_detail: Option<String>,
}

impl MonitorInner {
    fn new() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
            last_failure_detail: None,
        }
    }

    /// Pure transition logic, kept synchronous so tests can drive arbitrary
    /// result sequences without a runtime.
    fn apply(&mut self, result: CheckResult) -> Option<Transition> {
        let prior = self.state;

        if result.outcome.is_ok() {
            self.consecutive_failures = 0;
            self.state = HealthState::Healthy;
        } else {
            self.consecutive_failures += 1;
            self.last_failure_detail = Some(result.detail.clone());
            self.state = if self.consecutive_failures == 1 {
                HealthState::Degraded
            } else {
                HealthState::Down
            };
        }

        let transition = (self.state != prior).then(|| Transition {
            from: prior,
            to: self.state,
            at: result.checked_at,
            reason: if result.outcome.is_ok() {
                "check passed".to_string()
            } else {
                format!("{}: {}", result.outcome, result.detail)
            },
        });

        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(result);

        transition
    }

    fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_result: self.history.back().cloned(),
            last_failure_detail: self.last_failure_detail.clone(),
        }
    }
}

// ─── HealthMonitor ────────────────────────────────────────────────────────────

/// Thread-safe health monitor.
///
/// Cheaply cloneable — all clones share the same state via `Arc`. Starts
/// `Healthy` with an empty history; nothing persists across restarts.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<RwLock<MonitorInner>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MonitorInner::new())),
        }
    }

    /// Apply one cycle's result. Returns the transition, if the state changed.
    pub async fn apply(&self, result: CheckResult) -> Option<Transition> {
        let mut inner = self.inner.write().await;
        let transition = inner.apply(result);
        if let Some(t) = &transition {
            if t.to == HealthState::Healthy {
                info!(from = %t.from, to = %t.to, "canary recovered");
            } else {
                warn!(from = %t.from, to = %t.to, reason = %t.reason, "canary state changed");
            }
        }
        transition
    }

    /// Read-consistent snapshot for the endpoint and diagnostics.
    pub async fn snapshot(&self) -> HealthSnapshot {
        self.inner.read().await.snapshot()
    }

    pub async fn state(&self) -> HealthState {
        self.inner.read().await.state
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
