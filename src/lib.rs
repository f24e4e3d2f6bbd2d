pub mod config;
pub mod error;
pub mod health;
pub mod notifier;
pub mod probe;
pub mod rest;
pub mod sampler;
pub mod scheduler;
pub mod validator;

use std::sync::Arc;

use config::Settings;
use health::HealthMonitor;

/// Shared state read by the HTTP surface, independent of the tick loop.
pub struct CanaryContext {
    pub settings: Arc<Settings>,
    pub monitor: HealthMonitor,
    pub started_at: std::time::Instant,
}
