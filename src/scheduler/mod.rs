// SPDX-License-Identifier: MIT
//! Check-cycle scheduler.
//!
//! Drives the canary loop at a fixed period: probe + sample → validate →
//! apply to the state machine → notify on transition. The cycle runs inline
//! on the loop task, so two cycles can never overlap; ticks that fall due
//! while a cycle is still running are skipped, never queued
//! (`MissedTickBehavior::Skip`).
//!
//! Every cycle runs under a time budget no larger than the period. A cycle
//! that exceeds it is cancelled and recorded as a synthetic `QueryError`
//! result — failures are absorbed into the state machine, never propagated
//! out of the loop.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::health::HealthMonitor;
use crate::notifier::Notifier;
use crate::probe::ServiceProbe;
use crate::sampler::SampleSource;
use crate::validator::{CheckResult, Validator};

pub struct Scheduler {
    interval: Duration,
    cycle_timeout: Duration,
    sample_size: u64,
    probe: Arc<dyn ServiceProbe>,
    source: Arc<dyn SampleSource>,
    validator: Validator,
    monitor: HealthMonitor,
    notifier: Arc<Notifier>,
}

impl Scheduler {
    pub fn new(
        settings: &Settings,
        probe: Arc<dyn ServiceProbe>,
        source: Arc<dyn SampleSource>,
        validator: Validator,
        monitor: HealthMonitor,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            interval: settings.check_interval,
            cycle_timeout: settings.cycle_timeout,
            sample_size: settings.sample_size,
            probe,
            source,
            validator,
            monitor,
            notifier,
        }
    }

    /// The shared health monitor, for wiring the HTTP surface.
    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Spawn the infinite tick loop. Drop or abort the handle to stop.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            cycle_timeout_secs = self.cycle_timeout.as_secs(),
            sample_size = self.sample_size,
            "check scheduler started"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                let started = Instant::now();
                self.run_cycle().await;
                if started.elapsed() > self.interval {
                    debug!("cycle overran the interval — missed ticks skipped");
                }
            }
        })
    }

    /// Run exactly one check cycle: collect, apply, notify. Also used by the
    /// `canaryd check` one-shot command.
    pub async fn run_cycle(&self) -> CheckResult {
        let result = match tokio::time::timeout(self.cycle_timeout, self.collect()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(budget_secs = self.cycle_timeout.as_secs(), "check cycle cancelled on timeout");
                CheckResult::timed_out(self.cycle_timeout)
            }
        };

        if result.outcome.is_ok() {
            debug!(latency_ms = result.latency_ms, "check cycle ok");
        } else {
            warn!(outcome = %result.outcome, detail = %result.detail, "check cycle failed");
        }

        if let Some(transition) = self.monitor.apply(result.clone()).await {
            self.notifier.notify(&transition).await;
        }
        result
    }

    /// Gather one cycle's inputs and validate them.
    async fn collect(&self) -> CheckResult {
        let started = Instant::now();
        let (service, fetched) = tokio::join!(
            self.probe.status(),
            self.source.fetch_sample(self.sample_size)
        );
        self.validator
            .evaluate(&service, fetched, started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SamplingMode, Settings};
    use crate::error::{CheckError, NotifyError};
    use crate::health::HealthState;
    use crate::notifier::NotificationTransport;
    use crate::probe::ServiceStatus;
    use crate::sampler::{Sample, SampleRow};
    use crate::validator::CheckOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_settings(interval_secs: u64) -> Settings {
        Settings {
            datastack: "minnie65".to_string(),
            server_address: "https://materialize.test".to_string(),
            database_url: "postgres://unused".to_string(),
            table: "synapse_root_comparison".to_string(),
            slack_token: "xoxb-test".to_string(),
            slack_channel: "#alerts".to_string(),
            sample_size: 3,
            check_interval: Duration::from_secs(interval_secs),
            cycle_timeout: Duration::from_secs(interval_secs),
            sampling_mode: SamplingMode::RandomOffset,
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            log: "error".to_string(),
            log_format: "pretty".to_string(),
        }
    }

    struct UpProbe;
    #[async_trait]
    impl ServiceProbe for UpProbe {
        async fn status(&self) -> ServiceStatus {
            ServiceStatus::up()
        }
    }

    /// Source that fails while `failing` is set, counts calls either way.
    struct ScriptedSource {
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(failing: bool) -> Arc<Self> {
            Arc::new(Self {
                failing: AtomicBool::new(failing),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SampleSource for ScriptedSource {
        async fn fetch_sample(&self, n: u64) -> Result<Sample, CheckError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(CheckError::Connection("store down".to_string()));
            }
            Ok(Sample {
                rows: (1..=n as i64)
                    .map(|id| SampleRow {
                        id,
                        supervoxel_id: Some(id),
                        expected_root_id: Some(id),
                        materialized_root_id: Some(id),
                    })
                    .collect(),
            })
        }
    }

    /// Source whose fetch never completes — exercises the cycle timeout.
    struct HangingSource;
    #[async_trait]
    impl SampleSource for HangingSource {
        async fn fetch_sample(&self, _n: u64) -> Result<Sample, CheckError> {
            tokio::time::sleep(Duration::from_secs(86_400)).await;
            unreachable!("sampler should have been cancelled")
        }
    }

    struct CountingTransport {
        sent: Mutex<Vec<String>>,
    }
    #[async_trait]
    impl NotificationTransport for CountingTransport {
        async fn post_message(&self, _channel: &str, text: &str) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn build(
        settings: &Settings,
        source: Arc<dyn SampleSource>,
    ) -> (Arc<Scheduler>, HealthMonitor, Arc<CountingTransport>) {
        let monitor = HealthMonitor::new();
        let transport = Arc::new(CountingTransport {
            sent: Mutex::new(Vec::new()),
        });
        let notifier = Arc::new(Notifier::new(
            transport.clone(),
            &settings.slack_channel,
            &settings.datastack,
        ));
        let scheduler = Arc::new(Scheduler::new(
            settings,
            Arc::new(UpProbe),
            source,
            Validator::standard(),
            monitor.clone(),
            notifier,
        ));
        (scheduler, monitor, transport)
    }

    #[tokio::test]
    async fn passing_cycle_stays_healthy_and_silent() {
        let settings = test_settings(60);
        let source = ScriptedSource::new(false);
        let (scheduler, monitor, transport) = build(&settings, source.clone());

        let result = scheduler.run_cycle().await;
        assert_eq!(result.outcome, CheckOutcome::Ok);
        assert_eq!(monitor.state().await, HealthState::Healthy);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_cycle_is_recorded_as_query_error() {
        let settings = test_settings(60);
        let (scheduler, monitor, _transport) = build(&settings, Arc::new(HangingSource));

        let result = scheduler.run_cycle().await;
        assert_eq!(result.outcome, CheckOutcome::QueryError);
        assert!(result.detail.contains("timed out"));
        assert_eq!(monitor.state().await, HealthState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_ticks_at_the_configured_interval() {
        let settings = test_settings(60);
        let source = ScriptedSource::new(false);
        let (scheduler, _monitor, _transport) = build(&settings, source.clone());

        let handle = scheduler.spawn();
        // First tick fires immediately; then one per interval.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
        handle.abort();
    }

    #[tokio::test]
    async fn two_failures_alert_twice_then_stay_silent() {
        let settings = test_settings(60);
        let source = ScriptedSource::new(true);
        let (scheduler, monitor, transport) = build(&settings, source.clone());

        scheduler.run_cycle().await;
        assert_eq!(monitor.state().await, HealthState::Degraded);
        scheduler.run_cycle().await;
        assert_eq!(monitor.state().await, HealthState::Down);
        for _ in 0..10 {
            scheduler.run_cycle().await;
        }
        assert_eq!(monitor.state().await, HealthState::Down);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2, "one alert per transition, none while steady");
        assert!(sent[0].contains("healthy → degraded"));
        assert!(sent[1].contains("degraded → down"));
    }

    #[tokio::test]
    async fn recovery_alerts_exactly_once() {
        let settings = test_settings(60);
        let source = ScriptedSource::new(true);
        let (scheduler, monitor, transport) = build(&settings, source.clone());

        scheduler.run_cycle().await;
        scheduler.run_cycle().await;
        source.failing.store(false, Ordering::SeqCst);
        scheduler.run_cycle().await;
        scheduler.run_cycle().await;

        assert_eq!(monitor.state().await, HealthState::Healthy);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert!(sent[2].contains("down → healthy"));
    }
}
