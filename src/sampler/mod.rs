// SPDX-License-Identifier: MIT
//! Row sampling against the materialized store.
//!
//! Each check cycle draws a fixed-size random sample from the configured
//! comparison table. The table (usually a view) exposes, per row, the value
//! the materialization service serves and the authoritative value it should
//! match; the validator decides what "match" means.
//!
//! Two strategies, selected by [`SamplingMode`]:
//! - `system-rows` — `TABLESAMPLE SYSTEM_ROWS(n)`, cost bounded independent
//!   of table size. Needs the `tsm_system_rows` extension; if the store
//!   rejects it the sampler latches a fallback to `random-offset` and logs
//!   once.
//! - `random-offset` — `COUNT(*)` plus a random `OFFSET`/`LIMIT` window, the
//!   portable strategy.
//!
//! Sampling is strictly read-only and returns exactly `n` rows or fails.

use async_trait::async_trait;
use rand::Rng;
use sqlx::postgres::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use crate::config::SamplingMode;
use crate::error::{check_error_from_sqlx, CheckError};

/// One sampled row from the comparison table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SampleRow {
    /// Annotation id.
    pub id: i64,
    /// Source supervoxel the annotation is anchored to.
    pub supervoxel_id: Option<i64>,
    /// Root id the graph currently resolves the supervoxel to.
    pub expected_root_id: Option<i64>,
    /// Root id the materialized table serves.
    pub materialized_root_id: Option<i64>,
}

/// Ordered sample drawn for one check cycle. Not persisted.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub rows: Vec<SampleRow>,
}

impl Sample {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Capability to draw one cycle's sample. The scheduler only sees this trait;
/// tests substitute scripted sources.
#[async_trait]
pub trait SampleSource: Send + Sync {
    async fn fetch_sample(&self, n: u64) -> Result<Sample, CheckError>;
}

// ─── Postgres sampler ─────────────────────────────────────────────────────────

/// Postgres codes meaning the TABLESAMPLE method isn't available:
/// undefined function, undefined object, feature not supported.
const UNSUPPORTED_SAMPLING_CODES: &[&str] = &["42883", "42704", "0A000"];

pub struct PgSampler {
    pool: PgPool,
    table: String,
    mode: SamplingMode,
    /// Set once when system-rows sampling turns out to be unsupported.
    system_rows_unavailable: AtomicBool,
}

impl PgSampler {
    pub fn new(pool: PgPool, table: impl Into<String>, mode: SamplingMode) -> Self {
        Self {
            pool,
            table: table.into(),
            mode,
            system_rows_unavailable: AtomicBool::new(false),
        }
    }

    fn effective_mode(&self) -> SamplingMode {
        if self.mode == SamplingMode::SystemRows
            && !self.system_rows_unavailable.load(Ordering::Relaxed)
        {
            SamplingMode::SystemRows
        } else {
            SamplingMode::RandomOffset
        }
    }

    async fn fetch_system_rows(&self, n: u64) -> Result<Sample, sqlx::Error> {
        let sql = format!(
            "SELECT id, supervoxel_id, expected_root_id, materialized_root_id \
             FROM {} TABLESAMPLE SYSTEM_ROWS($1)",
            self.table
        );
        let rows: Vec<SampleRow> = sqlx::query_as(&sql)
            .bind(n as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(Sample { rows })
    }

    async fn fetch_random_offset(&self, n: u64) -> Result<Sample, CheckError> {
        let count_sql = format!("SELECT count(*) FROM {}", self.table);
        let (available,): (i64,) = sqlx::query_as(&count_sql)
            .fetch_one(&self.pool)
            .await
            .map_err(check_error_from_sqlx)?;
        let available = available.max(0) as u64;

        ensure_exact(available, n)?;

        let offset = random_offset(available, n, &mut rand::thread_rng());
        let sql = format!(
            "SELECT id, supervoxel_id, expected_root_id, materialized_root_id \
             FROM {} ORDER BY id OFFSET $1 LIMIT $2",
            self.table
        );
        let rows: Vec<SampleRow> = sqlx::query_as(&sql)
            .bind(offset as i64)
            .bind(n as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(check_error_from_sqlx)?;
        Ok(Sample { rows })
    }
}

#[async_trait]
impl SampleSource for PgSampler {
    async fn fetch_sample(&self, n: u64) -> Result<Sample, CheckError> {
        let sample = match self.effective_mode() {
            SamplingMode::SystemRows => match self.fetch_system_rows(n).await {
                Ok(sample) => sample,
                Err(e) if sampling_unsupported(&e) => {
                    warn!(
                        table = %self.table,
                        err = %e,
                        "system-rows sampling unsupported by store — falling back to random-offset"
                    );
                    self.system_rows_unavailable.store(true, Ordering::Relaxed);
                    self.fetch_random_offset(n).await?
                }
                Err(e) => return Err(check_error_from_sqlx(e)),
            },
            SamplingMode::RandomOffset => self.fetch_random_offset(n).await?,
        };

        // A short sample is a failure, never a smaller answer.
        ensure_exact(sample.len() as u64, n)?;
        debug!(rows = sample.len(), table = %self.table, "sample drawn");
        Ok(sample)
    }
}

fn sampling_unsupported(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| UNSUPPORTED_SAMPLING_CODES.contains(&code.as_ref()))
}

/// Exactly-n enforcement: a store (or result set) with fewer rows than the
/// requested sample size fails the cycle instead of shrinking the sample.
fn ensure_exact(available: u64, requested: u64) -> Result<(), CheckError> {
    if available < requested {
        return Err(CheckError::InsufficientData {
            available,
            requested,
        });
    }
    Ok(())
}

/// Pick a window start so the sample never runs off the end of the table.
/// Requires `available >= n`.
fn random_offset(available: u64, n: u64, rng: &mut impl Rng) -> u64 {
    let max_offset = available - n;
    if max_offset == 0 {
        0
    } else {
        rng.gen_range(0..=max_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn offset_stays_inside_table() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let offset = random_offset(10_000, 1000, &mut rng);
            assert!(offset + 1000 <= 10_000);
        }
    }

    #[test]
    fn offset_is_zero_when_sample_covers_table() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(random_offset(1000, 1000, &mut rng), 0);
        assert_eq!(random_offset(1, 1, &mut rng), 0);
    }

    #[test]
    fn offset_varies_across_draws() {
        let mut rng = StdRng::seed_from_u64(7);
        let draws: Vec<u64> = (0..50)
            .map(|_| random_offset(1_000_000, 1000, &mut rng))
            .collect();
        let first = draws[0];
        assert!(draws.iter().any(|&d| d != first));
    }

    #[test]
    fn short_store_is_rejected_never_truncated() {
        let err = ensure_exact(10, 1000).unwrap_err();
        match err {
            CheckError::InsufficientData {
                available,
                requested,
            } => {
                assert_eq!(available, 10);
                assert_eq!(requested, 1000);
            }
            other => panic!("expected InsufficientData, got {other:?}"),
        }
        assert!(ensure_exact(0, 1).is_err());
    }

    #[test]
    fn exact_or_larger_store_passes() {
        assert!(ensure_exact(1000, 1000).is_ok());
        assert!(ensure_exact(1001, 1000).is_ok());
    }

    #[test]
    fn non_database_errors_are_not_treated_as_unsupported() {
        assert!(!sampling_unsupported(&sqlx::Error::RowNotFound));
        assert!(!sampling_unsupported(&sqlx::Error::PoolTimedOut));
    }
}
