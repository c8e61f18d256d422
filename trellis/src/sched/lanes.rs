//! Lane pools: named bounded semaphores with live stats.
//!
//! `submit` admits a future once a permit is available, or aborts when the
//! caller's cancellation token fires first. The permit is held by RAII for
//! the whole future, so release happens on every exit path, panics included.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Canonical lane names. Lanes are created at startup; submitting to an
/// unknown lane is a programming error surfaced as [`LaneError::UnknownLane`].
pub const LANE_MAIN: &str = "main";
pub const LANE_SUBAGENT: &str = "subagent";
pub const LANE_DELEGATE: &str = "delegate";
pub const LANE_CRON: &str = "cron";

#[derive(Error, Debug)]
pub enum LaneError {
    #[error("unknown lane: {0}")]
    UnknownLane(String),
    #[error("cancelled while waiting for lane {0}")]
    Cancelled(String),
    #[error("lane {0} is closed")]
    Closed(String),
}

/// Live snapshot of one lane.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct LaneStats {
    pub name: String,
    pub concurrency: usize,
    pub active: usize,
    pub pending: usize,
}

struct Lane {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    active: AtomicUsize,
    pending: AtomicUsize,
}

/// Named bounded worker pools.
pub struct LanePool {
    lanes: HashMap<String, Lane>,
}

impl LanePool {
    /// Builds the pool from `(name, concurrency)` pairs. A concurrency of 0
    /// is clamped to 1.
    pub fn new<I, S>(lanes: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let lanes = lanes
            .into_iter()
            .map(|(name, concurrency)| {
                let concurrency = concurrency.max(1);
                (
                    name.into(),
                    Lane {
                        semaphore: Arc::new(Semaphore::new(concurrency)),
                        concurrency,
                        active: AtomicUsize::new(0),
                        pending: AtomicUsize::new(0),
                    },
                )
            })
            .collect();
        Self { lanes }
    }

    /// Default lanes per the canonical sizing.
    pub fn with_defaults() -> Self {
        Self::new([
            (LANE_MAIN, 4),
            (LANE_SUBAGENT, 8),
            (LANE_DELEGATE, 4),
            (LANE_CRON, 2),
        ])
    }

    /// Runs `fut` inside the named lane. Waits for a permit unless `cancel`
    /// fires first. The permit is released when the future completes.
    pub async fn submit<F, T>(
        &self,
        lane: &str,
        cancel: &CancellationToken,
        fut: F,
    ) -> Result<T, LaneError>
    where
        F: Future<Output = T>,
    {
        let entry = self
            .lanes
            .get(lane)
            .ok_or_else(|| LaneError::UnknownLane(lane.to_string()))?;

        entry.pending.fetch_add(1, Ordering::Relaxed);
        let permit = tokio::select! {
            permit = entry.semaphore.clone().acquire_owned() => {
                entry.pending.fetch_sub(1, Ordering::Relaxed);
                permit.map_err(|_| LaneError::Closed(lane.to_string()))?
            }
            _ = cancel.cancelled() => {
                entry.pending.fetch_sub(1, Ordering::Relaxed);
                return Err(LaneError::Cancelled(lane.to_string()));
            }
        };

        entry.active.fetch_add(1, Ordering::Relaxed);
        // Drop guard keeps `active` accurate even if `fut` panics.
        struct ActiveGuard<'a>(&'a AtomicUsize);
        impl Drop for ActiveGuard<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::Relaxed);
            }
        }
        let _active = ActiveGuard(&entry.active);
        let _permit = permit;

        Ok(fut.await)
    }

    /// Live `(name, concurrency, active, pending)` stats for every lane.
    pub fn stats(&self) -> Vec<LaneStats> {
        let mut out: Vec<LaneStats> = self
            .lanes
            .iter()
            .map(|(name, lane)| LaneStats {
                name: name.clone(),
                concurrency: lane.concurrency,
                active: lane.active.load(Ordering::Relaxed),
                pending: lane.pending.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
