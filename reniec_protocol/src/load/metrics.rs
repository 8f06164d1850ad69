// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Aggregation of call outcomes and latencies across concurrent workers.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Counters and latency samples for every operation kind, shared by all workers.
pub struct Metrics {
    started: Instant,
    inner: Mutex<MetricsState>,
}

#[derive(Default)]
struct MetricsState {
    total: u64,
    fail: u64,
    by_kind: BTreeMap<String, KindState>,
}

#[derive(Default)]
struct KindState {
    count: u64,
    ok: u64,
    latencies_ms: Vec<f64>,
}

impl Metrics {
    /// Start aggregating. Throughput is measured from this point.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            inner: Mutex::new(MetricsState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome of one call of `kind`.
    pub fn record(&self, kind: &str, ok: bool, elapsed: Duration) {
        let mut state = self.lock();
        state.total += 1;
        if !ok {
            state.fail += 1;
        }
        let kind_state = state.by_kind.entry(kind.to_string()).or_default();
        kind_state.count += 1;
        kind_state.ok += u64::from(ok);
        #[allow(clippy::cast_precision_loss)]
        let latency_ms = elapsed.as_nanos() as f64 / 1_000_000.0;
        kind_state.latencies_ms.push(latency_ms);
    }

    /// Reduce everything recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();
        let elapsed = self.started.elapsed();
        let mut all_latencies = vec![];
        let kinds = state
            .by_kind
            .iter()
            .map(|(kind, kind_state)| {
                all_latencies.extend_from_slice(&kind_state.latencies_ms);
                (
                    kind.clone(),
                    KindSnapshot {
                        count: kind_state.count,
                        ok: kind_state.ok,
                        latency: Percentiles::of(kind_state.latencies_ms.clone()),
                    },
                )
            })
            .collect();
        MetricsSnapshot {
            total: state.total,
            fail: state.fail,
            elapsed,
            latency: Percentiles::of(all_latencies),
            kinds,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Sample at percentile `p` of ascending `sorted`, using the sample at index
/// `round(p/100 * (n-1))` with ties going to the even index. `None` when there are no samples.
#[must_use]
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let index = ((p / 100.0) * (sorted.len() - 1) as f64).round_ties_even() as usize;
    sorted.get(index.min(sorted.len() - 1)).copied()
}

/// p50, p95 and p99 latency in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Percentiles {
    /// Median
    pub p50: Option<f64>,
    /// 95th percentile
    pub p95: Option<f64>,
    /// 99th percentile
    pub p99: Option<f64>,
}

impl Percentiles {
    fn of(mut samples: Vec<f64>) -> Self {
        samples.sort_by(f64::total_cmp);
        Self {
            p50: percentile(&samples, 50.0),
            p95: percentile(&samples, 95.0),
            p99: percentile(&samples, 99.0),
        }
    }
}

/// Aggregate of one operation kind
#[derive(Debug, Clone, PartialEq)]
pub struct KindSnapshot {
    /// Calls recorded
    pub count: u64,
    /// Successful calls
    pub ok: u64,
    /// Latency percentiles
    pub latency: Percentiles,
}

impl KindSnapshot {
    /// Percentage of successful calls
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ok_percent(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            100.0 * self.ok as f64 / self.count as f64
        }
    }
}

/// Aggregate of a run
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Calls recorded
    pub total: u64,
    /// Failed calls
    pub fail: u64,
    /// Time since aggregation started
    pub elapsed: Duration,
    /// Latency percentiles across every kind
    pub latency: Percentiles,
    /// Aggregate per kind, sorted by kind
    pub kinds: BTreeMap<String, KindSnapshot>,
}

impl MetricsSnapshot {
    /// Successful calls
    #[must_use]
    pub fn ok(&self) -> u64 {
        self.total - self.fail
    }

    /// Calls per second
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total as f64 / secs
        } else {
            0.0
        }
    }

    /// Write `kind,count,ok,p50_ms,p95_ms,p99_ms` rows, leaving cells empty without samples.
    ///
    /// # Errors
    /// Returns any error writing to `writer`.
    pub fn write_csv<W: io::Write>(&self, mut writer: W) -> io::Result<()> {
        fn cell(value: Option<f64>) -> String {
            value.map(|v| v.to_string()).unwrap_or_default()
        }
        writeln!(writer, "kind,count,ok,p50_ms,p95_ms,p99_ms")?;
        for (kind, snapshot) in &self.kinds {
            writeln!(
                writer,
                "{kind},{},{},{},{},{}",
                snapshot.count,
                snapshot.ok,
                cell(snapshot.latency.p50),
                cell(snapshot.latency.p95),
                cell(snapshot.latency.p99)
            )?;
        }
        writer.flush()
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "===== RESULTS =====")?;
        writeln!(f, "Total messages     : {}", self.total)?;
        writeln!(f, "Success / Failure  : {} / {}", self.ok(), self.fail)?;
        writeln!(f, "Total time (s)     : {:.2}", self.elapsed.as_secs_f64())?;
        writeln!(f, "Throughput (msg/s) : {:.1}", self.throughput())?;
        writeln!(f)?;
        match (self.latency.p50, self.latency.p95, self.latency.p99) {
            (Some(p50), Some(p95), Some(p99)) => writeln!(
                f,
                "Total latency (ms): p50={p50:.1}  p95={p95:.1}  p99={p99:.1}"
            )?,
            _ => writeln!(f, "Total latency (ms): no samples")?,
        }
        writeln!(f)?;
        writeln!(f, "By operation:")?;
        for (kind, snapshot) in &self.kinds {
            write!(
                f,
                " - {kind:<18} n={:<5} ok%={:5.1}",
                snapshot.count,
                snapshot.ok_percent()
            )?;
            if let (Some(p50), Some(p95), Some(p99)) =
                (snapshot.latency.p50, snapshot.latency.p95, snapshot.latency.p99)
            {
                write!(f, "  p50={p50:5.1}  p95={p95:5.1}  p99={p99:5.1}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
