use super::error::ExtractError;
use super::error_log::ErrorLog;
use super::staging::StagingSink;
use super::work::{ItemId, WorkItem};
use crate::extract::Extractor;
use rand::{thread_rng, Rng};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Self-throttling between two extractor calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RatePolicy {
    #[default]
    None,
    Fixed(Duration),
    /// Uniform delay in `[min, max]`.
    Jittered { min: Duration, max: Duration },
}

impl RatePolicy {
    /// `delay_ms` alone is a fixed delay; with `jitter_ms` the delay is drawn
    /// from `[delay_ms, delay_ms + jitter_ms]`.
    pub fn from_millis(delay_ms: u64, jitter_ms: u64) -> Self {
        match (delay_ms, jitter_ms) {
            (0, 0) => RatePolicy::None,
            (d, 0) => RatePolicy::Fixed(Duration::from_millis(d)),
            (d, j) => RatePolicy::Jittered {
                min: Duration::from_millis(d),
                max: Duration::from_millis(d + j),
            },
        }
    }

    pub fn next_delay(&self) -> Duration {
        match *self {
            RatePolicy::None => Duration::ZERO,
            RatePolicy::Fixed(d) => d,
            RatePolicy::Jittered { min, max } => {
                let lo = min.as_millis() as u64;
                let hi = max.as_millis() as u64;
                if hi <= lo {
                    return min;
                }
                Duration::from_millis(thread_rng().gen_range(lo..=hi))
            }
        }
    }
}

#[derive(Debug, Default)]
struct StopInner {
    flag: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation, observed between items and during the
/// inter-item delay, never in the middle of an extractor call.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub async fn triggered(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }

    /// First Ctrl+C asks the loop to stop at the next item boundary so the
    /// finalizer runs; a second one exits at once (the staging file is
    /// recovered by the next run).
    pub fn install_ctrl_c(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(target: "tracker", error = %err, "failed to install Ctrl+C handler");
                return;
            }
            warn!(target: "tracker", "Ctrl+C received; finishing the current item, then saving");
            signal.trigger();
            if tokio::signal::ctrl_c().await.is_ok() {
                error!(target: "tracker", "second Ctrl+C; exiting without finalize");
                std::process::exit(130);
            }
        });
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Completed,
    Cancelled,
    Fatal(ExtractError),
}

/// What the loop did so far; `attempted` is what the finalizer advances by.
#[derive(Debug, Default, Clone)]
pub struct TrackerReport {
    pub attempted: usize,
    pub produced: usize,
    pub failed: usize,
    pub processed: HashSet<ItemId>,
}

/// Drives the extractor over the pending slice, one item at a time.
///
/// Successes go to the staging sink, recoverable failures to the error log;
/// both count as attempted. A fatal error stops the loop without counting
/// the item that raised it.
pub struct ProgressTracker<'a> {
    extractor: &'a dyn Extractor,
    staging: &'a mut StagingSink,
    errors: &'a ErrorLog,
    rate: RatePolicy,
    stop: StopSignal,
    report: TrackerReport,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(
        extractor: &'a dyn Extractor,
        staging: &'a mut StagingSink,
        errors: &'a ErrorLog,
        rate: RatePolicy,
        stop: StopSignal,
    ) -> Self {
        Self {
            extractor,
            staging,
            errors,
            rate,
            stop,
            report: TrackerReport::default(),
        }
    }

    pub fn report(&self) -> &TrackerReport {
        &self.report
    }

    pub fn into_report(self) -> TrackerReport {
        self.report
    }

    /// `items[0]` has global index `first_idx`; `end_idx` is only for progress output.
    pub async fn run(&mut self, items: &[WorkItem], first_idx: i64, end_idx: i64) -> LoopExit {
        for (offset, item) in items.iter().enumerate() {
            if offset > 0 {
                self.pause().await;
            }
            if self.stop.is_triggered() {
                info!(
                    target: "tracker",
                    next = first_idx + offset as i64,
                    "stop requested; leaving the loop"
                );
                return LoopExit::Cancelled;
            }

            let idx = first_idx + offset as i64;
            info!(target: "tracker", idx, end = end_idx, id = %item.id, "extracting");

            match self.extractor.extract(item).await {
                Ok(record) => {
                    let record = stamp_id(record, item);
                    if let Err(err) = self.staging.append(&record) {
                        error!(target: "tracker", id = %item.id, error = %err, "staging write failed");
                        return LoopExit::Fatal(ExtractError::fatal(format!(
                            "staging write failed: {err}"
                        )));
                    }
                    self.report.attempted += 1;
                    self.report.produced += 1;
                    self.report.processed.insert(item.id.clone());
                }
                Err(ExtractError::Recoverable(reason)) => {
                    warn!(target: "tracker", id = %item.id, %reason, "item failed; continuing");
                    if let Err(err) = self.errors.record(&item.id, &reason) {
                        warn!(target: "tracker", id = %item.id, error = %err, "could not write error log");
                    }
                    // crash recovery counts marked items as attempted
                    if let Err(err) = self.staging.mark_failed(&item.id, &reason) {
                        warn!(target: "tracker", id = %item.id, error = %err, "could not mark failed item in staging");
                    }
                    self.report.attempted += 1;
                    self.report.failed += 1;
                }
                Err(fatal @ ExtractError::Fatal(_)) => {
                    error!(target: "tracker", id = %item.id, error = %fatal, "fatal error; stopping");
                    return LoopExit::Fatal(fatal);
                }
            }
        }
        LoopExit::Completed
    }

    async fn pause(&self) {
        let delay = self.rate.next_delay();
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.stop.triggered() => {}
        }
    }
}

/// Make sure the staged record carries the item's id; a different `id`
/// returned by the extractor is replaced.
fn stamp_id(record: Value, item: &WorkItem) -> Value {
    match record {
        Value::Object(mut map) => {
            match map.get("id").and_then(ItemId::from_value) {
                Some(id) if id == item.id => {}
                Some(other) => {
                    warn!(target: "tracker", id = %item.id, returned = %other, "extractor returned a different id; keeping the item id");
                    map.insert("id".to_string(), item.id.to_value());
                }
                None => {
                    map.insert("id".to_string(), item.id.to_value());
                }
            }
            Value::Object(map)
        }
        other => {
            let mut map = Map::new();
            map.insert("id".to_string(), item.id.to_value());
            map.insert("data".to_string(), other);
            Value::Object(map)
        }
    }
}
