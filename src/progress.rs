//! Indexing progress tracking and reporting.
//!
//! [`ProgressTracker`] holds the process-wide, non-persisted state of one
//! indexing cycle and turns it into a serializable [`ProgressSnapshot`] for
//! the `/status` endpoint and `nrag status`. Every state change is also
//! forwarded as a [`ProgressEvent`] to a [`ProgressReporter`], which the CLI
//! renders on **stderr** (human or JSON) so stdout remains parseable.
//!
//! # State machine
//!
//! ```text
//! Idle ──begin_scan──▶ Scanning ──record_batch──▶ BatchProgress ─┐
//!   ▲                                                ▲           │
//!   └──────────── end_scan (nothing pending) ────────┴───────────┘
//! ```
//!
//! Within a cycle `processed_batches` only grows. It is advanced by the
//! batches a source actually consumed, which can differ from the pre-scan
//! estimate, so it may exceed `total_batches`; the snapshot's `percent` is
//! clamped to 100.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::IndexKind;
use crate::vector::BatchProgress;

/// Default trailing window during which recent activity counts as indexing.
pub const DEFAULT_ACTIVITY_WINDOW: Duration = Duration::from_secs(10);

/// Phase of the indexing cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexPhase {
    /// Nothing in flight.
    Idle,
    /// Listing the store and estimating work.
    Scanning,
    /// At least one batch has been reported in this cycle.
    BatchProgress,
}

/// The batch currently in flight.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentBatch {
    pub source_id: String,
    pub source_title: String,
    pub batch_index: usize,
    pub total_batches: usize,
    pub total_chunks: usize,
    pub processed_chunks: usize,
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// A rescan listed the store.
    ScanStarted { discovered: usize },
    /// Pre-scan estimate of the work in this cycle.
    Planned { total_batches: usize },
    /// A vector batch started or finished.
    Batch(CurrentBatch),
    /// A source finished indexing (successfully or not).
    SourceFinished {
        source_id: String,
        kind: IndexKind,
        error: Option<String>,
        processed_batches: usize,
        total_batches: usize,
    },
    /// The cycle's queue drained.
    ScanFinished {
        vector_indexed: usize,
        csv_indexed: usize,
        failed: usize,
    },
}

/// Reports indexing progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the watch loop.
    fn report(&self, event: &ProgressEvent);
}

/// Human-friendly progress on stderr: "index  Field notes  batch 2/4  50 / 87 chunks".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        let line = match event {
            ProgressEvent::ScanStarted { discovered } => {
                format!("index  scanning  {} sources\n", format_number(*discovered as u64))
            }
            ProgressEvent::Planned { total_batches } => {
                format!(
                    "index  planned  {} batches\n",
                    format_number(*total_batches as u64)
                )
            }
            ProgressEvent::Batch(b) => format!(
                "index  {}  batch {}/{}  {} / {} chunks\n",
                b.source_title,
                b.batch_index + 1,
                b.total_batches,
                format_number(b.processed_chunks as u64),
                format_number(b.total_chunks as u64)
            ),
            ProgressEvent::SourceFinished {
                source_id,
                kind,
                error,
                processed_batches,
                total_batches,
            } => match error {
                None => format!(
                    "index  {}  done ({:?})  {} / {} batches\n",
                    source_id, kind, processed_batches, total_batches
                ),
                Some(e) => format!("index  {}  failed: {}\n", source_id, e),
            },
            ProgressEvent::ScanFinished {
                vector_indexed,
                csv_indexed,
                failed,
            } => format!(
                "index  complete  {} text, {} csv, {} failed\n",
                format_number(*vector_indexed as u64),
                format_number(*csv_indexed as u64),
                failed
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        let obj = match event {
            ProgressEvent::ScanStarted { discovered } => serde_json::json!({
                "event": "progress",
                "phase": "scanning",
                "discovered": discovered
            }),
            ProgressEvent::Planned { total_batches } => serde_json::json!({
                "event": "progress",
                "phase": "planned",
                "totalBatches": total_batches
            }),
            ProgressEvent::Batch(b) => serde_json::json!({
                "event": "progress",
                "phase": "batch",
                "batch": b
            }),
            ProgressEvent::SourceFinished {
                source_id,
                kind,
                error,
                processed_batches,
                total_batches,
            } => serde_json::json!({
                "event": "source",
                "sourceId": source_id,
                "kind": kind,
                "error": error,
                "processedBatches": processed_batches,
                "totalBatches": total_batches
            }),
            ProgressEvent::ScanFinished {
                vector_indexed,
                csv_indexed,
                failed,
            } => serde_json::json!({
                "event": "complete",
                "vectorIndexed": vector_indexed,
                "csvIndexed": csv_indexed,
                "failed": failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Parse a `--progress` value. `auto` picks by TTY.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::default_for_tty()),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            "off" => Some(ProgressMode::Off),
            _ => None,
        }
    }

    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

// ============ Tracker ============

/// Serializable view of the tracker, as returned by `/status`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub phase: IndexPhase,
    pub is_indexing: bool,
    pub total_discovered: usize,
    pub vector_indexed: usize,
    pub csv_indexed: usize,
    pub pending_count: usize,
    pub pending: Vec<String>,
    pub failed: Vec<String>,
    pub total_batches: usize,
    pub processed_batches: usize,
    pub percent: f64,
    pub current_batch: Option<CurrentBatch>,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct TrackerState {
    phase: Option<IndexPhase>,
    total_discovered: usize,
    vector_indexed: usize,
    csv_indexed: usize,
    pending: BTreeSet<String>,
    failed: BTreeSet<String>,
    total_batches: usize,
    processed_batches: usize,
    current_batch: Option<CurrentBatch>,
    last_activity: Option<(Instant, DateTime<Utc>)>,
}

impl TrackerState {
    fn touch(&mut self) {
        self.last_activity = Some((Instant::now(), Utc::now()));
    }
}

/// Process-wide indexing progress, shared between the watch loop and
/// status readers.
pub struct ProgressTracker {
    state: RwLock<TrackerState>,
    activity_window: Duration,
    reporter: Arc<dyn ProgressReporter>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVITY_WINDOW)
    }
}

impl ProgressTracker {
    pub fn new(activity_window: Duration) -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            activity_window,
            reporter: Arc::new(NoProgress),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    fn update<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Like `update`, and refreshes the activity window. Only work on a
    /// source counts as activity; scan bookkeeping does not.
    fn update_active<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.touch();
        f(&mut state)
    }

    /// Start a new cycle: batch counters reset, discovered count replaced.
    pub fn begin_scan(&self, discovered: usize) {
        self.update(|s| {
            s.phase = Some(IndexPhase::Scanning);
            s.total_discovered = discovered;
            s.total_batches = 0;
            s.processed_batches = 0;
            s.current_batch = None;
        });
        self.reporter.report(&ProgressEvent::ScanStarted { discovered });
    }

    /// Add `batches` to the cycle's planned total.
    pub fn add_planned_batches(&self, batches: usize) {
        if batches == 0 {
            return;
        }
        let total_batches = self.update_active(|s| {
            s.total_batches += batches;
            s.total_batches
        });
        self.reporter.report(&ProgressEvent::Planned { total_batches });
    }

    pub fn mark_pending(&self, source_id: &str) {
        self.update_active(|s| {
            s.pending.insert(source_id.to_string());
        });
    }

    /// Record a vector batch boundary for `source_id`.
    pub fn record_batch(&self, source_id: &str, source_title: &str, progress: BatchProgress) {
        let batch = CurrentBatch {
            source_id: source_id.to_string(),
            source_title: source_title.to_string(),
            batch_index: progress.batch_index,
            total_batches: progress.total_batches,
            total_chunks: progress.total_chunks,
            processed_chunks: progress.processed_chunks,
        };
        self.update_active(|s| {
            s.phase = Some(IndexPhase::BatchProgress);
            s.current_batch = Some(batch.clone());
        });
        self.reporter.report(&ProgressEvent::Batch(batch));
    }

    /// A source left the queue. `consumed_batches` advances the processed
    /// counter; `error` moves the source to the failed set.
    pub fn finish_source(
        &self,
        source_id: &str,
        kind: IndexKind,
        consumed_batches: usize,
        error: Option<String>,
    ) {
        let (processed_batches, total_batches) = self.update_active(|s| {
            s.pending.remove(source_id);
            s.processed_batches += consumed_batches;
            if error.is_some() {
                s.failed.insert(source_id.to_string());
            } else {
                s.failed.remove(source_id);
            }
            if s
                .current_batch
                .as_ref()
                .is_some_and(|b| b.source_id == source_id)
            {
                s.current_batch = None;
            }
            (s.processed_batches, s.total_batches)
        });
        self.reporter.report(&ProgressEvent::SourceFinished {
            source_id: source_id.to_string(),
            kind,
            error,
            processed_batches,
            total_batches,
        });
    }

    /// Forget a source that was removed from the store.
    pub fn forget_source(&self, source_id: &str) {
        self.update(|s| {
            s.pending.remove(source_id);
            s.failed.remove(source_id);
        });
    }

    /// Current sizes of the already-indexed sets.
    pub fn set_indexed_counts(&self, vector_indexed: usize, csv_indexed: usize) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.vector_indexed = vector_indexed;
        state.csv_indexed = csv_indexed;
    }

    /// Close the cycle if nothing is pending.
    pub fn end_scan(&self) {
        let finished = self.update(|s| {
            if !s.pending.is_empty() {
                return None;
            }
            s.phase = Some(IndexPhase::Idle);
            s.current_batch = None;
            Some((s.vector_indexed, s.csv_indexed, s.failed.len()))
        });
        if let Some((vector_indexed, csv_indexed, failed)) = finished {
            self.reporter.report(&ProgressEvent::ScanFinished {
                vector_indexed,
                csv_indexed,
                failed,
            });
        }
    }

    pub fn is_failed(&self, source_id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .failed
            .contains(source_id)
    }

    /// True while work is pending or activity happened within the window.
    pub fn is_indexing(&self) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        self.is_indexing_locked(&state)
    }

    fn is_indexing_locked(&self, state: &TrackerState) -> bool {
        !state.pending.is_empty()
            || state
                .last_activity
                .is_some_and(|(at, _)| at.elapsed() < self.activity_window)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let percent = if state.total_batches == 0 {
            if state.pending.is_empty() {
                100.0
            } else {
                0.0
            }
        } else {
            (state.processed_batches as f64 / state.total_batches as f64 * 100.0).min(100.0)
        };

        ProgressSnapshot {
            phase: state.phase.unwrap_or(IndexPhase::Idle),
            is_indexing: self.is_indexing_locked(&state),
            total_discovered: state.total_discovered,
            vector_indexed: state.vector_indexed,
            csv_indexed: state.csv_indexed,
            pending_count: state.pending.len(),
            pending: state.pending.iter().cloned().collect(),
            failed: state.failed.iter().cloned().collect(),
            total_batches: state.total_batches,
            processed_batches: state.processed_batches,
            percent,
            current_batch: state.current_batch.clone(),
            last_activity: state.last_activity.map(|(_, at)| at),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ProgressReporter for Recorder {
        fn report(&self, event: &ProgressEvent) {
            let tag = match event {
                ProgressEvent::ScanStarted { .. } => "scan",
                ProgressEvent::Planned { .. } => "planned",
                ProgressEvent::Batch(_) => "batch",
                ProgressEvent::SourceFinished { .. } => "source",
                ProgressEvent::ScanFinished { .. } => "complete",
            };
            self.0.lock().unwrap().push(tag.to_string());
        }
    }

    fn batch(i: usize, total: usize, done: usize) -> BatchProgress {
        BatchProgress {
            batch_index: i,
            total_batches: total,
            processed_chunks: done,
            total_chunks: 60,
        }
    }

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn test_cycle_phases_and_counters() {
        let recorder = Arc::new(Recorder::default());
        let tracker = ProgressTracker::new(Duration::ZERO).with_reporter(recorder.clone());
        assert_eq!(tracker.snapshot().phase, IndexPhase::Idle);
        assert!(!tracker.is_indexing());

        tracker.begin_scan(2);
        tracker.mark_pending("a");
        tracker.mark_pending("b");
        tracker.add_planned_batches(3);
        assert_eq!(tracker.snapshot().phase, IndexPhase::Scanning);
        assert!(tracker.is_indexing());

        tracker.record_batch("a", "Doc A", batch(0, 2, 0));
        let snap = tracker.snapshot();
        assert_eq!(snap.phase, IndexPhase::BatchProgress);
        assert_eq!(snap.current_batch.as_ref().unwrap().source_title, "Doc A");

        tracker.finish_source("a", IndexKind::Vector, 2, None);
        tracker.end_scan();
        assert_eq!(tracker.snapshot().phase, IndexPhase::BatchProgress);

        tracker.finish_source("b", IndexKind::Tabular, 1, None);
        tracker.set_indexed_counts(1, 1);
        tracker.end_scan();

        let snap = tracker.snapshot();
        assert_eq!(snap.phase, IndexPhase::Idle);
        assert_eq!(snap.processed_batches, 3);
        assert_eq!(snap.total_batches, 3);
        assert_eq!(snap.percent, 100.0);
        assert_eq!(snap.pending_count, 0);
        assert!(snap.current_batch.is_none());
        assert!(!snap.is_indexing);

        let events = recorder.0.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["scan", "planned", "batch", "source", "source", "complete"]
        );
    }

    #[test]
    fn test_processed_may_exceed_total_and_percent_clamps() {
        let tracker = ProgressTracker::new(Duration::ZERO);
        tracker.begin_scan(1);
        tracker.add_planned_batches(1);
        tracker.finish_source("a", IndexKind::Vector, 3, None);
        let snap = tracker.snapshot();
        assert_eq!(snap.processed_batches, 3);
        assert_eq!(snap.total_batches, 1);
        assert_eq!(snap.percent, 100.0);
    }

    #[test]
    fn test_failed_sources_tracked_and_cleared() {
        let tracker = ProgressTracker::new(Duration::ZERO);
        tracker.mark_pending("x");
        tracker.finish_source("x", IndexKind::Vector, 0, Some("boom".into()));
        assert!(tracker.is_failed("x"));
        assert_eq!(tracker.snapshot().failed, vec!["x".to_string()]);
        assert_eq!(tracker.snapshot().pending_count, 0);

        tracker.finish_source("x", IndexKind::Vector, 1, None);
        assert!(!tracker.is_failed("x"));
    }

    #[test]
    fn test_activity_window_keeps_indexing_true() {
        let tracker = ProgressTracker::new(Duration::from_secs(60));
        tracker.begin_scan(1);
        tracker.mark_pending("a");
        tracker.finish_source("a", IndexKind::Vector, 1, None);
        tracker.end_scan();
        assert_eq!(tracker.snapshot().pending_count, 0);
        assert!(tracker.is_indexing());
        assert!(tracker.snapshot().last_activity.is_some());
    }

    #[test]
    fn test_idle_scan_is_not_activity() {
        let tracker = ProgressTracker::new(Duration::from_secs(60));
        tracker.begin_scan(3);
        tracker.add_planned_batches(0);
        tracker.end_scan();
        tracker.forget_source("gone");
        assert!(!tracker.is_indexing());
        assert!(tracker.snapshot().last_activity.is_none());
    }

    #[test]
    fn test_begin_scan_resets_batch_counters() {
        let tracker = ProgressTracker::new(Duration::ZERO);
        tracker.begin_scan(1);
        tracker.add_planned_batches(4);
        tracker.finish_source("a", IndexKind::Vector, 4, None);
        tracker.begin_scan(1);
        let snap = tracker.snapshot();
        assert_eq!(snap.total_batches, 0);
        assert_eq!(snap.processed_batches, 0);
    }

    #[test]
    fn test_parse_progress_mode() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("off"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::parse("human"), Some(ProgressMode::Human));
        assert!(ProgressMode::parse("auto").is_some());
        assert_eq!(ProgressMode::parse("loud"), None);
    }
}
