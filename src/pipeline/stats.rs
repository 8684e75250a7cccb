// Pipeline counters and the write-failure record
//
// Counters are plain atomics so the hot path never takes a lock. Write
// failures are kept in a bounded ring so persistence gaps stay diagnosable
// from the /stats endpoint after the fact.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use uuid::Uuid;

use crate::pipeline::types::Batch;
use crate::subscribers::BroadcastReport;

/// Number of write failures kept for inspection
const MAX_RECENT_FAILURES: usize = 100;

/// A batch that could not be persisted after the retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFailure {
    pub batch_id: Uuid,
    pub sequence: u64,
    pub event_count: usize,
    pub first_offset: Option<i64>,
    pub last_offset: Option<i64>,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

impl WriteFailure {
    pub fn new(batch: &Batch, error: impl ToString) -> Self {
        let range = batch.offset_range();
        Self {
            batch_id: batch.id(),
            sequence: batch.sequence(),
            event_count: batch.len(),
            first_offset: range.map(|(first, _)| first),
            last_offset: range.map(|(_, last)| last),
            error: error.to_string(),
            recorded_at: Utc::now(),
        }
    }
}

/// Point-in-time copy of the pipeline counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub events_ingested: u64,
    pub late_events: u64,
    pub batches_flushed: u64,
    pub batches_persisted: u64,
    pub write_failures: u64,
    pub deliveries: u64,
    pub deliveries_skipped: u64,
    pub subscribers_evicted: u64,
    pub uptime_seconds: u64,
}

pub struct PipelineStats {
    events_ingested: AtomicU64,
    late_events: AtomicU64,
    batches_flushed: AtomicU64,
    batches_persisted: AtomicU64,
    write_failures: AtomicU64,
    deliveries: AtomicU64,
    deliveries_skipped: AtomicU64,
    subscribers_evicted: AtomicU64,
    recent_failures: Mutex<VecDeque<WriteFailure>>,
    start_time: Instant,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            events_ingested: AtomicU64::new(0),
            late_events: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            batches_persisted: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            deliveries_skipped: AtomicU64::new(0),
            subscribers_evicted: AtomicU64::new(0),
            recent_failures: Mutex::new(VecDeque::with_capacity(MAX_RECENT_FAILURES)),
            start_time: Instant::now(),
        }
    }

    pub fn record_ingested(&self) {
        self.events_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_event(&self) {
        self.late_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flushed(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self) {
        self.batches_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self, failure: WriteFailure) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        let mut recent = self.recent_failures.lock();
        if recent.len() == MAX_RECENT_FAILURES {
            recent.pop_front();
        }
        recent.push_back(failure);
    }

    pub fn record_broadcast(&self, report: &BroadcastReport) {
        self.deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.deliveries_skipped
            .fetch_add(report.skipped as u64, Ordering::Relaxed);
        self.subscribers_evicted
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
    }

    /// Most recent write failures, oldest first
    pub fn recent_failures(&self) -> Vec<WriteFailure> {
        self.recent_failures.lock().iter().cloned().collect()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            late_events: self.late_events.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_persisted: self.batches_persisted.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            deliveries_skipped: self.deliveries_skipped.load(Ordering::Relaxed),
            subscribers_evicted: self.subscribers_evicted.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}
