//! Market-data recorder.
//!
//! Producers (broker callbacks, replay feeders) push events into a bounded
//! queue; a dedicated writer drains it into the event log in batches of N
//! rows or every T seconds, whichever comes first. On overflow the queue
//! drops the OLDEST entry and bumps a counter instead of blocking the
//! producer callback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use twf_schemas::events::{
    KIND_BIDASK_FOP, KIND_SESSION_ERROR, KIND_SESSION_READY, KIND_SESSION_START,
    KIND_SESSION_STOP, KIND_SUBSCRIBE_OK, KIND_TICK_FOP,
};
use twf_schemas::{BookPayload, TickPayload};
use twf_store::{append_event, clock, NewEvent, StoreError};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RecorderConfig {
    /// Queue capacity; overflow drops oldest.
    pub queue_capacity: usize,
    /// Flush when this many rows are queued.
    pub batch_max_rows: usize,
    /// Flush at least this often regardless of queue depth.
    pub batch_max_delay: Duration,
    /// Producer tag stamped onto every event.
    pub producer: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_max_rows: 200,
            batch_max_delay: Duration::from_secs(2),
            producer: "recorder".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Bounded drop-oldest queue shared between producers and the writer.
#[derive(Debug)]
pub struct RecorderQueue {
    buf: Mutex<VecDeque<NewEvent>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl RecorderQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue one event. Never blocks; on overflow the oldest queued
    /// event is discarded and the drop counter incremented.
    pub fn push(&self, ev: NewEvent) {
        let mut buf = self.buf.lock().expect("recorder queue poisoned");
        if buf.len() >= self.capacity {
            buf.pop_front();
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n % 1000 == 1 {
                warn!(dropped_total = n, "recorder queue overflow, dropping oldest");
            }
        }
        buf.push_back(ev);
    }

    /// Take up to `max` queued events, oldest first.
    pub fn drain(&self, max: usize) -> Vec<NewEvent> {
        let mut buf = self.buf.lock().expect("recorder queue poisoned");
        let take = buf.len().min(max);
        buf.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().expect("recorder queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events discarded to overflow since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Owns the queue plus the writer side of the event log.
pub struct Recorder {
    pool: SqlitePool,
    queue: Arc<RecorderQueue>,
    cfg: RecorderConfig,
}

impl Recorder {
    pub fn new(pool: SqlitePool, cfg: RecorderConfig) -> Self {
        let queue = Arc::new(RecorderQueue::new(cfg.queue_capacity));
        Self { pool, queue, cfg }
    }

    /// Producer handle; cheap to clone across callback contexts.
    pub fn queue(&self) -> Arc<RecorderQueue> {
        Arc::clone(&self.queue)
    }

    /// Queue a book snapshot.
    pub fn record_book(&self, now: DateTime<Utc>, payload: &BookPayload) {
        self.queue.push(self.event_for(now, KIND_BIDASK_FOP, payload));
    }

    /// Queue a trade print.
    pub fn record_tick(&self, now: DateTime<Utc>, payload: &TickPayload) {
        self.queue.push(self.event_for(now, KIND_TICK_FOP, payload));
    }

    fn event_for<T: serde::Serialize>(&self, now: DateTime<Utc>, kind: &str, payload: &T) -> NewEvent {
        let ts = clock::now_iso(now);
        NewEvent {
            ts: ts.clone(),
            kind: kind.to_string(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            producer: self.cfg.producer.clone(),
            ingest_ts: ts,
        }
    }

    /// Write one lifecycle event immediately (not queued): `session_start`,
    /// `session_ready`, `subscribe_ok`, `session_stop`, `session_error`.
    pub async fn emit_lifecycle(
        &self,
        now: DateTime<Utc>,
        kind: &str,
        payload: Value,
    ) -> Result<i64> {
        debug_assert!(matches!(
            kind,
            KIND_SESSION_START
                | KIND_SESSION_READY
                | KIND_SUBSCRIBE_OK
                | KIND_SESSION_STOP
                | KIND_SESSION_ERROR
        ));
        let ts = clock::now_iso(now);
        let id = append_event(
            &self.pool,
            &NewEvent {
                ts: ts.clone(),
                kind: kind.to_string(),
                payload,
                producer: self.cfg.producer.clone(),
                ingest_ts: ts,
            },
        )
        .await?;
        Ok(id)
    }

    /// Drain one batch into the log inside a single transaction.
    /// Returns the number of rows written.
    pub async fn flush_once(&self) -> Result<usize> {
        let batch = self.queue.drain(self.cfg.batch_max_rows);
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::tx_failed("recorder batch begin"))?;
        for ev in &batch {
            append_event(&mut *tx, ev).await?;
        }
        tx.commit()
            .await
            .map_err(StoreError::tx_failed("recorder batch commit"))?;

        debug!(rows = batch.len(), "recorder batch committed");
        Ok(batch.len())
    }

    /// Writer loop: flush on the batch interval (or when the queue has a
    /// full batch) until `shutdown` flips true; then drain everything.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        let mut tick = tokio::time::interval(self.cfg.batch_max_delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.flush_once().await?;
                    // Catch up if producers are ahead of the timer.
                    while self.queue.len() >= self.cfg.batch_max_rows {
                        self.flush_once().await?;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        while self.flush_once().await? > 0 {}
                        return Ok(());
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use twf_store::{latest_event_by_kind, testkit_memory_pool};

    fn book(code: &str) -> BookPayload {
        BookPayload {
            code: code.into(),
            bid_price: vec![20000.0],
            ask_price: vec![20001.0],
            bid_volume: vec![1.0],
            ask_volume: vec![1.0],
            ..Default::default()
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let q = RecorderQueue::new(2);
        for i in 0..4 {
            q.push(NewEvent {
                ts: format!("t{i}"),
                kind: "tick_fop_v1".into(),
                payload: Value::Null,
                producer: "test".into(),
                ingest_ts: format!("t{i}"),
            });
        }
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped(), 2);
        let drained = q.drain(10);
        // The two newest survive.
        assert_eq!(drained[0].ts, "t2");
        assert_eq!(drained[1].ts, "t3");
    }

    #[tokio::test]
    async fn flush_writes_batch_atomically() {
        let pool = testkit_memory_pool().await.unwrap();
        let rec = Recorder::new(pool.clone(), RecorderConfig::default());
        let now = Utc::now();

        rec.record_book(now, &book("TMFB6"));
        rec.record_tick(
            now,
            &TickPayload {
                code: "TMFB6".into(),
                price: 20000.0,
                qty: 1.0,
                is_buy: true,
                datetime: None,
            },
        );

        let written = rec.flush_once().await.unwrap();
        assert_eq!(written, 2);
        assert!(rec.queue().is_empty());

        let hit = latest_event_by_kind(&pool, KIND_BIDASK_FOP, 100, |e| {
            e.payload["code"] == "TMFB6"
        })
        .await
        .unwrap();
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().producer, "recorder");
    }

    #[tokio::test]
    async fn lifecycle_events_are_immediate() {
        let pool = testkit_memory_pool().await.unwrap();
        let rec = Recorder::new(pool.clone(), RecorderConfig::default());
        rec.emit_lifecycle(Utc::now(), KIND_SESSION_START, serde_json::json!({"sim": true}))
            .await
            .unwrap();

        let hit = latest_event_by_kind(&pool, KIND_SESSION_START, 10, |_| true)
            .await
            .unwrap();
        assert!(hit.is_some());
    }
}
