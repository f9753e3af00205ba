//! Append-only event log.
//!
//! `events.id` is the monotone identity (AUTOINCREMENT); payloads are
//! immutable after insert. Scans run newest-first with a caller-supplied
//! payload predicate, bounded by `scan_limit`.

use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::StoreError;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub ts: String,
    pub kind: String,
    pub payload: Value,
    pub producer: String,
    pub ingest_ts: String,
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub ts: String,
    pub kind: String,
    pub payload: Value,
    pub producer: String,
    pub ingest_ts: String,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Append one event; returns the assigned id (strictly increasing).
pub async fn append_event<'e, E>(ex: E, ev: &NewEvent) -> Result<i64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let payload_json = serde_json::to_string(&ev.payload).unwrap_or_else(|_| "{}".to_string());

    let res = sqlx::query(
        r#"
        insert into events (ts, kind, payload_json, producer, ingest_ts)
        values (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&ev.ts)
    .bind(&ev.kind)
    .bind(payload_json)
    .bind(&ev.producer)
    .bind(&ev.ingest_ts)
    .execute(ex)
    .await
    .map_err(StoreError::unavailable("append_event"))?;

    Ok(res.last_insert_rowid())
}

/// Newest-first scan for `kind`, returning the first row that satisfies
/// `pred`. Rows with unparsable payloads are skipped (they can never
/// satisfy a payload predicate); ingestion counts those separately.
///
/// Ordering is deterministic: primary key descending; ids never tie.
pub async fn latest_event_by_kind<F>(
    pool: &SqlitePool,
    kind: &str,
    scan_limit: i64,
    pred: F,
) -> Result<Option<EventRow>, StoreError>
where
    F: Fn(&EventRow) -> bool,
{
    let rows = sqlx::query(
        r#"
        select id, ts, kind, payload_json, producer, ingest_ts
        from events
        where kind = ?1
        order by id desc
        limit ?2
        "#,
    )
    .bind(kind)
    .bind(scan_limit)
    .fetch_all(pool)
    .await
    .map_err(StoreError::unavailable("latest_event_by_kind scan"))?;

    for row in rows {
        let payload_json: String = row
            .try_get("payload_json")
            .map_err(StoreError::unavailable("latest_event_by_kind payload col"))?;
        let payload: Value = match serde_json::from_str(&payload_json) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let candidate = EventRow {
            id: row
                .try_get("id")
                .map_err(StoreError::unavailable("latest_event_by_kind id col"))?,
            ts: row
                .try_get("ts")
                .map_err(StoreError::unavailable("latest_event_by_kind ts col"))?,
            kind: row
                .try_get("kind")
                .map_err(StoreError::unavailable("latest_event_by_kind kind col"))?,
            payload,
            producer: row
                .try_get("producer")
                .map_err(StoreError::unavailable("latest_event_by_kind producer col"))?,
            ingest_ts: row
                .try_get("ingest_ts")
                .map_err(StoreError::unavailable("latest_event_by_kind ingest col"))?,
        };
        if pred(&candidate) {
            return Ok(Some(candidate));
        }
    }

    Ok(None)
}

/// All events of one kind, oldest-first (bar builder, replay).
pub async fn list_events_by_kinds(
    pool: &SqlitePool,
    kinds: &[&str],
) -> Result<Vec<EventRow>, StoreError> {
    if kinds.is_empty() {
        return Ok(Vec::new());
    }

    // Small fixed kind sets only; build the placeholder list by hand.
    let placeholders = (1..=kinds.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "select id, ts, kind, payload_json, producer, ingest_ts \
         from events where kind in ({placeholders}) order by id asc"
    );

    let mut q = sqlx::query(&sql);
    for k in kinds {
        q = q.bind(*k);
    }

    let rows = q
        .fetch_all(pool)
        .await
        .map_err(StoreError::unavailable("list_events_by_kinds"))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let payload_json: String = row
            .try_get("payload_json")
            .map_err(StoreError::unavailable("list_events_by_kinds payload col"))?;
        let payload = serde_json::from_str(&payload_json)
            .unwrap_or_else(|_| Value::String(payload_json.clone()));
        out.push(EventRow {
            id: row
                .try_get("id")
                .map_err(StoreError::unavailable("list_events_by_kinds id col"))?,
            ts: row
                .try_get("ts")
                .map_err(StoreError::unavailable("list_events_by_kinds ts col"))?,
            kind: row
                .try_get("kind")
                .map_err(StoreError::unavailable("list_events_by_kinds kind col"))?,
            payload,
            producer: row
                .try_get("producer")
                .map_err(StoreError::unavailable("list_events_by_kinds producer col"))?,
            ingest_ts: row
                .try_get("ingest_ts")
                .map_err(StoreError::unavailable("list_events_by_kinds ingest col"))?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit_memory_pool;
    use serde_json::json;

    fn ev(kind: &str, payload: Value) -> NewEvent {
        NewEvent {
            ts: "2026-01-29T10:00:00+08:00".into(),
            kind: kind.into(),
            payload,
            producer: "test".into(),
            ingest_ts: "2026-01-29T10:00:00+08:00".into(),
        }
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let pool = testkit_memory_pool().await.unwrap();
        let a = append_event(&pool, &ev("tick_fop_v1", json!({"code": "TMFB6"})))
            .await
            .unwrap();
        let b = append_event(&pool, &ev("tick_fop_v1", json!({"code": "TMFB6"})))
            .await
            .unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn latest_scan_matches_newest_first() {
        let pool = testkit_memory_pool().await.unwrap();
        append_event(&pool, &ev("bidask_fop_v1", json!({"code": "TMFB6", "seq": 1})))
            .await
            .unwrap();
        append_event(&pool, &ev("bidask_fop_v1", json!({"code": "TXFA6", "seq": 2})))
            .await
            .unwrap();
        append_event(&pool, &ev("bidask_fop_v1", json!({"code": "TMFB6", "seq": 3})))
            .await
            .unwrap();

        let hit = latest_event_by_kind(&pool, "bidask_fop_v1", 2000, |e| {
            e.payload.get("code").and_then(|c| c.as_str()) == Some("TMFB6")
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(hit.payload["seq"], 3);
    }

    #[tokio::test]
    async fn predicate_can_exclude_synthetic() {
        let pool = testkit_memory_pool().await.unwrap();
        append_event(
            &pool,
            &ev("bidask_fop_v1", json!({"code": "TMFB6", "synthetic": false, "tag": "real"})),
        )
        .await
        .unwrap();
        append_event(
            &pool,
            &ev("bidask_fop_v1", json!({"code": "TMFB6", "synthetic": true, "tag": "seed"})),
        )
        .await
        .unwrap();

        let hit = latest_event_by_kind(&pool, "bidask_fop_v1", 2000, |e| {
            e.payload["code"] == "TMFB6" && e.payload["synthetic"] != true
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(hit.payload["tag"], "real");
    }

    #[tokio::test]
    async fn scan_limit_bounds_the_window() {
        let pool = testkit_memory_pool().await.unwrap();
        append_event(&pool, &ev("bidask_fop_v1", json!({"code": "OLD"})))
            .await
            .unwrap();
        for _ in 0..5 {
            append_event(&pool, &ev("bidask_fop_v1", json!({"code": "NEW"})))
                .await
                .unwrap();
        }
        // OLD is 6 rows deep; a window of 5 must not find it.
        let hit = latest_event_by_kind(&pool, "bidask_fop_v1", 5, |e| e.payload["code"] == "OLD")
            .await
            .unwrap();
        assert!(hit.is_none());
    }
}
