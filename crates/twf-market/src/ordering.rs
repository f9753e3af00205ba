//! Total ordering for replayed events.
//!
//! Recorder files interleave streams with mixed clocks; replay needs one
//! stable order. The sort key is `(event_ts_epoch, seq_like_id, kind,
//! line_no)`: a missing timestamp contributes zero, a missing sequence
//! contributes the line number, so the key is total over any input and
//! replaying the same log always yields the same order.

use serde_json::Value;

use twf_store::clock;

// ---------------------------------------------------------------------------
// ReplayEvent
// ---------------------------------------------------------------------------

/// One line of a replayed log, reduced to what ordering needs.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplayEvent {
    pub ts: Option<String>,
    pub seq: Option<i64>,
    pub kind: String,
    /// 1-based position in the source file.
    pub line_no: i64,
    pub payload: Value,
}

impl ReplayEvent {
    /// Build from a parsed JSONL object; `ts`/`seq`/`kind` are read from
    /// the usual field names when present.
    pub fn from_json(line_no: i64, obj: &Value) -> Self {
        Self {
            ts: obj
                .get("ts")
                .or_else(|| obj.get("event_ts"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            seq: obj
                .get("seq")
                .or_else(|| obj.get("id"))
                .and_then(|v| v.as_i64()),
            kind: obj
                .get("kind")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            line_no,
            payload: obj.clone(),
        }
    }

    /// Total, stable sort key.
    pub fn sort_key(&self) -> (i64, i64, String, i64) {
        let ts_epoch = self
            .ts
            .as_deref()
            .and_then(clock::parse_ts_flexible)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0);
        let seq = self.seq.unwrap_or(self.line_no);
        (ts_epoch, seq, self.kind.clone(), self.line_no)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Drift diagnostics surfaced by the replay report.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplayReport {
    pub total: usize,
    pub missing_ts: usize,
    pub missing_seq: usize,
}

impl ReplayReport {
    pub fn missing_ts_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.missing_ts as f64 / self.total as f64
        }
    }

    pub fn missing_seq_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.missing_seq as f64 / self.total as f64
        }
    }
}

/// Sort events by the total key and report drift.
pub fn order_events(mut events: Vec<ReplayEvent>) -> (Vec<ReplayEvent>, ReplayReport) {
    let report = ReplayReport {
        total: events.len(),
        missing_ts: events
            .iter()
            .filter(|e| e.ts.as_deref().and_then(clock::parse_ts_flexible).is_none())
            .count(),
        missing_seq: events.iter().filter(|e| e.seq.is_none()).count(),
    };
    events.sort_by_key(|e| e.sort_key());
    (events, report)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(line_no: i64, ts: Option<&str>, seq: Option<i64>, kind: &str) -> ReplayEvent {
        ReplayEvent {
            ts: ts.map(str::to_string),
            seq,
            kind: kind.into(),
            line_no,
            payload: Value::Null,
        }
    }

    #[test]
    fn orders_by_ts_then_seq_then_kind_then_line() {
        let events = vec![
            ev(1, Some("2026-01-29T10:00:02+08:00"), Some(5), "tick_fop_v1"),
            ev(2, Some("2026-01-29T10:00:01+08:00"), Some(9), "tick_fop_v1"),
            ev(3, Some("2026-01-29T10:00:01+08:00"), Some(3), "tick_fop_v1"),
            ev(4, Some("2026-01-29T10:00:01+08:00"), Some(3), "bidask_fop_v1"),
        ];
        let (sorted, _) = order_events(events);
        let lines: Vec<i64> = sorted.iter().map(|e| e.line_no).collect();
        // Same ts+seq: "bidask_fop_v1" < "tick_fop_v1" lexicographically.
        assert_eq!(lines, vec![4, 3, 2, 1]);
    }

    #[test]
    fn missing_parts_contribute_zero_and_line_no() {
        let events = vec![
            ev(7, None, None, "tick_fop_v1"),
            ev(2, None, None, "tick_fop_v1"),
            ev(1, Some("2026-01-29T10:00:01+08:00"), Some(1), "tick_fop_v1"),
        ];
        let (sorted, report) = order_events(events);
        // Missing ts sorts before any real ts (epoch 0); among those, the
        // line number stands in for seq.
        assert_eq!(sorted[0].line_no, 2);
        assert_eq!(sorted[1].line_no, 7);
        assert_eq!(sorted[2].line_no, 1);
        assert_eq!(report.missing_ts, 2);
        assert_eq!(report.missing_seq, 2);
        assert!((report.missing_ts_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn replay_is_stable_across_runs() {
        let make = || {
            vec![
                ev(1, Some("2026-01-29T10:00:02+08:00"), None, "b"),
                ev(2, Some("2026-01-29T10:00:02+08:00"), None, "a"),
                ev(3, None, Some(1), "c"),
            ]
        };
        let (a, _) = order_events(make());
        let (b, _) = order_events(make());
        assert_eq!(a, b);
    }

    #[test]
    fn from_json_reads_common_fields() {
        let e = ReplayEvent::from_json(
            12,
            &json!({"ts": "2026-01-29T10:00:00+08:00", "id": 42, "kind": "tick_fop_v1"}),
        );
        assert_eq!(e.seq, Some(42));
        assert_eq!(e.kind, "tick_fop_v1");
        assert_eq!(e.line_no, 12);
    }
}
