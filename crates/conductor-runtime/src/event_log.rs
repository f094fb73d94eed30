//! Append-only run event log with bounded replay and live fan-out.
//!
//! Events are written inside the caller's transaction with [insert_event] and
//! handed to [EventLog::publish] only after that transaction committed, so a
//! subscriber never sees an event that was rolled back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use conductor_kernel::{Clock, EventCursor, EventRecord, KernelError, Page};

use crate::store::{dt_to_ms, from_json_text, ms_to_dt, to_json_text, SqliteStore};

pub const MAX_EVENT_PAGE: usize = 500;

/// Live stream of newly committed events of one run.
pub type EventSubscription = broadcast::Receiver<EventRecord>;

#[derive(Clone)]
pub struct EventLog {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<EventRecord>>>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(store: SqliteStore, clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            store,
            clock,
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Appends one event in its own transaction and publishes it.
    pub fn append(
        &self,
        run_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<EventRecord, KernelError> {
        let now = self.clock.now();
        let event = self
            .store
            .with_transaction(|tx| insert_event(tx, run_id, event_type, &payload, now))?;
        self.publish(std::slice::from_ref(&event));
        Ok(event)
    }

    /// Oldest-first page after `cursor`.
    pub fn replay(
        &self,
        run_id: &str,
        cursor: Option<&EventCursor>,
        limit: usize,
    ) -> Result<Page<EventRecord>, KernelError> {
        if limit == 0 || limit > MAX_EVENT_PAGE {
            return Err(KernelError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_EVENT_PAGE
            )));
        }
        let (after_ms, after_seq) = match cursor {
            Some(c) => {
                let seq = i64::try_from(c.sequence_id).map_err(|_| {
                    KernelError::Validation("invalid cursor: sequence id out of range".to_string())
                })?;
                (c.timestamp_ms, seq)
            }
            None => (i64::MIN, i64::MIN),
        };
        let conn = self.store.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT sequence_id, run_id, timestamp_ms, event_type, payload_json
                 FROM run_events
                 WHERE run_id = ?1
                   AND (timestamp_ms > ?2 OR (timestamp_ms = ?2 AND sequence_id > ?3))
                 ORDER BY timestamp_ms ASC, sequence_id ASC
                 LIMIT ?4",
            )
            .map_err(|e| KernelError::Storage(format!("prepare replay events: {}", e)))?;
        let rows = stmt
            .query_map(
                params![run_id, after_ms, after_seq, (limit + 1) as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .map_err(|e| KernelError::Storage(format!("query replay events: {}", e)))?;
        let mut items = Vec::new();
        for row in rows {
            let (seq, run_id, ts, event_type, payload) =
                row.map_err(|e| KernelError::Storage(format!("scan event row: {}", e)))?;
            items.push(EventRecord {
                sequence_id: seq as u64,
                run_id,
                timestamp: ms_to_dt(ts),
                event_type,
                payload: from_json_text(&payload, "event payload")?,
            });
        }
        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|last| {
                EventCursor {
                    timestamp_ms: dt_to_ms(last.timestamp),
                    sequence_id: last.sequence_id,
                }
                .encode()
            })
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    pub fn subscribe(&self, run_id: &str) -> Result<EventSubscription, KernelError> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| KernelError::Storage("event channels lock poisoned".to_string()))?;
        // Runs that went quiet never hit the prune in `publish`.
        channels.retain(|_, sender| sender.receiver_count() > 0);
        let sender = channels
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.subscribe())
    }

    /// Fans committed events out to subscribers. Never blocks and never fails:
    /// lagging receivers lose the oldest messages, closed channels are dropped.
    pub fn publish(&self, events: &[EventRecord]) {
        if events.is_empty() {
            return;
        }
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(_) => {
                warn!("event channels lock poisoned; skipping fan-out");
                return;
            }
        };
        for event in events {
            let Some(sender) = channels.get(&event.run_id) else {
                continue;
            };
            if sender.send(event.clone()).is_err() {
                debug!(run_id = %event.run_id, "no live subscribers; dropping channel");
                channels.remove(&event.run_id);
            }
        }
    }

    /// Number of runs with an open fan-out channel.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.channels
            .lock()
            .ok()
            .and_then(|c| c.get(run_id).map(|s| s.receiver_count()))
            .unwrap_or(0)
    }
}

/// Inserts one event. The timestamp is clamped so it never goes backwards
/// within a run; `sequence_id` comes from AUTOINCREMENT and is strictly
/// increasing across the whole log.
pub(crate) fn insert_event(
    conn: &Connection,
    run_id: &str,
    event_type: &str,
    payload: &Value,
    at: DateTime<Utc>,
) -> Result<EventRecord, KernelError> {
    let last_ms = conn
        .query_row(
            "SELECT MAX(timestamp_ms) FROM run_events WHERE run_id = ?1",
            params![run_id],
            |r| r.get::<_, Option<i64>>(0),
        )
        .map_err(|e| KernelError::Storage(format!("read last event time: {}", e)))?;
    let ts_ms = last_ms.map_or(dt_to_ms(at), |last| last.max(dt_to_ms(at)));
    conn.execute(
        "INSERT INTO run_events(run_id, timestamp_ms, event_type, payload_json)
         VALUES (?1, ?2, ?3, ?4)",
        params![run_id, ts_ms, event_type, to_json_text(payload, "event payload")?],
    )
    .map_err(|e| KernelError::Storage(format!("insert event: {}", e)))?;
    Ok(EventRecord {
        sequence_id: conn.last_insert_rowid() as u64,
        run_id: run_id.to_string(),
        timestamp: ms_to_dt(ts_ms),
        event_type: event_type.to_string(),
        payload: payload.clone(),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use conductor_kernel::{event_types, ManualClock};
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;

    fn log_with_clock() -> (EventLog, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = SqliteStore::open_in_memory().expect("open store");
        (EventLog::new(store, clock.clone(), 16), clock)
    }

    #[test]
    fn timestamps_never_go_backwards_within_a_run() {
        let (log, clock) = log_with_clock();
        let first = log.append("run-1", event_types::RUN_CREATED, json!({})).unwrap();
        clock.advance(Duration::seconds(-10));
        let second = log.append("run-1", event_types::RUN_STARTED, json!({})).unwrap();
        assert!(second.timestamp >= first.timestamp);
        assert!(second.sequence_id > first.sequence_id);

        // Another run is not clamped by run-1's history.
        let other = log.append("run-2", event_types::RUN_CREATED, json!({})).unwrap();
        assert!(other.timestamp < first.timestamp);
    }

    #[test]
    fn replay_pages_oldest_first() {
        let (log, clock) = log_with_clock();
        for i in 0..5 {
            log.append("run-1", "tick", json!({"i": i})).unwrap();
            clock.advance(Duration::milliseconds(1));
        }
        log.append("run-2", "tick", json!({})).unwrap();

        let first = log.replay("run-1", None, 2).unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].payload["i"], 0);
        let cursor = EventCursor::decode(first.next_cursor.as_deref().unwrap()).unwrap();

        let second = log.replay("run-1", Some(&cursor), 2).unwrap();
        assert_eq!(second.items[0].payload["i"], 2);
        let cursor = EventCursor::decode(second.next_cursor.as_deref().unwrap()).unwrap();

        let last = log.replay("run-1", Some(&cursor), 2).unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].payload["i"], 4);
        assert!(last.next_cursor.is_none());
    }

    #[test]
    fn replay_rejects_sequence_ids_beyond_storage_range() {
        let (log, _clock) = log_with_clock();
        let created = log.append("run-1", event_types::RUN_CREATED, json!({})).unwrap();
        let cursor = EventCursor {
            timestamp_ms: dt_to_ms(created.timestamp),
            sequence_id: u64::MAX,
        };
        assert!(matches!(
            log.replay("run-1", Some(&cursor), 10),
            Err(KernelError::Validation(_))
        ));
    }

    #[test]
    fn replay_rejects_out_of_range_limits() {
        let (log, _clock) = log_with_clock();
        assert!(log.replay("run-1", None, 0).is_err());
        assert!(log.replay("run-1", None, MAX_EVENT_PAGE + 1).is_err());
    }

    #[test]
    fn subscribers_receive_published_events() {
        let (log, _clock) = log_with_clock();
        let mut rx = log.subscribe("run-1").unwrap();
        assert_eq!(log.subscriber_count("run-1"), 1);
        let event = log.append("run-1", event_types::RUN_CREATED, json!({})).unwrap();
        assert_eq!(rx.try_recv().unwrap(), event);
        log.append("run-2", event_types::RUN_CREATED, json!({})).unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn dropped_subscribers_do_not_fail_appends() {
        let (log, _clock) = log_with_clock();
        let rx = log.subscribe("run-1").unwrap();
        drop(rx);
        log.append("run-1", event_types::RUN_CREATED, json!({})).unwrap();
        assert_eq!(log.subscriber_count("run-1"), 0);
    }

    #[test]
    fn abandoned_channels_are_pruned_on_next_subscribe() {
        let (log, _clock) = log_with_clock();
        for run in ["run-1", "run-2", "run-3"] {
            drop(log.subscribe(run).unwrap());
        }
        assert!(log.channel_count() <= 1);

        let _live = log.subscribe("run-4").unwrap();
        assert_eq!(log.channel_count(), 1);
        assert_eq!(log.subscriber_count("run-4"), 1);
    }

    #[test]
    fn lagging_subscriber_is_told_how_many_it_missed() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = SqliteStore::open_in_memory().expect("open store");
        let log = EventLog::new(store, clock, 2);
        let mut rx = log.subscribe("run-1").unwrap();
        for _ in 0..4 {
            log.append("run-1", "tick", json!({})).unwrap();
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(2))));
    }
}
