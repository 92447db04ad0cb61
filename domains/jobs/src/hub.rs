//! In-process pub/sub fanning job events to live subscribers
//!
//! Publishers must never be throttled by slow consumers: each subscriber gets
//! a bounded sink and `publish` drops events for sinks that are full. A
//! subscriber that dropped events recovers by replaying the store's event log
//! from its last-seen `seq`, so completeness comes from the log, never from
//! the hub.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::entities::JobEventRecord;

type SinkMap = HashMap<Uuid, HashMap<Uuid, mpsc::Sender<JobEventRecord>>>;

/// Per-job event fan-out
#[derive(Default)]
pub struct EventHub {
    subs: Arc<RwLock<SinkMap>>,
}

/// A live subscription; dropping it unsubscribes
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<JobEventRecord>,
    job_id: Uuid,
    subs: Arc<RwLock<SinkMap>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut subs = self.subs.write().unwrap();
        if let Some(job_subs) = subs.get_mut(&self.job_id) {
            job_subs.remove(&self.id);
            if job_subs.is_empty() {
                subs.remove(&self.job_id);
            }
        }
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a bounded sink for `job_id` with the given buffer depth
    pub fn subscribe(&self, job_id: Uuid, buffer: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = Uuid::new_v4();
        self.subs
            .write()
            .unwrap()
            .entry(job_id)
            .or_default()
            .insert(id, tx);
        Subscription {
            id,
            receiver: rx,
            job_id,
            subs: Arc::clone(&self.subs),
        }
    }

    /// Non-blocking fan-out: full or closed sinks are skipped silently
    pub fn publish(&self, job_id: Uuid, event: &JobEventRecord) {
        let subs = self.subs.read().unwrap();
        let Some(job_subs) = subs.get(&job_id) else {
            return;
        };
        for tx in job_subs.values() {
            let _ = tx.try_send(event.clone());
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.subs.read().unwrap().get(&job_id).map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::JobEventType;
    use chrono::Utc;

    fn record(job_id: Uuid, seq: i64) -> JobEventRecord {
        JobEventRecord {
            event_id: Uuid::new_v4(),
            seq,
            trace_id: "trace".to_string(),
            job_id,
            project_id: Uuid::new_v4(),
            event_type: JobEventType::JobProgress,
            ts: Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_events_in_order() {
        let hub = EventHub::new();
        let job_id = Uuid::new_v4();
        let mut sub = hub.subscribe(job_id, 8);

        for seq in 1..=3 {
            hub.publish(job_id, &record(job_id, seq));
        }
        for expected in 1..=3 {
            let evt = sub.receiver.recv().await.unwrap();
            assert_eq!(evt.seq, expected);
        }
    }

    #[tokio::test]
    async fn test_full_sink_drops_silently() {
        let hub = EventHub::new();
        let job_id = Uuid::new_v4();
        let mut sub = hub.subscribe(job_id, 2);

        for seq in 1..=5 {
            hub.publish(job_id, &record(job_id, seq));
        }
        // Only the first two fit; the rest were dropped for this sink.
        assert_eq!(sub.receiver.recv().await.unwrap().seq, 1);
        assert_eq!(sub.receiver.recv().await.unwrap().seq, 2);
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let hub = EventHub::new();
        let job_id = Uuid::new_v4();
        hub.publish(job_id, &record(job_id, 1));
        assert_eq!(hub.subscriber_count(job_id), 0);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub = EventHub::new();
        let job_id = Uuid::new_v4();
        let sub = hub.subscribe(job_id, 4);
        let other = hub.subscribe(job_id, 4);
        assert_eq!(hub.subscriber_count(job_id), 2);

        drop(sub);
        assert_eq!(hub.subscriber_count(job_id), 1);
        drop(other);
        assert_eq!(hub.subscriber_count(job_id), 0);
    }

    #[tokio::test]
    async fn test_subscribers_are_isolated_per_job() {
        let hub = EventHub::new();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();
        let mut sub_a = hub.subscribe(job_a, 4);
        let mut sub_b = hub.subscribe(job_b, 4);

        hub.publish(job_a, &record(job_a, 1));
        assert_eq!(sub_a.receiver.recv().await.unwrap().job_id, job_a);
        assert!(sub_b.receiver.try_recv().is_err());
    }
}
