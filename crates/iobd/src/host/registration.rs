//! Ordered admission of concurrent host registrations.
//!
//! Registrations for the same connection id run one at a time, in
//! ascending submission timestamp. Each request enqueues its
//! `(timestamp, sequence)` key and sleeps on the lane's [`Notify`] until it
//! holds the smallest key and nothing is in flight. Admission hands out a
//! [`RegistrationPermit`]; dropping it lets the next request in.
//!
//! ```text
//!   lane "host-1":  pending {(t1,#4), (t3,#5)}   in_flight: true
//!                        │
//!                        ▼  permit dropped → notify_waiters
//!   lane "host-1":  pending {(t3,#5)}            in_flight: true   (t1 admitted)
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use iob_core::ConnectionId;

use super::RegistrationError;

type QueueKey = (DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct Lane {
    pending: BTreeSet<QueueKey>,
    in_flight: bool,
    notify: Arc<Notify>,
}

impl Lane {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && !self.in_flight
    }
}

#[derive(Debug, Default)]
pub struct RegistrationQueue {
    lanes: Mutex<HashMap<ConnectionId, Lane>>,
    sequence: AtomicU64,
}

impl RegistrationQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Waits until the registration submitted at `submitted_at` may run.
    ///
    /// # Errors
    ///
    /// `RegistrationError::QueueTimeout` if not admitted within `wait`; the
    /// request is removed from the queue.
    pub async fn admit(
        self: &Arc<Self>,
        id: &ConnectionId,
        submitted_at: DateTime<Utc>,
        wait: Duration,
    ) -> Result<RegistrationPermit, RegistrationError> {
        let key = (submitted_at, self.sequence.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + wait;

        let notify = {
            let mut lanes = self.lanes.lock();
            let lane = lanes.entry(id.clone()).or_default();
            lane.pending.insert(key);
            Arc::clone(&lane.notify)
        };

        loop {
            // Created before the check so a wakeup in between is not lost.
            let notified = notify.notified();

            if self.try_take(id, &key) {
                debug!(connection_id = %id, "Registration admitted");
                return Ok(RegistrationPermit {
                    queue: Arc::clone(self),
                    id: id.clone(),
                });
            }

            if timeout_at(deadline, notified).await.is_err() {
                self.withdraw(id, &key);
                warn!(
                    connection_id = %id,
                    wait_secs = wait.as_secs(),
                    "Registration queue wait timed out"
                );
                return Err(RegistrationError::QueueTimeout {
                    connection_id: id.clone(),
                    waited: wait,
                });
            }
        }
    }

    /// Number of registrations waiting for `id`.
    pub fn pending(&self, id: &ConnectionId) -> usize {
        self.lanes
            .lock()
            .get(id)
            .map(|lane| lane.pending.len())
            .unwrap_or(0)
    }

    fn try_take(&self, id: &ConnectionId, key: &QueueKey) -> bool {
        let mut lanes = self.lanes.lock();
        let Some(lane) = lanes.get_mut(id) else {
            return false;
        };

        if lane.in_flight || lane.pending.first() != Some(key) {
            return false;
        }

        lane.pending.remove(key);
        lane.in_flight = true;
        true
    }

    fn withdraw(&self, id: &ConnectionId, key: &QueueKey) {
        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get_mut(id) {
            lane.pending.remove(key);
            // The head may have changed.
            lane.notify.notify_waiters();
            if lane.is_idle() {
                lanes.remove(id);
            }
        }
    }

    fn release(&self, id: &ConnectionId) {
        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get_mut(id) {
            lane.in_flight = false;
            lane.notify.notify_waiters();
            if lane.is_idle() {
                lanes.remove(id);
            }
        }
    }
}

/// Exclusive right to register one connection id.
#[derive(Debug)]
pub struct RegistrationPermit {
    queue: Arc<RegistrationQueue>,
    id: ConnectionId,
}

impl Drop for RegistrationPermit {
    fn drop(&mut self) {
        self.queue.release(&self.id);
        debug!(connection_id = %self.id, "Registration released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    fn at(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(offset_ms).unwrap()
    }

    #[tokio::test]
    async fn test_uncontended_admission() {
        let queue = RegistrationQueue::new();
        let id = ConnectionId::new("host-1");

        let permit = queue.admit(&id, at(0), Duration::from_secs(1)).await.unwrap();
        assert_eq!(queue.pending(&id), 0);
        drop(permit);

        // Lane is cleaned up and reusable.
        assert!(queue.lanes.lock().is_empty());
        queue.admit(&id, at(1), Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_admitted_in_timestamp_order_not_arrival_order() {
        let queue = RegistrationQueue::new();
        let id = ConnectionId::new("host-1");
        let first = queue.admit(&id, at(10), Duration::from_secs(5)).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        // Arrives first but was submitted later.
        for (waiting, (name, ts)) in [("late", 30), ("early", 20)].into_iter().enumerate() {
            let lane = Arc::clone(&queue);
            let host = id.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _permit = lane.admit(&host, at(ts), Duration::from_secs(5)).await.unwrap();
                tx.send(name).unwrap();
                tokio::task::yield_now().await;
            });
            while queue.pending(&id) <= waiting {
                tokio::task::yield_now().await;
            }
        }

        drop(first);
        assert_eq!(rx.recv().await, Some("early"));
        assert_eq!(rx.recv().await, Some("late"));
    }

    #[tokio::test]
    async fn test_never_two_in_flight() {
        let queue = RegistrationQueue::new();
        let id = ConnectionId::new("host-1");
        let active = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::new();
        for ts in 0..8 {
            let queue = Arc::clone(&queue);
            let id = id.clone();
            let active = Arc::clone(&active);
            tasks.push(tokio::spawn(async move {
                let _permit = queue.admit(&id, at(ts), Duration::from_secs(5)).await.unwrap();
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_withdraws_request() {
        let queue = RegistrationQueue::new();
        let id = ConnectionId::new("host-1");
        let _held = queue.admit(&id, at(0), Duration::from_secs(1)).await.unwrap();

        let err = queue
            .admit(&id, at(1), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::QueueTimeout { .. }));
        assert_eq!(queue.pending(&id), 0);
    }

    #[tokio::test]
    async fn test_lanes_are_independent() {
        let queue = RegistrationQueue::new();
        let _a = queue
            .admit(&ConnectionId::new("a"), at(0), Duration::from_secs(1))
            .await
            .unwrap();
        let _b = queue
            .admit(&ConnectionId::new("b"), at(0), Duration::from_secs(1))
            .await
            .unwrap();
    }
}
