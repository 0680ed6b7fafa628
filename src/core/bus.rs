//! Notification bus (component G).
//!
//! Single-producer-per-task, multi-consumer fan-out of [`Event`]. A
//! subscriber registers with an optional task-id filter and receives a
//! bounded `mpsc` channel; if that channel fills, events for it are
//! dropped and exactly one `SubscriberLagged` event is emitted per lag
//! episode. Per-task event ordering is preserved because every producer
//! (the PTY executor, the pattern scanner, the intervention controller)
//! publishes through the same `&Bus` in call order, and delivery to each
//! subscriber is a simple `try_send`.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::core::task::TaskState;

const SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone)]
pub enum Event {
    OutputChunk {
        task_id: String,
        bytes: Vec<u8>,
        ts: DateTime<Utc>,
    },
    PatternHit {
        task_id: String,
        rule_id: String,
        matched_text: String,
        ts: DateTime<Utc>,
    },
    InterventionDelivered {
        task_id: String,
        rule_id: String,
        payload: String,
        ts: DateTime<Utc>,
    },
    StateChange {
        task_id: String,
        old: TaskState,
        new: TaskState,
        ts: DateTime<Utc>,
        exit_code: Option<i32>,
        /// Short annotation for a same-state or terminal transition that
        /// isn't a plain exit, e.g. `quota_exhausted`, `backpressure_timeout`.
        /// Absent for an ordinary transition.
        reason: Option<String>,
    },
    /// Not part of the core event set the client subscribes to; emitted
    /// for a lagging subscriber so the drop is visible rather than silent.
    SubscriberLagged {
        subscriber_id: u64,
        ts: DateTime<Utc>,
    },
}

impl Event {
    /// The task this event is about, if any (`SubscriberLagged` is bus-wide).
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::OutputChunk { task_id, .. }
            | Event::PatternHit { task_id, .. }
            | Event::InterventionDelivered { task_id, .. }
            | Event::StateChange { task_id, .. } => Some(task_id),
            Event::SubscriberLagged { .. } => None,
        }
    }
}

struct Subscriber {
    id: u64,
    task_filter: Option<String>,
    sender: mpsc::Sender<Event>,
    /// Set once per lag episode so repeated full-queue drops emit only
    /// one `SubscriberLagged` event.
    lagging: bool,
}

/// Process-wide but never global-mutable: owned by the supervisor
/// context and passed explicitly rather than reached through a
/// module-level static, so tests can spin up independent instances.
pub struct Bus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber_id: std::sync::atomic::AtomicU64,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Registers a new subscriber, optionally filtered to one task id.
    /// Returns the receiving half; dropping it is a first-class signal —
    /// the next publish that notices the channel is closed GCs the
    /// registration.
    pub fn subscribe(&self, task_filter: Option<String>) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = self
            .next_subscriber_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.lock().unwrap().push(Subscriber {
            id,
            task_filter,
            sender: tx,
            lagging: false,
        });
        rx
    }

    /// Publishes an event to every subscriber whose filter matches.
    /// Never blocks the producer: a full subscriber queue drops the
    /// event instead.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        let event_task = event.task_id();

        subscribers.retain_mut(|sub| {
            if let Some(filter) = &sub.task_filter {
                if event_task != Some(filter.as_str()) {
                    return true; // Not for this subscriber; keep it.
                }
            }

            // Reserve the channel's last permit exclusively for a lag
            // marker, so "full" never means the lag announcement itself
            // gets silently dropped alongside the events it's reporting.
            if sub.sender.capacity() <= 1 {
                if !sub.lagging {
                    sub.lagging = true;
                    let _ = sub.sender.try_send(Event::SubscriberLagged {
                        subscriber_id: sub.id,
                        ts: Utc::now(),
                    });
                }
                return !sub.sender.is_closed();
            }

            match sub.sender.try_send(event.clone()) {
                Ok(()) => {
                    sub.lagging = false;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false, // GC this subscriber.
            }
        });
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_filtered_events() {
        let bus = Bus::new();
        let mut rx_a = bus.subscribe(Some("task-a".to_string()));
        let mut rx_all = bus.subscribe(None);

        bus.publish(Event::PatternHit {
            task_id: "task-a".to_string(),
            rule_id: "todo-marker".to_string(),
            matched_text: "TODO".to_string(),
            ts: Utc::now(),
        });
        bus.publish(Event::PatternHit {
            task_id: "task-b".to_string(),
            rule_id: "todo-marker".to_string(),
            matched_text: "TODO".to_string(),
            ts: Utc::now(),
        });

        let first = rx_a.try_recv().unwrap();
        assert_eq!(first.task_id(), Some("task-a"));
        assert!(rx_a.try_recv().is_err(), "filtered subscriber must not see task-b");

        assert!(rx_all.try_recv().is_ok());
        assert!(rx_all.try_recv().is_ok(), "unfiltered subscriber sees both");
    }

    #[tokio::test]
    async fn closed_receiver_is_garbage_collected() {
        let bus = Bus::new();
        let rx = bus.subscribe(None);
        drop(rx);

        bus.publish(Event::SubscriberLagged {
            subscriber_id: 0,
            ts: Utc::now(),
        });

        assert_eq!(bus.subscribers.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn full_queue_emits_one_lag_event() {
        let bus = Bus::new();
        let mut rx = bus.subscribe(None);

        for _ in 0..(SUBSCRIBER_QUEUE_DEPTH + 5) {
            bus.publish(Event::StateChange {
                task_id: "t".to_string(),
                old: TaskState::Running,
                new: TaskState::Running,
                ts: Utc::now(),
                exit_code: None,
                reason: None,
            });
        }

        let mut lag_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::SubscriberLagged { .. }) {
                lag_events += 1;
            }
        }
        assert_eq!(lag_events, 1, "exactly one lag episode should be announced");
    }
}
