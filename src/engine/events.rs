// src/engine/events.rs - Lifecycle event stream and broadcast bus
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::engine::job::{HostResult, JobId, ScanJob};

/// Lifecycle and result events published by the scan manager. Snapshots are
/// owned copies; an event is never mutated after emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    JobQueued {
        job_id: JobId,
        target: String,
    },
    JobStarted {
        job_id: JobId,
    },
    HostDiscovered {
        job_id: JobId,
        host: HostResult,
    },
    JobProgress {
        job_id: JobId,
        percent: u8,
    },
    JobCompleted {
        job: ScanJob,
    },
    JobFailed {
        job_id: JobId,
        reason: String,
        exit_code: Option<i32>,
        /// Trailing output lines kept for diagnosis.
        diagnostics: Vec<String>,
    },
    JobCancelled {
        job_id: JobId,
    },
    /// A slow subscriber's queue overflowed; `dropped` non-terminal events
    /// were discarded for that subscriber. Non-fatal diagnostic.
    SubscriberOverflow {
        dropped: u64,
    },
}

impl ScanEvent {
    /// Terminal events close out a job and are never dropped by the bus.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanEvent::JobCompleted { .. }
                | ScanEvent::JobFailed { .. }
                | ScanEvent::JobCancelled { .. }
        )
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            ScanEvent::JobQueued { job_id, .. }
            | ScanEvent::JobStarted { job_id }
            | ScanEvent::HostDiscovered { job_id, .. }
            | ScanEvent::JobProgress { job_id, .. }
            | ScanEvent::JobFailed { job_id, .. }
            | ScanEvent::JobCancelled { job_id } => Some(*job_id),
            ScanEvent::JobCompleted { job } => Some(job.id),
            ScanEvent::SubscriberOverflow { .. } => None,
        }
    }
}

struct SubscriberQueue {
    events: VecDeque<ScanEvent>,
    dropped: u64,
    closed: bool,
}

struct SubscriberShared {
    queue: Mutex<SubscriberQueue>,
    notify: Notify,
}

/// Broadcast bus. Every subscriber receives every event published after its
/// subscription, through a bounded per-subscriber queue. Publication never
/// blocks: on overflow the oldest non-terminal event is dropped and later
/// surfaced as a `SubscriberOverflow` diagnostic.
pub struct EventBus {
    capacity: usize,
    subscribers: Mutex<Vec<Weak<SubscriberShared>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let shared = Arc::new(SubscriberShared {
            queue: Mutex::new(SubscriberQueue {
                events: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        });
        self.subscribers.lock().push(Arc::downgrade(&shared));
        Subscription { shared }
    }

    pub fn publish(&self, event: &ScanEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| match weak.upgrade() {
            Some(shared) => {
                self.push_to(&shared, event.clone());
                true
            }
            None => false,
        });
    }

    fn push_to(&self, shared: &SubscriberShared, event: ScanEvent) {
        {
            let mut queue = shared.queue.lock();
            if event.is_terminal() || queue.events.len() < self.capacity {
                // Terminal events may exceed the bound; they must arrive.
                queue.events.push_back(event);
            } else if let Some(pos) = queue.events.iter().position(|e| !e.is_terminal()) {
                queue.events.remove(pos);
                queue.events.push_back(event);
                queue.dropped += 1;
                debug!("Subscriber queue full, dropped oldest non-terminal event");
            } else {
                queue.dropped += 1;
                debug!("Subscriber queue full of terminal events, dropped incoming event");
            }
        }
        shared.notify.notify_one();
    }

    /// Mark the stream finished. Subscribers drain what is queued, then see
    /// end of stream.
    pub fn close(&self) {
        let subscribers = self.subscribers.lock();
        for weak in subscribers.iter() {
            if let Some(shared) = weak.upgrade() {
                shared.queue.lock().closed = true;
                shared.notify.notify_one();
            }
        }
    }
}

/// One subscriber's view of the event stream.
pub struct Subscription {
    shared: Arc<SubscriberShared>,
}

impl Subscription {
    /// Next event, or `None` once the bus is closed and drained. Overflow
    /// since the last receive is reported before further events.
    pub async fn recv(&mut self) -> Option<ScanEvent> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut queue = self.shared.queue.lock();
                if queue.dropped > 0 {
                    let dropped = queue.dropped;
                    queue.dropped = 0;
                    return Some(ScanEvent::SubscriberOverflow { dropped });
                }
                if let Some(event) = queue.events.pop_front() {
                    return Some(event);
                }
                if queue.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of `recv`.
    pub fn try_recv(&mut self) -> Option<ScanEvent> {
        let mut queue = self.shared.queue.lock();
        if queue.dropped > 0 {
            let dropped = queue.dropped;
            queue.dropped = 0;
            return Some(ScanEvent::SubscriberOverflow { dropped });
        }
        queue.events.pop_front()
    }
}
