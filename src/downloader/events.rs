use futures::Stream;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::Notify;
use crate::downloader::{JobId, JobProgress, JobState};

pub const DEFAULT_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum EventKind {
    StateChanged {
        state: JobState,
        error: Option<String>,
    },
    Progress(JobProgress),
    /// Raw output line from the external tool, or an orchestrator note.
    Log(String),
}

impl JobEvent {
    fn is_progress(&self) -> bool {
        matches!(self.kind, EventKind::Progress(_))
    }
}

/// Fan-out of job events to any number of subscribers.
///
/// Each subscriber owns a bounded queue. Publishing never waits on a subscriber:
/// when a queue is full the oldest progress event in it is discarded, while state
/// changes and log lines are always kept. Events of one job reach every subscriber
/// in the order they were published.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    capacity: usize,
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
}

struct SubscriberQueue {
    events: Mutex<VecDeque<JobEvent>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                capacity: capacity.max(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn publish(&self, job_id: &str, kind: EventKind) {
        let event = JobEvent {
            job_id: job_id.to_string(),
            kind,
        };

        // Held for the whole fan-out so concurrent publishers cannot interleave
        // differently for different subscribers.
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(event.clone(), self.inner.capacity);
                true
            }
            None => false,
        });
    }

    /// Events published from now on; nothing from before the call is replayed.
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        lock(&self.inner.subscribers).push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers)
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl Drop for SinkInner {
    fn drop(&mut self) {
        for weak in lock(&self.subscribers).drain(..) {
            if let Some(queue) = weak.upgrade() {
                queue.closed.store(true, Ordering::SeqCst);
                queue.notify.notify_one();
            }
        }
    }
}

impl SubscriberQueue {
    fn push(&self, event: JobEvent, capacity: usize) {
        let mut events = lock(&self.events);
        if events.len() >= capacity {
            if let Some(oldest) = events.iter().position(JobEvent::is_progress) {
                events.remove(oldest);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            } else if event.is_progress() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        events.push_back(event);
        drop(events);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<JobEvent> {
        lock(&self.events).pop_front()
    }
}

impl Subscription {
    /// Waits for the next event. Returns `None` only once the sink is gone and
    /// everything buffered has been read.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<JobEvent> {
        self.queue.pop()
    }

    /// Progress events discarded because this subscriber fell behind.
    pub fn dropped_progress(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn into_stream(self) -> impl Stream<Item = JobEvent> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|event| (event, subscription))
        })
    }
}

/// Mirrors job events into the `log` facade: lifecycle at info/error, raw tool
/// output at debug, progress at trace.
pub fn spawn_log_writer(sink: &EventSink) -> tokio::task::JoinHandle<()> {
    let mut subscription = sink.subscribe();
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            match event.kind {
                EventKind::StateChanged { state, error: Some(error) } => {
                    log::error!("[JOB {}] {}: {}", event.job_id, state, error);
                }
                EventKind::StateChanged { state, error: None } => {
                    log::info!("[JOB {}] {}", event.job_id, state);
                }
                EventKind::Log(line) => log::debug!("[JOB {}] {}", event.job_id, line),
                EventKind::Progress(progress) => {
                    log::trace!("[JOB {}] {:?} {:?}%", event.job_id, progress.phase, progress.percent);
                }
            }
        }
    })
}
