//! Fan-out of published samples to stream subscribers.
//!
//! Every subscriber owns a bounded queue. Publishing never waits: a full queue
//! loses its oldest sample, and a subscriber that keeps overflowing without
//! draining is evicted. Queues are only touched through this module.

use crate::sample::Sample;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

pub type SubscriberId = u64;

pub const DEFAULT_STREAM_BUFFER: usize = 64;
pub const DEFAULT_STALL_LIMIT: u32 = 256;

/// What a subscriber reads off its queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamItem {
    Sample(Sample),
    /// Number of samples discarded for this subscriber since its last read.
    Dropped(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecv {
    Empty,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    pub connected_at: DateTime<Utc>,
    pub queued: usize,
    pub dropped_total: u64,
}

/// Per-publish accounting, mostly for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub overflowed: usize,
    pub evicted: usize,
}

// Internal overflow handling outcome; never surfaced to callers as an error.
enum PushOutcome {
    Queued,
    Overflowed,
    Evicted,
    Closed,
}

#[derive(Default)]
struct SubscriberQueue {
    buf: VecDeque<Sample>,
    dropped_pending: u64,
    dropped_total: u64,
    overflows_since_drain: u32,
    closed: bool,
}

struct SubscriberSlot {
    id: SubscriberId,
    connected_at: DateTime<Utc>,
    queue: Mutex<SubscriberQueue>,
    notify: Notify,
}

impl SubscriberSlot {
    fn queue(&self) -> MutexGuard<'_, SubscriberQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, sample: &Sample, capacity: usize, stall_limit: u32) -> PushOutcome {
        let outcome = {
            let mut q = self.queue();
            if q.closed {
                return PushOutcome::Closed;
            }
            let mut outcome = PushOutcome::Queued;
            if q.buf.len() >= capacity {
                q.buf.pop_front();
                q.dropped_pending += 1;
                q.dropped_total += 1;
                q.overflows_since_drain += 1;
                outcome = PushOutcome::Overflowed;
                if q.overflows_since_drain >= stall_limit {
                    q.closed = true;
                    q.buf.clear();
                    outcome = PushOutcome::Evicted;
                }
            }
            if !q.closed {
                q.buf.push_back(*sample);
            }
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    fn close(&self) {
        self.queue().closed = true;
        self.notify.notify_one();
    }
}

struct BroadcasterInner {
    next_id: AtomicU64,
    capacity: usize,
    stall_limit: u32,
    closed: AtomicBool,
    evicted_total: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, Arc<SubscriberSlot>>>,
}

impl BroadcasterInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<SubscriberId, Arc<SubscriberSlot>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct StreamBroadcaster {
    inner: Arc<BroadcasterInner>,
}

impl Default for StreamBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BUFFER, DEFAULT_STALL_LIMIT)
    }
}

impl StreamBroadcaster {
    /// `capacity` is the per-subscriber queue length; `stall_limit` the number of
    /// overflows a subscriber may accumulate without reading before eviction.
    pub fn new(capacity: usize, stall_limit: u32) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                stall_limit: stall_limit.max(1),
                closed: AtomicBool::new(false),
                evicted_total: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(SubscriberSlot {
            id,
            connected_at: Utc::now(),
            queue: Mutex::new(SubscriberQueue::default()),
            notify: Notify::new(),
        });
        {
            let mut registry = self.inner.registry();
            // Checked under the registry lock so close_all cannot miss this slot.
            if self.inner.closed.load(Ordering::Acquire) {
                slot.close();
            } else {
                registry.insert(id, Arc::clone(&slot));
            }
        }
        debug!("Stream subscriber {} connected", id);
        Subscription {
            slot,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Queue `sample` for every subscriber without blocking on any of them.
    pub fn publish(&self, sample: &Sample) -> PublishReport {
        let mut report = PublishReport::default();
        let mut registry = self.inner.registry();
        registry.retain(|id, slot| {
            match slot.push(sample, self.inner.capacity, self.inner.stall_limit) {
                PushOutcome::Queued => {
                    report.delivered += 1;
                    true
                }
                PushOutcome::Overflowed => {
                    report.delivered += 1;
                    report.overflowed += 1;
                    true
                }
                PushOutcome::Evicted => {
                    info!("Evicting stalled stream subscriber {}", id);
                    report.evicted += 1;
                    false
                }
                PushOutcome::Closed => false,
            }
        });
        drop(registry);
        if report.evicted > 0 {
            self.inner
                .evicted_total
                .fetch_add(report.evicted as u64, Ordering::Relaxed);
        }
        report
    }

    /// Close every subscriber and refuse new ones.
    pub fn close_all(&self) {
        let slots: Vec<_> = {
            let mut registry = self.inner.registry();
            self.inner.closed.store(true, Ordering::Release);
            registry.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &slots {
            slot.close();
        }
        if !slots.is_empty() {
            info!("Closed {} stream subscriber(s)", slots.len());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry().len()
    }

    pub fn evicted_total(&self) -> u64 {
        self.inner.evicted_total.load(Ordering::Relaxed)
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        let slots: Vec<_> = self.inner.registry().values().cloned().collect();
        let mut infos: Vec<_> = slots
            .iter()
            .map(|slot| {
                let q = slot.queue();
                SubscriberInfo {
                    id: slot.id,
                    connected_at: slot.connected_at,
                    queued: q.buf.len(),
                    dropped_total: q.dropped_total,
                }
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

/// Receiving end of one subscriber. Dropping it deregisters the subscriber.
pub struct Subscription {
    slot: Arc<SubscriberSlot>,
    inner: Arc<BroadcasterInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.slot.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.slot.connected_at
    }

    pub fn try_recv(&mut self) -> Result<StreamItem, TryRecv> {
        let mut q = self.slot.queue();
        if q.dropped_pending > 0 {
            let dropped = std::mem::take(&mut q.dropped_pending);
            return Ok(StreamItem::Dropped(dropped));
        }
        if let Some(sample) = q.buf.pop_front() {
            q.overflows_since_drain = 0;
            return Ok(StreamItem::Sample(sample));
        }
        if q.closed {
            Err(TryRecv::Closed)
        } else {
            Err(TryRecv::Empty)
        }
    }

    /// Wait for the next item. `None` once the subscriber has been closed and drained.
    pub async fn recv(&mut self) -> Option<StreamItem> {
        loop {
            match self.try_recv() {
                Ok(item) => return Some(item),
                Err(TryRecv::Closed) => return None,
                Err(TryRecv::Empty) => self.slot.notify.notified().await,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.inner.registry().remove(&self.slot.id).is_some() {
            debug!("Stream subscriber {} disconnected", self.slot.id);
        }
    }
}
