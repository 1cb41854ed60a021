use super::error::BufferError;
use super::item::{Item, ItemBatch};
use super::metrics::{BufferMetrics, DROP_REASON_AGE};
use parking_lot::Mutex;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// A buffered item plus the bookkeeping the buffer stamps on insertion.
/// The sequence number breaks priority ties so equal-priority items leave
/// in insertion order.
struct Entry {
    item: Item,
    inserted_at: Instant,
    seq: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.item
            .priority()
            .cmp(&other.item.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Entry {}

struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Concurrency-safe holding area for telemetry items, ordered by
/// (priority, insertion time). Removal always yields the highest-priority
/// prefix; within one priority class, oldest first.
///
/// A non-zero `max_age` enables lazy eviction: items older than the limit
/// are discarded on access and counted as drops, never delivered.
pub struct PriorityBuffer {
    inner: Mutex<Inner>,
    len: AtomicUsize,
    max_age: Duration,
    metrics: BufferMetrics,
}

impl PriorityBuffer {
    pub fn new(max_age: Duration) -> Result<Self, prometheus::Error> {
        Ok(Self::with_metrics(max_age, BufferMetrics::new()?))
    }

    pub fn with_metrics(max_age: Duration, metrics: BufferMetrics) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            len: AtomicUsize::new(0),
            max_age,
            metrics,
        }
    }

    pub fn metrics(&self) -> &BufferMetrics {
        &self.metrics
    }

    /// Appends all supplied items, or none on a fault. An empty batch is
    /// rejected as invalid. Expired entries at the top of the store are
    /// evicted opportunistically while the lock is held.
    pub fn insert<I>(&self, items: I) -> Result<(), BufferError>
    where
        I: IntoIterator<Item = Item>,
    {
        let timer = self.metrics.insert_timer();
        let items: Vec<Item> = items.into_iter().collect();
        if items.is_empty() {
            timer.stop_and_discard();
            return Err(BufferError::EmptyBatch);
        }

        let mut inner = self.inner.lock();
        let evicted = self.evict_expired_top(&mut inner);

        let added = items.len();
        let now = Instant::now();
        for item in items {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Entry {
                item,
                inserted_at: now,
                seq,
            });
        }

        // Mirror updated under the lock so len() stays consistent with the heap.
        self.len.fetch_add(added, Ordering::Release);
        if evicted > 0 {
            self.len.fetch_sub(evicted, Ordering::Release);
            self.metrics.inc_drops(DROP_REASON_AGE, evicted as u64);
        }
        drop(inner);

        drop(timer);
        Ok(())
    }

    /// Exact count of items currently held. Safe to call concurrently with
    /// `insert` and `drain`.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-destructive view of the up-to-`max` highest-priority live items,
    /// in removal order. Expired entries are skipped but left in place for
    /// `drain` to account for.
    pub fn get(&self, max: usize) -> ItemBatch {
        let timer = self.metrics.get_timer();
        let inner = self.inner.lock();

        let mut candidates: BinaryHeap<&Entry> = inner.heap.iter().collect();
        let mut batch = ItemBatch::with_capacity(max.min(candidates.len()));
        while batch.len() < max {
            let Some(entry) = candidates.pop() else { break };
            if self.expired(entry) {
                continue;
            }
            batch.push(entry.item.clone());
        }
        drop(inner);

        drop(timer);
        batch
    }

    /// Atomically removes and returns up to `max` highest-priority items.
    /// Expired entries encountered on the way out are tallied as drops and
    /// not returned; `len()` reflects every removal.
    pub fn drain(&self, max: usize) -> ItemBatch {
        let timer = self.metrics.drain_timer();
        let mut inner = self.inner.lock();

        let mut batch = ItemBatch::with_capacity(max.min(inner.heap.len()));
        let mut removed = 0usize;
        let mut evicted = 0u64;
        while batch.len() < max {
            let Some(entry) = inner.heap.pop() else { break };
            removed += 1;
            if self.expired(&entry) {
                evicted += 1;
                continue;
            }
            batch.push(entry.item);
        }

        if removed > 0 {
            self.len.fetch_sub(removed, Ordering::Release);
        }
        if evicted > 0 {
            self.metrics.inc_drops(DROP_REASON_AGE, evicted);
        }
        drop(inner);

        drop(timer);
        batch
    }

    fn expired(&self, entry: &Entry) -> bool {
        !self.max_age.is_zero() && entry.inserted_at.elapsed() > self.max_age
    }

    fn evict_expired_top(&self, inner: &mut Inner) -> usize {
        if self.max_age.is_zero() {
            return 0;
        }
        let mut evicted = 0;
        while inner.heap.peek().is_some_and(|entry| self.expired(entry)) {
            inner.heap.pop();
            evicted += 1;
        }
        evicted
    }
}

impl std::fmt::Debug for PriorityBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityBuffer")
            .field("len", &self.len())
            .field("max_age", &self.max_age)
            .finish()
    }
}
