use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Artificial impairment applied to outgoing traffic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkConditions {
    pub enabled: bool,
    pub loss_percent: f32,
    /// Drops every Nth message on a link, 0 disables.
    pub drop_every: u32,
    /// Also impair the sequenced channel, not only unsequenced sends.
    pub affect_sequenced: bool,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl LinkConditions {
    pub fn lossy(loss_percent: f32) -> Self {
        Self {
            enabled: true,
            loss_percent,
            ..Default::default()
        }
    }

    pub fn applies_to(&self, sequenced: bool) -> bool {
        self.enabled && (!sequenced || self.affect_sequenced)
    }

    /// `sent` is the 1-based count of messages sent on the link so far.
    pub fn should_drop(&self, sent: u64) -> bool {
        if !self.enabled {
            return false;
        }
        if self.drop_every > 0 && sent % self.drop_every as u64 == 0 {
            return true;
        }
        self.loss_percent > 0.0 && rand_percent() * 100.0 < self.loss_percent
    }

    pub fn delay(&self) -> Duration {
        if !self.enabled || self.max_latency_ms == 0 {
            return Duration::ZERO;
        }
        let base = self.min_latency_ms;
        let range = self.max_latency_ms.saturating_sub(self.min_latency_ms);
        let jitter = if self.jitter_ms > 0 {
            (rand_percent() * self.jitter_ms as f32) as u32
        } else {
            0
        };
        Duration::from_millis((base + (rand_percent() * range as f32) as u32 + jitter) as u64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub packets_resent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: f32,
}

#[derive(Debug)]
struct Delayed<T> {
    release: Instant,
    order: u64,
    item: T,
}

impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.release == other.release && self.order == other.order
    }
}

impl<T> Eq for Delayed<T> {}

impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Delayed<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .release
            .cmp(&self.release)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Holds items back until their release time, preserving send order for
/// equal release times.
#[derive(Debug)]
pub struct DelayQueue<T> {
    heap: BinaryHeap<Delayed<T>>,
    next_order: u64,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_order: 0,
        }
    }
}

impl<T> DelayQueue<T> {
    pub fn push(&mut self, item: T, delay: Duration) {
        let order = self.next_order;
        self.next_order += 1;
        self.heap.push(Delayed {
            release: Instant::now() + delay,
            order,
            item,
        });
    }

    pub fn take_due(&mut self) -> Vec<T> {
        let mut due = Vec::new();
        let now = Instant::now();
        while self.heap.peek().is_some_and(|d| d.release <= now) {
            if let Some(delayed) = self.heap.pop() {
                due.push(delayed.item);
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

pub fn rand_percent() -> f32 {
    rand_u64() as f32 / u64::MAX as f32
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(Instant::now().elapsed().as_nanos());
    hasher.finish()
}
