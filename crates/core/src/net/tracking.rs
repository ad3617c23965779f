use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Datagrams further behind the newest one than this are treated as stale.
const RECEIVE_WINDOW: u32 = 64;
const MIN_RTO: Duration = Duration::from_millis(30);
const MAX_RTO: Duration = Duration::from_secs(1);

/// Wrapping comparison of datagram sequence numbers.
#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    (s1.wrapping_sub(s2) as i32) > 0
}

/// True when an (ack, bitfield) pair covers `sequence`. Bit n of the field
/// stands for `ack - n - 1`.
fn ack_covers(ack: u32, bitfield: u32, sequence: u32) -> bool {
    if sequence == ack {
        return true;
    }
    let behind = ack.wrapping_sub(sequence);
    sequence_greater_than(ack, sequence) && behind <= 32 && bitfield & (1 << (behind - 1)) != 0
}

/// Smoothed round trip and its variance, RFC 6298 style.
#[derive(Debug, Default)]
struct RttEstimator {
    smoothed: Option<Duration>,
    variance: Duration,
}

impl RttEstimator {
    fn sample(&mut self, rtt: Duration) {
        match self.smoothed {
            None => {
                self.smoothed = Some(rtt);
                self.variance = rtt / 2;
            }
            Some(srtt) => {
                let diff = if rtt > srtt { rtt - srtt } else { srtt - rtt };
                self.variance = self.variance * 3 / 4 + diff / 4;
                self.smoothed = Some(srtt * 7 / 8 + rtt / 8);
            }
        }
    }

    fn rto(&self) -> Duration {
        match self.smoothed {
            Some(srtt) => (srtt + self.variance * 4).clamp(MIN_RTO, MAX_RTO),
            None => Duration::from_millis(200),
        }
    }
}

/// Send times of our datagrams the peer has not acknowledged yet.
#[derive(Debug)]
pub struct AckTracker {
    unacked: VecDeque<(u32, Instant)>,
    capacity: usize,
    rtt: RttEstimator,
}

impl AckTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            unacked: VecDeque::with_capacity(capacity),
            capacity,
            rtt: RttEstimator::default(),
        }
    }

    pub fn track(&mut self, sequence: u32) {
        if self.unacked.len() == self.capacity {
            self.unacked.pop_front();
        }
        self.unacked.push_back((sequence, Instant::now()));
    }

    /// Forgets every datagram the ack covers and returns their sequences.
    pub fn process_ack(&mut self, ack: u32, bitfield: u32) -> Vec<u32> {
        let now = Instant::now();
        let mut acked = Vec::new();
        let rtt = &mut self.rtt;
        self.unacked.retain(|&(sequence, sent)| {
            if !ack_covers(ack, bitfield, sequence) {
                return true;
            }
            rtt.sample(now.duration_since(sent));
            acked.push(sequence);
            false
        });
        acked
    }

    /// None until the first ack arrived.
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.rtt.smoothed
    }

    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }
}

/// Datagrams seen from a peer, for acks and duplicate filtering.
#[derive(Debug, Default)]
pub struct ReceiveTracker {
    /// None until the first datagram arrived.
    newest: Option<u32>,
    /// Bit n set means `newest - n - 1` arrived.
    seen: u64,
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false for duplicates and datagrams too old to tell apart.
    pub fn record_received(&mut self, sequence: u32) -> bool {
        let Some(newest) = self.newest else {
            self.newest = Some(sequence);
            self.seen = 0;
            return true;
        };

        if sequence_greater_than(sequence, newest) {
            let ahead = sequence.wrapping_sub(newest);
            self.seen = if ahead > RECEIVE_WINDOW {
                0
            } else {
                // the old newest becomes bit ahead - 1
                (self.seen << 1 | 1).checked_shl(ahead - 1).unwrap_or(0)
            };
            self.newest = Some(sequence);
            return true;
        }

        let behind = newest.wrapping_sub(sequence);
        if behind == 0 || behind > RECEIVE_WINDOW {
            return false;
        }
        let bit = 1u64 << (behind - 1);
        if self.seen & bit != 0 {
            return false;
        }
        self.seen |= bit;
        true
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.newest.unwrap_or(0), self.seen as u32)
    }
}
