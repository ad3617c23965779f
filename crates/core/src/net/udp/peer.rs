use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::datagram::{FRAGMENT_SIZE, Fragment};
use crate::net::UserId;
use crate::net::tracking::{AckTracker, ReceiveTracker, sequence_greater_than};

const MAX_IN_FLIGHT: usize = 128;
const MAX_REORDER_SPAN: u32 = 16_384;

#[derive(Debug)]
struct InFlight {
    fragment: Fragment,
    last_sent: Instant,
    datagrams: Vec<u32>,
}

/// Connection state for one remote peer of the UDP provider.
#[derive(Debug)]
pub struct PeerLink {
    pub addr: SocketAddr,
    pub id: UserId,
    pub connected_at: Instant,
    pub last_receive: Instant,
    pub last_send: Instant,
    pub ack_pending: bool,
    pub sent_count: u64,
    pub receive: ReceiveTracker,
    pub acks: AckTracker,
    send_sequence: u32,
    next_stream_id: u32,
    backlog: VecDeque<Fragment>,
    in_flight: BTreeMap<u32, InFlight>,
    next_expected: u32,
    out_of_order: BTreeMap<u32, Fragment>,
    partial: Vec<u8>,
    inbox: VecDeque<Vec<u8>>,
}

impl PeerLink {
    pub fn new(addr: SocketAddr, id: UserId) -> Self {
        let now = Instant::now();
        Self {
            addr,
            id,
            connected_at: now,
            last_receive: now,
            last_send: now,
            ack_pending: false,
            sent_count: 0,
            receive: ReceiveTracker::new(),
            acks: AckTracker::new(1024),
            send_sequence: 0,
            next_stream_id: 0,
            backlog: VecDeque::new(),
            in_flight: BTreeMap::new(),
            next_expected: 0,
            out_of_order: BTreeMap::new(),
            partial: Vec::new(),
            inbox: VecDeque::new(),
        }
    }

    pub fn next_sequence(&mut self) -> u32 {
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.send_sequence
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive.elapsed() > timeout
    }

    /// Splits a message into stream fragments queued behind earlier ones.
    pub fn queue_message(&mut self, data: &[u8]) {
        let count = data.len().div_ceil(FRAGMENT_SIZE).max(1);
        for index in 0..count {
            let start = index * FRAGMENT_SIZE;
            let end = (start + FRAGMENT_SIZE).min(data.len());
            self.backlog.push_back(Fragment {
                stream_id: self.next_stream_id,
                index: index as u16,
                count: count as u16,
                data: data[start..end].to_vec(),
            });
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
        }
    }

    /// Fragments that should go out now: new ones while the window has room,
    /// plus any whose retransmission timer expired.
    pub fn take_due_fragments(&mut self) -> Vec<Fragment> {
        let now = Instant::now();
        let rto = self.acks.rto();
        let mut due: Vec<Fragment> = self
            .in_flight
            .values()
            .filter(|f| now.duration_since(f.last_sent) >= rto)
            .map(|f| f.fragment.clone())
            .collect();

        while self.in_flight.len() < MAX_IN_FLIGHT {
            let Some(fragment) = self.backlog.pop_front() else {
                break;
            };
            self.in_flight.insert(
                fragment.stream_id,
                InFlight {
                    fragment: fragment.clone(),
                    last_sent: now,
                    datagrams: Vec::new(),
                },
            );
            due.push(fragment);
        }
        due
    }

    pub fn mark_sent(&mut self, stream_id: u32, datagram: u32) {
        if let Some(entry) = self.in_flight.get_mut(&stream_id) {
            entry.last_sent = Instant::now();
            entry.datagrams.push(datagram);
        }
    }

    pub fn is_retransmit(&self, stream_id: u32) -> bool {
        self.in_flight
            .get(&stream_id)
            .is_some_and(|entry| !entry.datagrams.is_empty())
    }

    pub fn on_acked(&mut self, datagrams: &[u32]) {
        if datagrams.is_empty() {
            return;
        }
        self.in_flight
            .retain(|_, entry| !entry.datagrams.iter().any(|d| datagrams.contains(d)));
    }

    pub fn accept_fragment(&mut self, fragment: Fragment) {
        let id = fragment.stream_id;
        if id != self.next_expected && !sequence_greater_than(id, self.next_expected) {
            return;
        }
        if id.wrapping_sub(self.next_expected) > MAX_REORDER_SPAN {
            log::warn!("Fragment {} from user {} too far ahead, ignored", id, self.id);
            return;
        }
        self.out_of_order.entry(id).or_insert(fragment);

        while let Some(next) = self.out_of_order.remove(&self.next_expected) {
            self.next_expected = self.next_expected.wrapping_add(1);
            self.partial.extend_from_slice(&next.data);
            if next.index + 1 >= next.count {
                self.inbox.push_back(std::mem::take(&mut self.partial));
            }
        }
    }

    pub fn deliver_unsequenced(&mut self, data: Vec<u8>) {
        self.inbox.push_back(data);
    }

    pub fn peek_message_len(&self) -> Option<usize> {
        self.inbox.front().map(Vec::len)
    }

    pub fn pop_message(&mut self) -> Option<Vec<u8>> {
        self.inbox.pop_front()
    }

    pub fn has_unacked(&self) -> bool {
        !self.in_flight.is_empty() || !self.backlog.is_empty()
    }
}
