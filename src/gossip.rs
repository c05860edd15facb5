//! Epidemic dissemination of gossip messages.
//!
//! A [`GossipDisseminator`] decides, for every message a node originates or receives, whether it is new and which
//! linked peers it goes to next. It performs no I/O itself; the peer agent owns one and does the sending.
//!
//! Each node relays a given `(origin, sequence)` pair at most once, to at most `max_fanout` of its links, never
//! back to the link it arrived on and never to the origin. The total number of copies of one message across the
//! whole graph is therefore bounded by the number of links, however many times it is relayed.

use std::collections::{BTreeSet, HashMap};

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::{address::Address, current_timestamp_millis, directory::PeerDirectory};

/// Default number of sequence numbers tracked per origin.
pub const DEFAULT_SEEN_WINDOW: u64 = 64;

/// A gossip payload with its origin and per-origin sequence number.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GossipMessage {
    /// The node that created the message.
    pub origin: Address,
    /// Monotonic per origin, starting at 1.
    pub sequence: u64,
    /// Opaque application payload.
    pub payload: String,
}

/// Builds the payload of the `round`-th scheduled gossip message: `"<unix-millis>:<origin>:GOSSIP<round>"`.
pub fn scheduled_payload(origin: &Address, round: u64) -> String {
    format!("{}:{}:GOSSIP{}", current_timestamp_millis(), origin, round)
}

#[derive(Clone, Debug, Default)]
struct OriginWindow {
    highest: u64,
    seen: BTreeSet<u64>,
}

/// Duplicate suppression over a sliding window of sequence numbers per origin.
///
/// For each origin the window holds the sequence numbers in `(highest - window, highest]`. Anything at or below
/// the lower edge is treated as already seen.
#[derive(Clone, Debug)]
pub struct SeenWindow {
    window: u64,
    origins: HashMap<Address, OriginWindow>,
}

impl SeenWindow {
    /// Creates a window tracking `window` sequence numbers per origin (at least one).
    pub fn new(window: u64) -> Self {
        SeenWindow {
            window: window.max(1),
            origins: HashMap::new(),
        }
    }

    /// Records a sighting, returning `true` only the first time a message is seen.
    pub fn observe(&mut self, origin: &Address, sequence: u64) -> bool {
        let window = self.window;
        let entry = self.origins.entry(origin.clone()).or_default();

        if entry.highest >= window && sequence <= entry.highest - window {
            return false;
        }
        if !entry.seen.insert(sequence) {
            return false;
        }
        if sequence > entry.highest {
            entry.highest = sequence;
            let floor = entry.highest.saturating_sub(window);
            entry.seen = entry.seen.split_off(&(floor + 1));
        }
        true
    }

    /// Highest sequence number seen from `origin`.
    pub fn highest(&self, origin: &Address) -> Option<u64> {
        self.origins.get(origin).map(|entry| entry.highest)
    }
}

/// Generates, filters and routes gossip for one node.
#[derive(Debug)]
pub struct GossipDisseminator {
    local: Address,
    next_sequence: u64,
    max_fanout: usize,
    seen: SeenWindow,
    rng: StdRng,
}

impl GossipDisseminator {
    /// Creates a disseminator for the node at `local`.
    pub fn new(local: Address, max_fanout: usize, seen_window: u64, rng: StdRng) -> Self {
        GossipDisseminator {
            local,
            next_sequence: 0,
            max_fanout,
            seen: SeenWindow::new(seen_window),
            rng,
        }
    }

    /// Creates the next message from this node. It is marked as seen so it is never relayed back.
    pub fn originate(&mut self, payload: impl Into<String>) -> GossipMessage {
        self.next_sequence += 1;
        let message = GossipMessage {
            origin: self.local.clone(),
            sequence: self.next_sequence,
            payload: payload.into(),
        };
        self.seen.observe(&message.origin, message.sequence);
        message
    }

    /// Returns `true` if a received message is new and should be delivered and relayed.
    pub fn receive(&mut self, message: &GossipMessage) -> bool {
        if message.origin == self.local {
            return false;
        }
        self.seen.observe(&message.origin, message.sequence)
    }

    /// Picks the linked peers a message goes to next: a random subset of `linked`, excluding the peer it came
    /// `from` and its origin.
    pub fn targets(
        &mut self,
        linked: &PeerDirectory,
        message: &GossipMessage,
        from: Option<&Address>,
    ) -> Vec<Address> {
        linked.sample_where(self.max_fanout, &mut self.rng, |peer| {
            Some(peer) != from && *peer != message.origin
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use rand::{seq::index, Rng, SeedableRng};

    use super::*;

    fn addr(port: u16) -> Address {
        Address::new("127.0.0.1", port)
    }

    #[test]
    fn window_accepts_each_sequence_once() {
        let mut seen = SeenWindow::new(4);
        let origin = addr(1);
        assert!(seen.observe(&origin, 1));
        assert!(!seen.observe(&origin, 1));
        assert!(seen.observe(&origin, 3));
        assert!(seen.observe(&origin, 2));
        assert!(!seen.observe(&origin, 2));
        assert_eq!(seen.highest(&origin), Some(3));
    }

    #[test]
    fn window_drops_messages_older_than_its_edge() {
        let mut seen = SeenWindow::new(4);
        let origin = addr(1);
        assert!(seen.observe(&origin, 10));
        // (6, 10] is inside the window
        assert!(seen.observe(&origin, 7));
        assert!(!seen.observe(&origin, 6));
        assert!(!seen.observe(&origin, 1));
        // origins are independent
        assert!(seen.observe(&addr(2), 1));
    }

    #[test]
    fn own_messages_are_never_accepted_back() {
        let rng = StdRng::seed_from_u64(0);
        let mut gossip = GossipDisseminator::new(addr(1), 4, DEFAULT_SEEN_WINDOW, rng);
        let first = gossip.originate("x");
        let second = gossip.originate("y");
        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert!(!gossip.receive(&first));
    }

    #[test]
    fn targets_exclude_sender_and_origin() {
        let rng = StdRng::seed_from_u64(5);
        let mut gossip = GossipDisseminator::new(addr(1), 4, DEFAULT_SEEN_WINDOW, rng);
        let mut linked = PeerDirectory::new();
        for port in 2..=6 {
            linked.upsert(addr(port));
        }
        let message = GossipMessage {
            origin: addr(2),
            sequence: 1,
            payload: "x".into(),
        };

        for _ in 0..100 {
            let targets = gossip.targets(&linked, &message, Some(&addr(3)));
            assert!(!targets.is_empty() && targets.len() <= 3);
            assert!(!targets.contains(&addr(2)));
            assert!(!targets.contains(&addr(3)));
        }
    }

    /// Floods one message through a random graph and counts every copy sent over every link.
    fn flood(nodes: u16, seed: u64, fanout: usize) -> (usize, usize, HashMap<(u16, u16), usize>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut linked: Vec<PeerDirectory> = (0..nodes).map(|_| PeerDirectory::new()).collect();
        let mut links = 0;
        for a in 0..nodes {
            let degree = rng.random_range(1..=3usize).min(nodes as usize - 1);
            for b in index::sample(&mut rng, nodes as usize, degree).into_iter() {
                let b = b as u16;
                if a != b && !linked[a as usize].contains(&addr(b)) {
                    linked[a as usize].upsert(addr(b));
                    linked[b as usize].upsert(addr(a));
                    links += 1;
                }
            }
        }

        let mut gossip: Vec<GossipDisseminator> = (0..nodes)
            .map(|n| {
                GossipDisseminator::new(addr(n), fanout, 16, StdRng::seed_from_u64(seed + n as u64))
            })
            .collect();

        let message = gossip[0].originate("x");
        let mut in_flight = VecDeque::new();
        for target in gossip[0].targets(&linked[0], &message, None) {
            in_flight.push_back((0u16, target.port()));
        }

        let mut copies: HashMap<(u16, u16), usize> = HashMap::new();
        let mut total = 0;
        while let Some((from, to)) = in_flight.pop_front() {
            total += 1;
            *copies.entry((from, to)).or_default() += 1;
            let node = &mut gossip[to as usize];
            if node.receive(&message) {
                let targets = node.targets(&linked[to as usize], &message, Some(&addr(from)));
                for target in targets {
                    in_flight.push_back((to, target.port()));
                }
            }
        }

        (total, links, copies)
    }

    #[test]
    fn copies_are_bounded_by_links() {
        for seed in 0..20 {
            let (total, links, copies) = flood(30, seed, 4);
            assert!(total <= 2 * links, "seed {seed}: {total} copies over {links} links");
            assert!(copies.values().all(|&n| n == 1), "seed {seed}: a relayer sent a copy twice");
        }
    }

    #[test]
    fn replaying_a_message_produces_no_new_copies() {
        let rng = StdRng::seed_from_u64(9);
        let mut node = GossipDisseminator::new(addr(1), 4, DEFAULT_SEEN_WINDOW, rng);
        let message = GossipMessage {
            origin: addr(2),
            sequence: 1,
            payload: "x".into(),
        };
        assert!(node.receive(&message));
        for _ in 0..10 {
            assert!(!node.receive(&message));
        }
    }
}
