//! The peer directory: an ordered set of peer addresses with liveness metadata.
//!
//! A [`PeerDirectory`] is a plain data structure with no I/O and no interior locking. At a seed coordinator it is
//! owned by the directory actor, which serializes every mutation; at a peer agent it is owned by the agent's view
//! actor. Keys are kept in address order so that sampling with a seeded RNG is reproducible.

use std::collections::BTreeMap;

use rand::Rng;

use crate::{address::Address, current_timestamp_millis};

/// Default cap on the number of addresses returned by [`PeerDirectory::sample`].
pub const DEFAULT_MAX_SAMPLE: usize = 4;

/// The addresses a seed coordinator hands to a registering peer.
pub type DirectorySnapshot = Vec<Address>;

/// Liveness metadata for a single peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    address: Address,
    last_seen: u64,
    alive: bool,
}

impl PeerRecord {
    fn new(address: Address, now: u64) -> Self {
        PeerRecord {
            address,
            last_seen: now,
            alive: true,
        }
    }

    /// The peer's address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Unix timestamp in milliseconds when the peer was last registered or heard from.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Whether the peer is currently believed to be responsive.
    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

/// Outcome of [`PeerDirectory::upsert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    /// The address was not known and a new record was created.
    Inserted,
    /// The address was already known; its timestamp was refreshed.
    Refreshed,
}

/// Mapping from [`Address`] to [`PeerRecord`], each address appearing at most once.
#[derive(Clone, Debug, Default)]
pub struct PeerDirectory {
    records: BTreeMap<Address, PeerRecord>,
}

impl PeerDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        PeerDirectory::default()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no peers are known.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns `true` if the address is known.
    pub fn contains(&self, address: &Address) -> bool {
        self.records.contains_key(address)
    }

    /// Returns the record for an address.
    pub fn get(&self, address: &Address) -> Option<&PeerRecord> {
        self.records.get(address)
    }

    /// All known addresses, in address order.
    pub fn addresses(&self) -> Vec<Address> {
        self.records.keys().cloned().collect()
    }

    /// All known addresses except `exclude`, in address order.
    pub fn snapshot_excluding(&self, exclude: &Address) -> DirectorySnapshot {
        self.records
            .keys()
            .filter(|address| *address != exclude)
            .cloned()
            .collect()
    }

    /// Adds a record for `address`, or refreshes its timestamp and marks it alive if already present.
    pub fn upsert(&mut self, address: Address) -> Upsert {
        self.upsert_at(address, current_timestamp_millis())
    }

    /// Like [`upsert`](Self::upsert), with an explicit timestamp.
    ///
    /// The stored timestamp never moves backwards.
    pub fn upsert_at(&mut self, address: Address, now: u64) -> Upsert {
        match self.records.get_mut(&address) {
            Some(record) => {
                record.last_seen = record.last_seen.max(now);
                record.alive = true;
                Upsert::Refreshed
            }
            None => {
                self.records
                    .insert(address.clone(), PeerRecord::new(address, now));
                Upsert::Inserted
            }
        }
    }

    /// Upserts every address in `addresses`, returning how many were new.
    pub fn merge<I>(&mut self, addresses: I) -> usize
    where
        I: IntoIterator<Item = Address>,
    {
        let now = current_timestamp_millis();
        addresses
            .into_iter()
            .filter(|address| self.upsert_at(address.clone(), now) == Upsert::Inserted)
            .count()
    }

    /// Removes an address. Removing an unknown address is a no-op returning `None`.
    pub fn remove(&mut self, address: &Address) -> Option<PeerRecord> {
        self.records.remove(address)
    }

    /// Refreshes the timestamp of a known peer and marks it alive. Unknown addresses are ignored.
    pub fn mark_alive(&mut self, address: &Address) {
        if let Some(record) = self.records.get_mut(address) {
            record.last_seen = record.last_seen.max(current_timestamp_millis());
            record.alive = true;
        }
    }

    /// Marks a known peer as not currently responsive. Unknown addresses are ignored.
    pub fn mark_unresponsive(&mut self, address: &Address) {
        if let Some(record) = self.records.get_mut(address) {
            record.alive = false;
        }
    }

    /// Returns a uniformly random subset of the known addresses.
    ///
    /// The subset size is itself random: `min(random(1, len), max_count)`. Varying the fan-out rather than always
    /// saturating `max_count` spreads connection load across the network. An empty directory yields an empty
    /// sample.
    pub fn sample<R: Rng>(&self, max_count: usize, rng: &mut R) -> Vec<Address> {
        self.sample_where(max_count, rng, |_| true)
    }

    /// Like [`sample`](Self::sample), drawing only from the addresses accepted by `filter`.
    pub fn sample_where<R, F>(&self, max_count: usize, rng: &mut R, filter: F) -> Vec<Address>
    where
        R: Rng,
        F: Fn(&Address) -> bool,
    {
        let candidates: Vec<&Address> = self.records.keys().filter(|a| filter(a)).collect();
        if candidates.is_empty() || max_count == 0 {
            return Vec::new();
        }

        let count = rng.random_range(1..=candidates.len()).min(max_count);
        rand::seq::index::sample(rng, candidates.len(), count)
            .into_iter()
            .map(|i| candidates[i].clone())
            .collect()
    }
}
