//! Receive-side reassembly of multi-packet messages
//!
//! Fragments are buffered per `(channel, message id)` until every sequence
//! index of the declared total has been seen. Arrival order and duplicates do
//! not matter: chunks are stored by index and concatenated in index order.
//! Entries that stop receiving fragments are dropped by [`ReassemblyBuffer::sweep`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::config::ReassemblyConfig;
use crate::dispatch::Observation;
use crate::packet::{Fragment, MAX_TOTAL_COUNT};
use crate::types::{ChannelId, MessageId, Timestamp};

// ----------------------------------------------------------------------------
// Keys and Entries
// ----------------------------------------------------------------------------

/// Identifies one message being reassembled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    pub channel: ChannelId,
    pub message_id: MessageId,
}

impl ReassemblyKey {
    pub fn new(channel: ChannelId, message_id: MessageId) -> Self {
        Self {
            channel,
            message_id,
        }
    }
}

/// Position of an entry in eviction order: start time, then arrival
type EvictionSlot = (Timestamp, u64);

/// Partially received message
#[derive(Debug)]
struct ReassemblyEntry {
    slot: EvictionSlot,
    total_count: u8,
    /// Indexed by sequence index
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    first_seen_at: Timestamp,
    last_seen_at: Timestamp,
}

impl ReassemblyEntry {
    fn new(slot: EvictionSlot, total_count: u8, now: Timestamp) -> Self {
        Self {
            slot,
            total_count,
            chunks: vec![None; total_count as usize],
            received: 0,
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    /// Store a chunk, returning true if the index was already present
    fn insert(&mut self, sequence_index: u8, chunk: Vec<u8>, now: Timestamp) -> bool {
        let slot = &mut self.chunks[sequence_index as usize];
        let duplicate = slot.is_some();
        if !duplicate {
            self.received += 1;
        }
        *slot = Some(chunk);
        if now > self.last_seen_at {
            self.last_seen_at = now;
        }
        duplicate
    }

    fn is_complete(&self) -> bool {
        self.received == self.total_count as usize
    }

    fn assemble(self) -> Vec<u8> {
        let len = self.chunks.iter().flatten().map(Vec::len).sum();
        let mut payload = Vec::with_capacity(len);
        for chunk in self.chunks.into_iter().flatten() {
            payload.extend_from_slice(&chunk);
        }
        payload
    }

    fn is_expired(&self, now: Timestamp, ttl_millis: u64) -> bool {
        now - self.last_seen_at > ttl_millis
    }
}

// ----------------------------------------------------------------------------
// Completed Message
// ----------------------------------------------------------------------------

/// A message whose fragments have all arrived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedReassembly {
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    pub fragment_count: u8,
    /// Reception details of the fragment that completed the message
    pub observation: Observation,
    pub first_seen_at: Timestamp,
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Snapshot of buffer activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub active: usize,
    pub fragments: u64,
    pub duplicates: u64,
    pub completed: u64,
    pub expired: u64,
    pub evicted: u64,
    pub resets: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    fragments: AtomicU64,
    duplicates: AtomicU64,
    completed: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
    resets: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// Reassembly Buffer
// ----------------------------------------------------------------------------

/// Concurrent buffer of partially received messages
///
/// Internally sharded: ingesting a fragment locks only the shard holding its
/// key, so a sweep or a burst on one message does not stall unrelated keys.
/// Entries are also listed in start order for eviction; that index is only
/// touched when an entry is created or removed.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    config: ReassemblyConfig,
    entries: DashMap<ReassemblyKey, ReassemblyEntry>,
    /// Locked after a shard, never before
    eviction: Mutex<BTreeMap<EvictionSlot, ReassemblyKey>>,
    arrivals: AtomicU64,
    counters: Counters,
}

impl ReassemblyBuffer {
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            eviction: Mutex::new(BTreeMap::new()),
            arrivals: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Buffer one fragment heard on `observation.channel`
    ///
    /// Returns the completed message when this fragment was the last one
    /// missing. The entry is removed in the same step, so later duplicates of
    /// the same fragments start a fresh entry instead of completing twice.
    pub fn ingest(&self, fragment: Fragment, observation: Observation) -> Option<CompletedReassembly> {
        let header = fragment.header;
        if header.total_count < 2
            || header.total_count as usize > MAX_TOTAL_COUNT
            || header.sequence_index >= header.total_count
        {
            Counters::bump(&self.counters.rejected);
            debug!(
                "Rejecting fragment {}/{} of message {}: inconsistent header",
                header.sequence_index, header.total_count, header.message_id
            );
            return None;
        }

        Counters::bump(&self.counters.fragments);
        let key = ReassemblyKey::new(observation.channel, header.message_id);
        let now = observation.timestamp;

        if !self.entries.contains_key(&key) && self.entries.len() >= self.config.max_entries {
            self.evict_oldest();
        }

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().total_count != header.total_count {
                    Counters::bump(&self.counters.resets);
                    debug!(
                        "Message {} on {} changed total count {} -> {}, restarting",
                        key.message_id,
                        key.channel,
                        occupied.get().total_count,
                        header.total_count
                    );
                    let slot = occupied.get().slot;
                    occupied.insert(ReassemblyEntry::new(slot, header.total_count, now));
                }

                if occupied
                    .get_mut()
                    .insert(header.sequence_index, fragment.chunk, now)
                {
                    Counters::bump(&self.counters.duplicates);
                }

                trace!(
                    "Message {} on {}: {}/{} fragments",
                    key.message_id,
                    key.channel,
                    occupied.get().received,
                    occupied.get().total_count
                );

                if !occupied.get().is_complete() {
                    return None;
                }

                let entry = occupied.remove();
                self.unlist(&[entry.slot]);
                Counters::bump(&self.counters.completed);
                let first_seen_at = entry.first_seen_at;
                let fragment_count = entry.total_count;
                let payload = entry.assemble();
                debug!(
                    "Reassembled message {} on {}: {} bytes from {} fragments",
                    key.message_id,
                    key.channel,
                    payload.len(),
                    fragment_count
                );

                Some(CompletedReassembly {
                    message_id: key.message_id,
                    payload,
                    fragment_count,
                    observation,
                    first_seen_at,
                })
            }
            Entry::Vacant(vacant) => {
                let slot = (now, self.arrivals.fetch_add(1, Ordering::Relaxed));
                let mut entry = ReassemblyEntry::new(slot, header.total_count, now);
                entry.insert(header.sequence_index, fragment.chunk, now);
                self.index().insert(slot, key);
                debug!(
                    "Started reassembly of message {} on {} ({} fragments)",
                    key.message_id, key.channel, header.total_count
                );
                vacant.insert(entry);
                None
            }
        }
    }

    /// Drop entries idle for longer than the configured TTL
    ///
    /// Returns how many entries were removed. Nothing else is reported: a lost
    /// message is only observable by its absence.
    pub fn sweep(&self, now: Timestamp) -> usize {
        let ttl_millis = self.config.ttl.as_millis() as u64;
        let mut dropped = Vec::new();

        self.entries.retain(|key, entry| {
            let expired = entry.is_expired(now, ttl_millis);
            if expired {
                debug!(
                    "Dropping incomplete message {} on {} ({}/{} fragments)",
                    key.message_id, key.channel, entry.received, entry.total_count
                );
                dropped.push(entry.slot);
            }
            !expired
        });

        self.unlist(&dropped);
        if !dropped.is_empty() {
            self.counters
                .expired
                .fetch_add(dropped.len() as u64, Ordering::Relaxed);
        }
        dropped.len()
    }

    /// Received and expected fragment counts of an in-progress message
    pub fn progress(&self, key: &ReassemblyKey) -> Option<(usize, u8)> {
        self.entries
            .get(key)
            .map(|entry| (entry.received, entry.total_count))
    }

    pub fn active_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        self.index().clear();
        self.entries.clear();
    }

    pub fn stats(&self) -> ReassemblyStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ReassemblyStats {
            active: self.entries.len(),
            fragments: load(&self.counters.fragments),
            duplicates: load(&self.counters.duplicates),
            completed: load(&self.counters.completed),
            expired: load(&self.counters.expired),
            evicted: load(&self.counters.evicted),
            resets: load(&self.counters.resets),
            rejected: load(&self.counters.rejected),
        }
    }

    fn index(&self) -> MutexGuard<'_, BTreeMap<EvictionSlot, ReassemblyKey>> {
        self.eviction.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unlist(&self, slots: &[EvictionSlot]) {
        if slots.is_empty() {
            return;
        }
        let mut index = self.index();
        for slot in slots {
            index.remove(slot);
        }
    }

    /// Remove the entry that started earliest
    fn evict_oldest(&self) {
        loop {
            let Some((slot, key)) = self.index().pop_first() else {
                return;
            };
            // Skip index slots whose entry was replaced after a clear
            if self.entries.remove_if(&key, |_, entry| entry.slot == slot).is_some() {
                Counters::bump(&self.counters.evicted);
                warn!(
                    "Reassembly buffer full ({} entries), evicted message {} on {}",
                    self.config.max_entries, key.message_id, key.channel
                );
                return;
            }
        }
    }
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new(ReassemblyConfig::default())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
