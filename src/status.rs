//! Status pool: last known bus value per address.
//!
//! Every telegram carrying a value (`GroupValueWrite`, `GroupValueResponse`)
//! updates the entry of its destination and marks it fresh. Sending a write
//! marks the entry dirty until the bus confirms it, so a caller asking for a
//! fresh value waits for the confirmation instead of reading its own
//! optimistic write back.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::addressing::{IndividualAddress, KnxAddress};
use crate::protocol::cemi::{Apci, Cemi};
use crate::utility::{poll_until, POLL_INTERVAL};

/// Cached state of one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub apci: Apci,
    pub data: Vec<u8>,
    /// Device that sent the last update
    pub source: IndividualAddress,
    pub updated_at: Instant,
    /// A write is pending confirmation
    pub dirty: bool,
}

/// Address keyed status cache, shared between the receive threads and callers
#[derive(Debug, Default)]
pub struct StatusPool {
    entries: RwLock<HashMap<KnxAddress, StatusEntry>>,
}

impl StatusPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry of `address` and mark it fresh
    pub fn update(&self, address: KnxAddress, apci: Apci, data: &[u8], source: IndividualAddress) {
        let entry = StatusEntry {
            apci,
            data: data.to_vec(),
            source,
            updated_at: Instant::now(),
            dirty: false,
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, entry);
    }

    /// Update from an observed telegram; returns `false` when the telegram
    /// carries no value (reads, management services, control packets).
    pub fn update_from_cemi(&self, cemi: &Cemi) -> bool {
        match cemi.apci() {
            Some(apci) if apci.carries_value() => {
                self.update(cemi.destination(), apci, cemi.data(), cemi.source());
                true
            }
            _ => false,
        }
    }

    /// Flag an existing entry as stale; unknown addresses are left alone
    pub fn mark_dirty(&self, address: KnxAddress) {
        if let Some(entry) = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&address)
        {
            entry.dirty = true;
        }
    }

    fn lookup(&self, address: KnxAddress, require_fresh: bool) -> Option<StatusEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .filter(|entry| !require_fresh || !entry.dirty)
            .cloned()
    }

    /// Entry of `address`, waiting up to `timeout` for one to appear (or to
    /// become fresh when `require_fresh` is set).
    pub fn get(
        &self,
        address: KnxAddress,
        require_fresh: bool,
        timeout: Duration,
    ) -> Option<StatusEntry> {
        poll_until(timeout, POLL_INTERVAL, || self.lookup(address, require_fresh))
    }

    /// Entry of `address` as currently known, dirty or not
    pub fn peek(&self, address: KnxAddress) -> Option<StatusEntry> {
        self.lookup(address, false)
    }

    pub fn is_dirty(&self, address: KnxAddress) -> Option<bool> {
        self.peek(address).map(|entry| entry.dirty)
    }

    pub fn addresses(&self) -> Vec<KnxAddress> {
        let mut addresses: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        addresses.sort_unstable();
        addresses
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
