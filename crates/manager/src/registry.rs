//! Domain registry
//!
//! In-memory set of managed domain sets, keyed by discovery label. The
//! registry is the single owner of domain set identity: the discovery
//! reconciler creates and deletes entries, the acquisition pipeline only
//! updates retry counts, the expiry scheduler only reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use certherd_common::{DomainKey, DomainSet};
use parking_lot::RwLock;
use tracing::{debug, trace};

/// A registry entry
///
/// `generation` identifies this lifetime of the key: a key removed and
/// rediscovered gets a new generation, so tasks created for the old entry
/// can be recognised as stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredDomain {
    pub set: DomainSet,
    pub generation: u64,
}

/// Registry of managed domain sets
#[derive(Debug, Default)]
pub struct DomainRegistry {
    entries: RwLock<HashMap<DomainKey, RegisteredDomain>>,
    next_generation: AtomicU64,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a domain set unless its key is already registered.
    ///
    /// Returns the new entry, or `None` if the key was present (the existing
    /// entry is left untouched).
    pub fn insert(&self, set: DomainSet) -> Option<RegisteredDomain> {
        let mut entries = self.entries.write();
        if entries.contains_key(&set.key) {
            trace!(domain = %set.key, "Domain already registered");
            return None;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = RegisteredDomain { set, generation };
        entries.insert(entry.set.key.clone(), entry.clone());

        debug!(
            domain = %entry.set.key,
            generation = generation,
            registered = entries.len(),
            "Registered domain set"
        );
        Some(entry)
    }

    /// Remove a domain set
    pub fn remove(&self, key: &DomainKey) -> Option<RegisteredDomain> {
        let removed = self.entries.write().remove(key);
        if removed.is_some() {
            debug!(domain = %key, "Unregistered domain set");
        }
        removed
    }

    pub fn get(&self, key: &DomainKey) -> Option<RegisteredDomain> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &DomainKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Whether `key` is registered with exactly this generation
    pub fn is_current(&self, key: &DomainKey, generation: u64) -> bool {
        self.entries
            .read()
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// All registered keys, sorted
    pub fn keys(&self) -> Vec<DomainKey> {
        let mut keys: Vec<DomainKey> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Copy of all entries, sorted by key
    pub fn snapshot(&self) -> Vec<RegisteredDomain> {
        let mut entries: Vec<RegisteredDomain> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.set.key.cmp(&b.set.key));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Count a failed attempt against the entry.
    ///
    /// The count spans tasks: a task re-triggered after giving up keeps
    /// adding to it until a success resets it. Ignored for stale
    /// generations. Returns whether the entry was updated.
    pub fn record_failure(&self, key: &DomainKey, generation: u64) -> bool {
        self.update(key, generation, |set| {
            set.retry_count = set.retry_count.saturating_add(1)
        })
    }

    /// Reset the retry count after a success.
    pub fn record_success(&self, key: &DomainKey, generation: u64) -> bool {
        self.update(key, generation, |set| set.retry_count = 0)
    }

    fn update(&self, key: &DomainKey, generation: u64, f: impl FnOnce(&mut DomainSet)) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if entry.generation == generation => {
                f(&mut entry.set);
                true
            }
            _ => false,
        }
    }
}
