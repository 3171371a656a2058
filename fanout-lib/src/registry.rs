//! Correlation of in-flight transfers with caller keys.
//!
//! Completions arrive in finish order and are reported by slot. The registry
//! keeps a bidirectional index so both directions are a single hash lookup.

use std::collections::HashMap;
use std::fmt;

use http::Method;
use serde::Serialize;
use tokio::time::Instant;
use url::Url;

use crate::{Destination, ErrorKind, Result};

/// Stable identifier of an in-flight transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotId(u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Bookkeeping of a dispatched request
#[derive(Debug, Clone)]
pub struct InFlight {
    /// Caller supplied key
    pub key: String,
    /// Destination the connection was checked out for
    pub destination: Destination,
    /// Requested URL
    pub url: Url,
    /// Request method
    pub method: Method,
    /// When the request was dispatched
    pub dispatched_at: Instant,
    /// Keep the response headers in the completion
    pub collect_headers: bool,
}

/// Bidirectional index between keys and in-flight slots
#[derive(Debug, Default)]
pub struct RequestRegistry {
    slots: HashMap<SlotId, InFlight>,
    keys: HashMap<String, SlotId>,
    next_slot: u64,
}

impl RequestRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatched request and return its slot.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DuplicateKey`] if the key is already in flight.
    pub fn register(&mut self, entry: InFlight) -> Result<SlotId> {
        if self.keys.contains_key(&entry.key) {
            return Err(ErrorKind::DuplicateKey(entry.key));
        }
        let slot = SlotId(self.next_slot);
        self.next_slot += 1;
        self.keys.insert(entry.key.clone(), slot);
        self.slots.insert(slot, entry);
        Ok(slot)
    }

    /// Reverse lookup of the key a slot belongs to
    #[must_use]
    pub fn resolve(&self, slot: SlotId) -> Option<&str> {
        self.slots.get(&slot).map(|entry| entry.key.as_str())
    }

    /// Look up the in-flight entry of a key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&InFlight> {
        self.keys.get(key).and_then(|slot| self.slots.get(slot))
    }

    /// Remove a slot, returning its entry
    pub fn take(&mut self, slot: SlotId) -> Option<InFlight> {
        let entry = self.slots.remove(&slot)?;
        self.keys.remove(&entry.key);
        Some(entry)
    }

    /// Remove a key, returning its entry
    pub fn remove(&mut self, key: &str) -> Option<InFlight> {
        let slot = self.keys.remove(key)?;
        self.slots.remove(&slot)
    }

    /// Whether `key` is in flight
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Number of in-flight requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Remove every entry, returning their keys
    pub fn drain(&mut self) -> Vec<String> {
        self.keys.clear();
        let mut entries: Vec<_> = self.slots.drain().collect();
        entries.sort_by_key(|(slot, _)| *slot);
        entries.into_iter().map(|(_, entry)| entry.key).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(key: &str) -> InFlight {
        let url = Url::parse("http://example.com/").unwrap();
        InFlight {
            key: key.to_string(),
            destination: Destination::try_from(&url).unwrap(),
            url,
            method: Method::GET,
            dispatched_at: Instant::now(),
            collect_headers: false,
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = RequestRegistry::new();
        let a = registry.register(entry("a")).unwrap();
        let b = registry.register(entry("b")).unwrap();

        assert_ne!(a, b);
        assert_eq!(registry.resolve(b), Some("b"));
        assert_eq!(registry.resolve(a), Some("a"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let mut registry = RequestRegistry::new();
        registry.register(entry("a")).unwrap();
        assert_eq!(
            registry.register(entry("a")),
            Err(ErrorKind::DuplicateKey("a".to_string()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_take_removes_both_directions() {
        let mut registry = RequestRegistry::new();
        let slot = registry.register(entry("a")).unwrap();

        let taken = registry.take(slot).unwrap();
        assert_eq!(taken.key, "a");
        assert!(!registry.contains_key("a"));
        assert_eq!(registry.resolve(slot), None);
        assert!(registry.is_empty());

        // the key may be registered again once it left the registry
        let again = registry.register(entry("a")).unwrap();
        assert_ne!(again, slot);
    }

    #[test]
    fn test_remove_by_key() {
        let mut registry = RequestRegistry::new();
        let slot = registry.register(entry("a")).unwrap();
        assert!(registry.remove("a").is_some());
        assert_eq!(registry.resolve(slot), None);
        assert!(registry.remove("a").is_none());
    }

    #[test]
    fn test_drain_in_dispatch_order() {
        let mut registry = RequestRegistry::new();
        for key in ["c", "a", "b"] {
            registry.register(entry(key)).unwrap();
        }
        assert_eq!(registry.drain(), vec!["c", "a", "b"]);
        assert!(registry.is_empty());
    }
}
