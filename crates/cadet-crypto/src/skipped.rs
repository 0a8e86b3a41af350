//! Bounded store of message keys skipped over on the receive chain.

use std::collections::VecDeque;

use crate::keys::SymmetricKey;

/// A message key derived ahead of time because earlier messages of its chain
/// have not arrived yet.
#[derive(Clone, Debug)]
pub struct SkippedKey {
    /// Header key of the chain the message belongs to
    pub header_key: SymmetricKey,
    /// One-time message key
    pub message_key: SymmetricKey,
    /// Chain position of the message
    pub counter: u32,
}

/// FIFO of skipped keys, newest at the front.
///
/// The store never holds more than `capacity` entries; inserting past the cap
/// evicts from the back, i.e. the oldest entry first.
#[derive(Clone, Debug)]
pub struct SkippedKeys {
    entries: VecDeque<SkippedKey>,
    capacity: usize,
}

impl SkippedKeys {
    /// Empty store holding at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity), capacity }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of stored keys.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a key, evicting the oldest entries over capacity.
    ///
    /// Returns the number of evicted entries.
    pub fn insert(&mut self, key: SkippedKey) -> usize {
        self.entries.push_front(key);
        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
            evicted += 1;
        }
        evicted
    }

    /// Distinct header keys present in the store, newest first.
    pub fn header_keys(&self) -> Vec<SymmetricKey> {
        let mut keys: Vec<SymmetricKey> = Vec::new();
        for entry in &self.entries {
            if !keys.contains(&entry.header_key) {
                keys.push(entry.header_key.clone());
            }
        }
        keys
    }

    /// Remove and return the entry for `counter` on the chain of `header_key`.
    pub fn take(&mut self, header_key: &SymmetricKey, counter: u32) -> Option<SkippedKey> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.counter == counter && &entry.header_key == header_key)?;
        self.entries.remove(index)
    }

    /// Chain positions currently stored, newest first.
    pub fn counters(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|entry| entry.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(counter: u32) -> SkippedKey {
        SkippedKey {
            header_key: SymmetricKey::from_bytes([1u8; 32]),
            message_key: SymmetricKey::from_bytes([counter as u8; 32]),
            counter,
        }
    }

    #[test]
    fn evicts_oldest_first() {
        let mut store = SkippedKeys::new(3);
        for counter in 0..5 {
            store.insert(entry(counter));
        }

        assert_eq!(store.len(), 3);
        assert_eq!(store.counters().collect::<Vec<_>>(), vec![4, 3, 2]);
    }

    #[test]
    fn take_is_use_once() {
        let mut store = SkippedKeys::new(4);
        store.insert(entry(7));
        let hk = SymmetricKey::from_bytes([1u8; 32]);

        assert!(store.take(&hk, 7).is_some());
        assert!(store.take(&hk, 7).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn take_requires_matching_chain() {
        let mut store = SkippedKeys::new(4);
        store.insert(entry(7));

        let other = SymmetricKey::from_bytes([2u8; 32]);
        assert!(store.take(&other, 7).is_none());
        assert_eq!(store.len(), 1);
    }
}
