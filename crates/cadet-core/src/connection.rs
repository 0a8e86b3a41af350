//! Readiness tracking for the connections underneath a tunnel.
//!
//! A connection is *ready* when it can accept one more message. Handing it
//! a message makes it busy until the transport reports it ready again.

use std::collections::{BTreeSet, VecDeque};

use cadet_proto::ConnectionId;

/// Connections of one tunnel, split into ready and busy.
#[derive(Debug, Default, Clone)]
pub struct ConnectionSet {
    ready: VecDeque<ConnectionId>,
    busy: BTreeSet<ConnectionId>,
}

impl ConnectionSet {
    /// No connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// `id` may accept a message. Adds it if unknown.
    pub fn mark_ready(&mut self, id: ConnectionId) {
        self.busy.remove(&id);
        if !self.ready.contains(&id) {
            self.ready.push_back(id);
        }
    }

    /// `id` is known but cannot accept messages.
    pub fn mark_busy(&mut self, id: ConnectionId) {
        self.ready.retain(|c| *c != id);
        self.busy.insert(id);
    }

    /// Forget `id`.
    pub fn remove(&mut self, id: ConnectionId) {
        self.ready.retain(|c| *c != id);
        self.busy.remove(&id);
    }

    /// Take a ready connection, rotating between them; it becomes busy.
    pub fn take_ready(&mut self) -> Option<ConnectionId> {
        let id = self.ready.pop_front()?;
        self.busy.insert(id);
        Some(id)
    }

    /// Total known connections.
    pub fn len(&self) -> usize {
        self.ready.len() + self.busy.len()
    }

    /// Whether no connection is known.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.busy.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_ready_rotates_and_marks_busy() {
        let mut set = ConnectionSet::new();
        set.mark_ready(ConnectionId(1));
        set.mark_ready(ConnectionId(2));
        set.mark_ready(ConnectionId(1));

        assert_eq!(set.take_ready(), Some(ConnectionId(1)));
        assert_eq!(set.take_ready(), Some(ConnectionId(2)));
        assert_eq!(set.take_ready(), None);
        assert_eq!(set.len(), 2);

        set.mark_ready(ConnectionId(2));
        set.remove(ConnectionId(2));
        assert_eq!(set.take_ready(), None);
        assert_eq!(set.len(), 1);

        set.mark_busy(ConnectionId(1));
        set.remove(ConnectionId(1));
        assert!(set.is_empty());
    }
}
