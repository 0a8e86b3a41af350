//! Open-port registry shared by all tunnels of a service.

use std::collections::HashMap;

use cadet_proto::PortHash;

use crate::error::ServiceError;

/// Identifies one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Answers whether a port has a listener.
///
/// Tunnels consult this when a peer opens a channel; the service owns the
/// actual registry.
pub trait PortLookup {
    /// Listener bound to `port`, if any.
    fn lookup_open_port(&self, port: &PortHash) -> Option<ListenerId>;
}

/// Ports with a local listener.
#[derive(Debug, Default, Clone)]
pub struct OpenPorts {
    by_hash: HashMap<PortHash, ListenerId>,
    next_listener: u64,
}

impl OpenPorts {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener on `port`.
    ///
    /// # Errors
    ///
    /// - `ServiceError::PortAlreadyOpen` if a listener exists
    pub fn open(&mut self, port: PortHash) -> Result<ListenerId, ServiceError> {
        if self.by_hash.contains_key(&port) {
            return Err(ServiceError::PortAlreadyOpen);
        }
        let listener = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.by_hash.insert(port, listener);
        Ok(listener)
    }

    /// Remove the listener on `port`.
    ///
    /// # Errors
    ///
    /// - `ServiceError::PortNotOpen` if no listener exists
    pub fn close(&mut self, port: &PortHash) -> Result<ListenerId, ServiceError> {
        self.by_hash.remove(port).ok_or(ServiceError::PortNotOpen)
    }

    /// Number of open ports.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// Whether no port is open.
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

impl PortLookup for OpenPorts {
    fn lookup_open_port(&self, port: &PortHash) -> Option<ListenerId> {
        self.by_hash.get(port).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_twice_is_rejected_until_closed() {
        let mut ports = OpenPorts::new();
        let port = PortHash([9; 32]);

        let first = ports.open(port).unwrap();
        assert_eq!(ports.open(port), Err(ServiceError::PortAlreadyOpen));
        assert_eq!(ports.lookup_open_port(&port), Some(first));

        assert_eq!(ports.close(&port), Ok(first));
        assert_eq!(ports.close(&port), Err(ServiceError::PortNotOpen));
        assert!(ports.is_empty());

        let second = ports.open(port).unwrap();
        assert_ne!(first, second);
    }
}
