//! Per-tunnel FIFO of plaintext records awaiting a ready connection.
//!
//! Records are encrypted when they leave the queue, not when they enter it,
//! so ratchet counters follow transmission order. Each entry carries a
//! [`SendOrigin`] telling the tunnel whom to notify once the record has been
//! handed to a connection.

use std::collections::VecDeque;

use cadet_proto::{ChannelNumber, ChannelRecord, Mid};

/// Handle for a queued record, usable to cancel it before transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueHandle(u64);

/// Control record kinds a channel tracks completion for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// `ChannelOpen`
    Open,
    /// `ChannelOpenAck`
    OpenAck,
    /// `AppDataAck`
    DataAck,
    /// `ChannelDestroy`
    Destroy,
}

/// Who queued a record and what completing it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOrigin {
    /// Tunnel-level record (keepalive, echoed destroy); nothing to notify
    Tunnel,
    /// Channel control record
    ChannelControl {
        /// Owning channel
        ctn: ChannelNumber,
        /// Which control record
        kind: ControlKind,
    },
    /// Application payload; the channel starts its retransmission timer
    ChannelData {
        /// Owning channel
        ctn: ChannelNumber,
        /// Sequence number of the payload
        mid: Mid,
    },
}

/// One queued record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRecord {
    /// Cancellation handle
    pub handle: QueueHandle,
    /// Plaintext record
    pub record: ChannelRecord,
    /// Completion target
    pub origin: SendOrigin,
}

/// FIFO send queue.
#[derive(Debug, Default)]
pub struct SendQueue {
    entries: VecDeque<QueuedRecord>,
    next_handle: u64,
}

impl SendQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn push(&mut self, record: ChannelRecord, origin: SendOrigin) -> QueueHandle {
        let handle = QueueHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.push_back(QueuedRecord { handle, record, origin });
        handle
    }

    /// Remove a record that has not been transmitted yet.
    pub fn cancel(&mut self, handle: QueueHandle) -> Option<QueuedRecord> {
        let index = self.entries.iter().position(|entry| entry.handle == handle)?;
        self.entries.remove(index)
    }

    /// Take the oldest record.
    pub fn pop_front(&mut self) -> Option<QueuedRecord> {
        self.entries.pop_front()
    }

    /// Number of queued records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use cadet_proto::ChannelDestroy;

    use super::*;

    fn destroy(n: u32) -> ChannelRecord {
        ChannelRecord::ChannelDestroy(ChannelDestroy { ctn: ChannelNumber(n) })
    }

    #[test]
    fn fifo_order_and_cancel() {
        let mut queue = SendQueue::new();
        let a = queue.push(destroy(1), SendOrigin::Tunnel);
        let b = queue.push(destroy(2), SendOrigin::Tunnel);
        let c = queue.push(destroy(3), SendOrigin::Tunnel);

        assert!(queue.cancel(b).is_some());
        assert!(queue.cancel(b).is_none());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop_front().map(|e| e.handle), Some(a));
        assert_eq!(queue.pop_front().map(|e| e.handle), Some(c));
        assert!(queue.is_empty());
    }

    #[test]
    fn popped_record_cannot_be_cancelled() {
        let mut queue = SendQueue::new();
        let ctn = ChannelNumber(5);
        let data = queue.push(ChannelRecord::Keepalive, SendOrigin::ChannelData { ctn, mid: Mid(0) });
        queue.push(destroy(5), SendOrigin::ChannelControl { ctn, kind: ControlKind::Destroy });

        let sent = queue.pop_front().unwrap();
        assert_eq!(sent.origin, SendOrigin::ChannelData { ctn, mid: Mid(0) });
        assert!(queue.cancel(data).is_none());
        assert_eq!(queue.len(), 1);
    }
}
