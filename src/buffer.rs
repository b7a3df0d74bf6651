use bytes::Bytes;
use std::collections::VecDeque;

/// A sensor message parked while the broker link is down.
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub node_id: u32,
    pub payload: Bytes,
}

/// Bounded FIFO buffer shielding the broker link from outages.
///
/// Inserts beyond capacity are rejected, keeping the oldest messages. The
/// drain hands back every entry in arrival order and always leaves the
/// buffer empty; replay failures are the caller's to count.
#[derive(Debug)]
pub struct StoreForwardBuffer {
    entries: VecDeque<BufferedMessage>,
    capacity: usize,
}

impl StoreForwardBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity), capacity }
    }

    /// Appends a message if there is room. Returns whether it was accepted.
    pub fn try_enqueue(&mut self, node_id: u32, payload: Bytes) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push_back(BufferedMessage { node_id, payload });
        true
    }

    /// Removes and returns all buffered messages in arrival order.
    pub fn take_all(&mut self) -> Vec<BufferedMessage> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
