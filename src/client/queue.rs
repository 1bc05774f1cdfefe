//! Outgoing queue for messages sent before the key exchange completes.

/// Bounded FIFO of plaintext messages. Once full, newly offered messages
/// are dropped; already-queued messages are never displaced.
#[derive(Debug)]
pub struct OutgoingQueue {
    messages: Vec<Vec<u8>>,
    capacity: usize,
}

impl OutgoingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Vec::new(),
            capacity,
        }
    }

    /// Append a message. Returns `false` if it was dropped because the
    /// queue is full.
    pub fn push(&mut self, message: Vec<u8>) -> bool {
        if self.messages.len() >= self.capacity {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Swap the contents out for an empty queue, preserving enqueue order.
    pub fn take(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.messages)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.capacity
    }
}
