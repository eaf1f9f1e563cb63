use std::collections::VecDeque;

use tracing::warn;

pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// A routed, serialized alert waiting for the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
}

/// Bounded FIFO of unsent messages. When full, the oldest entry is evicted to
/// admit the newest.
#[derive(Debug)]
pub struct OutgoingBuffer {
    queue: VecDeque<OutgoingMessage>,
    capacity: usize,
    evicted: u64,
}

impl OutgoingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_CAPACITY)),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    pub fn enqueue(&mut self, message: OutgoingMessage) {
        while self.queue.len() >= self.capacity {
            if let Some(old) = self.queue.pop_front() {
                self.evicted += 1;
                warn!(routing_key = %old.routing_key, "outgoing buffer full, evicted oldest message");
            }
        }
        self.queue.push_back(message);
    }

    /// Put a message that failed mid-flush back at the head. It is the oldest
    /// entry, so it is the one discarded when the buffer has filled meanwhile.
    pub fn requeue_front(&mut self, message: OutgoingMessage) -> bool {
        if self.queue.len() >= self.capacity {
            self.evicted += 1;
            return false;
        }
        self.queue.push_front(message);
        true
    }

    pub fn pop_front(&mut self) -> Option<OutgoingMessage> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl Default for OutgoingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(i: usize) -> OutgoingMessage {
        OutgoingMessage {
            routing_key: "anomaly.orders".to_string(),
            payload: format!("{i}").into_bytes(),
        }
    }

    fn drain(buf: &mut OutgoingBuffer) -> Vec<String> {
        std::iter::from_fn(|| buf.pop_front())
            .map(|m| String::from_utf8(m.payload).unwrap())
            .collect()
    }

    #[test]
    fn overflow_keeps_newest_in_order() {
        let mut buf = OutgoingBuffer::new(3);
        for i in 0..4 {
            buf.enqueue(msg(i));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.evicted(), 1);
        assert_eq!(drain(&mut buf), vec!["1", "2", "3"]);
    }

    #[test]
    fn default_capacity_is_one_thousand() {
        let mut buf = OutgoingBuffer::default();
        for i in 0..1001 {
            buf.enqueue(msg(i));
        }
        assert_eq!(buf.len(), 1000);
        assert_eq!(buf.pop_front().unwrap().payload, b"1".to_vec());
    }

    #[test]
    fn requeue_front_restores_head() {
        let mut buf = OutgoingBuffer::new(3);
        buf.enqueue(msg(1));
        buf.enqueue(msg(2));
        let head = buf.pop_front().unwrap();
        assert!(buf.requeue_front(head));
        assert_eq!(drain(&mut buf), vec!["1", "2"]);
    }

    #[test]
    fn requeue_front_drops_when_full() {
        let mut buf = OutgoingBuffer::new(2);
        buf.enqueue(msg(1));
        buf.enqueue(msg(2));
        assert!(!buf.requeue_front(msg(0)));
        assert_eq!(drain(&mut buf), vec!["1", "2"]);
    }
}
