//! Bounded per-room message history

use std::collections::VecDeque;

use crate::protocol::ChatMessage;

/// Default number of messages kept per room
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// FIFO buffer of the most recent messages; the oldest is evicted first
#[derive(Debug, Clone)]
pub struct MessageHistory {
    capacity: usize,
    messages: VecDeque<ChatMessage>,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl MessageHistory {
    /// A zero capacity is bumped to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            messages: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a message, returning the evicted one if the buffer was full
    pub fn push(&mut self, message: ChatMessage) -> Option<ChatMessage> {
        let evicted = if self.messages.len() == self.capacity {
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(message);
        evicted
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Oldest first
    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;
    use crate::registry::RoomId;

    fn message(n: usize) -> ChatMessage {
        ChatMessage {
            id: format!("m{}", n),
            room_id: RoomId::from("r"),
            text: n.to_string(),
            sender_id: "u".to_string(),
            sender_name: "U".to_string(),
            conn_id: ConnectionId::next(),
            timestamp: n as i64,
        }
    }

    #[test]
    fn test_keeps_last_hundred_in_order() {
        let mut history = MessageHistory::default();
        for n in 0..250 {
            history.push(message(n));
        }

        assert_eq!(history.len(), 100);
        let texts: Vec<String> = history.to_vec().into_iter().map(|m| m.text).collect();
        let expected: Vec<String> = (150..250).map(|n| n.to_string()).collect();
        assert_eq!(texts, expected);
    }

    #[test]
    fn test_push_reports_eviction() {
        let mut history = MessageHistory::new(2);
        assert!(history.push(message(1)).is_none());
        assert!(history.push(message(2)).is_none());
        let evicted = history.push(message(3)).unwrap();
        assert_eq!(evicted.text, "1");
        assert_eq!(history.to_vec().len(), 2);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut history = MessageHistory::new(0);
        history.push(message(1));
        history.push(message(2));
        assert_eq!(history.len(), 1);
        assert_eq!(history.to_vec()[0].text, "2");
    }
}
