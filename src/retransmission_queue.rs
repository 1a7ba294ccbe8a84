use std::collections::VecDeque;
use tracing::trace;
use crate::message::ProtocolMessage;

/// FIFO of sent `Regular` messages that were not acknowledged yet. Ids are strictly increasing
///  from front to back, and messages are only ever removed from the front.
#[derive(Default)]
pub struct RetransmissionQueue {
    messages: VecDeque<ProtocolMessage>,
}

impl RetransmissionQueue {
    pub fn new() -> RetransmissionQueue {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: ProtocolMessage) {
        if let Some(last) = self.messages.back() {
            assert!(last.id < message.id, "this is a bug: message ids must be increasing, {} after {}", message.id, last.id);
        }
        self.messages.push_back(message);
    }

    /// Removes all messages with an id up to and including `ack`, returning the number of removed
    ///  messages
    pub fn acknowledge(&mut self, ack: u32) -> usize {
        let mut num_removed = 0;
        while let Some(first) = self.messages.front() {
            if first.id > ack {
                break;
            }
            self.messages.pop_front();
            num_removed += 1;
        }
        if num_removed > 0 {
            trace!("ack #{}: removed {} messages from the retransmission queue", ack, num_removed);
        }
        num_removed
    }

    pub fn oldest(&self) -> Option<&ProtocolMessage> {
        self.messages.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtocolMessage> {
        self.messages.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProtocolMessage> {
        self.messages.iter_mut()
    }
}
