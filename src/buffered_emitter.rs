use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tracing::trace;

/// An event source for a single consumer that never drops an event just because nobody is
///  subscribed yet: While there is no live subscriber, events are kept in a backlog, and the
///  backlog is handed to the next subscriber in the order the events were fired.
///
/// Subscribing creates a new channel; a subscription replaces the previous one. If the
///  receiver is dropped, subsequent events are backlogged again.
pub struct BufferedEmitter<T> {
    state: Mutex<EmitterState<T>>,
}

struct EmitterState<T> {
    backlog: VecDeque<T>,
    subscriber: Option<mpsc::UnboundedSender<T>>,
}

impl<T: Send + 'static> Default for BufferedEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> BufferedEmitter<T> {
    pub fn new() -> BufferedEmitter<T> {
        BufferedEmitter {
            state: Mutex::new(EmitterState {
                backlog: VecDeque::new(),
                subscriber: None,
            }),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut state = self.state.lock().unwrap();
        if !state.backlog.is_empty() {
            trace!("new subscriber: handing over {} buffered events", state.backlog.len());
        }
        for event in state.backlog.drain(..) {
            // the receiver is alive, so this can not fail
            let _ = sender.send(event);
        }
        state.subscriber = Some(sender);

        receiver
    }

    pub fn fire(&self, event: T) {
        let mut state = self.state.lock().unwrap();

        let event = match &state.subscriber {
            Some(subscriber) => match subscriber.send(event) {
                Ok(()) => return,
                Err(SendError(event)) => {
                    trace!("subscriber is gone - buffering events");
                    event
                }
            },
            None => event,
        };

        state.subscriber = None;
        state.backlog.push_back(event);
    }

    /// discards all buffered events
    pub fn flush_buffer(&self) {
        self.state.lock().unwrap()
            .backlog.clear();
    }

    pub fn num_buffered(&self) -> usize {
        self.state.lock().unwrap()
            .backlog.len()
    }
}
