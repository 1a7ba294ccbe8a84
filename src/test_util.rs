use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use crate::frame_reader::FrameReader;
use crate::message::{ProtocolMessage, ProtocolMessageType};
use crate::socket::{Socket, SocketCloseEvent, SocketConnection, SocketEvent};

/// A socket that records everything written to it, decoding it back into frames on request
#[derive(Default)]
pub struct RecordingSocket {
    writes: Mutex<Vec<Bytes>>,
    num_taken: AtomicUsize,
    num_drains: AtomicUsize,
    is_disposed: AtomicBool,
}

impl RecordingSocket {
    pub fn num_writes(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn num_drains(&self) -> usize {
        self.num_drains.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::Acquire)
    }

    /// all messages written so far
    pub fn written_messages(&self) -> Vec<ProtocolMessage> {
        let mut reader = FrameReader::new();
        for chunk in self.writes.lock().unwrap().iter() {
            reader.accept_chunk(chunk.clone());
        }

        let mut result = Vec::new();
        while let Some(msg) = reader.next_message() {
            result.push(msg);
        }
        assert!(reader.read_entire_buffer().is_empty(), "socket received an incomplete frame");
        result
    }

    /// messages written since the previous call
    pub fn take_messages(&self) -> Vec<ProtocolMessage> {
        let all = self.written_messages();
        let num_taken = self.num_taken.swap(all.len(), Ordering::AcqRel);
        all.into_iter().skip(num_taken).collect()
    }

    /// types of the messages written since the previous call to `take_messages()`
    pub fn take_types(&self) -> Vec<ProtocolMessageType> {
        self.take_messages().into_iter()
            .map(|m| m.message_type)
            .collect()
    }
}

#[async_trait]
impl Socket for RecordingSocket {
    fn write(&self, buf: Bytes) {
        if self.is_disposed() {
            return;
        }
        self.writes.lock().unwrap().push(buf);
    }

    fn end(&self) {}

    async fn drain(&self) {
        self.num_drains.fetch_add(1, Ordering::AcqRel);
    }

    fn dispose(&self) {
        self.is_disposed.store(true, Ordering::Release);
    }
}

/// A connection with a [RecordingSocket], along with the sender for its incoming events
pub fn connection() -> (Arc<RecordingSocket>, SocketConnection, mpsc::UnboundedSender<SocketEvent>) {
    let socket = Arc::new(RecordingSocket::default());
    let (event_sender, events) = mpsc::unbounded_channel();
    let connection = SocketConnection {
        socket: socket.clone(),
        events,
    };
    (socket, connection, event_sender)
}

pub fn frame(message_type: ProtocolMessageType, id: u32, ack: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    ProtocolMessage::new(message_type, id, ack, Bytes::copy_from_slice(data))
        .ser(&mut buf);
    buf.freeze()
}

pub fn data_event(message_type: ProtocolMessageType, id: u32, ack: u32, data: &[u8]) -> SocketEvent {
    SocketEvent::Data(frame(message_type, id, ack, data))
}

pub fn close_event(had_error: bool) -> SocketEvent {
    SocketEvent::Closed(SocketCloseEvent { had_error })
}

/// gives spawned tasks the chance to run to completion
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn drain_receiver<T>(receiver: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut result = Vec::new();
    while let Ok(evt) = receiver.try_recv() {
        result.push(evt);
    }
    result
}
