use std::sync::{Arc, Mutex};
use anyhow::bail;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use crate::buffered_emitter::BufferedEmitter;
use crate::frame_reader::FrameReader;
use crate::frame_writer::FrameWriter;
use crate::message::{check_payload_len, ProtocolMessage, ProtocolMessageType};
use crate::socket::{Socket, SocketCloseEvent, SocketConnection, SocketEventHandler, SocketPump};

struct BasicReadState {
    reader: FrameReader,
    stop_after_first_message: bool,
    is_stopped: bool,
}

struct BasicProtocolShared {
    read_state: Mutex<BasicReadState>,
    message_emitter: BufferedEmitter<Bytes>,
    close_emitter: BufferedEmitter<SocketCloseEvent>,
}

struct BasicSocketHandler {
    shared: Arc<BasicProtocolShared>,
}

impl SocketEventHandler for BasicSocketHandler {
    fn on_data(&self, chunk: Bytes) {
        let mut read_state = self.shared.read_state.lock().unwrap();
        read_state.reader.accept_chunk(chunk);

        // after stopping, data is only buffered for `detach()`
        while !read_state.is_stopped {
            let Some(msg) = read_state.reader.next_message() else {
                break;
            };

            match msg.message_type {
                ProtocolMessageType::Regular => {
                    self.shared.message_emitter.fire(msg.data);
                    if read_state.stop_after_first_message {
                        debug!("received handshake message - leaving subsequent data for the next protocol");
                        read_state.is_stopped = true;
                    }
                }
                _ => trace!("ignoring {:?}", msg),
            }
        }
    }

    fn on_close(&self, event: SocketCloseEvent) {
        debug!("socket closed: {:?}", event);
        self.shared.close_emitter.fire(event);
    }
}

/// Framing on top of a single socket, without sequencing, acknowledgements or retransmission:
///  if the socket goes away, so does everything that was in flight.
///
/// This is typically used for a handshake, after which the socket is detached and handed to a
///  [crate::persistent_protocol::PersistentProtocol].
pub struct BasicProtocol {
    socket: Arc<dyn Socket>,
    writer: FrameWriter,
    shared: Arc<BasicProtocolShared>,
    pump: Option<SocketPump>,
}

impl Drop for BasicProtocol {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl BasicProtocol {
    /// `initial_chunk` is data that was read from the socket before it was handed to this protocol
    pub fn new(connection: SocketConnection, initial_chunk: Option<Bytes>) -> BasicProtocol {
        Self::create(connection, initial_chunk, false)
    }

    /// Creates a protocol that processes a single `Regular` message and then stops, leaving
    ///  all data received after that message unprocessed. This is for handshakes where the peer
    ///  switches to a different protocol right after its handshake message: the data that
    ///  [BasicProtocol::detach] returns is then exactly what the peer sent after it.
    pub fn new_handshake(connection: SocketConnection, initial_chunk: Option<Bytes>) -> BasicProtocol {
        Self::create(connection, initial_chunk, true)
    }

    fn create(connection: SocketConnection, initial_chunk: Option<Bytes>, stop_after_first_message: bool) -> BasicProtocol {
        let shared = Arc::new(BasicProtocolShared {
            read_state: Mutex::new(BasicReadState {
                reader: FrameReader::new(),
                stop_after_first_message,
                is_stopped: false,
            }),
            message_emitter: BufferedEmitter::new(),
            close_emitter: BufferedEmitter::new(),
        });

        let handler = BasicSocketHandler { shared: shared.clone() };
        if let Some(initial_chunk) = initial_chunk {
            handler.on_data(initial_chunk);
        }

        BasicProtocol {
            socket: connection.socket.clone(),
            writer: FrameWriter::new(connection.socket),
            shared,
            pump: Some(SocketPump::spawn(connection.events, handler)),
        }
    }

    pub fn send(&self, data: Bytes) -> anyhow::Result<()> {
        check_payload_len(data.len())?;
        self.writer.write(&mut ProtocolMessage::new(ProtocolMessageType::Regular, 0, 0, data));
        Ok(())
    }

    /// There is no session to terminate at this level
    pub fn send_disconnect(&self) {
        trace!("disconnect on basic protocol - ignoring");
    }

    pub async fn drain(&self) {
        self.writer.drain().await;
    }

    pub fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.shared.message_emitter.subscribe()
    }

    pub fn subscribe_close(&self) -> mpsc::UnboundedReceiver<SocketCloseEvent> {
        self.shared.close_emitter.subscribe()
    }

    /// Stops processing the socket's events and returns the socket along with all incoming data
    ///  that was not processed yet, for passing both on to a different protocol. Pending outgoing
    ///  data is flushed to the socket.
    pub async fn detach(mut self) -> anyhow::Result<(SocketConnection, Bytes)> {
        let Some(pump) = self.pump.take() else {
            bail!("protocol is disposed");
        };
        let Some(events) = pump.stop().await else {
            bail!("socket event processing terminated abnormally");
        };

        self.writer.dispose();

        let residual = {
            let mut read_state = self.shared.read_state.lock().unwrap();
            let residual = read_state.reader.read_entire_buffer();
            read_state.reader.dispose();
            residual
        };
        debug!("detaching socket with {} bytes of unprocessed data", residual.len());

        Ok((SocketConnection { socket: self.socket.clone(), events }, residual))
    }

    /// Stops processing socket events and disposes the reader and writer. The socket itself is
    ///  left alone.
    pub fn dispose(&mut self) {
        if let Some(mut pump) = self.pump.take() {
            trace!("disposing basic protocol");
            pump.abort();
        }
        self.writer.dispose();
        self.shared.read_state.lock().unwrap()
            .reader.dispose();
    }
}
