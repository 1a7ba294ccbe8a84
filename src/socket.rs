use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SocketCloseEvent {
    pub had_error: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SocketEvent {
    Data(Bytes),
    Closed(SocketCloseEvent),
}

/// The sending side of an ordered, duplex, chunked byte channel. Incoming data is delivered
///  separately as a stream of [SocketEvent]s, see [SocketConnection].
///
/// Writes are fire-and-forget; `drain()` resolves when all previously written data was handed
///  to the transport.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Socket: Send + Sync + 'static {
    fn write(&self, buf: Bytes);

    /// half-close: no more data will be written
    fn end(&self);

    async fn drain(&self);

    fn dispose(&self);
}

/// A socket together with the stream of its incoming events
pub struct SocketConnection {
    pub socket: Arc<dyn Socket>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

pub trait SocketEventHandler: Send + Sync + 'static {
    fn on_data(&self, chunk: Bytes);
    fn on_close(&self, event: SocketCloseEvent);
}

/// Forwards a socket's incoming events to a handler in a spawned task. The pump can either be
///  aborted, or stopped gracefully, which returns the event stream so that it can be handed to
///  a different owner.
pub struct SocketPump {
    stop_sender: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<mpsc::UnboundedReceiver<SocketEvent>>>,
}

impl Drop for SocketPump {
    fn drop(&mut self) {
        self.abort();
    }
}

impl SocketPump {
    pub fn spawn(events: mpsc::UnboundedReceiver<SocketEvent>, handler: impl SocketEventHandler) -> SocketPump {
        let (stop_sender, stop_receiver) = oneshot::channel();

        SocketPump {
            stop_sender: Some(stop_sender),
            handle: Some(tokio::spawn(Self::do_loop(events, handler, stop_receiver))),
        }
    }

    pub fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Stops forwarding events after the event that is currently being processed, returning
    ///  the event stream. Events that were not forwarded remain in the stream.
    pub async fn stop(mut self) -> Option<mpsc::UnboundedReceiver<SocketEvent>> {
        if let Some(stop_sender) = self.stop_sender.take() {
            let _ = stop_sender.send(());
        }

        let handle = self.handle.take()?;
        match handle.await {
            Ok(events) => Some(events),
            Err(e) => {
                debug!("socket pump terminated abnormally: {}", e);
                None
            }
        }
    }

    async fn do_loop(mut events: mpsc::UnboundedReceiver<SocketEvent>, handler: impl SocketEventHandler, mut stop_receiver: oneshot::Receiver<()>) -> mpsc::UnboundedReceiver<SocketEvent> {
        loop {
            select! {
                biased;
                _ = &mut stop_receiver => {
                    trace!("socket pump stopped");
                    break;
                }
                evt = events.recv() => match evt {
                    Some(SocketEvent::Data(chunk)) => handler.on_data(chunk),
                    Some(SocketEvent::Closed(close_event)) => {
                        handler.on_close(close_event);
                        break;
                    }
                    None => {
                        debug!("socket event stream ended without a close event");
                        handler.on_close(SocketCloseEvent { had_error: true });
                        break;
                    }
                }
            }
        }
        events
    }
}


const READ_BUFFER_SIZE: usize = 64 * 1024;

enum WriteCommand {
    Data(Bytes),
    Drain(oneshot::Sender<()>),
    End,
    Dispose,
}

/// [Socket] implementation on top of a TCP connection. Reading and writing happen in two
///  spawned tasks, and writes are serialized through a channel to the writing task.
pub struct TcpSocket {
    peer_addr: SocketAddr,
    commands: mpsc::UnboundedSender<WriteCommand>,
    read_handle: JoinHandle<()>,
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl TcpSocket {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<SocketConnection> {
        let stream = TcpStream::connect(addr).await?;
        debug!("connected to {:?}", addr);
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> anyhow::Result<SocketConnection> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (event_sender, events) = mpsc::unbounded_channel();
        let (commands, command_receiver) = mpsc::unbounded_channel();

        let read_handle = tokio::spawn(Self::read_loop(peer_addr, read_half, event_sender));
        tokio::spawn(Self::write_loop(peer_addr, write_half, command_receiver));

        Ok(SocketConnection {
            socket: Arc::new(TcpSocket {
                peer_addr,
                commands,
                read_handle,
            }),
            events,
        })
    }

    fn send_command(&self, command: WriteCommand) -> bool {
        if self.commands.send(command).is_err() {
            trace!("socket to {:?} is disposed - ignoring", self.peer_addr);
            return false;
        }
        true
    }

    async fn read_loop(peer_addr: SocketAddr, mut read_half: OwnedReadHalf, events: mpsc::UnboundedSender<SocketEvent>) {
        loop {
            let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
            let event = match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!("connection closed by {:?}", peer_addr);
                    SocketEvent::Closed(SocketCloseEvent { had_error: false })
                }
                Ok(n) => {
                    trace!("received {} bytes from {:?}", n, peer_addr);
                    SocketEvent::Data(buf.freeze())
                }
                Err(e) => {
                    debug!("error reading from {:?}: {}", peer_addr, e);
                    SocketEvent::Closed(SocketCloseEvent { had_error: true })
                }
            };

            let is_closed = matches!(event, SocketEvent::Closed(_));
            if events.send(event).is_err() {
                trace!("socket events from {:?} are not consumed any longer - stopping read loop", peer_addr);
                return;
            }
            if is_closed {
                return;
            }
        }
    }

    async fn write_loop(peer_addr: SocketAddr, mut write_half: OwnedWriteHalf, mut commands: mpsc::UnboundedReceiver<WriteCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                WriteCommand::Data(buf) => {
                    //NB: write errors show up on the read side as well, so they are only logged here
                    if let Err(e) = write_half.write_all(&buf).await {
                        debug!("error writing {} bytes to {:?}: {}", buf.len(), peer_addr, e);
                    }
                }
                WriteCommand::Drain(done) => {
                    if let Err(e) = write_half.flush().await {
                        debug!("error flushing socket to {:?}: {}", peer_addr, e);
                    }
                    let _ = done.send(());
                }
                WriteCommand::End => {
                    if let Err(e) = write_half.shutdown().await {
                        debug!("error shutting down socket to {:?}: {}", peer_addr, e);
                    }
                }
                WriteCommand::Dispose => break,
            }
        }
        trace!("write loop for {:?} terminated", peer_addr);
    }
}

#[async_trait]
impl Socket for TcpSocket {
    fn write(&self, buf: Bytes) {
        self.send_command(WriteCommand::Data(buf));
    }

    fn end(&self) {
        self.send_command(WriteCommand::End);
    }

    async fn drain(&self) {
        let (done_sender, done_receiver) = oneshot::channel();
        if self.send_command(WriteCommand::Drain(done_sender)) {
            let _ = done_receiver.await;
        }
    }

    /// Stops reading immediately. Data that was written before is still sent.
    fn dispose(&self) {
        self.read_handle.abort();
        self.send_command(WriteCommand::Dispose);
    }
}
