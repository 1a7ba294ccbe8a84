use std::sync::{Arc, Mutex, Weak};
use bytes::BytesMut;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;
use crate::message::ProtocolMessage;
use crate::socket::Socket;

struct FrameWriterInner {
    socket: Arc<dyn Socket>,
    pending: BytesMut,
    is_paused: bool,
    is_disposed: bool,
    deferred_flush_handle: Option<JoinHandle<()>>,
}

impl FrameWriterInner {
    fn do_flush(&mut self) {
        if let Some(handle) = self.deferred_flush_handle.take() {
            handle.abort();
        }

        if self.is_paused || self.is_disposed || self.pending.is_empty() {
            return;
        }

        trace!("flushing {} bytes to socket", self.pending.len());
        self.socket.write(self.pending.split().freeze());
    }
}

/// Serializes messages into a pending buffer that is flushed to the socket by a spawned task.
///  All messages written before that task runs go to the socket in a single write.
///
/// Clones share the same buffer and socket.
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<FrameWriterInner>>,
}

impl FrameWriter {
    pub fn new(socket: Arc<dyn Socket>) -> FrameWriter {
        FrameWriter {
            inner: Arc::new(Mutex::new(FrameWriterInner {
                socket,
                pending: BytesMut::new(),
                is_paused: false,
                is_disposed: false,
                deferred_flush_handle: None,
            })),
        }
    }

    pub fn write(&self, message: &mut ProtocolMessage) {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_disposed {
            // e.g. a response to a request that was cancelled in the meantime
            trace!("writer is disposed - ignoring {:?}", message);
            return;
        }

        message.written_time = Some(Instant::now());
        trace!("writing {:?}", message);

        let was_empty = inner.pending.is_empty();
        message.ser(&mut inner.pending);

        if was_empty && !inner.is_paused && inner.deferred_flush_handle.is_none() {
            let weak_inner = Arc::downgrade(&self.inner);
            inner.deferred_flush_handle = Some(tokio::spawn(Self::deferred_flush(weak_inner)));
        }
    }

    async fn deferred_flush(inner: Weak<Mutex<FrameWriterInner>>) {
        if let Some(inner) = inner.upgrade() {
            let mut inner = inner.lock().unwrap();
            // this task is running, so there is nothing to abort
            inner.deferred_flush_handle = None;
            inner.do_flush();
        }
    }

    /// sends everything that is pending right away - unless the writer is paused
    pub fn flush(&self) {
        self.inner.lock().unwrap().do_flush();
    }

    pub fn pause(&self) {
        trace!("pausing writer");
        self.inner.lock().unwrap().is_paused = true;
    }

    pub fn resume(&self) {
        trace!("resuming writer");
        let mut inner = self.inner.lock().unwrap();
        inner.is_paused = false;
        inner.do_flush();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().is_paused
    }

    pub fn num_pending_bytes(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub async fn drain(&self) {
        let socket = {
            let mut inner = self.inner.lock().unwrap();
            inner.do_flush();
            inner.socket.clone()
        };
        socket.drain().await;
    }

    /// Flushes pending data (if not paused) one last time. Subsequent writes are ignored. The
    ///  socket itself is not disposed.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_disposed {
            return;
        }
        inner.do_flush();
        inner.is_disposed = true;
        inner.pending.clear();
    }
}
