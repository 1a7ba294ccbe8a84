use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::trace;
use crate::chunk_stream::ChunkStream;
use crate::message::{FrameHeader, ProtocolMessage};

#[derive(Copy, Clone, Debug)]
enum ReadState {
    AwaitingHeader,
    AwaitingBody(FrameHeader),
}

/// Parses a stream of incoming byte chunks into frames. This is pull-based: chunks are added
///  via [FrameReader::accept_chunk], and complete messages are taken out via
///  [FrameReader::next_message] until it returns `None`.
pub struct FrameReader {
    incoming: ChunkStream,
    state: ReadState,
    is_disposed: bool,
    last_read_time: Instant,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> FrameReader {
        FrameReader {
            incoming: ChunkStream::new(),
            state: ReadState::AwaitingHeader,
            is_disposed: false,
            last_read_time: Instant::now(),
        }
    }

    /// the time when the most recent (non-empty) chunk of data arrived
    pub fn last_read_time(&self) -> Instant {
        self.last_read_time
    }

    pub fn accept_chunk(&mut self, chunk: Bytes) {
        if self.is_disposed || chunk.is_empty() {
            return;
        }
        trace!("accepting chunk of {} bytes", chunk.len());
        self.last_read_time = Instant::now();
        self.incoming.accept_chunk(chunk);
    }

    /// Returns the next complete message, or `None` if the buffered data does not contain one.
    ///
    /// NB: Disposal is checked on every call, so a caller that dispatches messages one by one
    ///      stops as soon as the reader is disposed during dispatch
    pub fn next_message(&mut self) -> Option<ProtocolMessage> {
        loop {
            if self.is_disposed {
                return None;
            }

            match self.state {
                ReadState::AwaitingHeader => {
                    if self.incoming.len() < FrameHeader::SERIALIZED_LEN {
                        return None;
                    }
                    let mut buf = self.incoming.read(FrameHeader::SERIALIZED_LEN)
                        .expect("this is a bug: available length was checked");
                    let header = FrameHeader::deser(&mut buf)
                        .expect("this is a bug: the header buffer has exactly the header length");
                    self.state = ReadState::AwaitingBody(header);
                }
                ReadState::AwaitingBody(header) => {
                    let body_len = header.body_len as usize;
                    if self.incoming.len() < body_len {
                        return None;
                    }
                    let body = self.incoming.read(body_len)
                        .expect("this is a bug: available length was checked");
                    self.state = ReadState::AwaitingHeader;

                    let message = ProtocolMessage::new(header.message_type, header.id, header.ack, body);
                    trace!("read {:?}", message);
                    return Some(message);
                }
            }
        }
    }

    /// Hands off all bytes that were received but not consumed as complete messages. If a header
    ///  was parsed already but its body is incomplete, the header is re-serialized in front of
    ///  the residual bytes so that the result is a valid frame stream again.
    pub fn read_entire_buffer(&mut self) -> Bytes {
        let rest = self.incoming.read_all();

        match std::mem::replace(&mut self.state, ReadState::AwaitingHeader) {
            ReadState::AwaitingHeader => rest,
            ReadState::AwaitingBody(header) => {
                let mut buf = BytesMut::with_capacity(FrameHeader::SERIALIZED_LEN + rest.len());
                header.ser(&mut buf);
                buf.put_slice(&rest);
                buf.freeze()
            }
        }
    }

    pub fn dispose(&mut self) {
        self.is_disposed = true;
    }
}
