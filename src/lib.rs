//! A message-framing protocol that keeps a logical session alive across a sequence of sockets,
//!  delivering messages in order and exactly once even if the underlying connection breaks and
//!  is replaced by a new one.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (opaque chunks of bytes) over an ordered,
//!   duplex byte channel (TCP, a pipe, a websocket etc.)
//!   * the byte channel is not assumed to buffer or retransmit anything across reconnects
//! * A `Regular` message carries a sequence number, and it is kept for retransmission until the
//!   peer acknowledges it
//!   * acks are piggy-backed on all outgoing messages. An explicit `Ack` is only sent if there
//!     was no outgoing traffic for a while
//!   * a gap in the incoming sequence triggers a `ReplayRequest` (rate limited)
//! * When a socket is replaced, all unacknowledged messages are re-sent on the new socket, and
//!   the peer ignores duplicates
//! * Timeouts are *reported* rather than acted upon: the application decides whether and how to
//!   reconnect
//!   * a timeout is only reported if the local process is not under high load, since a busy
//!     process may just not have got around to reading incoming data
//! * Unsequenced `Control` messages for handshakes etc., and `Pause` / `Resume` as simple
//!   back-pressure signals
//! * Explicitly *not* in scope: encryption, authentication, multiplexing of several streams over
//!   a single session
//!
//! ## Wire format
//!
//! Every frame is a fixed-size header followed by the body, all numbers in network byte order (BE):
//!
//! ```ascii
//!  0: message type (u8):
//!      0 None (ignored)
//!      1 Regular
//!      2 Control
//!      3 Ack
//!      5 Disconnect
//!      6 ReplayRequest
//!      7 Pause
//!      8 Resume
//!      9 KeepAlive
//!  1: sequence id (u32) - for Regular messages, 0 otherwise
//!  5: ack (u32) - highest id that was received in order, 0 for 'nothing'
//!  9: body length (u32)
//! 13: body
//! ```
//!
//! ## Structure
//!
//! * [basic_protocol::BasicProtocol] does framing on a single socket without any sequencing. It
//!   is typically used for an initial handshake, after which the socket is detached and handed
//!   to a [persistent_protocol::PersistentProtocol]
//! * [persistent_protocol::PersistentProtocol] is the session. Reconnecting is done by calling
//!   `begin_accept_reconnection` with the new socket, and `end_accept_reconnection` once the
//!   application is ready for traffic
//! * [load_estimator::SchedulerLoadEstimator] is shared between sessions and must be started
//!   explicitly
//! * [socket::Socket] abstracts the byte channel, with [socket::TcpSocket] as an implementation
//!   for TCP

pub mod basic_protocol;
pub mod buffered_emitter;
pub mod chunk_stream;
pub mod config;
pub mod frame_reader;
pub mod frame_writer;
pub mod load_estimator;
pub mod message;
pub mod persistent_protocol;
pub mod retransmission_queue;
pub mod socket;

#[cfg(test)]
pub mod test_util;
