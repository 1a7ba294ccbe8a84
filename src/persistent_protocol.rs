use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use crate::buffered_emitter::BufferedEmitter;
use crate::config::ProtocolConfig;
use crate::frame_reader::FrameReader;
use crate::frame_writer::FrameWriter;
use crate::load_estimator::LoadEstimator;
use crate::message::{check_payload_len, ProtocolMessage, ProtocolMessageType};
use crate::retransmission_queue::RetransmissionQueue;
use crate::socket::{Socket, SocketCloseEvent, SocketConnection, SocketEvent, SocketEventHandler, SocketPump};

/// Snapshot of a session's sequence bookkeeping
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SessionCounters {
    /// id of the most recently sent `Regular` message
    pub outgoing_msg_id: u32,
    /// highest id the peer acknowledged
    pub outgoing_ack_id: u32,
    /// id of the most recent `Regular` message that was received in order
    pub incoming_msg_id: u32,
    /// highest incoming id that was acknowledged to the peer
    pub incoming_ack_id: u32,
}

/// Emitted when sent messages remain unacknowledged and nothing at all was received from the
///  peer for the configured timeout. Handling this (e.g. by reconnecting) is up to the
///  application.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SocketTimeoutEvent {
    pub unacknowledged_msg_count: usize,
    pub time_since_oldest_unacknowledged_msg: Duration,
    pub time_since_last_received_some_data: Duration,
}

struct ProtocolState {
    counters: SessionCounters,
    is_reconnecting: bool,
    is_disposed: bool,
    did_send_disconnect: bool,

    socket: Arc<dyn Socket>,
    /// incremented for every new socket, so that events from replaced sockets can be told apart
    socket_generation: u64,
    reader: FrameReader,
    writer: FrameWriter,
    pump: Option<SocketPump>,

    unacknowledged: RetransmissionQueue,

    incoming_msg_last_time: Instant,
    last_replay_request_time: Option<Instant>,
    last_socket_timeout_time: Instant,

    ack_check_handle: Option<JoinHandle<()>>,
    timeout_check_handle: Option<JoinHandle<()>>,
    keep_alive_handle: Option<JoinHandle<()>>,
}

impl ProtocolState {
    fn abort_timers(&mut self) {
        for handle in [self.ack_check_handle.take(), self.timeout_check_handle.take(), self.keep_alive_handle.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }

    fn write_control_message(&self, message_type: ProtocolMessageType, ack: u32) {
        self.writer.write(&mut ProtocolMessage::empty(message_type, 0, ack));
    }
}

struct PersistentProtocolInner {
    config: Arc<ProtocolConfig>,
    load_estimator: Arc<dyn LoadEstimator>,
    state: Mutex<ProtocolState>,

    message_emitter: BufferedEmitter<Bytes>,
    control_emitter: BufferedEmitter<Bytes>,
    disconnect_emitter: BufferedEmitter<()>,
    socket_close_emitter: BufferedEmitter<SocketCloseEvent>,
    socket_timeout_emitter: BufferedEmitter<SocketTimeoutEvent>,
}

struct PersistentSocketHandler {
    inner: Weak<PersistentProtocolInner>,
    socket_generation: u64,
}

impl SocketEventHandler for PersistentSocketHandler {
    fn on_data(&self, chunk: Bytes) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_socket_data(self.socket_generation, chunk);
        }
    }

    fn on_close(&self, event: SocketCloseEvent) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_socket_close(self.socket_generation, event);
        }
    }
}

impl PersistentProtocolInner {
    fn spawn_pump(self: &Arc<Self>, state: &mut ProtocolState, connection_events: mpsc::UnboundedReceiver<SocketEvent>) {
        let handler = PersistentSocketHandler {
            inner: Arc::downgrade(self),
            socket_generation: state.socket_generation,
        };
        state.pump = Some(SocketPump::spawn(connection_events, handler));
    }

    fn on_socket_data(self: &Arc<Self>, socket_generation: u64, chunk: Bytes) {
        let mut state = self.state.lock().unwrap();
        if state.socket_generation != socket_generation || state.is_disposed {
            trace!("ignoring data from a replaced socket");
            return;
        }

        state.reader.accept_chunk(chunk);
        self.process_incoming(&mut state);
    }

    fn on_socket_close(&self, socket_generation: u64, event: SocketCloseEvent) {
        let state = self.state.lock().unwrap();
        if state.socket_generation != socket_generation || state.is_disposed {
            trace!("ignoring close of a replaced socket");
            return;
        }

        debug!("socket closed: {:?}", event);
        self.socket_close_emitter.fire(event);
    }

    fn process_incoming(self: &Arc<Self>, state: &mut ProtocolState) {
        while let Some(msg) = state.reader.next_message() {
            self.receive_message(state, msg);
        }
    }

    fn receive_message(self: &Arc<Self>, state: &mut ProtocolState, msg: ProtocolMessage) {
        let ack = if msg.ack > state.counters.outgoing_msg_id {
            warn!("peer acknowledged #{} but only #{} was sent - ignoring the excess", msg.ack, state.counters.outgoing_msg_id);
            state.counters.outgoing_msg_id
        }
        else {
            msg.ack
        };
        if ack > state.counters.outgoing_ack_id {
            state.counters.outgoing_ack_id = ack;
            state.unacknowledged.acknowledge(ack);
        }

        match msg.message_type {
            ProtocolMessageType::None => {}
            ProtocolMessageType::Regular => {
                if msg.id <= state.counters.incoming_msg_id {
                    trace!("ignoring duplicate message #{}", msg.id);
                }
                else if msg.id != state.counters.incoming_msg_id + 1 {
                    self.on_gap(state, msg.id);
                }
                else {
                    state.counters.incoming_msg_id = msg.id;
                    state.incoming_msg_last_time = Instant::now();
                    self.check_ack(state);
                    self.message_emitter.fire(msg.data);
                }
            }
            ProtocolMessageType::Control => {
                self.control_emitter.fire(msg.data);
            }
            ProtocolMessageType::Ack => {}
            ProtocolMessageType::Disconnect => {
                info!("peer disconnected");
                self.disconnect_emitter.fire(());
            }
            ProtocolMessageType::ReplayRequest => {
                debug!("peer requested a replay of {} unacknowledged messages", state.unacknowledged.len());
                for unacknowledged in state.unacknowledged.iter_mut() {
                    state.writer.write(unacknowledged);
                }
                self.check_timeout(state);
            }
            ProtocolMessageType::Pause => {
                debug!("peer paused - pausing writer");
                state.writer.pause();
            }
            ProtocolMessageType::Resume => {
                debug!("peer resumed - resuming writer");
                state.writer.resume();
            }
            ProtocolMessageType::KeepAlive => {
                // receiving it updated the reader's 'last read time', which is all it is for
            }
        }
    }

    fn on_gap(&self, state: &mut ProtocolState, received_id: u32) {
        let now = Instant::now();
        let is_due = match state.last_replay_request_time {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.config.replay_request_min_interval,
        };

        if is_due {
            debug!("received message #{} while expecting #{} - requesting replay", received_id, state.counters.incoming_msg_id + 1);
            state.last_replay_request_time = Some(now);
            state.write_control_message(ProtocolMessageType::ReplayRequest, 0);
        }
        else {
            trace!("received message #{} while expecting #{} - replay was requested recently", received_id, state.counters.incoming_msg_id + 1);
        }
    }

    fn send_ack(&self, state: &mut ProtocolState) {
        if state.counters.incoming_msg_id <= state.counters.incoming_ack_id {
            return;
        }
        state.counters.incoming_ack_id = state.counters.incoming_msg_id;
        trace!("sending ack #{}", state.counters.incoming_ack_id);
        let ack = state.counters.incoming_ack_id;
        state.write_control_message(ProtocolMessageType::Ack, ack);
    }

    /// Acknowledges received messages if there was no outgoing traffic (carrying the ack) for
    ///  the ack delay
    fn check_ack(self: &Arc<Self>, state: &mut ProtocolState) {
        if state.is_disposed || state.counters.incoming_msg_id <= state.counters.incoming_ack_id {
            return;
        }
        if state.ack_check_handle.is_some() {
            return;
        }

        let elapsed = state.incoming_msg_last_time.elapsed();
        if elapsed >= self.config.ack_delay {
            self.send_ack(state);
            return;
        }

        let delay = self.config.ack_delay - elapsed + self.config.ack_check_slack;
        let weak_inner = Arc::downgrade(self);
        state.ack_check_handle = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak_inner.upgrade() {
                let mut state = inner.state.lock().unwrap();
                state.ack_check_handle = None;
                inner.check_ack(&mut state);
            }
        }));
    }

    /// Reports a socket timeout if the oldest unacknowledged message, the most recent incoming
    ///  data and the previous timeout are all older than the timeout. Otherwise it re-checks
    ///  when that may be the case.
    fn check_timeout(self: &Arc<Self>, state: &mut ProtocolState) {
        if state.is_disposed || state.is_reconnecting || state.timeout_check_handle.is_some() {
            return;
        }
        let Some(oldest) = state.unacknowledged.oldest() else {
            return;
        };

        let now = Instant::now();
        let timeout = self.config.unacknowledged_timeout;

        let time_since_oldest_unacknowledged_msg = now.saturating_duration_since(oldest.written_time.unwrap_or(now));
        let time_since_last_received_some_data = now.saturating_duration_since(state.reader.last_read_time());
        let time_since_last_timeout = now.saturating_duration_since(state.last_socket_timeout_time);

        if time_since_oldest_unacknowledged_msg >= timeout
            && time_since_last_received_some_data >= timeout
            && time_since_last_timeout >= timeout
        {
            if self.load_estimator.has_high_load() {
                debug!("socket timeout suppressed due to high load");
            }
            else {
                let event = SocketTimeoutEvent {
                    unacknowledged_msg_count: state.unacknowledged.len(),
                    time_since_oldest_unacknowledged_msg,
                    time_since_last_received_some_data,
                };
                warn!("socket timeout: {:?}", event);
                state.last_socket_timeout_time = now;
                self.socket_timeout_emitter.fire(event);
                return;
            }
        }

        let delay = [
            timeout.saturating_sub(time_since_oldest_unacknowledged_msg),
            timeout.saturating_sub(time_since_last_received_some_data),
            timeout.saturating_sub(time_since_last_timeout),
            self.config.min_timeout_check_delay,
        ].into_iter()
            .max()
            .unwrap_or(self.config.min_timeout_check_delay);

        let weak_inner = Arc::downgrade(self);
        state.timeout_check_handle = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak_inner.upgrade() {
                let mut state = inner.state.lock().unwrap();
                state.timeout_check_handle = None;
                inner.check_timeout(&mut state);
            }
        }));
    }

    async fn keep_alive_loop(inner: Weak<PersistentProtocolInner>, keep_alive_interval: Duration) {
        let mut keep_alive_interval = interval_at(Instant::now() + keep_alive_interval, keep_alive_interval);
        keep_alive_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            keep_alive_interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };

            let mut state = inner.state.lock().unwrap();
            if state.is_disposed {
                return;
            }
            state.counters.incoming_ack_id = state.counters.incoming_msg_id;
            trace!("sending keep-alive with ack #{}", state.counters.incoming_ack_id);
            let ack = state.counters.incoming_ack_id;
            state.write_control_message(ProtocolMessageType::KeepAlive, ack);
        }
    }
}

/// A session of ordered, exactly-once message delivery on top of a sequence of sockets. `Regular`
///  messages are numbered, acknowledged by the peer and kept for retransmission until they are,
///  so that a session survives replacing a broken socket with a new one (see
///  [PersistentProtocol::begin_accept_reconnection]).
///
/// Events are delivered through channels that buffer events until they are subscribed. All
///  timers run as spawned tasks, so a protocol must be created inside a tokio runtime.
pub struct PersistentProtocol {
    inner: Arc<PersistentProtocolInner>,
}

impl Drop for PersistentProtocol {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl PersistentProtocol {
    /// `initial_chunk` is data that was received on the socket before it was handed over,
    ///  see [crate::basic_protocol::BasicProtocol::detach]
    pub fn new(connection: SocketConnection, initial_chunk: Option<Bytes>, config: Arc<ProtocolConfig>, load_estimator: Arc<dyn LoadEstimator>) -> anyhow::Result<PersistentProtocol> {
        config.validate()?;

        let now = Instant::now();
        let keep_alive_interval = config.keep_alive_interval;

        let inner = Arc::new(PersistentProtocolInner {
            config,
            load_estimator,
            state: Mutex::new(ProtocolState {
                counters: Default::default(),
                is_reconnecting: false,
                is_disposed: false,
                did_send_disconnect: false,
                socket: connection.socket.clone(),
                socket_generation: 0,
                reader: FrameReader::new(),
                writer: FrameWriter::new(connection.socket),
                pump: None,
                unacknowledged: RetransmissionQueue::new(),
                incoming_msg_last_time: now,
                last_replay_request_time: None,
                last_socket_timeout_time: now,
                ack_check_handle: None,
                timeout_check_handle: None,
                keep_alive_handle: None,
            }),
            message_emitter: BufferedEmitter::new(),
            control_emitter: BufferedEmitter::new(),
            disconnect_emitter: BufferedEmitter::new(),
            socket_close_emitter: BufferedEmitter::new(),
            socket_timeout_emitter: BufferedEmitter::new(),
        });

        {
            let mut state = inner.state.lock().unwrap();
            inner.spawn_pump(&mut state, connection.events);

            if let Some(keep_alive_interval) = keep_alive_interval {
                state.keep_alive_handle = Some(tokio::spawn(PersistentProtocolInner::keep_alive_loop(Arc::downgrade(&inner), keep_alive_interval)));
            }

            if let Some(initial_chunk) = initial_chunk {
                state.reader.accept_chunk(initial_chunk);
                inner.process_incoming(&mut state);
            }
        }

        Ok(PersistentProtocol { inner })
    }

    /// Sends a sequenced message. While a reconnection is being accepted, the message is only
    ///  queued, and it is sent when the reconnection is complete.
    pub fn send(&self, data: Bytes) -> anyhow::Result<()> {
        check_payload_len(data.len())?;

        let mut state = self.inner.state.lock().unwrap();
        if state.is_disposed {
            trace!("protocol is disposed - dropping message");
            return Ok(());
        }

        let id = state.counters.outgoing_msg_id.checked_add(1)
            .ok_or_else(|| anyhow!("message id space is exhausted"))?;
        state.counters.outgoing_msg_id = id;
        state.counters.incoming_ack_id = state.counters.incoming_msg_id;

        let mut msg = ProtocolMessage::new(ProtocolMessageType::Regular, id, state.counters.incoming_ack_id, data);
        if !state.is_reconnecting {
            state.writer.write(&mut msg);
        }
        state.unacknowledged.push(msg);

        if !state.is_reconnecting {
            self.inner.check_timeout(&mut state);
        }
        Ok(())
    }

    /// Sends an unsequenced message that is delivered to the peer's control message channel.
    ///  It is not retransmitted.
    pub fn send_control(&self, data: Bytes) -> anyhow::Result<()> {
        check_payload_len(data.len())?;
        let state = self.inner.state.lock().unwrap();
        state.writer.write(&mut ProtocolMessage::new(ProtocolMessageType::Control, 0, 0, data));
        Ok(())
    }

    /// Tells the peer that the session ends, flushing the writer. Only the first call has an
    ///  effect.
    pub fn send_disconnect(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.did_send_disconnect {
            return;
        }
        info!("sending disconnect");
        state.did_send_disconnect = true;
        state.write_control_message(ProtocolMessageType::Disconnect, 0);
        state.writer.flush();
    }

    /// asks the peer to stop sending
    pub fn send_pause(&self) {
        debug!("asking peer to pause");
        self.inner.state.lock().unwrap()
            .write_control_message(ProtocolMessageType::Pause, 0);
    }

    /// asks the peer to continue sending
    pub fn send_resume(&self) {
        debug!("asking peer to resume");
        self.inner.state.lock().unwrap()
            .write_control_message(ProtocolMessageType::Resume, 0);
    }

    /// stops writing to the socket until the peer sends a `Resume`
    pub fn pause_socket_writing(&self) {
        self.inner.state.lock().unwrap()
            .writer.pause();
    }

    pub async fn drain(&self) {
        let writer = self.inner.state.lock().unwrap()
            .writer.clone();
        writer.drain().await;
    }

    /// Replaces the current socket with a new one. The old socket is disposed, and events that
    ///  were buffered for it are discarded. Messages sent before [PersistentProtocol::end_accept_reconnection]
    ///  are queued.
    pub fn begin_accept_reconnection(&self, connection: SocketConnection, initial_chunk: Option<Bytes>) {
        let mut state = self.inner.state.lock().unwrap();
        if state.is_disposed {
            warn!("reconnection for a disposed protocol - disposing the new socket");
            connection.socket.dispose();
            return;
        }

        info!("accepting reconnection");
        state.is_reconnecting = true;

        if let Some(mut pump) = state.pump.take() {
            pump.abort();
        }
        state.reader.dispose();
        state.writer.dispose();
        state.socket.dispose();

        self.inner.control_emitter.flush_buffer();
        self.inner.socket_close_emitter.flush_buffer();
        self.inner.socket_timeout_emitter.flush_buffer();

        state.last_replay_request_time = None;
        state.last_socket_timeout_time = Instant::now();

        state.socket = connection.socket.clone();
        state.reader = FrameReader::new();
        state.writer = FrameWriter::new(connection.socket);
        state.socket_generation += 1;
        self.inner.spawn_pump(&mut state, connection.events);

        if let Some(initial_chunk) = initial_chunk {
            state.reader.accept_chunk(initial_chunk);
            self.inner.process_incoming(&mut state);
        }
    }

    /// Completes a reconnection: acknowledges everything received so far, and sends all
    ///  unacknowledged messages (including those queued during the reconnection)
    pub fn end_accept_reconnection(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.is_disposed {
            return;
        }
        let state = &mut *state;

        state.is_reconnecting = false;

        // the peer may have missed a previous ack, so this one is sent unconditionally
        state.counters.incoming_ack_id = state.counters.incoming_msg_id;
        let ack = state.counters.incoming_ack_id;
        state.write_control_message(ProtocolMessageType::Ack, ack);

        info!("reconnected - resending {} unacknowledged messages", state.unacknowledged.len());
        for unacknowledged in state.unacknowledged.iter_mut() {
            state.writer.write(unacknowledged);
        }

        self.inner.check_timeout(state);
    }

    /// Takes all incoming bytes that were received but not processed as messages yet
    pub fn read_entire_buffer(&self) -> Bytes {
        self.inner.state.lock().unwrap()
            .reader.read_entire_buffer()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.inner.state.lock().unwrap()
            .unacknowledged.len()
    }

    pub fn time_since_last_incoming_data(&self) -> Duration {
        self.inner.state.lock().unwrap()
            .reader.last_read_time().elapsed()
    }

    pub fn counters(&self) -> SessionCounters {
        self.inner.state.lock().unwrap()
            .counters
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.state.lock().unwrap()
            .is_reconnecting
    }

    /// payloads of `Regular` messages, in order and without duplicates
    pub fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.inner.message_emitter.subscribe()
    }

    pub fn subscribe_control_messages(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.inner.control_emitter.subscribe()
    }

    /// fires when the peer ended the session
    pub fn subscribe_disconnect(&self) -> mpsc::UnboundedReceiver<()> {
        self.inner.disconnect_emitter.subscribe()
    }

    pub fn subscribe_socket_close(&self) -> mpsc::UnboundedReceiver<SocketCloseEvent> {
        self.inner.socket_close_emitter.subscribe()
    }

    pub fn subscribe_socket_timeout(&self) -> mpsc::UnboundedReceiver<SocketTimeoutEvent> {
        self.inner.socket_timeout_emitter.subscribe()
    }

    /// Stops all timers and disposes reader, writer and socket. Messages sent afterwards are
    ///  dropped.
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.is_disposed {
            return;
        }
        debug!("disposing persistent protocol");
        state.is_disposed = true;

        state.abort_timers();
        if let Some(mut pump) = state.pump.take() {
            pump.abort();
        }
        state.reader.dispose();
        state.writer.dispose();
        state.socket.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::load_estimator::{FixedLoadEstimator, MockLoadEstimator};
    use crate::test_util::{close_event, connection, data_event, drain_receiver, frame, settle, RecordingSocket};
    use ProtocolMessageType::{Ack, Control, Disconnect, KeepAlive, Pause, Regular, ReplayRequest, Resume};

    fn test_config() -> Arc<ProtocolConfig> {
        Arc::new(ProtocolConfig {
            keep_alive_interval: None,
            ..Default::default()
        })
    }

    fn new_protocol() -> (PersistentProtocol, Arc<RecordingSocket>, mpsc::UnboundedSender<SocketEvent>) {
        new_protocol_with(test_config(), Arc::new(FixedLoadEstimator::no_load()))
    }

    fn new_protocol_with(config: Arc<ProtocolConfig>, load_estimator: Arc<dyn LoadEstimator>) -> (PersistentProtocol, Arc<RecordingSocket>, mpsc::UnboundedSender<SocketEvent>) {
        let (socket, connection, events) = connection();
        let protocol = PersistentProtocol::new(connection, None, config, load_estimator).unwrap();
        (protocol, socket, events)
    }

    fn ids(messages: &[ProtocolMessage]) -> Vec<(ProtocolMessageType, u32, u32)> {
        messages.iter()
            .map(|m| (m.message_type, m.id, m.ack))
            .collect()
    }

    fn count_of(types: &[ProtocolMessageType], message_type: ProtocolMessageType) -> usize {
        types.iter()
            .filter(|&&t| t == message_type)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_numbers_messages_and_piggybacks_ack() {
        let (protocol, socket, events) = new_protocol();
        let mut messages = protocol.subscribe_messages();

        events.send(data_event(Regular, 1, 0, b"in")).unwrap();
        settle().await;
        assert_eq!(drain_receiver(&mut messages), vec![Bytes::from_static(b"in")]);

        protocol.send(Bytes::from_static(b"a")).unwrap();
        protocol.send(Bytes::from_static(b"b")).unwrap();
        settle().await;

        let written = socket.take_messages();
        assert_eq!(ids(&written), vec![(Regular, 1, 1), (Regular, 2, 1)]);
        assert_eq!(written[1].data.as_ref(), b"b");

        assert_eq!(protocol.counters(), SessionCounters {
            outgoing_msg_id: 2,
            outgoing_ack_id: 0,
            incoming_msg_id: 1,
            incoming_ack_id: 1,
        });
        assert_eq!(protocol.unacknowledged_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_removes_acknowledged_messages() {
        let (protocol, socket, events) = new_protocol();
        for data in [b"1", b"2", b"3"] {
            protocol.send(Bytes::from_static(data)).unwrap();
        }
        settle().await;
        socket.take_messages();

        events.send(data_event(Ack, 0, 2, b"")).unwrap();
        settle().await;
        assert_eq!(protocol.unacknowledged_count(), 1);
        assert_eq!(protocol.counters().outgoing_ack_id, 2);

        // a stale ack changes nothing
        events.send(data_event(Ack, 0, 1, b"")).unwrap();
        settle().await;
        assert_eq!(protocol.unacknowledged_count(), 1);
        assert_eq!(protocol.counters().outgoing_ack_id, 2);

        // a replay resends what is still unacknowledged
        events.send(data_event(ReplayRequest, 0, 0, b"")).unwrap();
        settle().await;
        let written = socket.take_messages();
        assert_eq!(ids(&written), vec![(Regular, 3, 0)]);
        assert_eq!(written[0].data.as_ref(), b"3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_beyond_last_sent_message_is_capped() {
        let (protocol, socket, events) = new_protocol();
        protocol.send(Bytes::from_static(b"1")).unwrap();
        protocol.send(Bytes::from_static(b"2")).unwrap();
        settle().await;
        socket.take_messages();

        events.send(data_event(Ack, 0, 7, b"")).unwrap();
        settle().await;
        assert_eq!(protocol.unacknowledged_count(), 0);
        assert_eq!(protocol.counters().outgoing_ack_id, 2);

        protocol.send(Bytes::from_static(b"3")).unwrap();
        events.send(data_event(Ack, 0, 2, b"")).unwrap();
        settle().await;
        assert_eq!(protocol.unacknowledged_count(), 1);
        assert_eq!(ids(&socket.take_messages()), vec![(Regular, 3, 0)]);

        events.send(data_event(Ack, 0, 3, b"")).unwrap();
        settle().await;
        assert_eq!(protocol.unacknowledged_count(), 0);
        assert_eq!(protocol.counters().outgoing_ack_id, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_flushes_and_drains_socket() {
        let (protocol, socket, _events) = new_protocol();
        protocol.send(Bytes::from_static(b"a")).unwrap();
        protocol.send_control(Bytes::from_static(b"b")).unwrap();
        assert_eq!(socket.num_writes(), 0);

        protocol.drain().await;
        assert_eq!(socket.num_drains(), 1);
        assert_eq!(ids(&socket.take_messages()), vec![(Regular, 1, 0), (Control, 0, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_entire_buffer_returns_incomplete_frame() {
        let (protocol, _socket, events) = new_protocol();
        let mut messages = protocol.subscribe_messages();

        let incomplete = frame(Regular, 2, 0, b"incomplete");
        events.send(data_event(Regular, 1, 0, b"whole")).unwrap();
        events.send(SocketEvent::Data(incomplete.slice(..17))).unwrap();
        settle().await;

        assert_eq!(drain_receiver(&mut messages), vec![Bytes::from_static(b"whole")]);
        assert_eq!(protocol.read_entire_buffer(), incomplete.slice(..17));
        assert!(protocol.read_entire_buffer().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_is_piggybacked_on_any_message() {
        let (protocol, _socket, events) = new_protocol();
        protocol.send(Bytes::from_static(b"1")).unwrap();
        protocol.send(Bytes::from_static(b"2")).unwrap();

        events.send(data_event(Regular, 1, 2, b"x")).unwrap();
        settle().await;
        assert_eq!(protocol.unacknowledged_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_are_ignored() {
        let (protocol, _socket, events) = new_protocol();
        let mut messages = protocol.subscribe_messages();

        events.send(data_event(Regular, 1, 0, b"a")).unwrap();
        events.send(data_event(Regular, 2, 0, b"b")).unwrap();
        events.send(data_event(Regular, 1, 0, b"a")).unwrap();
        events.send(data_event(Regular, 3, 0, b"c")).unwrap();
        settle().await;

        assert_eq!(drain_receiver(&mut messages), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
        assert_eq!(protocol.counters().incoming_msg_id, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_triggers_single_replay_request() {
        let (protocol, socket, events) = new_protocol();
        let mut messages = protocol.subscribe_messages();

        events.send(data_event(Regular, 1, 0, b"1")).unwrap();
        events.send(data_event(Regular, 2, 0, b"2")).unwrap();
        events.send(data_event(Regular, 4, 0, b"4")).unwrap();
        settle().await;

        assert_eq!(drain_receiver(&mut messages), vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]);
        assert_eq!(ids(&socket.take_messages()), vec![(ReplayRequest, 0, 0)]);

        sleep(Duration::from_secs(5)).await;
        events.send(data_event(Regular, 5, 0, b"5")).unwrap();
        events.send(data_event(Regular, 4, 0, b"4")).unwrap();
        events.send(data_event(Regular, 6, 0, b"6")).unwrap();
        settle().await;
        assert_eq!(count_of(&socket.take_types(), ReplayRequest), 0);
        assert_eq!(protocol.counters().incoming_msg_id, 2);

        sleep(Duration::from_secs(6)).await;
        events.send(data_event(Regular, 7, 0, b"7")).unwrap();
        settle().await;
        assert_eq!(count_of(&socket.take_types(), ReplayRequest), 1);
        assert!(drain_receiver(&mut messages).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_fills_gap() {
        let (protocol, _socket, events) = new_protocol();
        let mut messages = protocol.subscribe_messages();

        events.send(data_event(Regular, 1, 0, b"1")).unwrap();
        events.send(data_event(Regular, 3, 0, b"3")).unwrap();
        // the peer's replay
        events.send(data_event(Regular, 2, 0, b"2")).unwrap();
        events.send(data_event(Regular, 3, 0, b"3")).unwrap();
        settle().await;

        assert_eq!(drain_receiver(&mut messages), vec![Bytes::from_static(b"1"), Bytes::from_static(b"2"), Bytes::from_static(b"3")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_is_sent_after_delay() {
        let (protocol, socket, events) = new_protocol();

        events.send(data_event(Regular, 1, 0, b"a")).unwrap();
        settle().await;
        sleep(Duration::from_millis(1900)).await;
        settle().await;
        assert!(socket.take_messages().is_empty());

        sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(ids(&socket.take_messages()), vec![(Ack, 0, 1)]);
        assert_eq!(protocol.counters().incoming_ack_id, 1);

        // nothing left to acknowledge
        sleep(Duration::from_secs(10)).await;
        settle().await;
        assert!(socket.take_messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outgoing_message_makes_ack_unnecessary() {
        let (protocol, socket, events) = new_protocol();

        events.send(data_event(Regular, 1, 0, b"a")).unwrap();
        settle().await;
        sleep(Duration::from_secs(1)).await;
        protocol.send(Bytes::from_static(b"b")).unwrap();

        sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(ids(&socket.take_messages()), vec![(Regular, 1, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_delay_restarts_with_every_message() {
        let (_protocol, socket, events) = new_protocol();

        events.send(data_event(Regular, 1, 0, b"a")).unwrap();
        settle().await;
        sleep(Duration::from_millis(1500)).await;
        events.send(data_event(Regular, 2, 0, b"b")).unwrap();
        settle().await;

        // the check at 2.005s finds the most recent message too young and re-checks at 3.505s
        sleep(Duration::from_millis(1900)).await;
        settle().await;
        assert!(socket.take_messages().is_empty());

        sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(ids(&socket.take_messages()), vec![(Ack, 0, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_under_low_load() {
        let (protocol, _socket, _events) = new_protocol();
        let mut timeouts = protocol.subscribe_socket_timeout();

        protocol.send(Bytes::from_static(b"a")).unwrap();
        sleep(Duration::from_secs(19)).await;
        settle().await;
        assert!(drain_receiver(&mut timeouts).is_empty());

        sleep(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(drain_receiver(&mut timeouts), vec![SocketTimeoutEvent {
            unacknowledged_msg_count: 1,
            time_since_oldest_unacknowledged_msg: Duration::from_secs(20),
            time_since_last_received_some_data: Duration::from_secs(20),
        }]);

        sleep(Duration::from_secs(60)).await;
        settle().await;
        assert!(drain_receiver(&mut timeouts).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_timeout_under_high_load() {
        let high_load = Arc::new(AtomicBool::new(true));
        let mut load_estimator = MockLoadEstimator::new();
        let cloned = high_load.clone();
        load_estimator.expect_has_high_load()
            .returning(move || cloned.load(Ordering::Acquire));

        let (protocol, _socket, _events) = new_protocol_with(test_config(), Arc::new(load_estimator));
        let mut timeouts = protocol.subscribe_socket_timeout();

        protocol.send(Bytes::from_static(b"a")).unwrap();
        sleep(Duration::from_secs(25)).await;
        settle().await;
        assert!(drain_receiver(&mut timeouts).is_empty());

        // re-checked periodically while the load is high
        high_load.store(false, Ordering::Release);
        sleep(Duration::from_millis(600)).await;
        settle().await;
        let timeouts = drain_receiver(&mut timeouts);
        assert_eq!(timeouts.len(), 1);
        assert!(timeouts[0].time_since_oldest_unacknowledged_msg >= Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_data_defers_timeout() {
        let (protocol, _socket, events) = new_protocol();
        let mut timeouts = protocol.subscribe_socket_timeout();

        protocol.send(Bytes::from_static(b"a")).unwrap();
        sleep(Duration::from_secs(15)).await;
        events.send(data_event(KeepAlive, 0, 0, b"")).unwrap();
        settle().await;

        sleep(Duration::from_secs(15)).await;
        settle().await;
        assert!(drain_receiver(&mut timeouts).is_empty());
        assert_eq!(protocol.time_since_last_incoming_data(), Duration::from_secs(15));

        sleep(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(drain_receiver(&mut timeouts).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_timeout_when_everything_is_acknowledged() {
        let (protocol, _socket, events) = new_protocol();
        let mut timeouts = protocol.subscribe_socket_timeout();

        protocol.send(Bytes::from_static(b"a")).unwrap();
        events.send(data_event(Ack, 0, 1, b"")).unwrap();
        settle().await;

        sleep(Duration::from_secs(60)).await;
        settle().await;
        assert!(drain_receiver(&mut timeouts).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_from_peer() {
        let (protocol, socket, events) = new_protocol();

        events.send(data_event(Pause, 0, 0, b"")).unwrap();
        settle().await;

        protocol.send(Bytes::from_static(b"a")).unwrap();
        protocol.send(Bytes::from_static(b"b")).unwrap();
        settle().await;
        assert_eq!(socket.num_writes(), 0);

        events.send(data_event(Resume, 0, 0, b"")).unwrap();
        settle().await;
        let written = socket.take_messages();
        assert_eq!(ids(&written), vec![(Regular, 1, 0), (Regular, 2, 0)]);
        assert_eq!(written[0].data.as_ref(), b"a");
        assert_eq!(written[1].data.as_ref(), b"b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_socket_writing() {
        let (protocol, socket, events) = new_protocol();

        protocol.pause_socket_writing();
        protocol.send(Bytes::from_static(b"a")).unwrap();
        settle().await;
        assert_eq!(socket.num_writes(), 0);

        events.send(data_event(Resume, 0, 0, b"")).unwrap();
        settle().await;
        assert_eq!(ids(&socket.take_messages()), vec![(Regular, 1, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outgoing_control_messages() {
        let (protocol, socket, _events) = new_protocol();

        protocol.send_control(Bytes::from_static(b"ctl")).unwrap();
        protocol.send_pause();
        protocol.send_resume();
        settle().await;

        let written = socket.take_messages();
        assert_eq!(ids(&written), vec![(Control, 0, 0), (Pause, 0, 0), (Resume, 0, 0)]);
        assert_eq!(written[0].data.as_ref(), b"ctl");
        assert_eq!(protocol.unacknowledged_count(), 0);
        assert_eq!(protocol.counters(), SessionCounters::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_disconnect_once_and_flushed() {
        let (protocol, socket, _events) = new_protocol();

        protocol.send_disconnect();
        assert_eq!(socket.num_writes(), 1);
        protocol.send_disconnect();
        settle().await;

        assert_eq!(ids(&socket.take_messages()), vec![(Disconnect, 0, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_control_and_disconnect() {
        let (protocol, _socket, events) = new_protocol();

        events.send(data_event(Control, 0, 0, b"ctl")).unwrap();
        events.send(data_event(Regular, 1, 0, b"msg")).unwrap();
        events.send(data_event(Disconnect, 0, 0, b"")).unwrap();
        settle().await;

        assert_eq!(drain_receiver(&mut protocol.subscribe_control_messages()), vec![Bytes::from_static(b"ctl")]);
        assert_eq!(drain_receiver(&mut protocol.subscribe_messages()), vec![Bytes::from_static(b"msg")]);
        assert_eq!(drain_receiver(&mut protocol.subscribe_disconnect()), vec![()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_message_type_is_skipped() {
        let (protocol, _socket, events) = new_protocol();

        let mut raw = frame(Regular, 1, 0, b"a").to_vec();
        let mut unknown = frame(Regular, 7, 0, b"junk").to_vec();
        unknown[0] = 42;
        raw.extend_from_slice(&unknown);
        raw.extend_from_slice(&frame(Regular, 2, 0, b"b"));
        events.send(SocketEvent::Data(Bytes::from(raw))).unwrap();
        settle().await;

        assert_eq!(drain_receiver(&mut protocol.subscribe_messages()), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_chunk_is_processed() {
        let (socket, connection, _events) = connection();
        let mut initial = frame(Regular, 1, 0, b"early").to_vec();
        initial.extend_from_slice(&frame(Control, 0, 0, b"hello"));

        let protocol = PersistentProtocol::new(connection, Some(Bytes::from(initial)), test_config(), Arc::new(FixedLoadEstimator::no_load())).unwrap();

        assert_eq!(drain_receiver(&mut protocol.subscribe_messages()), vec![Bytes::from_static(b"early")]);
        assert_eq!(drain_receiver(&mut protocol.subscribe_control_messages()), vec![Bytes::from_static(b"hello")]);
        assert_eq!(socket.num_writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let (_socket, connection, _events) = connection();
        let config = ProtocolConfig {
            ack_delay: Duration::ZERO,
            ..Default::default()
        };
        assert!(PersistentProtocol::new(connection, None, Arc::new(config), Arc::new(FixedLoadEstimator::no_load())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive() {
        let config = Arc::new(ProtocolConfig::default());
        let (_protocol, socket, events) = new_protocol_with(config, Arc::new(FixedLoadEstimator::no_load()));

        events.send(data_event(Regular, 1, 0, b"a")).unwrap();
        events.send(data_event(Regular, 2, 0, b"b")).unwrap();
        settle().await;

        sleep(Duration::from_millis(5100)).await;
        settle().await;
        assert_eq!(ids(&socket.take_messages()), vec![(Ack, 0, 2), (KeepAlive, 0, 2)]);

        sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(ids(&socket.take_messages()), vec![(KeepAlive, 0, 2), (KeepAlive, 0, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_resends_unacknowledged() {
        let (protocol, old_socket, old_events) = new_protocol();
        let mut messages = protocol.subscribe_messages();

        events_then_settle(&old_events, vec![data_event(Regular, 1, 0, b"in")]).await;
        for data in [b"1", b"2", b"3"] {
            protocol.send(Bytes::from_static(data)).unwrap();
        }
        settle().await;
        old_socket.take_messages();
        let counters_before = protocol.counters();

        let (new_socket, new_connection, _new_events) = connection();
        protocol.begin_accept_reconnection(new_connection, None);
        assert!(protocol.is_reconnecting());
        assert!(old_socket.is_disposed());

        protocol.end_accept_reconnection();
        assert!(!protocol.is_reconnecting());
        settle().await;

        let written = new_socket.take_messages();
        assert_eq!(ids(&written), vec![(Ack, 0, 1), (Regular, 1, 1), (Regular, 2, 1), (Regular, 3, 1)]);
        assert_eq!(written[3].data.as_ref(), b"3");
        assert_eq!(protocol.counters(), counters_before);
        assert_eq!(protocol.unacknowledged_count(), 3);
        assert_eq!(drain_receiver(&mut messages), vec![Bytes::from_static(b"in")]);
    }

    async fn events_then_settle(events: &mpsc::UnboundedSender<SocketEvent>, to_send: Vec<SocketEvent>) {
        for evt in to_send {
            events.send(evt).unwrap();
        }
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_reconnecting_is_deferred() {
        let (protocol, old_socket, _old_events) = new_protocol();
        protocol.send(Bytes::from_static(b"1")).unwrap();
        settle().await;

        let (new_socket, new_connection, _new_events) = connection();
        protocol.begin_accept_reconnection(new_connection, None);
        protocol.send(Bytes::from_static(b"2")).unwrap();
        settle().await;
        assert_eq!(new_socket.num_writes(), 0);
        assert_eq!(ids(&old_socket.take_messages()), vec![(Regular, 1, 0)]);

        protocol.end_accept_reconnection();
        settle().await;
        assert_eq!(ids(&new_socket.take_messages()), vec![(Ack, 0, 0), (Regular, 1, 0), (Regular, 2, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_switches_event_source() {
        let (protocol, _old_socket, old_events) = new_protocol();
        let mut messages = protocol.subscribe_messages();

        // buffered for the old socket, discarded by the reconnection
        old_events.send(close_event(true)).unwrap();
        settle().await;

        let (_new_socket, new_connection, new_events) = connection();
        protocol.begin_accept_reconnection(new_connection, Some(frame(Regular, 1, 0, b"first")));
        protocol.end_accept_reconnection();

        let _ = old_events.send(data_event(Regular, 2, 0, b"stale"));
        new_events.send(data_event(Regular, 2, 0, b"second")).unwrap();
        settle().await;

        assert_eq!(drain_receiver(&mut messages), vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);

        let mut closes = protocol.subscribe_socket_close();
        assert!(drain_receiver(&mut closes).is_empty());
        new_events.send(close_event(false)).unwrap();
        settle().await;
        assert_eq!(drain_receiver(&mut closes), vec![SocketCloseEvent { had_error: false }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_resets_replay_limit_and_discards_control_backlog() {
        let (protocol, old_socket, old_events) = new_protocol();

        events_then_settle(&old_events, vec![
            data_event(Regular, 1, 0, b"1"),
            data_event(Regular, 3, 0, b"3"),
            data_event(Control, 0, 0, b"for the old socket"),
        ]).await;
        assert_eq!(count_of(&old_socket.take_types(), ReplayRequest), 1);

        sleep(Duration::from_secs(2)).await;
        let (new_socket, new_connection, new_events) = connection();
        protocol.begin_accept_reconnection(new_connection, None);
        protocol.end_accept_reconnection();

        // well within the replay request interval, but on a new socket
        events_then_settle(&new_events, vec![data_event(Regular, 3, 0, b"3")]).await;
        assert_eq!(count_of(&new_socket.take_types(), ReplayRequest), 1);
        assert_eq!(protocol.counters().incoming_msg_id, 1);

        let mut control_messages = protocol.subscribe_control_messages();
        assert!(drain_receiver(&mut control_messages).is_empty());

        events_then_settle(&new_events, vec![data_event(Control, 0, 0, b"for the new socket")]).await;
        assert_eq!(drain_receiver(&mut control_messages), vec![Bytes::from_static(b"for the new socket")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_restarts_timeout_window() {
        let (protocol, _old_socket, _old_events) = new_protocol();
        let mut timeouts = protocol.subscribe_socket_timeout();

        protocol.send(Bytes::from_static(b"a")).unwrap();
        sleep(Duration::from_secs(15)).await;

        let (_new_socket, new_connection, _new_events) = connection();
        protocol.begin_accept_reconnection(new_connection, None);
        protocol.end_accept_reconnection();

        sleep(Duration::from_secs(15)).await;
        settle().await;
        assert!(drain_receiver(&mut timeouts).is_empty());

        sleep(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(drain_receiver(&mut timeouts).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose() {
        let (protocol, socket, events) = new_protocol();
        let mut timeouts = protocol.subscribe_socket_timeout();
        let mut messages = protocol.subscribe_messages();
        protocol.send(Bytes::from_static(b"a")).unwrap();

        protocol.dispose();
        assert!(socket.is_disposed());
        assert_eq!(ids(&socket.take_messages()), vec![(Regular, 1, 0)]);

        protocol.send(Bytes::from_static(b"b")).unwrap();
        let _ = events.send(data_event(Regular, 1, 0, b"late"));
        sleep(Duration::from_secs(60)).await;
        settle().await;

        assert_eq!(socket.num_writes(), 1);
        assert!(drain_receiver(&mut timeouts).is_empty());
        assert!(drain_receiver(&mut messages).is_empty());
    }
}
