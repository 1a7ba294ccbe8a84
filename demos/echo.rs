use clap::Parser;
use clap_derive::Parser;
use persistent_protocol::basic_protocol::BasicProtocol;
use persistent_protocol::config::{LoadEstimatorConfig, ProtocolConfig};
use persistent_protocol::load_estimator::{LoadEstimator, SchedulerLoadEstimator};
use persistent_protocol::persistent_protocol::PersistentProtocol;
use persistent_protocol::socket::{SocketConnection, TcpSocket};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn, Level};

const HELLO_PREFIX: &str = "hello ";
const WELCOME_NEW: &[u8] = b"welcome new";
const WELCOME_RESUMED: &[u8] = b"welcome resumed";

#[derive(Parser)]
struct Args {
    /// address to listen on (server) or to connect to (client)
    address: String,

    #[clap(long, default_value_t = false)]
    server: bool,

    #[clap(long, default_value_t = 10)]
    num_messages: usize,

    #[clap(long, default_value_t = 500)]
    interval_millis: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

type Sessions = Arc<Mutex<HashMap<u64, Arc<PersistentProtocol>>>>;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let addr: SocketAddr = args.address.parse()?;
    let config = Arc::new(ProtocolConfig::default());

    let load_estimator = Arc::new(SchedulerLoadEstimator::new(Arc::new(LoadEstimatorConfig::default()))?);
    load_estimator.start();

    if args.server {
        run_server(addr, config, load_estimator).await
    }
    else {
        run_client(addr, args.num_messages, Duration::from_millis(args.interval_millis), config, load_estimator).await
    }
}

async fn run_server(addr: SocketAddr, config: Arc<ProtocolConfig>, load_estimator: Arc<dyn LoadEstimator>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("echo server listening on {:?}", addr);

    let sessions: Sessions = Default::default();
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        debug!("accepted connection from {:?}", peer_addr);

        let sessions = sessions.clone();
        let config = config.clone();
        let load_estimator = load_estimator.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_connection(stream, sessions, config, load_estimator).await {
                warn!("handshake with {:?} failed: {}", peer_addr, e);
            }
        });
    }
}

async fn accept_connection(stream: TcpStream, sessions: Sessions, config: Arc<ProtocolConfig>, load_estimator: Arc<dyn LoadEstimator>) -> anyhow::Result<()> {
    let handshake = BasicProtocol::new_handshake(TcpSocket::from_stream(stream)?, None);
    let hello = receive_handshake_message(&handshake).await?;
    let session_id = parse_hello(&hello)?;

    let existing = sessions.lock().unwrap()
        .get(&session_id)
        .cloned();
    handshake.send(Bytes::from_static(if existing.is_some() { WELCOME_RESUMED } else { WELCOME_NEW }))?;

    let (connection, residual) = handshake.detach().await?;
    let initial_chunk = (!residual.is_empty()).then_some(residual);

    match existing {
        Some(protocol) => {
            info!("session {}: reconnected", session_id);
            protocol.begin_accept_reconnection(connection, initial_chunk);
            protocol.end_accept_reconnection();
        }
        None => {
            info!("session {}: new", session_id);
            let protocol = Arc::new(PersistentProtocol::new(connection, initial_chunk, config, load_estimator)?);
            sessions.lock().unwrap()
                .insert(session_id, protocol.clone());
            tokio::spawn(echo_session(session_id, protocol, sessions));
        }
    }
    Ok(())
}

async fn echo_session(session_id: u64, protocol: Arc<PersistentProtocol>, sessions: Sessions) {
    let mut messages = protocol.subscribe_messages();
    let mut disconnects = protocol.subscribe_disconnect();
    let mut closes = protocol.subscribe_socket_close();
    let mut timeouts = protocol.subscribe_socket_timeout();

    loop {
        select! {
            msg = messages.recv() => {
                let Some(msg) = msg else { break; };
                if let Err(e) = protocol.send(msg) {
                    error!("session {}: error echoing message: {}", session_id, e);
                }
            }
            _ = disconnects.recv() => {
                info!("session {}: ended by client", session_id);
                break;
            }
            Some(evt) = closes.recv() => {
                info!("session {}: socket closed ({:?}) - waiting for the client to reconnect", session_id, evt);
            }
            Some(evt) = timeouts.recv() => {
                warn!("session {}: {:?}", session_id, evt);
            }
        }
    }

    sessions.lock().unwrap()
        .remove(&session_id);
    protocol.dispose();
}

async fn run_client(addr: SocketAddr, num_messages: usize, send_interval: Duration, config: Arc<ProtocolConfig>, load_estimator: Arc<dyn LoadEstimator>) -> anyhow::Result<()> {
    let session_id = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos() as u64;

    let (connection, residual, _) = client_handshake(addr, session_id).await?;
    let protocol = PersistentProtocol::new(connection, (!residual.is_empty()).then_some(residual), config, load_estimator)?;
    info!("session {}: connected to {:?}", session_id, addr);

    let mut messages = protocol.subscribe_messages();
    let mut closes = protocol.subscribe_socket_close();
    let mut timeouts = protocol.subscribe_socket_timeout();

    let mut send_interval = interval(send_interval);
    let mut num_sent = 0;
    let mut num_received = 0;

    while num_received < num_messages {
        select! {
            _ = send_interval.tick(), if num_sent < num_messages => {
                protocol.send(Bytes::from(format!("message #{}", num_sent)))?;
                num_sent += 1;
            }
            msg = messages.recv() => {
                let msg = msg.ok_or_else(|| anyhow!("session terminated"))?;
                info!("echo: {}", String::from_utf8_lossy(&msg));
                num_received += 1;
            }
            Some(evt) = closes.recv() => {
                warn!("connection lost ({:?}) - reconnecting", evt);
                reconnect(&protocol, addr, session_id).await?;
            }
            Some(evt) = timeouts.recv() => {
                warn!("{:?} - reconnecting", evt);
                reconnect(&protocol, addr, session_id).await?;
            }
        }
    }

    info!("received all {} echoes", num_messages);
    protocol.send_disconnect();
    protocol.drain().await;
    Ok(())
}

async fn reconnect(protocol: &PersistentProtocol, addr: SocketAddr, session_id: u64) -> anyhow::Result<()> {
    loop {
        match client_handshake(addr, session_id).await {
            Ok((connection, residual, is_resumed)) => {
                if !is_resumed {
                    bail!("server does not know session {} any more", session_id);
                }
                protocol.begin_accept_reconnection(connection, (!residual.is_empty()).then_some(residual));
                protocol.end_accept_reconnection();
                info!("session {}: reconnected, {} messages unacknowledged", session_id, protocol.unacknowledged_count());
                return Ok(());
            }
            Err(e) => {
                warn!("reconnect failed: {} - retrying", e);
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn client_handshake(addr: SocketAddr, session_id: u64) -> anyhow::Result<(SocketConnection, Bytes, bool)> {
    let handshake = BasicProtocol::new_handshake(TcpSocket::connect(addr).await?, None);
    handshake.send(Bytes::from(format!("{}{}", HELLO_PREFIX, session_id)))?;

    let welcome = receive_handshake_message(&handshake).await?;
    let is_resumed = match welcome.as_ref() {
        WELCOME_RESUMED => true,
        WELCOME_NEW => false,
        _ => bail!("unexpected handshake reply {:?}", welcome),
    };

    let (connection, residual) = handshake.detach().await?;
    Ok((connection, residual, is_resumed))
}

async fn receive_handshake_message(handshake: &BasicProtocol) -> anyhow::Result<Bytes> {
    let mut messages = handshake.subscribe_messages();
    let mut closes = handshake.subscribe_close();

    select! {
        msg = messages.recv() => msg.ok_or_else(|| anyhow!("protocol terminated during handshake")),
        _ = closes.recv() => Err(anyhow!("connection closed during handshake")),
        _ = sleep(Duration::from_secs(10)) => Err(anyhow!("handshake timed out")),
    }
}

fn parse_hello(hello: &[u8]) -> anyhow::Result<u64> {
    let hello = std::str::from_utf8(hello)?;
    let session_id = hello.strip_prefix(HELLO_PREFIX)
        .ok_or_else(|| anyhow!("invalid handshake message {:?}", hello))?
        .parse()?;
    Ok(session_id)
}
