use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::network::registry::ConnRegistry;
use crate::network::transport::{TransportKind, TransportReader, TransportWriter};
use crate::network::Framer;
use crate::protocol::{Message, Packet};
use crate::request::MsgDispatcher;
use crate::service::{ConnOptions, HeartbeatChecker, Shutdown};
use crate::{AppError, AppResult};

/// Connection lifecycle. Transitions happen once, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    Connecting,
    Running,
    Closing,
    Closed,
}

pub type ConnHookFn = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// User callbacks around the connection lifecycle. Panics inside a hook are
/// contained and logged.
#[derive(Clone, Default)]
pub struct ConnHooks {
    pub(crate) on_start: Option<ConnHookFn>,
    pub(crate) on_stop: Option<ConnHookFn>,
}

impl ConnHooks {
    pub(crate) fn call_start(&self, conn: &Arc<Connection>) {
        Self::call(&self.on_start, conn, "start");
    }

    pub(crate) fn call_stop(&self, conn: &Arc<Connection>) {
        Self::call(&self.on_stop, conn, "stop");
    }

    fn call(hook: &Option<ConnHookFn>, conn: &Arc<Connection>, which: &str) {
        if let Some(hook) = hook {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(conn))).is_err() {
                error!(conn_id = conn.id(), "connection {which} hook panicked");
            }
        }
    }
}

/// One peer: identity, state machine, send queues, and the property map
/// exposed to business code. The reader/writer loops live in
/// [`ConnectionDriver`]; this handle is what the registry and handlers see.
pub struct Connection {
    id: u64,
    kind: TransportKind,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    state: AtomicCell<ConnState>,
    msg_tx: mpsc::Sender<Bytes>,
    buff_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    properties: DashMap<String, Arc<dyn Any + Send + Sync>>,
    last_activity: AtomicCell<Instant>,
    packet: Arc<dyn Packet>,
}

impl Connection {
    #[allow(clippy::type_complexity)]
    pub(crate) fn new(
        id: u64,
        kind: TransportKind,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        packet: Arc<dyn Packet>,
        max_msg_chan_len: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<Bytes>, mpsc::Receiver<Bytes>) {
        // capacity 1 approximates an unbuffered channel: the sender parks
        // until the writer picks the message up
        let (msg_tx, msg_rx) = mpsc::channel(1);
        let (buff_tx, buff_rx) = mpsc::channel(max_msg_chan_len.max(1));
        let conn = Arc::new(Connection {
            id,
            kind,
            remote_addr,
            local_addr,
            state: AtomicCell::new(ConnState::Connecting),
            msg_tx,
            buff_tx,
            cancel: CancellationToken::new(),
            properties: DashMap::new(),
            last_activity: AtomicCell::new(Instant::now()),
            packet,
        });
        (conn, msg_rx, buff_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ConnState {
        self.state.load()
    }

    /// Sends on the direct channel, parking the caller until the writer has
    /// taken the message.
    pub async fn send_msg(&self, msg_id: u32, data: &[u8]) -> AppResult<()> {
        if self.state() >= ConnState::Closing {
            return Err(AppError::ConnectionClosed);
        }
        let wire = self
            .packet
            .pack(&Message::new(msg_id, Bytes::copy_from_slice(data)))?;
        self.msg_tx
            .send(wire.freeze())
            .await
            .map_err(|_| AppError::ConnectionClosed)
    }

    /// Sends on the bounded queue, failing fast when it is full.
    pub fn send_buff_msg(&self, msg_id: u32, data: &[u8]) -> AppResult<()> {
        if self.state() >= ConnState::Closing {
            return Err(AppError::ConnectionClosed);
        }
        let wire = self
            .packet
            .pack(&Message::new(msg_id, Bytes::copy_from_slice(data)))?;
        self.buff_tx.try_send(wire.freeze()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AppError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => AppError::ConnectionClosed,
        })
    }

    pub fn set_property(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.properties.insert(key.into(), value);
    }

    pub fn get_property(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.properties.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove_property(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.properties.remove(key).map(|(_, value)| value)
    }

    /// Begins teardown. The first caller wins; both loops observe the
    /// cancellation at their next suspension point.
    pub fn stop(&self) {
        let moved = self.transition(ConnState::Running, ConnState::Closing)
            || self.transition(ConnState::Connecting, ConnState::Closing);
        if moved {
            debug!(conn_id = self.id, "connection closing");
            self.cancel.cancel();
        }
    }

    pub(crate) fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state.compare_exchange(from, to).is_ok()
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn touch(&self) {
        self.last_activity.store(Instant::now());
    }

    /// True while the peer produced activity within the window.
    pub fn is_alive(&self, window: Duration) -> bool {
        self.last_activity.load().elapsed() < window
    }

    #[cfg(test)]
    pub(crate) fn mock() -> Arc<Connection> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT_MOCK_ID: AtomicU64 = AtomicU64::new(1);

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (conn, _msg_rx, _buff_rx) = Connection::new(
            NEXT_MOCK_ID.fetch_add(1, Ordering::Relaxed),
            TransportKind::Tcp,
            addr,
            addr,
            Arc::new(crate::protocol::TlvPacket::new(4096)),
            8,
        );
        conn
    }
}

/// Owns the reader loop, the writer task, and the per-connection heartbeat.
/// Created by the accept loop (or the client connector) and consumed by
/// [`ConnectionDriver::run`].
pub(crate) struct ConnectionDriver {
    pub(crate) conn: Arc<Connection>,
    pub(crate) reader: TransportReader,
    pub(crate) writer: TransportWriter,
    pub(crate) msg_rx: mpsc::Receiver<Bytes>,
    pub(crate) buff_rx: mpsc::Receiver<Bytes>,
    pub(crate) framer: Framer,
    pub(crate) dispatcher: Arc<MsgDispatcher>,
    pub(crate) registry: Arc<ConnRegistry>,
    pub(crate) hooks: ConnHooks,
    pub(crate) heartbeat: Option<HeartbeatChecker>,
    pub(crate) options: ConnOptions,
    pub(crate) shutdown: Shutdown,
    pub(crate) _shutdown_complete_tx: mpsc::Sender<()>,
}

impl ConnectionDriver {
    pub(crate) async fn run(self) {
        let ConnectionDriver {
            conn,
            mut reader,
            writer,
            msg_rx,
            buff_rx,
            framer,
            dispatcher,
            registry,
            hooks,
            heartbeat,
            options,
            mut shutdown,
            _shutdown_complete_tx,
        } = self;

        if !conn.transition(ConnState::Connecting, ConnState::Running) {
            // stopped before the loops ever started
            registry.remove(conn.id());
            return;
        }
        info!(
            conn_id = conn.id(),
            transport = %conn.kind(),
            remote = %conn.remote_addr(),
            "connection running"
        );
        hooks.call_start(&conn);

        let writer_handle = tokio::spawn(write_loop(
            conn.clone(),
            writer,
            msg_rx,
            buff_rx,
            options.write_timeout(),
        ));
        let heartbeat_handle: Option<JoinHandle<()>> = heartbeat
            .map(|checker| checker.spawn(conn.clone(), options.heartbeat_max()));

        let mut buf = BytesMut::with_capacity(options.io_read_buff_size());
        let mut result: AppResult<()> = Ok(());
        'read: loop {
            tokio::select! {
                _ = conn.cancelled() => break 'read,
                _ = shutdown.recv() => {
                    debug!(conn_id = conn.id(), "connection received server shutdown");
                    break 'read;
                }
                read = reader.read_into(&mut buf) => {
                    let n = match read {
                        Ok(n) => n,
                        Err(e) => {
                            result = Err(e);
                            break 'read;
                        }
                    };
                    if n == 0 {
                        debug!(conn_id = conn.id(), "peer closed the transport");
                        break 'read;
                    }
                    conn.touch();
                    loop {
                        match framer.parse(&mut buf) {
                            Ok(Some(frame)) => {
                                let request =
                                    dispatcher.new_request(conn.clone(), Message::undecoded(frame));
                                if let Err(e) = dispatcher.execute(request).await {
                                    result = Err(e);
                                    break 'read;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                result = Err(e);
                                break 'read;
                            }
                        }
                    }
                }
            }
        }

        if let Err(e) = &result {
            error!(conn_id = conn.id(), error = %e, "connection read loop failed");
        }

        conn.stop();
        let _ = writer_handle.await;
        if let Some(handle) = heartbeat_handle {
            let _ = handle.await;
        }
        hooks.call_stop(&conn);
        conn.transition(ConnState::Closing, ConnState::Closed);
        dispatcher.release_connection(conn.id());
        registry.remove(conn.id());
        info!(conn_id = conn.id(), "connection closed");
    }
}

/// Drains both send channels, preferring whichever is ready, and writes each
/// buffer within the configured timeout. Any failure tears the connection
/// down.
async fn write_loop(
    conn: Arc<Connection>,
    mut writer: TransportWriter,
    mut msg_rx: mpsc::Receiver<Bytes>,
    mut buff_rx: mpsc::Receiver<Bytes>,
    write_timeout: Duration,
) {
    loop {
        let data = tokio::select! {
            _ = conn.cancelled() => break,
            maybe = msg_rx.recv() => match maybe {
                Some(data) => data,
                None => break,
            },
            maybe = buff_rx.recv() => match maybe {
                Some(data) => data,
                None => break,
            },
        };
        match time::timeout(write_timeout, writer.write_all(data)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(conn_id = conn.id(), error = %e, "connection write failed");
                conn.stop();
                break;
            }
            Err(_) => {
                error!(conn_id = conn.id(), "connection write timed out");
                conn.stop();
                break;
            }
        }
    }
    writer.shutdown().await;
    debug!(conn_id = conn.id(), "connection write loop exited");
}
