use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tokio_kcp::{KcpConfig, KcpListener, KcpNoDelayConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::network::{
    load_tls_acceptor, split_stream, split_websocket, ConnHookFn, ConnHooks, ConnRegistry,
    Connection, ConnectionDriver, Framer, TransportKind, TransportReader, TransportWriter, IO,
};
use crate::protocol::{Packet, TlvPacket};
use crate::request::{DispatcherOptions, Interceptor, MsgDispatcher, RouteTable, Router, RouterHandler};
use crate::service::heartbeat::{HeartbeatHandler, HeartbeatRouter};
use crate::service::{HeartbeatChecker, ServeMode, ServerConfig, Shutdown};
use crate::AppError::IllegalState;
use crate::{AppError, AppResult};

enum BoundListener {
    Tcp {
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    },
    Websocket(TcpListener),
    Kcp(KcpListener),
}

/// Everything an accept loop needs to turn a socket into a running
/// connection.
#[derive(Clone)]
struct ServeContext {
    dispatcher: Arc<MsgDispatcher>,
    packet: Arc<dyn Packet>,
    hooks: ConnHooks,
    heartbeat: Option<HeartbeatChecker>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

/// The accept loop: binds one listener per [`ServeMode`], applies the
/// connection runtime to every accepted socket, and owns server-wide
/// shutdown.
///
/// Routing, interceptors, hooks and the heartbeat template are registered
/// between [`Server::bind`] and [`Server::serve`]; the dispatch pipeline is
/// frozen when serving starts.
pub struct Server {
    config: Arc<ServerConfig>,
    packet: Mutex<Arc<dyn Packet>>,
    registry: Arc<ConnRegistry>,
    routes: Mutex<RouteTable>,
    interceptors: Mutex<Vec<Arc<dyn Interceptor>>>,
    hooks: Mutex<ConnHooks>,
    heartbeat: Mutex<Option<HeartbeatChecker>>,
    listener: Mutex<Option<BoundListener>>,
    local_addr: SocketAddr,
    next_conn_id: AtomicU64,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Server {
    /// Binds the listener selected by `config.mode`. Unbindable addresses and
    /// invalid TLS material fail here, before any connection is accepted.
    pub async fn bind(config: ServerConfig) -> AppResult<Server> {
        config.validate()?;

        let (listener, local_addr) = match config.mode {
            ServeMode::Tcp => {
                let addr = config.listen_addr(config.tcp_port);
                let listener = TcpListener::bind(addr.as_str()).await.map_err(|e| {
                    IllegalState(format!("failed to bind tcp listener to {}: {}", addr, e))
                })?;
                let tls = match (&config.cert_file, &config.private_key_file) {
                    (Some(cert), Some(key)) => Some(load_tls_acceptor(cert, key)?),
                    _ => None,
                };
                let local_addr = listener.local_addr()?;
                (BoundListener::Tcp { listener, tls }, local_addr)
            }
            ServeMode::Websocket => {
                let addr = config.listen_addr(config.ws_port);
                let listener = TcpListener::bind(addr.as_str()).await.map_err(|e| {
                    IllegalState(format!("failed to bind ws listener to {}: {}", addr, e))
                })?;
                let local_addr = listener.local_addr()?;
                (BoundListener::Websocket(listener), local_addr)
            }
            ServeMode::Kcp => {
                let addr: SocketAddr = config
                    .listen_addr(config.kcp_port)
                    .parse()
                    .map_err(|e| AppError::InvalidValue(format!("kcp listen address: {}", e)))?;
                let listener = KcpListener::bind(kcp_config(&config), addr)
                    .await
                    .map_err(|e| {
                        IllegalState(format!("failed to bind kcp listener to {}: {}", addr, e))
                    })?;
                (BoundListener::Kcp(listener), addr)
            }
        };

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let packet: Arc<dyn Packet> = Arc::new(TlvPacket::new(config.max_packet_size));

        Ok(Server {
            registry: Arc::new(ConnRegistry::new(config.max_conn)),
            routes: Mutex::new(RouteTable::new(config.router_slices_mode)),
            interceptors: Mutex::new(Vec::new()),
            hooks: Mutex::new(ConnHooks::default()),
            heartbeat: Mutex::new(None),
            listener: Mutex::new(Some(listener)),
            local_addr,
            next_conn_id: AtomicU64::new(1),
            notify_shutdown,
            shutdown_complete_tx: Mutex::new(Some(shutdown_complete_tx)),
            shutdown_complete_rx: Mutex::new(Some(shutdown_complete_rx)),
            packet: Mutex::new(packet),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The bound listen address; with port 0 in the configuration this is
    /// where the OS actually put the listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnRegistry> {
        &self.registry
    }

    /// Replaces the wire codec. All connections accepted afterwards frame and
    /// encode with it.
    pub fn set_packet(&self, packet: Arc<dyn Packet>) {
        *self.packet.lock().unwrap() = packet;
    }

    pub fn add_router(&self, msg_id: u32, router: Arc<dyn Router>) -> AppResult<()> {
        self.routes.lock().unwrap().add_router(msg_id, router)
    }

    pub fn add_route_slices(
        &self,
        msg_id: u32,
        handlers: Vec<Arc<dyn RouterHandler>>,
    ) -> AppResult<()> {
        self.routes.lock().unwrap().add_route_slices(msg_id, handlers)
    }

    pub fn use_prelude(&self, handler: Arc<dyn RouterHandler>) -> AppResult<()> {
        self.routes.lock().unwrap().use_prelude(handler)
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.lock().unwrap().push(interceptor);
    }

    pub fn set_on_conn_start(&self, hook: ConnHookFn) {
        self.hooks.lock().unwrap().on_start = Some(hook);
    }

    pub fn set_on_conn_stop(&self, hook: ConnHookFn) {
        self.hooks.lock().unwrap().on_stop = Some(hook);
    }

    /// Probes every connection on `interval` with the default checker.
    pub fn start_heartbeat(&self, interval: Duration) {
        self.set_heartbeat(HeartbeatChecker::new(interval));
    }

    pub fn set_heartbeat(&self, checker: HeartbeatChecker) {
        *self.heartbeat.lock().unwrap() = Some(checker);
    }

    /// Runs the accept loop until [`Server::stop`] fires the shutdown
    /// broadcast. Call once; the routing table is frozen here.
    pub async fn serve(self: Arc<Self>) -> AppResult<()> {
        let mut table = std::mem::take(&mut *self.routes.lock().unwrap());
        let heartbeat = self.heartbeat.lock().unwrap().clone();
        if let Some(checker) = &heartbeat {
            // route probes so peers may answer them symmetrically
            if !table.contains(checker.msg_id()) {
                if table.slices_mode() {
                    table.add_route_slices(checker.msg_id(), vec![Arc::new(HeartbeatHandler)])?;
                } else {
                    table.add_router(checker.msg_id(), Arc::new(HeartbeatRouter))?;
                }
            }
        }

        let shutdown_complete_tx = self
            .shutdown_complete_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| IllegalState("server is already stopped".to_string()))?;
        let packet = self.packet.lock().unwrap().clone();
        let interceptors = std::mem::take(&mut *self.interceptors.lock().unwrap());
        let dispatcher = MsgDispatcher::start(
            table.freeze(),
            interceptors,
            packet.clone(),
            DispatcherOptions {
                worker_pool_size: self.config.worker_pool_size,
                max_worker_task_len: self.config.max_worker_task_len,
                worker_mode: self.config.worker_mode,
                request_pool_mode: self.config.request_pool_mode,
            },
            self.notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        );

        let context = ServeContext {
            dispatcher,
            packet,
            hooks: self.hooks.lock().unwrap().clone(),
            heartbeat,
            shutdown_complete_tx,
        };

        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| IllegalState("server is already serving".to_string()))?;

        info!(
            name = %self.config.name,
            addr = %self.local_addr,
            mode = ?self.config.mode,
            "server serving"
        );
        match listener {
            BoundListener::Tcp { listener, tls } => self.accept_tcp(listener, tls, context).await,
            BoundListener::Websocket(listener) => self.accept_websocket(listener, context).await,
            BoundListener::Kcp(listener) => self.accept_kcp(listener, context).await,
        }
    }

    /// Stops accepting, tears every connection down, and waits until all of
    /// them (and the worker pool) are gone.
    pub async fn stop(&self) {
        info!(name = %self.config.name, "server stopping");
        let _ = self.notify_shutdown.send(());
        for conn in self.registry.snapshot() {
            conn.stop();
        }
        let tx = self.shutdown_complete_tx.lock().unwrap().take();
        drop(tx);
        let rx = self.shutdown_complete_rx.lock().unwrap().take();
        if let Some(mut rx) = rx {
            let _ = rx.recv().await;
        }
        info!(name = %self.config.name, "server stopped");
    }

    async fn accept_tcp(
        self: &Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        context: ServeContext,
    ) -> AppResult<()> {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let mut backoff = 1;
        loop {
            let socket = tokio::select! {
                _ = shutdown.recv() => {
                    debug!("tcp accept loop received shutdown signal");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, _)) => {
                        backoff = 1;
                        socket
                    }
                    Err(e) => {
                        if backoff > 64 {
                            return Err(AppError::Accept(e.to_string()));
                        }
                        time::sleep(Duration::from_secs(backoff)).await;
                        backoff *= 2;
                        continue;
                    }
                }
            };

            let (remote, local) = match addrs_of(&socket) {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!(error = %e, "dropping socket without peer address");
                    continue;
                }
            };

            match &tls {
                Some(acceptor) => {
                    // handshake off the accept loop so a slow peer cannot
                    // stall other connections
                    let server = self.clone();
                    let acceptor = acceptor.clone();
                    let context = context.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(socket).await {
                            Ok(stream) => {
                                let (reader, writer) = split_stream(Box::new(stream) as Box<dyn IO>);
                                server.attach(&context, TransportKind::Tls, reader, writer, remote, local);
                            }
                            Err(e) => warn!(remote = %remote, error = %e, "tls handshake failed"),
                        }
                    });
                }
                None => {
                    let (reader, writer) = split_stream(Box::new(socket) as Box<dyn IO>);
                    self.attach(&context, TransportKind::Tcp, reader, writer, remote, local);
                }
            }
        }
    }

    async fn accept_websocket(
        self: &Arc<Self>,
        listener: TcpListener,
        context: ServeContext,
    ) -> AppResult<()> {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let mut backoff = 1;
        loop {
            let socket = tokio::select! {
                _ = shutdown.recv() => {
                    debug!("websocket accept loop received shutdown signal");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, _)) => {
                        backoff = 1;
                        socket
                    }
                    Err(e) => {
                        if backoff > 64 {
                            return Err(AppError::Accept(e.to_string()));
                        }
                        time::sleep(Duration::from_secs(backoff)).await;
                        backoff *= 2;
                        continue;
                    }
                }
            };

            let (remote, local) = match addrs_of(&socket) {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!(error = %e, "dropping socket without peer address");
                    continue;
                }
            };

            let server = self.clone();
            let context = context.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(socket).await {
                    Ok(ws) => {
                        let (reader, writer) = split_websocket(ws);
                        server.attach(
                            &context,
                            TransportKind::Websocket,
                            reader,
                            writer,
                            remote,
                            local,
                        );
                    }
                    Err(e) => warn!(remote = %remote, error = %e, "websocket handshake failed"),
                }
            });
        }
    }

    async fn accept_kcp(
        self: &Arc<Self>,
        mut listener: KcpListener,
        context: ServeContext,
    ) -> AppResult<()> {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let mut backoff = 1;
        loop {
            let (stream, remote) = tokio::select! {
                _ = shutdown.recv() => {
                    debug!("kcp accept loop received shutdown signal");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => {
                        backoff = 1;
                        pair
                    }
                    Err(e) => {
                        if backoff > 64 {
                            return Err(AppError::Accept(e.to_string()));
                        }
                        time::sleep(Duration::from_secs(backoff)).await;
                        backoff *= 2;
                        continue;
                    }
                }
            };

            let (reader, writer) = split_stream(Box::new(stream) as Box<dyn IO>);
            self.attach(
                &context,
                TransportKind::Kcp,
                reader,
                writer,
                remote,
                self.local_addr,
            );
        }
    }

    /// Registers the connection and spawns its driver. On a full registry the
    /// transport halves are dropped, which closes the socket.
    fn attach(
        &self,
        context: &ServeContext,
        kind: TransportKind,
        reader: TransportReader,
        writer: TransportWriter,
        remote: SocketAddr,
        local: SocketAddr,
    ) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (conn, msg_rx, buff_rx) = Connection::new(
            conn_id,
            kind,
            remote,
            local,
            context.packet.clone(),
            self.config.max_msg_chan_len,
        );
        if let Err(e) = self.registry.add(conn.clone()) {
            warn!(remote = %remote, error = %e, "rejecting connection");
            return;
        }
        let driver = ConnectionDriver {
            conn,
            reader,
            writer,
            msg_rx,
            buff_rx,
            framer: Framer::new(context.packet.length_field()),
            dispatcher: context.dispatcher.clone(),
            registry: self.registry.clone(),
            hooks: context.hooks.clone(),
            heartbeat: context.heartbeat.clone(),
            options: self.config.conn_options(),
            shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
            _shutdown_complete_tx: context.shutdown_complete_tx.clone(),
        };
        tokio::spawn(driver.run());
    }
}

fn addrs_of(socket: &TcpStream) -> std::io::Result<(SocketAddr, SocketAddr)> {
    Ok((socket.peer_addr()?, socket.local_addr()?))
}

fn kcp_config(config: &ServerConfig) -> KcpConfig {
    KcpConfig {
        nodelay: KcpNoDelayConfig {
            nodelay: config.kcp_no_delay != 0,
            interval: config.kcp_interval as i32,
            resend: config.kcp_resend as i32,
            nc: config.kcp_nc != 0,
        },
        wnd_size: (config.kcp_send_window, config.kcp_recv_window),
        stream: config.kcp_stream_mode,
        ..KcpConfig::default()
    }
}
