use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::network::{
    split_stream, ConnHookFn, ConnHooks, ConnRegistry, Connection, ConnectionDriver, Framer,
    TransportKind, IO,
};
use crate::protocol::{Packet, TlvPacket};
use crate::request::{DispatcherOptions, Interceptor, MsgDispatcher, RouteTable, Router, RouterHandler};
use crate::service::heartbeat::{HeartbeatHandler, HeartbeatRouter};
use crate::service::{ConnOptions, HeartbeatChecker, Shutdown, WorkerMode};
use crate::AppError::IllegalState;
use crate::AppResult;

/// Connector side of the framework: dials a TCP peer and runs the same
/// connection runtime as the server, with the worker pool disabled so
/// dispatch happens synchronously on the reader.
pub struct Client {
    name: String,
    addr: String,
    packet: Mutex<Arc<dyn Packet>>,
    routes: Mutex<RouteTable>,
    interceptors: Mutex<Vec<Arc<dyn Interceptor>>>,
    hooks: Mutex<ConnHooks>,
    heartbeat: Mutex<Option<HeartbeatChecker>>,
    options: ConnOptions,
    registry: Arc<ConnRegistry>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: Mutex<Option<mpsc::Receiver<()>>>,
    conn: Mutex<Option<Arc<Connection>>>,
}

impl Client {
    /// Single-handler routing client.
    pub fn new(addr: impl Into<String>) -> Client {
        Self::with_mode(addr, false)
    }

    /// Middleware-slices routing client.
    pub fn new_slices(addr: impl Into<String>) -> Client {
        Self::with_mode(addr, true)
    }

    fn with_mode(addr: impl Into<String>, slices_mode: bool) -> Client {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        Client {
            name: "tidenet-client".to_string(),
            addr: addr.into(),
            packet: Mutex::new(Arc::new(TlvPacket::new(4096))),
            routes: Mutex::new(RouteTable::new(slices_mode)),
            interceptors: Mutex::new(Vec::new()),
            hooks: Mutex::new(ConnHooks::default()),
            heartbeat: Mutex::new(None),
            options: ConnOptions::default(),
            registry: Arc::new(ConnRegistry::new(1)),
            notify_shutdown,
            shutdown_complete_tx: Mutex::new(Some(shutdown_complete_tx)),
            shutdown_complete_rx: Mutex::new(Some(shutdown_complete_rx)),
            conn: Mutex::new(None),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Client {
        self.name = name.into();
        self
    }

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

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.lock().unwrap().push(interceptor);
    }

    pub fn set_on_conn_start(&self, hook: ConnHookFn) {
        self.hooks.lock().unwrap().on_start = Some(hook);
    }

    pub fn set_on_conn_stop(&self, hook: ConnHookFn) {
        self.hooks.lock().unwrap().on_stop = Some(hook);
    }

    pub fn set_heartbeat(&self, checker: HeartbeatChecker) {
        *self.heartbeat.lock().unwrap() = Some(checker);
    }

    /// Dials the peer and starts the reader/writer loops. The returned handle
    /// is also available through [`Client::connection`].
    pub async fn connect(&self) -> AppResult<Arc<Connection>> {
        let socket = TcpStream::connect(self.addr.as_str()).await?;
        let remote = socket.peer_addr()?;
        let local = socket.local_addr()?;

        let mut table = std::mem::take(&mut *self.routes.lock().unwrap());
        let heartbeat = self.heartbeat.lock().unwrap().clone();
        if let Some(checker) = &heartbeat {
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
            .ok_or_else(|| IllegalState("client is already stopped".to_string()))?;
        let packet = self.packet.lock().unwrap().clone();
        let interceptors = std::mem::take(&mut *self.interceptors.lock().unwrap());
        let dispatcher = MsgDispatcher::start(
            table.freeze(),
            interceptors,
            packet.clone(),
            DispatcherOptions {
                worker_pool_size: 0,
                max_worker_task_len: 0,
                worker_mode: WorkerMode::Hash,
                request_pool_mode: false,
            },
            self.notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        );

        let (reader, writer) = split_stream(Box::new(socket) as Box<dyn IO>);
        let (conn, msg_rx, buff_rx) = Connection::new(
            0,
            TransportKind::Tcp,
            remote,
            local,
            packet.clone(),
            self.options.max_msg_chan_len(),
        );
        self.registry.add(conn.clone())?;

        let driver = ConnectionDriver {
            conn: conn.clone(),
            reader,
            writer,
            msg_rx,
            buff_rx,
            framer: Framer::new(packet.length_field()),
            dispatcher,
            registry: self.registry.clone(),
            hooks: self.hooks.lock().unwrap().clone(),
            heartbeat,
            options: self.options,
            shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
            _shutdown_complete_tx: shutdown_complete_tx,
        };
        tokio::spawn(driver.run());

        info!(name = %self.name, remote = %remote, "client connected");
        *self.conn.lock().unwrap() = Some(conn.clone());
        Ok(conn)
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.lock().unwrap().clone()
    }

    /// Tears the connection down and waits for its loops to finish.
    pub async fn stop(&self) {
        let _ = self.notify_shutdown.send(());
        if let Some(conn) = self.connection() {
            conn.stop();
        }
        let tx = self.shutdown_complete_tx.lock().unwrap().take();
        drop(tx);
        let rx = self.shutdown_complete_rx.lock().unwrap().take();
        if let Some(mut rx) = rx {
            let _ = rx.recv().await;
        }
        info!(name = %self.name, "client stopped");
    }
}

// options are fixed at construction; expose a builder-style override
impl Client {
    pub fn with_options(mut self, options: ConnOptions) -> Client {
        self.options = options;
        self
    }
}
