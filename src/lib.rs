pub mod network;
pub mod protocol;
pub mod request;
pub mod service;
pub mod utils;

pub use service::{
    global_config, init_tracing, setup_file_tracing, setup_local_tracing, AppError, AppResult,
    Client, ConnOptions, HeartbeatChecker, ServeMode, Server, ServerConfig, Shutdown, WorkerMode,
    GLOBAL_CONFIG, HEARTBEAT_DEFAULT_MSG_ID,
};

pub use network::{ByteOrder, ConnRegistry, ConnState, Connection, Framer, LengthField, TransportKind};
pub use protocol::{LtvPacket, Message, Packet, TlvPacket};
pub use request::{Chain, ElapsedTime, Interceptor, Recovery, Request, RouteTable, Router, RouterHandler};
