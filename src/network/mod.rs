//! Networking core: byte-stream framing, the transport abstraction, the
//! per-connection runtime, and the shared connection registry.
//!
//! Inbound bytes flow `transport -> framer -> interceptor chain`; outbound
//! messages flow `send queue -> packet codec -> transport`. Each connection
//! owns a reader loop and a writer task, both bound to one cancellation
//! token, so the first teardown trigger (peer EOF, write failure, `stop`,
//! heartbeat timeout) winds down the whole connection.

pub use connection::{ConnHookFn, ConnHooks, ConnState, Connection};
pub use framer::{ByteOrder, Framer, LengthField};
pub use registry::ConnRegistry;
pub use transport::{TransportKind, TransportReader, TransportWriter, IO};

pub(crate) use connection::ConnectionDriver;
pub(crate) use transport::{load_tls_acceptor, split_stream, split_websocket};

mod connection;
mod framer;
mod registry;
mod transport;
