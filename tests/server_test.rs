use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;

use tidenet::{
    Client, ConnState, ElapsedTime, HeartbeatChecker, LtvPacket, Recovery, Request, Router,
    RouterHandler, ServeMode, Server, ServerConfig, WorkerMode,
};

/// The reference exchange: LTV little-endian, len=5, tag=1, "HELLO".
const HELLO_FRAME: [u8; 13] = [
    0x05, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x48, 0x45, 0x4C, 0x4C, 0x4F,
];

fn ltv_frame(tag: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&tag.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        tcp_port: 0,
        worker_pool_size: 0,
        ..Default::default()
    }
}

struct EchoRouter;

#[async_trait]
impl Router for EchoRouter {
    async fn handle(&self, request: &mut Request) {
        let msg_id = request.message().id();
        let data = request.message().data().clone();
        let _ = request.connection().send_buff_msg(msg_id, &data);
    }
}

async fn start_echo_server(config: ServerConfig) -> Arc<Server> {
    let max_packet_size = config.max_packet_size;
    let server = Server::bind(config).await.unwrap();
    server.set_packet(Arc::new(LtvPacket::new(max_packet_size)));
    server.add_router(1, Arc::new(EchoRouter)).unwrap();
    let server = Arc::new(server);
    tokio::spawn(server.clone().serve());
    server
}

#[tokio::test]
async fn test_ltv_echo_round_trip() {
    let server = start_echo_server(test_config()).await;
    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();

    socket.write_all(&HELLO_FRAME).await.unwrap();
    let mut reply = [0u8; 13];
    timeout(Duration::from_secs(2), socket.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, HELLO_FRAME);

    server.stop().await;
    assert_eq!(server.registry().len(), 0);
}

#[tokio::test]
async fn test_frame_split_across_two_segments() {
    let server = start_echo_server(test_config()).await;
    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();

    socket.write_all(&HELLO_FRAME[..6]).await.unwrap();
    socket.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    socket.write_all(&HELLO_FRAME[6..]).await.unwrap();

    let mut reply = [0u8; 13];
    timeout(Duration::from_secs(2), socket.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, HELLO_FRAME);

    server.stop().await;
}

#[tokio::test]
async fn test_oversize_frame_closes_connection() {
    let config = ServerConfig {
        max_packet_size: 4,
        ..test_config()
    };
    let server = start_echo_server(config).await;
    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();

    // declares a 5-byte value against a 4-byte cap
    socket.write_all(&HELLO_FRAME).await.unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), socket.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    // no echo came back; the server closed the transport instead
    assert_eq!(n, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_worker_pool_preserves_per_connection_order() {
    let config = ServerConfig {
        worker_pool_size: 4,
        ..test_config()
    };
    let server = start_echo_server(config).await;

    let drive = |payloads: Vec<Vec<u8>>| {
        let addr = server.local_addr();
        async move {
            let mut socket = TcpStream::connect(addr).await.unwrap();
            let mut wire = Vec::new();
            for payload in &payloads {
                wire.extend_from_slice(&ltv_frame(1, payload));
            }
            socket.write_all(&wire).await.unwrap();

            let mut replies = Vec::new();
            for payload in &payloads {
                let mut reply = vec![0u8; 8 + payload.len()];
                timeout(Duration::from_secs(2), socket.read_exact(&mut reply))
                    .await
                    .unwrap()
                    .unwrap();
                replies.push(reply[8..].to_vec());
            }
            replies
        }
    };

    let first = vec![b"a0".to_vec(), b"a1".to_vec(), b"a2".to_vec()];
    let second = vec![b"b0".to_vec(), b"b1".to_vec(), b"b2".to_vec()];
    let (got_first, got_second) = tokio::join!(drive(first.clone()), drive(second.clone()));
    assert_eq!(got_first, first);
    assert_eq!(got_second, second);

    server.stop().await;
}

#[tokio::test]
async fn test_bind_worker_mode_round_trip() {
    let config = ServerConfig {
        worker_pool_size: 2,
        worker_mode: WorkerMode::Bind,
        ..test_config()
    };
    let server = start_echo_server(config).await;
    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();

    socket.write_all(&HELLO_FRAME).await.unwrap();
    let mut reply = [0u8; 13];
    timeout(Duration::from_secs(2), socket.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, HELLO_FRAME);

    server.stop().await;
}

#[tokio::test]
async fn test_heartbeat_stops_silent_peer() {
    let config = ServerConfig {
        heartbeat_max_secs: 2,
        ..test_config()
    };
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_probe = fired.clone();

    let server = Server::bind(config).await.unwrap();
    server.set_packet(Arc::new(LtvPacket::new(4096)));
    server.add_router(1, Arc::new(EchoRouter)).unwrap();
    server.set_heartbeat(
        HeartbeatChecker::new(Duration::from_millis(500)).with_on_remote_not_alive(move |conn| {
            fired_probe.fetch_add(1, Ordering::SeqCst);
            conn.stop();
        }),
    );
    let server = Arc::new(server);
    tokio::spawn(server.clone().serve());

    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
    // stay silent; swallow probe frames until the server hangs up
    let mut buf = [0u8; 64];
    let deadline = Duration::from_secs(5);
    let start = std::time::Instant::now();
    loop {
        let n = timeout(deadline, socket.read(&mut buf)).await.unwrap().unwrap();
        if n == 0 {
            break;
        }
    }
    let waited = start.elapsed();
    assert!(
        waited >= Duration::from_millis(1500) && waited < Duration::from_secs(4),
        "connection closed after {:?}",
        waited
    );
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.registry().len(), 0);

    server.stop().await;
}

struct PanicOnBoom;

#[async_trait]
impl RouterHandler for PanicOnBoom {
    async fn handle(&self, request: &mut Request) {
        let data = request.message().data().clone();
        if data.as_ref() == b"boom" {
            panic!("handler exploded on request");
        }
        let msg_id = request.message().id();
        let _ = request.connection().send_buff_msg(msg_id, &data);
    }
}

#[tokio::test]
async fn test_slices_recovery_keeps_connection_serving() {
    let config = ServerConfig {
        router_slices_mode: true,
        ..test_config()
    };
    let server = Server::bind(config).await.unwrap();
    server.set_packet(Arc::new(LtvPacket::new(4096)));
    server.use_prelude(Arc::new(Recovery)).unwrap();
    server.use_prelude(Arc::new(ElapsedTime)).unwrap();
    server
        .add_route_slices(7, vec![Arc::new(PanicOnBoom)])
        .unwrap();
    let server = Arc::new(server);
    tokio::spawn(server.clone().serve());

    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
    socket.write_all(&ltv_frame(7, b"boom")).await.unwrap();
    socket.write_all(&ltv_frame(7, b"still here")).await.unwrap();

    let mut reply = vec![0u8; 8 + b"still here".len()];
    timeout(Duration::from_secs(2), socket.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply[8..], b"still here");

    server.stop().await;
}

struct CaptureRouter {
    tx: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
}

#[async_trait]
impl Router for CaptureRouter {
    async fn handle(&self, request: &mut Request) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(request.message().data().to_vec());
        }
    }
}

#[tokio::test]
async fn test_client_round_trip_and_lifecycle() {
    let server = start_echo_server(test_config()).await;

    let client = Client::new(server.local_addr().to_string());
    client.set_packet(Arc::new(LtvPacket::new(4096)));
    let (tx, rx) = oneshot::channel();
    client
        .add_router(
            1,
            Arc::new(CaptureRouter {
                tx: Mutex::new(Some(tx)),
            }),
        )
        .unwrap();

    let conn = client.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.state(), ConnState::Running);
    conn.send_msg(1, b"HELLO").await.unwrap();

    let echoed = timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    assert_eq!(echoed, b"HELLO");

    client.stop().await;
    assert_eq!(conn.state(), ConnState::Closed);

    server.stop().await;
}

#[tokio::test]
async fn test_registry_cap_rejects_extra_connections() {
    let config = ServerConfig {
        max_conn: 1,
        ..test_config()
    };
    let server = start_echo_server(config).await;

    let mut first = TcpStream::connect(server.local_addr()).await.unwrap();
    first.write_all(&HELLO_FRAME).await.unwrap();
    let mut reply = [0u8; 13];
    timeout(Duration::from_secs(2), first.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();

    // second connection is accepted at the socket level, then closed
    let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(2), second.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(server.registry().len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_websocket_echo() {
    let config = ServerConfig {
        mode: ServeMode::Websocket,
        ws_port: 0,
        ..test_config()
    };
    let server = start_echo_server(config).await;

    let url = format!("ws://{}", server.local_addr());
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws.send(tokio_tungstenite::tungstenite::Message::Binary(
        HELLO_FRAME.to_vec(),
    ))
    .await
    .unwrap();

    let reply = loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let tokio_tungstenite::tungstenite::Message::Binary(data) = msg {
            break data;
        }
    };
    assert_eq!(&reply[..], &HELLO_FRAME[..]);

    server.stop().await;
}

#[tokio::test]
async fn test_conn_hooks_run_once_around_lifecycle() {
    let started = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicUsize::new(0));

    let server = Server::bind(test_config()).await.unwrap();
    server.set_packet(Arc::new(LtvPacket::new(4096)));
    server.add_router(1, Arc::new(EchoRouter)).unwrap();
    let started_hook = started.clone();
    server.set_on_conn_start(Arc::new(move |_conn| {
        started_hook.fetch_add(1, Ordering::SeqCst);
    }));
    let stopped_hook = stopped.clone();
    server.set_on_conn_stop(Arc::new(move |_conn| {
        stopped_hook.fetch_add(1, Ordering::SeqCst);
    }));
    let server = Arc::new(server);
    tokio::spawn(server.clone().serve());

    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
    socket.write_all(&HELLO_FRAME).await.unwrap();
    let mut reply = [0u8; 13];
    timeout(Duration::from_secs(2), socket.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    drop(socket);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
    assert_eq!(server.registry().len(), 0);

    server.stop().await;
}
