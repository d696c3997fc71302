use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig as TlsServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::{AppError, AppResult};

/// Marker for any boxable byte-stream transport.
pub trait IO: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IO for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    Websocket,
    Kcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Tls => write!(f, "tls"),
            TransportKind::Websocket => write!(f, "websocket"),
            TransportKind::Kcp => write!(f, "kcp"),
        }
    }
}

/// Read side of an accepted transport. Byte-stream transports feed the
/// framing buffer directly; WebSocket appends each binary payload to it, so
/// the same length-field framing applies on every transport.
pub enum TransportReader {
    Stream(ReadHalf<Box<dyn IO>>),
    Websocket(SplitStream<WebSocketStream<TcpStream>>),
}

/// Write side of an accepted transport.
pub enum TransportWriter {
    Stream(WriteHalf<Box<dyn IO>>),
    Websocket(SplitSink<WebSocketStream<TcpStream>, WsMessage>),
}

pub fn split_stream(io: Box<dyn IO>) -> (TransportReader, TransportWriter) {
    let (reader, writer) = tokio::io::split(io);
    (
        TransportReader::Stream(reader),
        TransportWriter::Stream(writer),
    )
}

pub fn split_websocket(ws: WebSocketStream<TcpStream>) -> (TransportReader, TransportWriter) {
    let (sink, stream) = ws.split();
    (
        TransportReader::Websocket(stream),
        TransportWriter::Websocket(sink),
    )
}

impl TransportReader {
    /// Appends incoming bytes to `buf`, returning how many arrived. Zero
    /// means the peer closed the transport.
    pub async fn read_into(&mut self, buf: &mut BytesMut) -> AppResult<usize> {
        match self {
            TransportReader::Stream(reader) => Ok(reader.read_buf(buf).await?),
            TransportReader::Websocket(stream) => loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Binary(data))) => {
                        if data.is_empty() {
                            continue;
                        }
                        buf.extend_from_slice(&data);
                        return Ok(data.len());
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(0),
                    // the protocol layer answers pings on the next flush
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                        continue;
                    }
                    Some(Ok(WsMessage::Text(_))) => {
                        return Err(AppError::DetailedIo(
                            "text frames are not accepted on binary transports".to_string(),
                        ));
                    }
                    Some(Err(e)) => return Err(AppError::DetailedIo(e.to_string())),
                }
            },
        }
    }
}

impl TransportWriter {
    pub async fn write_all(&mut self, data: Bytes) -> AppResult<()> {
        match self {
            TransportWriter::Stream(writer) => {
                writer.write_all(&data).await?;
                writer.flush().await?;
                Ok(())
            }
            TransportWriter::Websocket(sink) => sink
                .send(WsMessage::Binary(data.to_vec()))
                .await
                .map_err(|e| AppError::DetailedIo(e.to_string())),
        }
    }

    pub async fn shutdown(&mut self) {
        match self {
            TransportWriter::Stream(writer) => {
                let _ = writer.shutdown().await;
            }
            TransportWriter::Websocket(sink) => {
                let _ = sink.close().await;
            }
        }
    }
}

/// Builds a TLS acceptor from PEM files. Called once at server start; bad
/// material is a fatal configuration error.
pub(crate) fn load_tls_acceptor(cert_file: &str, key_file: &str) -> AppResult<TlsAcceptor> {
    let certs = {
        let mut reader = BufReader::new(File::open(cert_file)?);
        rustls_pemfile::certs(&mut reader)?
            .into_iter()
            .map(Certificate)
            .collect::<Vec<_>>()
    };
    if certs.is_empty() {
        return Err(AppError::Tls(format!(
            "no certificates found in {cert_file}"
        )));
    }

    let mut keys = {
        let mut reader = BufReader::new(File::open(key_file)?);
        rustls_pemfile::pkcs8_private_keys(&mut reader)?
    };
    if keys.is_empty() {
        let mut reader = BufReader::new(File::open(key_file)?);
        keys = rustls_pemfile::rsa_private_keys(&mut reader)?;
    }
    let key = keys
        .into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| AppError::Tls(format!("no private key found in {key_file}")))?;

    let config = TlsServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AppError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
