pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
#[error("server error")]
pub enum AppError {
    /// framing errors, both close the offending connection
    #[error("frame of {got} bytes exceeds limit {limit}")]
    FrameTooLarge { got: usize, limit: usize },

    #[error("malformed frame: {0}")]
    FrameMalformed(String),

    /// registry refused a new connection, the accept loop closes the socket
    #[error("max connections exceeded")]
    MaxConnectionsExceeded,

    /// bounded send queue is at capacity, surfaced to the caller
    #[error("message buffer full")]
    BufferFull,

    /// any send attempted once the connection reached Closing
    #[error("connection closed")]
    ConnectionClosed,

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIo(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSend(String),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("accept error: {0}")]
    Accept(String),

    /// marker error, the framer needs more bytes
    Incomplete,
}
