extern crate config as rs_config;

use std::path::Path;
use std::time::Duration;

use getset::CopyGetters;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::AppError::InvalidValue;
use crate::AppResult;

/// Process-wide configuration used by the binary path. Library users build a
/// [`ServerConfig`] directly and hand it to the server; either way the object
/// is frozen once serving starts.
pub static GLOBAL_CONFIG: OnceCell<ServerConfig> = OnceCell::new();

pub fn global_config() -> &'static ServerConfig {
    GLOBAL_CONFIG.get().expect("global config is not set")
}

/// Which listener the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServeMode {
    Tcp,
    Websocket,
    Kcp,
}

/// How inbound messages are placed onto workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// worker index = connection id modulo pool size; preserves per-connection order
    Hash,
    /// first message pins the connection to a worker, round-robin
    Bind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// server identifier, used in logs
    pub name: String,
    pub host: String,
    pub tcp_port: u16,
    pub ws_port: u16,
    pub kcp_port: u16,
    pub mode: ServeMode,
    /// registry cap; the accept loop closes sockets past it
    pub max_conn: usize,
    /// cap on the value portion of a frame
    pub max_packet_size: u32,
    /// 0 disables the pool and routes on the reader task
    pub worker_pool_size: usize,
    pub max_worker_task_len: usize,
    pub worker_mode: WorkerMode,
    /// per-connection bounded outbound queue
    pub max_msg_chan_len: usize,
    pub io_read_buff_size: usize,
    pub write_timeout_secs: u64,
    /// seconds of peer silence before the not-alive reaction fires
    pub heartbeat_max_secs: u64,
    /// both files present enables TLS on the TCP listener
    pub cert_file: Option<String>,
    pub private_key_file: Option<String>,
    pub router_slices_mode: bool,
    pub request_pool_mode: bool,
    /// empty means stdout-only logging
    pub log_dir: String,
    pub log_file: String,

    pub kcp_no_delay: u32,
    pub kcp_interval: u32,
    pub kcp_resend: u32,
    pub kcp_nc: u32,
    pub kcp_send_window: u16,
    pub kcp_recv_window: u16,
    pub kcp_ack_no_delay: bool,
    /// enable stream mode; default false
    pub kcp_stream_mode: bool,
    pub kcp_fec_data_shards: usize,
    pub kcp_fec_parity_shards: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            name: "tidenet-server".to_string(),
            host: "0.0.0.0".to_string(),
            tcp_port: 8999,
            ws_port: 9000,
            kcp_port: 9001,
            mode: ServeMode::Tcp,
            max_conn: 12000,
            max_packet_size: 4096,
            worker_pool_size: 10,
            max_worker_task_len: 1024,
            worker_mode: WorkerMode::Hash,
            max_msg_chan_len: 1024,
            io_read_buff_size: 1024,
            write_timeout_secs: 10,
            heartbeat_max_secs: 10,
            cert_file: None,
            private_key_file: None,
            router_slices_mode: false,
            request_pool_mode: false,
            log_dir: String::new(),
            log_file: String::new(),
            kcp_no_delay: 1,
            kcp_interval: 10,
            kcp_resend: 2,
            kcp_nc: 1,
            kcp_send_window: 1024,
            kcp_recv_window: 1024,
            kcp_ack_no_delay: false,
            kcp_stream_mode: false,
            kcp_fec_data_shards: 0,
            kcp_fec_parity_shards: 0,
        }
    }
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(InvalidValue("config file path is not utf-8".to_string()))?;
        let raw = rs_config::Config::builder()
            .add_source(rs_config::File::with_name(path_str))
            .build()?;
        let config: ServerConfig = raw.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_packet_size == 0 {
            return Err(InvalidValue("max_packet_size must be positive".to_string()));
        }
        if self.max_conn == 0 {
            return Err(InvalidValue("max_conn must be positive".to_string()));
        }
        if self.worker_pool_size > 0 && self.max_worker_task_len == 0 {
            return Err(InvalidValue(
                "max_worker_task_len must be positive when the worker pool is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn heartbeat_max(&self) -> Duration {
        Duration::from_secs(self.heartbeat_max_secs)
    }

    pub fn conn_options(&self) -> ConnOptions {
        ConnOptions {
            io_read_buff_size: self.io_read_buff_size,
            max_msg_chan_len: self.max_msg_chan_len,
            write_timeout: self.write_timeout(),
            heartbeat_max: self.heartbeat_max(),
        }
    }
}

/// The per-connection slice of the configuration, snapshotted at accept time.
#[derive(Debug, Clone, Copy, CopyGetters)]
#[get_copy = "pub"]
pub struct ConnOptions {
    io_read_buff_size: usize,
    max_msg_chan_len: usize,
    write_timeout: Duration,
    heartbeat_max: Duration,
}

impl Default for ConnOptions {
    fn default() -> Self {
        ServerConfig::default().conn_options()
    }
}

#[cfg(test)]
mod tests {
    use super::rs_config::{self, FileFormat};
    use super::*;

    #[test]
    fn test_defaults_are_serving_ready() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.mode, ServeMode::Tcp);
        assert_eq!(config.worker_mode, WorkerMode::Hash);
        assert_eq!(config.max_packet_size, 4096);
        assert!(!config.kcp_stream_mode);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let toml = r#"
            name = "edge"
            mode = "websocket"
            max_packet_size = 128
            worker_pool_size = 0
            router_slices_mode = true
        "#;
        let raw = rs_config::Config::builder()
            .add_source(rs_config::File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap();
        let config: ServerConfig = raw.try_deserialize().unwrap();
        assert_eq!(config.name, "edge");
        assert_eq!(config.mode, ServeMode::Websocket);
        assert_eq!(config.max_packet_size, 128);
        assert_eq!(config.worker_pool_size, 0);
        assert!(config.router_slices_mode);
        // untouched fields keep their defaults
        assert_eq!(config.max_conn, 12000);
    }

    #[test]
    fn test_validate_rejects_zero_packet_cap() {
        let config = ServerConfig {
            max_packet_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
