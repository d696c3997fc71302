use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};

use tidenet::{
    init_tracing, AppError, AppResult, HeartbeatChecker, Request, Router, Server, ServerConfig,
    GLOBAL_CONFIG,
};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    PrintConfig,
}

/// Demo route: answers every message with the same tag and payload.
struct EchoRouter;

#[async_trait]
impl Router for EchoRouter {
    async fn handle(&self, request: &mut Request) {
        let msg_id = request.message().id();
        let data = request.message().data().clone();
        if let Err(e) = request.connection().send_buff_msg(msg_id, &data) {
            warn!(msg_id, error = %e, "echo reply failed");
        }
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("conf.toml"), PathBuf::from);
    let config = if config_path.exists() {
        ServerConfig::from_file(&config_path)?
    } else {
        ServerConfig::default()
    };

    if let Some(Command::PrintConfig) = commandline.command {
        let rendered = serde_json::to_string_pretty(&config)
            .map_err(|e| AppError::InvalidValue(e.to_string()))?;
        println!("{rendered}");
        return Ok(());
    }

    let _tracing_guard = init_tracing(&config)?;
    GLOBAL_CONFIG
        .set(config.clone())
        .expect("set global config failed");

    let server = Server::bind(config).await?;
    server.add_router(1, Arc::new(EchoRouter))?;
    server.set_heartbeat(HeartbeatChecker::new(Duration::from_secs(5)));
    let server = Arc::new(server);

    tokio::select! {
        res = server.clone().serve() => {
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = signal::ctrl_c() => {
            info!("get shutdown signal");
        }
    }

    server.stop().await;
    Ok(())
}
