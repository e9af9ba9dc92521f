//! Pixel server — shared real-time canvas over WebSocket.
//!
//! Configuration comes from the environment (`PORT`, `PIXEL_DB_PATH`,
//! `PIXEL_BOARD_WIDTH`, ...). Logging follows `RUST_LOG`, default `info`.

use log::{error, info};
use std::process::ExitCode;

use pixel_collab::{CanvasServer, ServerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    info!(
        "Starting pixel server: board {}×{}, storage {}",
        config.board.width,
        config.board.height,
        config
            .storage_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "in-memory".to_string())
    );

    let server = match CanvasServer::start(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let code = tokio::select! {
        result = server.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Server stopped: {e}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            ExitCode::SUCCESS
        }
    };

    server.shutdown().await;
    code
}
