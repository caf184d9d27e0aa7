use anyhow::Result;
use mission_control::{api::ApiServer, app::MissionControl, config::Config};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting Mission Control task lifecycle engine");

    let config = Config::load()?;
    let app = MissionControl::new(config.clone());
    let reconciler_handle = app.spawn_reconciler_loop();

    let api_server = ApiServer::new(config, app)?;

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                tracing::error!("API server failed: {}", e);
            }
        }
        _ = reconciler_handle => {
            tracing::error!("reconciler loop exited unexpectedly");
        }
    }

    Ok(())
}
