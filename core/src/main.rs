/// StaffChat server - main entry point
use staffchat_core::{messenger_api, ChatService, Config};
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let api_addr = config.api_addr;

    let service = ChatService::new(config)
        .map_err(|e| anyhow::anyhow!("Failed to open chat service: {}", e))?;
    let liveness = service.start();
    info!("Starting StaffChat on http://{}", api_addr);

    tokio::select! {
        result = messenger_api::start_messenger_api(service.clone(), api_addr) => {
            result.map_err(|e| anyhow::anyhow!("Messenger API error: {}", e))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down");
        }
    }

    liveness.abort();
    service
        .flush()
        .map_err(|e| anyhow::anyhow!("Failed to flush chat DB: {}", e))?;
    info!("StaffChat stopped");
    Ok(())
}
