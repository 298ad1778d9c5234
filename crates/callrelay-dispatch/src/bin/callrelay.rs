//! Engine entry point: load config, start the controller, run until
//! interrupted

use callrelay_core::{init_logging, Config};
use callrelay_dispatch::Controller;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_logging(&config.logging)?;

    let controller = Controller::start(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    controller.shutdown().await;

    Ok(())
}
