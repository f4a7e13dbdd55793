use clap::Parser;
use kube::client::Client;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use workload_queue_controller::controllers;
use workload_queue_controller::utils::config::ControllerConfig;
use workload_queue_controller::utils::error::Error;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    let config = ControllerConfig::parse();

    // The client is shared by the watches and the status writers
    let kubernetes_client: Client = Client::try_default().await?;

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(err) => error!("Failed to listen for shutdown signal: {}", err),
        }
        shutdown.cancel();
    });

    controllers::run(kubernetes_client, config, token).await;
    Ok(())
}
