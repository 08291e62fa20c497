//! Broker Worker - Entry Point

#[tokio::main]
async fn main() -> eyre::Result<()> {
    core_config::tracing::install_color_eyre();
    broker_worker::run().await
}
