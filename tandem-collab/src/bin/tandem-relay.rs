//! Standalone relay server.
//!
//! Configured through `TANDEM_BIND_ADDR`, `TANDEM_STORAGE_PATH` and
//! `TANDEM_BROADCAST_CAPACITY`; log level through `RUST_LOG`.

use std::sync::Arc;

use tandem_collab::{Relay, RelayConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = RelayConfig::from_env();
    log::info!("Starting relay on {}", config.bind_addr);
    let relay = Arc::new(Relay::new(config)?);
    relay.run().await?;
    Ok(())
}
