//! `canopy serve`: Start the HTTP gateway.

use canopy_config::AppConfig;

use crate::runtime::CliResult;

pub async fn run(port_override: Option<u16>) -> CliResult {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("Canopy gateway listening on {}:{}", config.gateway.host, config.gateway.port);
    canopy_gateway::start(config).await
}
