use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use coap_gateway::codec::Codec;
use coap_gateway::config::GatewayConfig;
use coap_gateway::gateway::{Gateway, HttpOrigin};
use coap_gateway::mapper::Mapper;
use coap_gateway::observe::{Observations, ObserveConfig};
use coap_gateway::server::UdpGatewayServer;
use coap_gateway::Metrics;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coap_gateway=info".parse()?),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::load_from(path.into()),
        None => GatewayConfig::load(),
    }
    .context("Could not load the configuration")?;

    let metrics = Arc::new(Metrics::default());
    let upstream =
        Arc::new(HttpOrigin::new(&config.homeserver).context("Bad homeserver address")?);
    let observations = Observations::with_sync_defaults(
        upstream.clone(),
        Codec::v1(false, metrics.clone()),
        ObserveConfig::default(),
    );
    let gateway = Arc::new(Gateway::new(
        Mapper::v1(metrics),
        observations,
        upstream,
        &config,
    ));

    let server = UdpGatewayServer::bind(&config.listen_address, gateway, config.transport.clone())
        .await
        .context("Could not start up the server")?;
    info!(
        listen_address = %config.listen_address,
        homeserver_address = %config.homeserver,
        "Server up"
    );

    tokio::select! {
        result = server.run() => result.context("Failed to run the CoAP server")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            server.gateway().observations().shutdown().await;
        }
    }

    Ok(())
}
