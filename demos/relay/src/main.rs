//! Standalone relay server.
//!
//! Environment variables:
//! - VISOR_RELAY_SECRET_KEY: hex-encoded ed25519 seed (random if unset)
//! - VISOR_RELAY_ADDR: bind address (default 0.0.0.0:8081)
//! - VISOR_RELAY_PUBLIC_ADDR: address advertised in discovery
//! - VISOR_DISCOVERY_URL: relay discovery URL (in-memory registry if unset)
//! - RUST_LOG: tracing filter (default info)

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use visor_transport::crypto::{Keypair, SecKey};
use visor_transport::disc::{DiscoveryClient, HttpDiscovery, MemoryDiscovery};
use visor_transport::server::{Server, ServerBuilder};

const DEFAULT_ADDR: &str = "0.0.0.0:8081";

fn keys_from_env() -> Result<Keypair, String> {
    match std::env::var("VISOR_RELAY_SECRET_KEY") {
        Ok(hex) => hex
            .parse::<SecKey>()
            .map(Keypair::from_secret)
            .map_err(|e| format!("VISOR_RELAY_SECRET_KEY: {e}")),
        Err(_) => Ok(Keypair::generate()),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let keys = match keys_from_env() {
        Ok(keys) => keys,
        Err(e) => {
            error!(error = %e, "Invalid relay key");
            std::process::exit(2);
        }
    };
    let disc: Arc<dyn DiscoveryClient> = match std::env::var("VISOR_DISCOVERY_URL") {
        Ok(url) => Arc::new(HttpDiscovery::new(url)),
        Err(_) => Arc::new(MemoryDiscovery::new()),
    };

    let mut builder = ServerBuilder::new();
    if let Ok(public) = std::env::var("VISOR_RELAY_PUBLIC_ADDR") {
        builder = builder.public_address(public);
    }
    let server = Server::new(keys, disc, builder.build());
    let addr = std::env::var("VISOR_RELAY_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    info!(pk = %server.pk(), addr = %addr, "Starting relay server");

    let serving = server.clone();
    let task = tokio::spawn(async move { serving.listen_and_serve(&addr).await });

    tokio::select! {
        result = task => match result {
            Ok(Err(e)) => error!(error = %e, "Relay server stopped"),
            Err(e) => error!(error = %e, "Relay server task failed"),
            Ok(Ok(())) => {}
        },
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    server.close().await;
}
