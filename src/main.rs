mod config;
mod registry;
mod skyq;

use std::time::Duration;

use tracing::{error, info, warn};

use registry::DeviceRegistry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting skyq-control (devices={}, poll_interval={}s)",
        config.devices.len(),
        config.poll_interval_secs,
    );
    for device in &config.devices {
        info!(
            "  Device: {} ({}) at {} (http {}, control {})",
            device.name, device.id, device.host, device.http_port, device.tcp_port,
        );
    }

    let registry = match DeviceRegistry::new(Duration::from_secs(config.poll_interval_secs)) {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to start registry: {}", e);
            std::process::exit(1);
        }
    };

    for device in config.devices {
        let id = device.id.clone();
        if let Err(e) = registry.add(device) {
            warn!("Skipping device {}: {}", id, e);
        }
    }

    // Main loop: periodic health summary + shutdown signals
    let mut health_timer = tokio::time::interval(Duration::from_secs(60));
    health_timer.tick().await;
    loop {
        tokio::select! {
            _ = health_timer.tick() => {
                for (id, status) in registry.health_snapshot() {
                    let model = status
                        .identity
                        .as_ref()
                        .map(|i| i.model.as_str())
                        .unwrap_or("unknown");
                    info!(
                        "  {}: {} (model {}, {} consecutive failures)",
                        id, status.state, model, status.consecutive_failures,
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = async {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).expect("Failed to register SIGTERM handler");
                sigterm.recv().await;
            } => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    registry.shutdown();
    info!("skyq-control stopped");
}
