//! tor-relay: run an onion router relay.
//!
//! Usage: `tor-relay [torrc]`. Without a torrc the built-in defaults apply.

use rand::Rng;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant};
use tor_relay::{OnionRouter, RelayConfig, Termination};
use tracing_subscriber::EnvFilter;

const ROTATION_PERIOD: Duration = Duration::from_secs(60 * 60);
const ROTATION_JITTER_SECS: u64 = 10 * 60;
const PUBLISH_PERIOD: Duration = Duration::from_secs(18 * 60 * 60);

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = RelayConfig::default();
    if let Some(path) = std::env::args().nth(1) {
        if let Err(e) = config.read_file(&path) {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
        log::info!("Loaded configuration from {}", path);
    }

    let router = match OnionRouter::new(config) {
        Ok(router) => Arc::new(router),
        Err(e) => {
            log::error!("Cannot start relay: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut running = {
        let router = Arc::clone(&router);
        tokio::spawn(async move { router.run().await })
    };

    publish(&router);

    let mut publish_tick = interval_at(Instant::now() + PUBLISH_PERIOD, PUBLISH_PERIOD);
    let rotation = sleep(next_rotation());
    tokio::pin!(rotation);

    loop {
        tokio::select! {
            _ = &mut rotation => {
                match router.rotate_keys() {
                    Ok(descriptor) => log::info!(
                        "New onion key {}, previous valid until {:?}",
                        descriptor.ntor_onion_key,
                        descriptor.previous_expires_at
                    ),
                    Err(e) => log::warn!("Key rotation failed, retrying next period: {}", e),
                }
                rotation.as_mut().reset(Instant::now() + next_rotation());
            }
            _ = publish_tick.tick() => publish(&router),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log::warn!("Cannot listen for Ctrl-C: {}", e);
                }
                log::info!("Interrupted, shutting down");
                router.shutdown();
            }
            finished = &mut running => {
                return match finished {
                    Ok(Ok(Termination::Shutdown)) => ExitCode::SUCCESS,
                    Ok(Ok(Termination::Fatal(e))) => {
                        log::error!("Relay engine failed: {}", e);
                        ExitCode::FAILURE
                    }
                    Ok(Err(e)) => {
                        log::error!("Relay engine could not run: {}", e);
                        ExitCode::FAILURE
                    }
                    Err(e) => {
                        log::error!("Relay engine task died: {}", e);
                        ExitCode::FAILURE
                    }
                };
            }
        }
    }
}

fn next_rotation() -> Duration {
    ROTATION_PERIOD + Duration::from_secs(rand::thread_rng().gen_range(0..ROTATION_JITTER_SECS))
}

fn publish(router: &OnionRouter) {
    if !router.config().public_server {
        log::debug!("PublishServerDescriptor is off; not publishing");
        return;
    }
    let published = router
        .snapshot()
        .and_then(|snapshot| {
            serde_json::to_string(&snapshot)
                .map_err(|e| tor_relay::RelayError::Internal(format!("snapshot encoding: {}", e)))
        });
    match published {
        Ok(json) => log::info!("📜 Publishing descriptor {}", json),
        Err(e) => log::warn!("Descriptor not published: {}", e),
    }
}
