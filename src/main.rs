//! Headless demo: bootstrap the client identity, start the host registry
//! with mDNS discovery, and print host events until interrupted.

use nvstream_crypto::ClientIdentity;
use nvstream_registry::{HostEvent, HostRegistry, HostnameResolver, JsonFileStore, MdnsResolver};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let data_dir = data_dir();
    let identity = match ClientIdentity::load_or_generate(&data_dir) {
        Ok(identity) => Arc::new(identity),
        Err(e) => {
            error!("Could not initialize client identity: {}", e);
            return;
        }
    };
    info!("Client identity ready");

    let store = Arc::new(JsonFileStore::new(&data_dir));
    let resolver: Option<Arc<dyn HostnameResolver>> = match MdnsResolver::new() {
        Ok(resolver) => Some(Arc::new(resolver)),
        Err(e) => {
            error!("mDNS resolver unavailable, discovery disabled: {}", e);
            None
        }
    };

    let (registry, mut events) = match HostRegistry::new(identity, store, resolver, None) {
        Ok(pair) => pair,
        Err(e) => {
            error!("Could not start host registry: {}", e);
            return;
        }
    };

    // A manually specified host skips discovery entirely.
    if let Some(address) = std::env::args().nth(1) {
        registry.add_host_manually(&address);
    }

    registry.start_polling();
    info!("Polling started; waiting for hosts (Ctrl-C to exit)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                match event {
                    Some(HostEvent::StateChanged { uuid }) => {
                        for host in registry.get_hosts() {
                            if host.uuid == uuid {
                                info!(
                                    "{}: {:?} {:?} at {:?}",
                                    host.state.name,
                                    host.state.reachability,
                                    host.state.pair_state,
                                    host.state.active_address,
                                );
                            }
                        }
                    }
                    Some(HostEvent::AddCompleted { success, detected_port_blocking }) => {
                        info!(success, detected_port_blocking, "Host add completed");
                    }
                    Some(HostEvent::PairingCompleted { uuid, error }) => {
                        info!(%uuid, ?error, "Pairing completed");
                    }
                    Some(HostEvent::QuitCompleted { error }) => {
                        info!(?error, "Quit completed");
                    }
                    None => break,
                }
            }
        }
    }

    registry.stop_polling_async();
    registry.shutdown();
}

fn data_dir() -> std::path::PathBuf {
    std::env::var_os("NVSTREAM_DATA_DIR")
        .map(Into::into)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|home| std::path::PathBuf::from(home).join(".config/nvstream"))
                .unwrap_or_else(|| ".".into())
        })
}
