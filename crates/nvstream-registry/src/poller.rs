//! Per-host liveness polling.
//!
//! One worker per host while polling is active. Each cycle probes every
//! unique address in order; a previously online host gets
//! `TRIES_BEFORE_OFFLINING` full passes before being marked offline, while a
//! single success onlines an offline host immediately.

use crate::registry::{RegistryInner, SharedHost};
use nvstream_core::{HostAddress, PairState, ParseError, Reachability, Result};
use nvstream_crypto::ClientIdentity;
use nvstream_http::{parse_server_info, LogLevel, NvHttpClient};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

pub const TRIES_BEFORE_OFFLINING: u32 = 2;
pub const POLLS_PER_APP_LIST_FETCH: u32 = 10;
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(3);

pub(crate) struct HostPoller {
    pub host: SharedHost,
    pub registry: Weak<RegistryInner>,
    pub identity: Arc<ClientIdentity>,
    pub shutdown: Arc<Notify>,
    pub interrupted: Arc<AtomicBool>,
}

impl HostPoller {
    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) async fn run(self) {
        let (first_address, cert, https_port) = {
            let state = self.host.state.read().unwrap();
            (
                state.unique_addresses().into_iter().next(),
                state.server_cert_pem.clone(),
                state.https_port,
            )
        };
        let Some(first_address) = first_address else {
            debug!("Host {} has no addresses to poll", self.host.uuid);
            return;
        };

        // One transport shared across every iteration of this worker.
        let cert = if cert.is_empty() { None } else { Some(cert) };
        let Ok(mut http) = NvHttpClient::new(first_address, https_port, cert, self.identity.clone())
        else {
            return;
        };

        // Fetch the app list on the first cycle.
        let mut polls_since_app_list = POLLS_PER_APP_LIST_FETCH;

        loop {
            if self.is_interrupted() {
                return;
            }

            let mut state_changed = false;
            let (addresses, cert_pem, https_port, was_online, name) = {
                let state = self.host.state.read().unwrap();
                (
                    state.unique_addresses(),
                    state.server_cert_pem.clone(),
                    state.https_port,
                    state.reachability == Reachability::Online,
                    state.name.clone(),
                )
            };

            // Pairing may have pinned a certificate since the last cycle.
            if !cert_pem.is_empty() && http.server_cert_pem() != Some(cert_pem.as_str()) {
                let _ = http.set_server_cert(cert_pem);
            }
            if https_port != 0 {
                http.set_https_port(https_port);
            }

            let mut online = false;
            let tries = if was_online { TRIES_BEFORE_OFFLINING } else { 1 };
            'attempts: for _ in 0..tries {
                for address in &addresses {
                    if self.is_interrupted() {
                        return;
                    }
                    if let Ok(changed) = self.try_poll(&mut http, address).await {
                        if !was_online {
                            info!("{} is now online at {}", name, address);
                        }
                        online = true;
                        state_changed |= changed;
                        break 'attempts;
                    }
                }
            }

            if !online {
                let mut state = self.host.state.write().unwrap();
                if state.reachability != Reachability::Offline {
                    info!("{} is now offline", name);
                    state.reachability = Reachability::Offline;
                    state_changed = true;
                }
            }

            // Refetch the app list when it's empty or stale, but only for
            // an online, paired host.
            polls_since_app_list += 1;
            let (eligible, list_empty) = {
                let state = self.host.state.read().unwrap();
                (
                    state.reachability == Reachability::Online
                        && state.pair_state == PairState::Paired,
                    state.app_list.is_empty(),
                )
            };
            if eligible && (list_empty || polls_since_app_list >= POLLS_PER_APP_LIST_FETCH) {
                // Notify before the potentially slow list fetch so onlining
                // is never delayed behind it.
                if state_changed {
                    self.notify_state_changed();
                    state_changed = false;
                }

                let (fetched, changed) = self.update_app_list(&http).await;
                if fetched {
                    polls_since_app_list = 0;
                }
                state_changed |= changed;
            }

            if state_changed {
                self.notify_state_changed();
            }

            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn try_poll(&self, http: &mut NvHttpClient, address: &HostAddress) -> Result<bool> {
        http.set_address(address.clone());
        let xml = http.server_info(LogLevel::None, true).await?;
        let probe = parse_server_info(&xml)?;

        // Make sure the machine that answered is the one this record
        // identifies; a probe for a different UUID is discarded.
        if probe.uuid != self.host.uuid {
            info!(
                "Found unexpected host {} while looking for {}",
                probe.name, self.host.uuid
            );
            return Err(ParseError::InvalidValue("host UUID mismatch".to_string()).into());
        }

        if probe.https_port != 0 {
            http.set_https_port(probe.https_port);
        }

        let changed = {
            let mut state = self.host.state.write().unwrap();
            state.update_from(&probe, address.clone())
        };
        Ok(changed)
    }

    async fn update_app_list(&self, http: &NvHttpClient) -> (bool, bool) {
        match http.app_list().await {
            Ok(apps) if !apps.is_empty() => {
                let changed = {
                    let mut state = self.host.state.write().unwrap();
                    state.update_app_list(apps)
                };
                (true, changed)
            }
            Ok(_) => (false, false),
            Err(e) => {
                debug!("App list fetch failed for {}: {}", self.host.uuid, e);
                (false, false)
            }
        }
    }

    fn notify_state_changed(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.handle_state_changed(&self.host);
        }
    }
}
