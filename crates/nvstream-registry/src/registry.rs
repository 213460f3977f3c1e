//! The host registry: the UUID-keyed record map, background polling
//! lifecycle, the add/pair/quit/delete tasks, and event emission.
//!
//! Lock order: the map lock is above per-record locks; the flush-state
//! mutex inside the persister is a leaf (never acquired while a record lock
//! is held). The polling-control mutex and the map lock are never held
//! together.

use crate::discovery::{DiscoveryBrowser, HostnameResolver, PendingDiscovery};
use crate::persist::{load_hosts, Persister, SettingsStore};
use crate::poller::HostPoller;
use crate::stun;
use async_trait::async_trait;
use nvstream_core::{
    Error, HostAddress, HostProbe, HostState, Result, SerializedHost, DEFAULT_HTTP_PORT,
};
use nvstream_crypto::ClientIdentity;
use nvstream_http::{parse_server_info, LogLevel, NvHttpClient};
use nvstream_pairing::{pair_host, PairOutcome};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STUN_TIMEOUT: Duration = Duration::from_secs(3);

/// Events surfaced to the UI layer.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A serialized attribute or the online state of a host changed.
    StateChanged { uuid: String },
    /// A pairing attempt finished; `error` is `None` on success.
    PairingCompleted { uuid: String, error: Option<String> },
    /// A host-add request finished.
    AddCompleted {
        success: bool,
        detected_port_blocking: bool,
    },
    /// A quit-app request finished; `error` is `None` on success.
    QuitCompleted { error: Option<String> },
}

/// A host record: immutable UUID plus lock-guarded mutable state.
pub struct Host {
    pub uuid: String,
    pub state: RwLock<HostState>,
}

pub type SharedHost = Arc<Host>;

/// Cloned view of one record for the UI.
#[derive(Debug, Clone)]
pub struct HostSnapshot {
    pub uuid: String,
    pub state: HostState,
}

/// Optional probe for distinguishing "host down" from "network blocks the
/// streaming ports" when a manual add fails.
#[async_trait]
pub trait ConnectivityTester: Send + Sync {
    async fn ports_blocked(&self) -> bool;
}

pub(crate) struct PollerHandle {
    shutdown: Arc<Notify>,
    interrupted: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    fn is_active(&self) -> bool {
        !self.task.is_finished() && !self.interrupted.load(Ordering::SeqCst)
    }
}

struct PollingState {
    refs: u32,
    pollers: HashMap<String, PollerHandle>,
    browser: Option<DiscoveryBrowser>,
}

pub struct RegistryInner {
    identity: Arc<ClientIdentity>,
    hosts: RwLock<HashMap<String, SharedHost>>,
    polling: Mutex<PollingState>,
    pending_discovery: Mutex<HashSet<String>>,
    events: mpsc::UnboundedSender<HostEvent>,
    persister: Persister,
    resolver: Option<Arc<dyn HostnameResolver>>,
    connectivity: Option<Arc<dyn ConnectivityTester>>,
    runtime: tokio::runtime::Handle,
}

/// The registry facade handed to the UI and session layers.
pub struct HostRegistry {
    inner: Arc<RegistryInner>,
}

impl HostRegistry {
    /// Load persisted hosts and start the persistence worker. Must be
    /// called from within a tokio runtime; background tasks are spawned on
    /// it. Pass a resolver to enable mDNS discovery.
    pub fn new(
        identity: Arc<ClientIdentity>,
        store: Arc<dyn SettingsStore>,
        resolver: Option<Arc<dyn HostnameResolver>>,
        connectivity: Option<Arc<dyn ConnectivityTester>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HostEvent>)> {
        let persisted = load_hosts(store.as_ref())?;

        let mut hosts = HashMap::new();
        for serialized in &persisted {
            let (uuid, state) = serialized.clone().into_state();
            hosts.insert(
                uuid.clone(),
                Arc::new(Host {
                    uuid,
                    state: RwLock::new(state),
                }),
            );
        }
        info!("Loaded {} saved hosts", hosts.len());

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|weak: &Weak<RegistryInner>| {
            let snapshot_weak = weak.clone();
            let persister = Persister::start(
                store,
                Box::new(move || match snapshot_weak.upgrade() {
                    Some(inner) => inner.snapshot_serialized(),
                    None => Vec::new(),
                }),
                persisted,
            );

            RegistryInner {
                identity,
                hosts: RwLock::new(hosts),
                polling: Mutex::new(PollingState {
                    refs: 0,
                    pollers: HashMap::new(),
                    browser: None,
                }),
                pending_discovery: Mutex::new(HashSet::new()),
                events: events_tx,
                persister,
                resolver,
                connectivity,
                runtime: tokio::runtime::Handle::current(),
            }
        });

        Ok((Self { inner }, events_rx))
    }

    /// Refcounted polling start: the first call starts the mDNS browser and
    /// one polling worker per known host.
    pub fn start_polling(&self) {
        {
            let mut polling = self.inner.polling.lock().unwrap();
            polling.refs += 1;
            if polling.refs > 1 {
                return;
            }

            if self.inner.resolver.is_some() {
                let weak = Arc::downgrade(&self.inner);
                match DiscoveryBrowser::start(move |hostname, port| {
                    if let Some(inner) = weak.upgrade() {
                        RegistryInner::handle_service_discovered(inner, hostname, port);
                    }
                }) {
                    Ok(browser) => polling.browser = Some(browser),
                    Err(e) => warn!("mDNS discovery unavailable: {}", e),
                }
            } else {
                warn!("mDNS discovery is disabled");
            }
        }

        let hosts: Vec<SharedHost> = self.inner.hosts.read().unwrap().values().cloned().collect();
        for host in hosts {
            RegistryInner::start_polling_host(&self.inner, host);
        }
    }

    /// Refcounted polling stop: the last call tears down the browser and
    /// interrupts the workers without waiting for them.
    pub fn stop_polling_async(&self) {
        let mut polling = self.inner.polling.lock().unwrap();
        debug_assert!(polling.refs > 0);
        polling.refs = polling.refs.saturating_sub(1);
        if polling.refs > 0 {
            return;
        }

        self.inner.pending_discovery.lock().unwrap().clear();
        polling.browser = None;
        for handle in polling.pollers.values() {
            handle.interrupt();
        }
    }

    /// Parse a user-entered address and schedule an add. Invalid input
    /// completes immediately with failure.
    pub fn add_host_manually(&self, text: &str) {
        match parse_manual_address(text) {
            Some(address) => self.add_host(address, false, None),
            None => {
                let _ = self.inner.events.send(HostEvent::AddCompleted {
                    success: false,
                    detected_port_blocking: false,
                });
            }
        }
    }

    /// Schedule an async host add.
    pub fn add_host(&self, address: HostAddress, from_mdns: bool, ipv6_global: Option<HostAddress>) {
        RegistryInner::spawn_add(self.inner.clone(), address, from_mdns, ipv6_global);
    }

    /// Schedule an async delete: halt the record's poller, drop persistence,
    /// then free the record.
    pub fn delete_host(&self, uuid: &str) {
        let inner = self.inner.clone();
        let uuid = uuid.to_string();
        self.inner.runtime.spawn(async move {
            let handle = inner.polling.lock().unwrap().pollers.remove(&uuid);
            let host = inner.hosts.write().unwrap().remove(&uuid);

            // Persist the shrunken list before tearing the poller down.
            inner.persister.request_flush();

            if let Some(handle) = handle {
                handle.interrupt();
                let _ = handle.task.await;
            }
            drop(host);
            info!("Deleted host {}", uuid);
        });
    }

    /// Rename a host; the new name is sticky against probe updates.
    pub fn rename_host(&self, uuid: &str, name: &str) {
        let Some(host) = self.inner.lookup(uuid) else {
            return;
        };
        {
            let mut state = host.state.write().unwrap();
            state.name = name.to_string();
            state.has_custom_name = true;
        }
        self.inner.handle_state_changed(&host);
    }

    /// Schedule an async pairing attempt.
    pub fn pair_host(&self, uuid: &str, pin: &str) {
        let Some(host) = self.inner.lookup(uuid) else {
            return;
        };
        let inner = self.inner.clone();
        let pin = pin.to_string();
        self.inner.runtime.spawn(async move {
            inner.run_pairing(host, pin).await;
        });
    }

    /// Schedule an async quit of the host's running app.
    pub fn quit_running_app(&self, uuid: &str) {
        let Some(host) = self.inner.lookup(uuid) else {
            return;
        };
        host.state.write().unwrap().pending_quit = true;

        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            inner.run_quit(host).await;
        });
    }

    /// Four decimal digits, cryptographically random, zero-padded.
    pub fn generate_pin_string() -> String {
        format!("{:04}", rand::rngs::OsRng.gen_range(0..10000u32))
    }

    /// Snapshot of all hosts, stably sorted by lowercased name.
    pub fn get_hosts(&self) -> Vec<HostSnapshot> {
        let mut snapshots: Vec<HostSnapshot> = {
            let hosts = self.inner.hosts.read().unwrap();
            hosts
                .values()
                .map(|host| HostSnapshot {
                    uuid: host.uuid.clone(),
                    state: host.state.read().unwrap().clone(),
                })
                .collect()
        };
        snapshots.sort_by_cached_key(|snapshot| (snapshot.state.name.to_lowercase(), snapshot.uuid.clone()));
        snapshots
    }

    /// Stop all background work and flush pending saves.
    pub fn shutdown(&self) {
        {
            let mut polling = self.inner.polling.lock().unwrap();
            polling.browser = None;
            for handle in polling.pollers.values() {
                handle.interrupt();
            }
            polling.pollers.clear();
            polling.refs = 0;
        }
        self.inner.persister.shutdown();
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<RegistryInner> {
        &self.inner
    }
}

impl RegistryInner {
    fn lookup(&self, uuid: &str) -> Option<SharedHost> {
        self.hosts.read().unwrap().get(uuid).cloned()
    }

    /// Serialize every host under its read lock, in stable UUID order.
    fn snapshot_serialized(&self) -> Vec<SerializedHost> {
        let hosts = self.hosts.read().unwrap();
        let mut serialized: Vec<SerializedHost> = hosts
            .values()
            .map(|host| {
                let state = host.state.read().unwrap();
                SerializedHost::from_state(&host.uuid, &state, true)
            })
            .collect();
        serialized.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        serialized
    }

    /// Emit a state change, complete any pending quit, and queue a save.
    pub(crate) fn handle_state_changed(&self, host: &SharedHost) {
        let _ = self.events.send(HostEvent::StateChanged {
            uuid: host.uuid.clone(),
        });

        let quit_finished = {
            let mut state = host.state.write().unwrap();
            if state.pending_quit && state.current_game == 0 {
                state.pending_quit = false;
                true
            } else {
                false
            }
        };
        if quit_finished {
            let _ = self.events.send(HostEvent::QuitCompleted { error: None });
        }

        self.save_host(host);
    }

    fn save_host(&self, host: &SharedHost) {
        let serialized = {
            let state = host.state.read().unwrap();
            SerializedHost::from_state(&host.uuid, &state, true)
        };
        self.persister.save_host_if_changed(&serialized);
    }

    /// Start a poller for one host if polling is active and none is live.
    fn start_polling_host(inner: &Arc<RegistryInner>, host: SharedHost) {
        let mut polling = inner.polling.lock().unwrap();
        if polling.refs == 0 {
            return;
        }
        if let Some(existing) = polling.pollers.get(&host.uuid) {
            if existing.is_active() {
                return;
            }
        }

        let shutdown = Arc::new(Notify::new());
        let interrupted = Arc::new(AtomicBool::new(false));
        let uuid = host.uuid.clone();
        let poller = HostPoller {
            host,
            registry: Arc::downgrade(inner),
            identity: inner.identity.clone(),
            shutdown: shutdown.clone(),
            interrupted: interrupted.clone(),
        };
        let task = inner.runtime.spawn(poller.run());
        polling.pollers.insert(
            uuid,
            PollerHandle {
                shutdown,
                interrupted,
                task,
            },
        );
    }

    /// A resolved mDNS advertisement: resolve the hostname with bounded
    /// retries, then promote to an add request.
    fn handle_service_discovered(inner: Arc<RegistryInner>, hostname: String, port: u16) {
        {
            let mut pending = inner.pending_discovery.lock().unwrap();
            if !pending.insert(hostname.clone()) {
                return;
            }
        }

        let runtime = inner.runtime.clone();
        runtime.spawn(async move {
            let Some(resolver) = inner.resolver.clone() else {
                return;
            };
            let entry = PendingDiscovery {
                hostname: hostname.clone(),
                port,
            };
            if let Some(discovered) = entry.resolve(resolver.as_ref()).await {
                RegistryInner::spawn_add(
                    inner.clone(),
                    discovered.primary,
                    true,
                    discovered.ipv6_global,
                );
            }
            inner.pending_discovery.lock().unwrap().remove(&hostname);
        });
    }

    fn spawn_add(
        inner: Arc<RegistryInner>,
        address: HostAddress,
        from_mdns: bool,
        ipv6_global: Option<HostAddress>,
    ) {
        let runtime = inner.runtime.clone();
        runtime.spawn(async move {
            inner.run_add(address, from_mdns, ipv6_global).await;
        });
    }

    async fn run_add(
        self: &Arc<Self>,
        address: HostAddress,
        from_mdns: bool,
        ipv6_global: Option<HostAddress>,
    ) {
        info!(
            "Processing new host at {} from {}",
            address,
            if from_mdns { "mDNS" } else { "user" }
        );

        let mut http = match NvHttpClient::new(address.clone(), 0, None, self.identity.clone()) {
            Ok(http) => http,
            Err(e) => {
                warn!("Could not build transport for {}: {}", address, e);
                self.emit_add_failure(from_mdns).await;
                return;
            }
        };

        // Initial serverinfo over HTTP; we don't yet know which cert to pin.
        let mut server_info = self.fetch_server_info_for_add(&http, from_mdns, true).await;
        if server_info.is_none() {
            if let Some(v6) = &ipv6_global {
                // The IPv4 or link-local address failed; the global IPv6
                // address may still be reachable.
                http.set_address(v6.clone());
                server_info = self.fetch_server_info_for_add(&http, from_mdns, false).await;
            }
        }
        let Some(xml) = server_info else {
            return;
        };

        let mut probe = match parse_server_info(&xml) {
            Ok(probe) => probe,
            Err(e) => {
                warn!("Unparseable serverinfo from {}: {}", address, e);
                self.emit_add_failure(from_mdns).await;
                return;
            }
        };
        let reached = http.address().clone();
        if probe.https_port != 0 {
            http.set_https_port(probe.https_port);
        }

        // If we already know this UUID, pin its certificate and refetch
        // over HTTPS. HTTPS fields refine the HTTP identity fetch; for
        // brand-new hosts the HTTP fetch is authoritative.
        let existing_cert = {
            let hosts = self.hosts.read().unwrap();
            hosts.get(&probe.uuid).and_then(|host| {
                let state = host.state.read().unwrap();
                if state.server_cert_pem.is_empty() {
                    None
                } else {
                    Some(state.server_cert_pem.clone())
                }
            })
        };
        if let Some(cert) = existing_cert {
            if http.set_server_cert(cert).is_ok() {
                match http.server_info(LogLevel::Verbose, false).await {
                    Ok(https_xml) => {
                        if let Ok(https_probe) = parse_server_info(&https_xml) {
                            if https_probe.uuid == probe.uuid {
                                probe = https_probe;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("HTTPS refinement failed for {}: {}", probe.uuid, e);
                        self.emit_add_failure(from_mdns).await;
                        return;
                    }
                }
            }
        }

        let (host, inserted, changed) =
            self.merge_or_insert(&probe, &address, from_mdns, &ipv6_global, &reached);

        if inserted {
            Self::start_polling_host(self, host.clone());

            // For user-initiated adds of an RFC 1918 address, learn the
            // external address once via STUN.
            if !from_mdns && address.is_site_local_v4() {
                match stun::find_external_ipv4(
                    stun::DEFAULT_STUN_SERVER,
                    stun::DEFAULT_STUN_PORT,
                    STUN_TIMEOUT,
                )
                .await
                {
                    Ok(external) => {
                        let mut state = host.state.write().unwrap();
                        state.remote_address =
                            Some(HostAddress::new(external.to_string(), DEFAULT_HTTP_PORT));
                    }
                    Err(e) => warn!("STUN failed to get WAN address: {}", e),
                }
            }
        }

        if !from_mdns {
            let _ = self.events.send(HostEvent::AddCompleted {
                success: true,
                detected_port_blocking: false,
            });
        }
        if inserted || changed {
            if !inserted {
                info!(
                    "{} is now at {}",
                    host.state.read().unwrap().name,
                    reached
                );
            }
            self.handle_state_changed(&host);
        }
    }

    async fn fetch_server_info_for_add(
        &self,
        http: &NvHttpClient,
        from_mdns: bool,
        last_attempt_emits: bool,
    ) -> Option<String> {
        match http.server_info(LogLevel::Verbose, false).await {
            Ok(xml) => Some(xml),
            Err(e) => {
                debug!("serverinfo failed for {}: {}", http.address(), e);
                if last_attempt_emits {
                    self.emit_add_failure(from_mdns).await;
                }
                None
            }
        }
    }

    async fn emit_add_failure(&self, from_mdns: bool) {
        if from_mdns {
            return;
        }
        // Distinguish an offline host from a network that blocks the
        // streaming ports, when a tester is configured.
        let blocked = match &self.connectivity {
            Some(tester) => tester.ports_blocked().await,
            None => false,
        };
        let _ = self.events.send(HostEvent::AddCompleted {
            success: false,
            detected_port_blocking: blocked,
        });
    }

    /// Fold a probe into the existing record with the same UUID, or insert
    /// a fresh record. Returns (record, inserted, changed).
    pub(crate) fn merge_or_insert(
        &self,
        probe: &HostProbe,
        dialed: &HostAddress,
        from_mdns: bool,
        ipv6_global: &Option<HostAddress>,
        reached: &HostAddress,
    ) -> (SharedHost, bool, bool) {
        // Opportunistic read; upgrade to write only when the record does
        // not exist yet (the map lock protects the map, not the records).
        let existing = self.lookup(&probe.uuid);
        if let Some(host) = existing {
            let changed = Self::apply_probe(&host, probe, dialed, from_mdns, ipv6_global, reached);
            return (host, false, changed);
        }

        let mut hosts = self.hosts.write().unwrap();
        // Someone may have raced the insert between our read and write.
        if let Some(host) = hosts.get(&probe.uuid).cloned() {
            drop(hosts);
            let changed = Self::apply_probe(&host, probe, dialed, from_mdns, ipv6_global, reached);
            return (host, false, changed);
        }

        let host = Arc::new(Host {
            uuid: probe.uuid.clone(),
            state: RwLock::new(HostState::default()),
        });
        hosts.insert(probe.uuid.clone(), host.clone());
        drop(hosts);

        Self::apply_probe(&host, probe, dialed, from_mdns, ipv6_global, reached);
        (host, true, true)
    }

    fn apply_probe(
        host: &SharedHost,
        probe: &HostProbe,
        dialed: &HostAddress,
        from_mdns: bool,
        ipv6_global: &Option<HostAddress>,
        reached: &HostAddress,
    ) -> bool {
        let mut state = host.state.write().unwrap();
        let mut changed = state.update_from(probe, reached.clone());

        if from_mdns {
            // Only store the dialed address as the local address when the
            // host actually answered on it.
            if reached == dialed && state.local_address.as_ref() != Some(dialed) {
                state.local_address = Some(dialed.clone());
                changed = true;
            }
            if let Some(v6) = ipv6_global {
                if state.ipv6_address.as_ref() != Some(v6) {
                    state.ipv6_address = Some(v6.clone());
                    changed = true;
                }
            }
        } else if state.manual_address.as_ref() != Some(dialed) {
            state.manual_address = Some(dialed.clone());
            changed = true;
        }
        changed
    }

    async fn run_pairing(self: &Arc<Self>, host: SharedHost, pin: String) {
        let (address, https_port, app_version, current_game) = {
            let state = host.state.read().unwrap();
            (
                state.unique_addresses().into_iter().next(),
                state.https_port,
                state.app_version.clone(),
                state.current_game,
            )
        };

        let Some(address) = address else {
            self.emit_pairing_completed(&host.uuid, Some("Host has no known address".to_string()));
            return;
        };

        // Pairing always starts from the unauthenticated endpoint.
        let mut http = match NvHttpClient::new(address, https_port, None, self.identity.clone()) {
            Ok(http) => http,
            Err(e) => {
                self.emit_pairing_completed(&host.uuid, Some(e.to_string()));
                return;
            }
        };

        match pair_host(&mut http, self.identity.clone(), &app_version, &pin).await {
            Ok(PairOutcome::Paired { server_cert_pem }) => {
                {
                    let mut state = host.state.write().unwrap();
                    state.server_cert_pem = server_cert_pem;
                    state.pair_state = nvstream_core::PairState::Paired;
                }
                // Persist the freshly pinned certificate.
                self.save_host(&host);
                self.emit_pairing_completed(&host.uuid, None);
            }
            Ok(PairOutcome::PinWrong) => {
                self.emit_pairing_completed(
                    &host.uuid,
                    Some("The PIN from the PC didn't match. Please try again.".to_string()),
                );
            }
            Ok(PairOutcome::AlreadyInProgress) => {
                self.emit_pairing_completed(
                    &host.uuid,
                    Some("Another pairing attempt is already in progress.".to_string()),
                );
            }
            Ok(PairOutcome::Failed) => {
                let message = if current_game != 0 {
                    "You cannot pair while a previous session is still running on the host PC. \
                     Quit any running games or reboot the host PC, then try pairing again."
                } else {
                    "Pairing failed. Please try again."
                };
                self.emit_pairing_completed(&host.uuid, Some(message.to_string()));
            }
            Err(e) => {
                self.emit_pairing_completed(&host.uuid, Some(e.to_string()));
            }
        }
    }

    fn emit_pairing_completed(&self, uuid: &str, error: Option<String>) {
        let _ = self.events.send(HostEvent::PairingCompleted {
            uuid: uuid.to_string(),
            error,
        });
    }

    async fn run_quit(self: &Arc<Self>, host: SharedHost) {
        let (address, https_port, cert, current_game) = {
            let state = host.state.read().unwrap();
            (
                state.unique_addresses().into_iter().next(),
                state.https_port,
                state.server_cert_pem.clone(),
                state.current_game,
            )
        };

        if current_game == 0 {
            // Nothing running; completion is signaled immediately by the
            // next state change.
            return;
        }

        let fail = |error: String| {
            host.state.write().unwrap().pending_quit = false;
            let _ = self.events.send(HostEvent::QuitCompleted { error: Some(error) });
        };

        let Some(address) = address else {
            fail("Host has no known address".to_string());
            return;
        };
        let cert = if cert.is_empty() { None } else { Some(cert) };
        let http = match NvHttpClient::new(address, https_port, cert, self.identity.clone()) {
            Ok(http) => http,
            Err(e) => {
                fail(e.to_string());
                return;
            }
        };

        if let Err(e) = http.quit_app().await {
            match e {
                Error::HostProtocol(ref proto) if proto.status == 599 => {
                    fail(
                        "The running game wasn't started by this PC. You must quit the game on \
                         the host PC manually or use the device that originally started the game."
                            .to_string(),
                    );
                }
                other => fail(other.to_string()),
            }
        }
        // On success the polling worker observes currentgame returning to 0
        // and completes the pending quit.
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.persister.shutdown();
    }
}

/// Parse user input as `host[:port]`, a bracketed IPv6 URL form, or a bare
/// IPv6 literal.
pub(crate) fn parse_manual_address(text: &str) -> Option<HostAddress> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    // Bare IPv6 literal without URL escaping gets the default port.
    if let Ok(v6) = text.parse::<Ipv6Addr>() {
        return Some(HostAddress::new(v6.to_string(), DEFAULT_HTTP_PORT));
    }

    // Bracketed IPv6: [addr] or [addr]:port
    if let Some(rest) = text.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        host.parse::<Ipv6Addr>().ok()?;
        let port = if tail.is_empty() {
            DEFAULT_HTTP_PORT
        } else {
            tail.strip_prefix(':')?.parse().ok()?
        };
        return Some(HostAddress::new(host, port));
    }

    // Anything else with multiple colons is a malformed literal.
    if text.matches(':').count() > 1 {
        return None;
    }

    let (host, port) = match text.split_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (text, DEFAULT_HTTP_PORT),
    };
    if host.is_empty() {
        return None;
    }
    Some(HostAddress::new(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;

    fn test_identity() -> Arc<ClientIdentity> {
        static IDENTITY: std::sync::OnceLock<Arc<ClientIdentity>> = std::sync::OnceLock::new();
        IDENTITY
            .get_or_init(|| Arc::new(ClientIdentity::generate().unwrap()))
            .clone()
    }

    fn probe(uuid: &str, name: &str) -> HostProbe {
        HostProbe {
            uuid: uuid.to_string(),
            name: name.to_string(),
            https_port: 47984,
            app_version: "7.1.431.0".to_string(),
            ..Default::default()
        }
    }

    fn addr(a: &str) -> HostAddress {
        HostAddress::new(a, 47989)
    }

    async fn new_registry() -> (HostRegistry, mpsc::UnboundedReceiver<HostEvent>) {
        HostRegistry::new(test_identity(), Arc::new(MemoryStore::new()), None, None).unwrap()
    }

    mod manual_parsing {
        use super::*;

        #[test]
        fn plain_host_gets_default_port() {
            assert_eq!(
                parse_manual_address("192.168.1.50"),
                Some(HostAddress::new("192.168.1.50", DEFAULT_HTTP_PORT))
            );
            assert_eq!(
                parse_manual_address("gamingpc"),
                Some(HostAddress::new("gamingpc", DEFAULT_HTTP_PORT))
            );
        }

        #[test]
        fn explicit_port_is_kept() {
            assert_eq!(
                parse_manual_address("192.168.1.50:48010"),
                Some(HostAddress::new("192.168.1.50", 48010))
            );
        }

        #[test]
        fn ipv6_literals_and_brackets() {
            assert_eq!(
                parse_manual_address("fe80::1"),
                Some(HostAddress::new("fe80::1", DEFAULT_HTTP_PORT))
            );
            assert_eq!(
                parse_manual_address("[2600:1700::4]:48010"),
                Some(HostAddress::new("2600:1700::4", 48010))
            );
            assert_eq!(
                parse_manual_address("[2600:1700::4]"),
                Some(HostAddress::new("2600:1700::4", DEFAULT_HTTP_PORT))
            );
        }

        #[test]
        fn garbage_is_rejected() {
            assert_eq!(parse_manual_address(""), None);
            assert_eq!(parse_manual_address("  "), None);
            assert_eq!(parse_manual_address("a:b:c"), None);
            assert_eq!(parse_manual_address(":47989"), None);
            assert_eq!(parse_manual_address("[not-v6]:1"), None);
        }
    }

    mod folding {
        use super::*;

        #[tokio::test]
        async fn same_uuid_from_two_addresses_folds_into_one_record() {
            let (registry, _events) = new_registry().await;
            let inner = registry.inner();

            let (first, inserted, _) = inner.merge_or_insert(
                &probe("u1", "GAMINGPC"),
                &addr("192.168.1.50"),
                true,
                &None,
                &addr("192.168.1.50"),
            );
            assert!(inserted);

            let (second, inserted, _) = inner.merge_or_insert(
                &probe("u1", "GAMINGPC"),
                &addr("10.0.0.8"),
                false,
                &None,
                &addr("10.0.0.8"),
            );
            assert!(!inserted);
            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(registry.get_hosts().len(), 1);

            // The active address is the one that answered last.
            let state = second.state.read().unwrap();
            assert_eq!(state.active_address, Some(addr("10.0.0.8")));
            assert_eq!(state.local_address, Some(addr("192.168.1.50")));
            assert_eq!(state.manual_address, Some(addr("10.0.0.8")));
            assert!(state
                .unique_addresses()
                .contains(state.active_address.as_ref().unwrap()));
        }

        #[tokio::test]
        async fn mdns_add_keeps_unreachable_dialed_address_out() {
            let (registry, _events) = new_registry().await;
            let inner = registry.inner();

            // Dialed the IPv4 but only the IPv6 answered.
            let (host, _, _) = inner.merge_or_insert(
                &probe("u1", "GAMINGPC"),
                &addr("192.168.1.50"),
                true,
                &Some(addr("2600:1700::4")),
                &addr("2600:1700::4"),
            );

            let state = host.state.read().unwrap();
            assert_eq!(state.local_address, None);
            assert_eq!(state.ipv6_address, Some(addr("2600:1700::4")));
            assert_eq!(state.active_address, Some(addr("2600:1700::4")));
        }
    }

    mod snapshots {
        use super::*;

        #[tokio::test]
        async fn hosts_sort_by_lowercased_name() {
            let (registry, _events) = new_registry().await;
            let inner = registry.inner();

            inner.merge_or_insert(&probe("u1", "zeta"), &addr("10.0.0.1"), true, &None, &addr("10.0.0.1"));
            inner.merge_or_insert(&probe("u2", "Alpha"), &addr("10.0.0.2"), true, &None, &addr("10.0.0.2"));
            inner.merge_or_insert(&probe("u3", "beta"), &addr("10.0.0.3"), true, &None, &addr("10.0.0.3"));

            let names: Vec<String> = registry
                .get_hosts()
                .into_iter()
                .map(|h| h.state.name)
                .collect();
            assert_eq!(names, vec!["Alpha", "beta", "zeta"]);
        }
    }

    mod rename {
        use super::*;

        #[tokio::test]
        async fn rename_is_sticky_and_emits() {
            let (registry, mut events) = new_registry().await;
            let inner = registry.inner();

            let (host, _, _) = inner.merge_or_insert(
                &probe("u1", "GAMINGPC"),
                &addr("192.168.1.50"),
                true,
                &None,
                &addr("192.168.1.50"),
            );

            registry.rename_host("u1", "den pc");
            assert!(matches!(
                events.recv().await,
                Some(HostEvent::StateChanged { uuid }) if uuid == "u1"
            ));

            // A later probe must not clobber the custom name.
            host.state
                .write()
                .unwrap()
                .update_from(&probe("u1", "GAMINGPC"), addr("192.168.1.50"));
            assert_eq!(host.state.read().unwrap().name, "den pc");
        }
    }

    mod pins {
        use super::*;

        #[test]
        fn pins_are_four_zero_padded_digits() {
            for _ in 0..64 {
                let pin = HostRegistry::generate_pin_string();
                assert_eq!(pin.len(), 4);
                assert!(pin.chars().all(|c| c.is_ascii_digit()));
            }
        }
    }

    mod persistence_integration {
        use super::*;
        use crate::persist::{Slot, SettingsStore};
        use std::time::Duration;

        #[tokio::test(flavor = "multi_thread")]
        async fn state_changes_reach_the_store() {
            let store = Arc::new(MemoryStore::new());
            let (registry, _events) =
                HostRegistry::new(test_identity(), store.clone(), None, None).unwrap();
            let inner = registry.inner();

            let (host, _, _) = inner.merge_or_insert(
                &probe("u1", "GAMINGPC"),
                &addr("192.168.1.50"),
                true,
                &None,
                &addr("192.168.1.50"),
            );
            inner.handle_state_changed(&host);

            let mut written = Vec::new();
            for _ in 0..200 {
                written = store.read_slot(Slot::Primary).unwrap();
                if !written.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(written.len(), 1);
            assert_eq!(written[0].uuid, "u1");
            assert_eq!(written[0].name, "GAMINGPC");

            registry.shutdown();
        }

        #[tokio::test]
        async fn saved_hosts_reload_on_startup() {
            let store = Arc::new(MemoryStore::new());
            {
                let (registry, _events) =
                    HostRegistry::new(test_identity(), store.clone(), None, None).unwrap();
                let inner = registry.inner();
                let (host, _, _) = inner.merge_or_insert(
                    &probe("u1", "GAMINGPC"),
                    &addr("192.168.1.50"),
                    true,
                    &None,
                    &addr("192.168.1.50"),
                );
                inner.save_host(&host);
                registry.shutdown();
            }

            let (registry, _events) =
                HostRegistry::new(test_identity(), store.clone(), None, None).unwrap();
            let hosts = registry.get_hosts();
            assert_eq!(hosts.len(), 1);
            assert_eq!(hosts[0].uuid, "u1");
            assert_eq!(hosts[0].state.reachability, nvstream_core::Reachability::Unknown);
            registry.shutdown();
        }
    }
}
