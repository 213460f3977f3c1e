//! mDNS discovery of GameStream hosts.
//!
//! The browser watches `_nvstream._tcp.local.` service announcements. Each
//! advertised hostname becomes a pending entry that is resolved with a
//! bounded number of retries before being promoted to a host-add request or
//! discarded.

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use nvstream_core::{DiscoveryError, HostAddress, Result};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SERVICE_TYPE: &str = "_nvstream._tcp.local.";
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);
pub const RESOLVE_RETRIES: u32 = 10;

/// Resolves an advertised hostname to its addresses. The mDNS daemon backs
/// the real implementation; tests substitute scripted resolvers.
#[async_trait]
pub trait HostnameResolver: Send + Sync {
    async fn resolve(&self, hostname: &str, timeout: Duration) -> Vec<IpAddr>;
}

/// A/AAAA resolution through the mDNS daemon.
pub struct MdnsResolver {
    daemon: ServiceDaemon,
}

impl MdnsResolver {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| DiscoveryError::Daemon(format!("Failed to create mDNS daemon: {}", e)))?;
        Ok(Self { daemon })
    }
}

#[async_trait]
impl HostnameResolver for MdnsResolver {
    async fn resolve(&self, hostname: &str, timeout: Duration) -> Vec<IpAddr> {
        let receiver = match self
            .daemon
            .resolve_hostname(hostname, Some(timeout.as_millis() as u64))
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Hostname resolution request failed for {}: {}", hostname, e);
                return Vec::new();
            }
        };

        let deadline = std::time::Instant::now() + timeout;
        let mut addresses: Vec<IpAddr> = Vec::new();
        while std::time::Instant::now() < deadline {
            match receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(mdns_sd::HostnameResolutionEvent::AddressesFound(_, found)) => {
                    addresses.extend(found.iter().copied());
                }
                Ok(mdns_sd::HostnameResolutionEvent::SearchTimeout(_)) => break,
                Ok(_) => {}
                Err(_) => {
                    // Poll again until the deadline; the daemon batches
                    // answers.
                    tokio::task::yield_now().await;
                }
            }
        }
        addresses
    }
}

/// The "best" IPv6 global address from a resolved set: the first IPv6
/// address that is not link-local, site-local, ULA, 6to4, or Teredo.
pub fn best_global_ipv6(addresses: &[IpAddr]) -> Option<Ipv6Addr> {
    addresses.iter().find_map(|addr| match addr {
        IpAddr::V6(v6) if is_global_v6(v6) => Some(*v6),
        _ => None,
    })
}

fn is_global_v6(addr: &Ipv6Addr) -> bool {
    let seg = addr.segments();
    // Link-local fe80::/10
    if seg[0] & 0xffc0 == 0xfe80 {
        return false;
    }
    // Site-local fec0::/10
    if seg[0] & 0xffc0 == 0xfec0 {
        return false;
    }
    // ULA fc00::/7
    if seg[0] & 0xfe00 == 0xfc00 {
        return false;
    }
    // 6to4 2002::/16
    if seg[0] == 0x2002 {
        return false;
    }
    // Teredo 2001::/32
    if seg[0] == 0x2001 && seg[1] == 0x0000 {
        return false;
    }
    true
}

/// True for an IPv6 address usable as a primary LAN address when no IPv4
/// was advertised.
pub fn is_local_scope_v6(addr: &Ipv6Addr) -> bool {
    let seg = addr.segments();
    seg[0] & 0xffc0 == 0xfe80 || seg[0] & 0xffc0 == 0xfec0 || seg[0] & 0xfe00 == 0xfc00
}

/// Where a resolved discovery entry gets promoted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub primary: HostAddress,
    pub ipv6_global: Option<HostAddress>,
}

/// Choose the add-request addresses from a resolved address set, per the
/// discovery policy: IPv4 primary when present, otherwise a local-scope
/// IPv6; the best global IPv6 rides along either way.
pub fn promote_addresses(addresses: &[IpAddr], port: u16) -> Option<DiscoveredHost> {
    let ipv6_global =
        best_global_ipv6(addresses).map(|v6| HostAddress::new(v6.to_string(), port));

    for addr in addresses {
        if let IpAddr::V4(v4) = addr {
            return Some(DiscoveredHost {
                primary: HostAddress::new(v4.to_string(), port),
                ipv6_global,
            });
        }
    }

    for addr in addresses {
        if let IpAddr::V6(v6) = addr {
            if is_local_scope_v6(v6) {
                return Some(DiscoveredHost {
                    primary: HostAddress::new(v6.to_string(), port),
                    ipv6_global,
                });
            }
        }
    }

    None
}

/// One advertised service being resolved. Bounded retries; discarded on
/// exhaustion.
pub struct PendingDiscovery {
    pub hostname: String,
    pub port: u16,
}

impl PendingDiscovery {
    /// Resolve with retries. Returns the promoted addresses, or `None` when
    /// every attempt came back empty.
    pub async fn resolve(
        &self,
        resolver: &dyn HostnameResolver,
    ) -> Option<DiscoveredHost> {
        for attempt in 0..RESOLVE_RETRIES {
            let addresses = resolver.resolve(&self.hostname, RESOLVE_TIMEOUT).await;
            if let Some(discovered) = promote_addresses(&addresses, self.port) {
                return Some(discovered);
            }
            if attempt + 1 < RESOLVE_RETRIES {
                info!("Resolving {} timed out. Retrying...", self.hostname);
            }
        }
        warn!(
            "Giving up on resolving {} after repeated failures",
            self.hostname
        );
        None
    }
}

/// A running mDNS browse. Dropping stops the event pump.
pub struct DiscoveryBrowser {
    daemon: ServiceDaemon,
    running: Arc<AtomicBool>,
}

impl DiscoveryBrowser {
    /// Start browsing. `on_service` fires for each newly resolved service
    /// advertisement with (hostname, port); the caller owns the pending
    /// resolution from there.
    pub fn start(
        on_service: impl Fn(String, u16) + Send + 'static,
    ) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| DiscoveryError::Daemon(format!("Failed to create mDNS daemon: {}", e)))?;

        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| DiscoveryError::Daemon(format!("Failed to browse: {}", e)))?;

        let running = Arc::new(AtomicBool::new(true));
        let pump_running = Arc::clone(&running);

        tokio::task::spawn_blocking(move || {
            let mut seen: HashSet<String> = HashSet::new();
            while pump_running.load(Ordering::SeqCst) {
                match receiver.recv_timeout(Duration::from_millis(100)) {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let hostname = info.get_hostname().trim_end_matches('.').to_string();
                        let port = info.get_port();
                        if seen.insert(format!("{}:{}", hostname, port)) {
                            debug!("Discovered mDNS host: {}", hostname);
                            on_service(hostname, port);
                        }
                    }
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                        debug!("mDNS service removed: {}", fullname);
                    }
                    Ok(_) => {}
                    Err(_) => {}
                }
            }
        });

        Ok(Self { daemon, running })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.daemon.stop_browse(SERVICE_TYPE);
    }
}

impl Drop for DiscoveryBrowser {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scripted resolver for tests: per-hostname queues of answers.
pub struct StaticResolver {
    answers: Mutex<Vec<Vec<IpAddr>>>,
    pub calls: std::sync::atomic::AtomicU32,
}

impl StaticResolver {
    /// Each call to `resolve` pops the next answer; an empty queue answers
    /// with nothing.
    pub fn new(answers: Vec<Vec<IpAddr>>) -> Self {
        Self {
            answers: Mutex::new(answers),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl HostnameResolver for StaticResolver {
    async fn resolve(&self, _hostname: &str, _timeout: Duration) -> Vec<IpAddr> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut answers = self.answers.lock().unwrap();
        if answers.is_empty() {
            Vec::new()
        } else {
            answers.remove(0)
        }
    }
}
