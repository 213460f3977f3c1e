//! # nvstream-registry
//!
//! The host registry: mDNS discovery, per-host liveness polling, the
//! pairing/quit/add/delete task surface, and crash-safe persistence of the
//! known-host list.

pub mod discovery;
pub mod persist;
pub mod poller;
pub mod registry;
pub mod stun;

pub use discovery::{best_global_ipv6, HostnameResolver, MdnsResolver, StaticResolver};
pub use persist::{JsonFileStore, MemoryStore, Persister, SettingsStore, Slot};
pub use poller::{POLLS_PER_APP_LIST_FETCH, TRIES_BEFORE_OFFLINING};
pub use registry::{ConnectivityTester, Host, HostEvent, HostRegistry, HostSnapshot, SharedHost};
