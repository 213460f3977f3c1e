//! Durable host storage with a crash-safe two-slot write protocol and a
//! coalescing flush worker.
//!
//! Writes go backup → clear primary → write primary → delete backup. A
//! non-empty backup at startup means a previous write died mid-way, and the
//! backup is the authoritative copy. Partial writes therefore never lose the
//! registry.

use nvstream_core::{PersistenceError, Result, SerializedHost};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Primary,
    Backup,
}

/// The persistence back-end: two logical array slots.
pub trait SettingsStore: Send + Sync {
    fn read_slot(&self, slot: Slot) -> Result<Vec<SerializedHost>>;
    fn write_slot(&self, slot: Slot, hosts: &[SerializedHost]) -> Result<()>;
    fn clear_slot(&self, slot: Slot) -> Result<()>;
}

/// JSON files on disk, one per slot.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, slot: Slot) -> PathBuf {
        match slot {
            Slot::Primary => self.dir.join("hosts.json"),
            Slot::Backup => self.dir.join("hostsbackup.json"),
        }
    }
}

impl SettingsStore for JsonFileStore {
    fn read_slot(&self, slot: Slot) -> Result<Vec<SerializedHost>> {
        let path = self.path_for(slot);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read(&path).map_err(PersistenceError::Io)?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&data)
            .map_err(|e| PersistenceError::Corrupt(e.to_string()).into())
    }

    fn write_slot(&self, slot: Slot, hosts: &[SerializedHost]) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(PersistenceError::Io)?;
        let data = serde_json::to_vec_pretty(hosts)
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        fs::write(self.path_for(slot), data).map_err(PersistenceError::Io)?;
        Ok(())
    }

    fn clear_slot(&self, slot: Slot) -> Result<()> {
        let path = self.path_for(slot);
        if path.exists() {
            fs::remove_file(path).map_err(PersistenceError::Io)?;
        }
        Ok(())
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<Slot, Vec<SerializedHost>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn read_slot(&self, slot: Slot) -> Result<Vec<SerializedHost>> {
        Ok(self
            .slots
            .lock()
            .unwrap()
            .get(&slot)
            .cloned()
            .unwrap_or_default())
    }

    fn write_slot(&self, slot: Slot, hosts: &[SerializedHost]) -> Result<()> {
        self.slots.lock().unwrap().insert(slot, hosts.to_vec());
        Ok(())
    }

    fn clear_slot(&self, slot: Slot) -> Result<()> {
        self.slots.lock().unwrap().remove(&slot);
        Ok(())
    }
}

/// Read the host list at startup, adopting the backup slot if a previous
/// write crashed mid-protocol.
pub fn load_hosts(store: &dyn SettingsStore) -> Result<Vec<SerializedHost>> {
    let backup = store.read_slot(Slot::Backup)?;
    if !backup.is_empty() {
        debug!(
            count = backup.len(),
            "Backup slot is non-empty; adopting it over the primary"
        );
        return Ok(backup);
    }
    store.read_slot(Slot::Primary)
}

struct FlushState {
    needs_flush: bool,
    shutdown: bool,
    /// Last serialized form per UUID; a save request that would not change
    /// any of these is dropped.
    last_serialized: HashMap<String, SerializedHost>,
}

struct FlushShared {
    state: Mutex<FlushState>,
    condvar: Condvar,
    store: Arc<dyn SettingsStore>,
    /// Snapshot of every host's serializable fields, taken under each
    /// record's read lock by the owner.
    snapshot: Box<dyn Fn() -> Vec<SerializedHost> + Send + Sync>,
}

/// Owns the flush worker thread. The flush-state mutex is a leaf in the
/// registry lock order: it is never acquired while a per-record lock is
/// held (the reverse, taking a record read lock under it, is fine).
pub struct Persister {
    shared: Arc<FlushShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Persister {
    pub fn start(
        store: Arc<dyn SettingsStore>,
        snapshot: Box<dyn Fn() -> Vec<SerializedHost> + Send + Sync>,
        initial: Vec<SerializedHost>,
    ) -> Self {
        let shared = Arc::new(FlushShared {
            state: Mutex::new(FlushState {
                needs_flush: false,
                shutdown: false,
                last_serialized: initial.into_iter().map(|h| (h.uuid.clone(), h)).collect(),
            }),
            condvar: Condvar::new(),
            store,
            snapshot,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("host-flush".to_string())
            .spawn(move || flush_worker(worker_shared))
            .expect("spawn flush worker");

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Signal that the host list needs writing. Coalesces with any pending
    /// request.
    pub fn request_flush(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.needs_flush = true;
        drop(state);
        self.shared.condvar.notify_one();
    }

    /// Queue a flush only if `serialized` differs from the last flushed
    /// form of this host.
    pub fn save_host_if_changed(&self, serialized: &SerializedHost) {
        let changed = {
            let state = self.shared.state.lock().unwrap();
            state.last_serialized.get(&serialized.uuid) != Some(serialized)
        };
        if changed {
            self.request_flush();
        }
    }

    /// Stop the worker, completing any pending flush first.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.condvar.notify_one();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flush_worker(shared: Arc<FlushShared>) {
    loop {
        // Wait for a flush request or an interruption.
        let hosts = {
            let mut state = shared.state.lock().unwrap();
            while !state.shutdown && !state.needs_flush {
                state = shared.condvar.wait(state).unwrap();
            }

            // Bail without flushing if we woke for shutdown alone. With
            // both pending, do the flush before exiting.
            if !state.needs_flush {
                break;
            }
            state.needs_flush = false;

            // Snapshot and remember what we're about to write so racing
            // save requests can detect no-ops.
            let hosts = (shared.snapshot)();
            state.last_serialized = hosts.iter().map(|h| (h.uuid.clone(), h.clone())).collect();
            hosts
        };

        if let Err(e) = run_flush_protocol(shared.store.as_ref(), &hosts) {
            error!("Host list flush failed: {}", e);
        }

        let state = shared.state.lock().unwrap();
        if state.shutdown && !state.needs_flush {
            break;
        }
    }
}

/// The crash-safe write sequence. Both slots receive the full list; a crash
/// at any point leaves at least one complete snapshot behind.
fn run_flush_protocol(store: &dyn SettingsStore, hosts: &[SerializedHost]) -> Result<()> {
    store.write_slot(Slot::Backup, hosts)?;
    store.clear_slot(Slot::Primary)?;
    store.write_slot(Slot::Primary, hosts)?;
    store.clear_slot(Slot::Backup)?;
    Ok(())
}
