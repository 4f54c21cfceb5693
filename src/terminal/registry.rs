use crate::terminal::buffer::OutputBuffer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::{Child, ChildStdin};
use uuid::Uuid;

/// Live bookkeeping for one spawned shell.
///
/// The `Child` is taken by the exit-waiter task right after creation; every
/// later interaction goes through the pid (signals) or the retained stdin
/// handle (command dispatch).
#[derive(Debug)]
pub struct TerminalHandle {
    pub tenant: String,
    pub id: String,
    pub pid: u32,
    pub stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pub child: tokio::sync::Mutex<Option<Child>>,
    /// Set exactly once by whichever termination path wins.
    pub reaped: AtomicBool,
}

impl TerminalHandle {
    pub fn new(
        tenant: impl Into<String>,
        id: impl Into<String>,
        pid: u32,
        stdin: Option<ChildStdin>,
        child: Option<Child>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            pid,
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(child),
            reaped: AtomicBool::new(false),
        }
    }

    /// Claim the teardown token. Returns true for exactly one caller.
    pub fn claim_teardown(&self) -> bool {
        !self.reaped.swap(true, Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct RegistryMaps {
    processes: HashMap<String, HashMap<String, Arc<TerminalHandle>>>,
    buffers: HashMap<String, HashMap<String, Arc<OutputBuffer>>>,
}

/// The shared tenant → terminal → live-process mapping, paired with
/// tenant → terminal → output buffer.
///
/// One coarse mutex guards both maps, and every mutation — creation included —
/// goes through it, so readers never observe one map updated without the
/// other. The lock covers only the synchronous map access and is never held
/// across spawning or I/O.
#[derive(Debug, Default)]
pub struct TerminalRegistry {
    inner: Mutex<RegistryMaps>,
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryMaps> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert the process handle and its output buffer together. Returns false
    /// (and inserts nothing) if the id is already registered for the tenant.
    pub fn register(
        &self,
        tenant: &str,
        id: &str,
        handle: Arc<TerminalHandle>,
        buffer: Arc<OutputBuffer>,
    ) -> bool {
        let mut maps = self.lock();
        let procs = maps.processes.entry(tenant.to_string()).or_default();
        if procs.contains_key(id) {
            return false;
        }
        procs.insert(id.to_string(), handle);
        maps.buffers
            .entry(tenant.to_string())
            .or_default()
            .insert(id.to_string(), buffer);
        true
    }

    /// Allocate a terminal id unused by the tenant and insert the handle and
    /// buffer built for it, all under one lock acquisition, so concurrent
    /// creations can neither draw the same id nor lose an insert.
    pub fn register_new<F>(
        &self,
        tenant: &str,
        build: F,
    ) -> (String, Arc<TerminalHandle>, Arc<OutputBuffer>)
    where
        F: FnOnce(&str) -> (Arc<TerminalHandle>, Arc<OutputBuffer>),
    {
        let mut maps = self.lock();
        let procs = maps.processes.entry(tenant.to_string()).or_default();
        let id = loop {
            let candidate = format!("term-{}", &Uuid::new_v4().simple().to_string()[..8]);
            if !procs.contains_key(&candidate) {
                break candidate;
            }
        };
        let (handle, buffer) = build(&id);
        procs.insert(id.clone(), handle.clone());
        maps.buffers
            .entry(tenant.to_string())
            .or_default()
            .insert(id.clone(), buffer.clone());
        (id, handle, buffer)
    }

    /// Remove both entries for (tenant, id). The buffer is closed under the
    /// same call so detached reader tasks can no longer mutate it. Returns the
    /// removed pair, or None if the terminal was not registered.
    pub fn unregister(
        &self,
        tenant: &str,
        id: &str,
    ) -> Option<(Arc<TerminalHandle>, Arc<OutputBuffer>)> {
        let (handle, buffer) = {
            let mut maps = self.lock();
            let handle = maps.processes.get_mut(tenant).and_then(|m| m.remove(id));
            let buffer = maps.buffers.get_mut(tenant).and_then(|m| m.remove(id));
            if maps.processes.get(tenant).map(|m| m.is_empty()).unwrap_or(false) {
                maps.processes.remove(tenant);
            }
            if maps.buffers.get(tenant).map(|m| m.is_empty()).unwrap_or(false) {
                maps.buffers.remove(tenant);
            }
            (handle?, buffer)
        };
        if let Some(ref buffer) = buffer {
            buffer.close();
        }
        buffer.map(|b| (handle, b))
    }

    pub fn lookup(&self, tenant: &str, id: &str) -> Option<Arc<TerminalHandle>> {
        self.lock()
            .processes
            .get(tenant)
            .and_then(|m| m.get(id))
            .cloned()
    }

    pub fn buffer(&self, tenant: &str, id: &str) -> Option<Arc<OutputBuffer>> {
        self.lock()
            .buffers
            .get(tenant)
            .and_then(|m| m.get(id))
            .cloned()
    }

    /// Snapshot of the tenant's currently open terminal ids.
    pub fn list(&self, tenant: &str) -> Vec<String> {
        self.lock()
            .processes
            .get(tenant)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// All (tenant, id) pairs across tenants, for shutdown sweeps.
    pub fn snapshot_all(&self) -> Vec<(String, String)> {
        let maps = self.lock();
        maps.processes
            .iter()
            .flat_map(|(tenant, ids)| {
                ids.keys().map(move |id| (tenant.clone(), id.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_handle(tenant: &str, id: &str) -> Arc<TerminalHandle> {
        Arc::new(TerminalHandle::new(tenant, id, 0, None, None))
    }

    fn dummy_buffer() -> Arc<OutputBuffer> {
        Arc::new(OutputBuffer::new(1024))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = TerminalRegistry::new();
        assert!(registry.register("alice", "term-1", dummy_handle("alice", "term-1"), dummy_buffer()));
        assert!(registry.lookup("alice", "term-1").is_some());
        assert!(registry.buffer("alice", "term-1").is_some());
        assert!(registry.lookup("alice", "term-2").is_none());
        assert!(registry.lookup("bob", "term-1").is_none());
    }

    #[test]
    fn test_register_rejects_duplicate_id() {
        let registry = TerminalRegistry::new();
        assert!(registry.register("alice", "term-1", dummy_handle("alice", "term-1"), dummy_buffer()));
        assert!(!registry.register("alice", "term-1", dummy_handle("alice", "term-1"), dummy_buffer()));
        assert_eq!(registry.list("alice").len(), 1);
    }

    #[test]
    fn test_unregister_removes_both_entries_and_closes_buffer() {
        let registry = TerminalRegistry::new();
        registry.register("alice", "term-1", dummy_handle("alice", "term-1"), dummy_buffer());

        let (_, buffer) = registry.unregister("alice", "term-1").expect("registered");
        assert!(buffer.is_closed());
        assert!(registry.lookup("alice", "term-1").is_none());
        assert!(registry.buffer("alice", "term-1").is_none());
        assert!(registry.list("alice").is_empty());
    }

    #[test]
    fn test_unregister_twice_is_none() {
        let registry = TerminalRegistry::new();
        registry.register("alice", "term-1", dummy_handle("alice", "term-1"), dummy_buffer());
        assert!(registry.unregister("alice", "term-1").is_some());
        assert!(registry.unregister("alice", "term-1").is_none());
    }

    #[test]
    fn test_ids_are_scoped_per_tenant() {
        let registry = TerminalRegistry::new();
        registry.register("alice", "term-1", dummy_handle("alice", "term-1"), dummy_buffer());
        registry.register("bob", "term-1", dummy_handle("bob", "term-1"), dummy_buffer());
        assert_eq!(registry.list("alice"), vec!["term-1".to_string()]);
        assert_eq!(registry.list("bob"), vec!["term-1".to_string()]);

        registry.unregister("alice", "term-1");
        assert!(registry.list("alice").is_empty());
        assert_eq!(registry.list("bob").len(), 1);
    }

    #[test]
    fn test_snapshot_all_spans_tenants() {
        let registry = TerminalRegistry::new();
        registry.register("alice", "term-1", dummy_handle("alice", "term-1"), dummy_buffer());
        registry.register("bob", "term-2", dummy_handle("bob", "term-2"), dummy_buffer());
        let mut all = registry.snapshot_all();
        all.sort();
        assert_eq!(
            all,
            vec![
                ("alice".to_string(), "term-1".to_string()),
                ("bob".to_string(), "term-2".to_string()),
            ]
        );
    }

    #[test]
    fn test_register_new_allocates_unique_ids_with_both_entries() {
        let registry = TerminalRegistry::new();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..64 {
            let (id, handle, _) = registry.register_new("alice", |id| {
                (
                    Arc::new(TerminalHandle::new("alice", id, 0, None, None)),
                    dummy_buffer(),
                )
            });
            assert_eq!(handle.id, id);
            assert!(id.starts_with("term-"));
            assert!(ids.insert(id));
        }
        assert_eq!(registry.list("alice").len(), 64);
        for id in &ids {
            assert!(registry.lookup("alice", id).is_some());
            assert!(registry.buffer("alice", id).is_some());
        }
    }

    #[test]
    fn test_claim_teardown_is_exclusive() {
        let handle = dummy_handle("alice", "term-1");
        assert!(handle.claim_teardown());
        assert!(!handle.claim_teardown());
        assert!(!handle.claim_teardown());
    }
}
