use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use localfs_process::{ObservedState, ProcessKey};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedProcess {
    pub state: ObservedState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<ProcessKey, TrackedProcess>,
    leased: HashSet<ProcessKey>,
}

/// In-memory observed state for every instance and agent.
///
/// All mutation is synchronous so a decision taken on the current state is
/// committed before the caller next yields.
#[derive(Debug, Clone, Default)]
pub struct StateTracker {
    inner: Arc<Mutex<Inner>>,
}

/// Exclusive right to act on one key for the duration of a decision.
#[derive(Debug)]
pub struct Lease {
    key: ProcessKey,
    inner: Arc<Mutex<Inner>>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.leased.remove(&self.key);
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts an `unknown` entry unless one exists already.
    pub fn seed(&self, key: ProcessKey, port: Option<u16>) {
        self.lock()
            .entries
            .entry(key)
            .or_insert_with(|| TrackedProcess {
                port,
                ..TrackedProcess::default()
            });
    }

    pub fn get(&self, key: &ProcessKey) -> Option<TrackedProcess> {
        self.lock().entries.get(key).cloned()
    }

    pub fn state(&self, key: &ProcessKey) -> Option<ObservedState> {
        self.lock().entries.get(key).map(|e| e.state)
    }

    pub fn contains(&self, key: &ProcessKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Sets the state, creating the entry if needed. Returns the previous one.
    pub fn set_state(&self, key: &ProcessKey, state: ObservedState) -> ObservedState {
        let mut inner = self.lock();
        let entry = inner.entries.entry(key.clone()).or_default();
        std::mem::replace(&mut entry.state, state)
    }

    /// Records a freshly spawned process.
    pub fn record_spawn(&self, key: &ProcessKey, pid: u32, port: u16, dir: Option<PathBuf>) {
        let mut inner = self.lock();
        let entry = inner.entries.entry(key.clone()).or_default();
        entry.state = ObservedState::Started;
        entry.pid = Some(pid);
        entry.port = Some(port);
        if dir.is_some() {
            entry.dir = dir;
        }
    }

    pub fn remove(&self, key: &ProcessKey) -> Option<TrackedProcess> {
        self.lock().entries.remove(key)
    }

    /// `None` while another holder is still deciding for `key`.
    pub fn try_lease(&self, key: &ProcessKey) -> Option<Lease> {
        let mut inner = self.lock();
        if !inner.leased.insert(key.clone()) {
            return None;
        }
        Some(Lease {
            key: key.clone(),
            inner: self.inner.clone(),
        })
    }
}
