use std::collections::HashMap;

use log::info;

use crate::host::HostEvent;
use crate::types::Tid;

/// One kernel thread of the target. `status` is the last event a wait
/// reported for it. Per-thread operations live on the controller, which
/// borrows the owning process for the duration of each call.
#[derive(Debug, Clone)]
pub struct Thread {
    pub id: Tid,
    pub status: Option<HostEvent>,
}

/// Maps kernel thread ids to their state and tracks the current thread: the
/// one operations without an explicit thread argument are dispatched to.
pub struct ThreadRegistry {
    threads: HashMap<Tid, Thread>,
    current: Option<Tid>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        ThreadRegistry {
            threads: HashMap::new(),
            current: None,
        }
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.threads.contains_key(&tid)
    }

    /// Register a newly discovered thread. The first thread registered
    /// becomes the current thread.
    pub fn add(&mut self, tid: Tid) -> &mut Thread {
        if !self.threads.contains_key(&tid) {
            info!("new thread spawned {tid}");
            self.threads.insert(tid, Thread { id: tid, status: None });
            if self.current.is_none() {
                self.current = Some(tid);
            }
        }
        self.threads.get_mut(&tid).unwrap()
    }

    pub fn remove(&mut self, tid: Tid) {
        self.threads.remove(&tid);
        if self.current == Some(tid) {
            self.current = self.threads.keys().next().copied();
        }
    }

    pub fn get(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    pub fn ids(&self) -> Vec<Tid> {
        self.threads.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    pub fn set_current(&mut self, tid: Tid) {
        self.current = Some(tid);
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
