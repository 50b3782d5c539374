use anyhow::{Result, anyhow};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Finished,
    Panicked,
    Joined,
    Detached,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Running => "running",
            WorkerStatus::Finished => "finished",
            WorkerStatus::Panicked => "panicked",
            WorkerStatus::Joined => "joined",
            WorkerStatus::Detached => "detached",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub name: String,
    pub status: WorkerStatus,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicUsize,
    workers: Mutex<BTreeMap<usize, WorkerInfo>>,
}

impl RegistryInner {
    fn workers(&self) -> MutexGuard<'_, BTreeMap<usize, WorkerInfo>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, id: usize, status: WorkerStatus) {
        if let Some(info) = self.workers().get_mut(&id) {
            info.status = status;
        }
    }
}

/// Named OS threads owned by the service, with their lifecycle status.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    inner: Arc<RegistryInner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: impl Into<String>, f: F) -> Result<WorkerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.workers().insert(
            id,
            WorkerInfo {
                name: name.clone(),
                status: WorkerStatus::Running,
            },
        );

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            match outcome {
                Ok(()) => inner.set_status(id, WorkerStatus::Finished),
                Err(payload) => {
                    inner.set_status(id, WorkerStatus::Panicked);
                    panic::resume_unwind(payload);
                }
            }
        });

        match spawned {
            Ok(join_handle) => Ok(WorkerHandle {
                name,
                id,
                handle: Some(join_handle),
                inner: Arc::clone(&self.inner),
            }),
            Err(e) => {
                self.inner.workers().remove(&id);
                Err(anyhow!("failed to spawn worker '{name}': {e}"))
            }
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        self.inner.workers().values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .workers()
            .values()
            .filter(|info| info.status == WorkerStatus::Running)
            .count()
    }

    pub fn active_names(&self) -> Vec<String> {
        self.inner
            .workers()
            .values()
            .filter(|info| info.status == WorkerStatus::Running)
            .map(|info| info.name.clone())
            .collect()
    }
}

pub struct WorkerHandle {
    name: String,
    id: usize,
    handle: Option<JoinHandle<()>>,
    inner: Arc<RegistryInner>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn join(mut self) -> thread::Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let result = handle.join();
        if result.is_ok() {
            self.inner.set_status(self.id, WorkerStatus::Joined);
        }
        result
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        // Dropping the JoinHandle detaches the thread; only a live worker is marked.
        let mut workers = self.inner.workers();
        if let Some(info) = workers.get_mut(&self.id) {
            if info.status == WorkerStatus::Running {
                info.status = WorkerStatus::Detached;
            }
        }
    }
}
