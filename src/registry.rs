use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Entry {
    label: String,
    pid: Option<u32>,
    cancel: CancellationToken,
}

/// In-flight fetcher processes. Filled before a child is awaited, emptied by
/// [`Registration`]'s drop, and swept by [`ProcessRegistry::cancel_all`] from
/// any thread.
///
/// Cancellation is sticky: once `cancel_all` has run, processes registered
/// later start out cancelled and [`ProcessRegistry::is_cancelled`] stays true.
#[derive(Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a spawned child until the returned guard is dropped.
    pub fn register_process(self: &Arc<Self>, label: impl Into<String>, pid: Option<u32>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let label = label.into();
        tracing::debug!(id, pid, %label, "Registered fetcher process");
        self.entries.lock().insert(
            id,
            Entry {
                label,
                pid,
                cancel: cancel.clone(),
            },
        );
        Registration {
            registry: Arc::clone(self),
            id,
            cancel,
        }
    }

    /// Signal every registered child to terminate. Returns how many were signalled.
    /// Filesystem state is left wherever the run stopped.
    pub fn cancel_all(&self) -> usize {
        self.shutdown.cancel();
        let entries = self.entries.lock();
        for entry in entries.values() {
            tracing::warn!(pid = entry.pid, label = %entry.label, "Terminating fetcher");
            entry.cancel.cancel();
        }
        entries.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once [`cancel_all`](Self::cancel_all) has been called.
    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scope guard for one registered process; deregisters on drop whatever the outcome.
pub struct Registration {
    registry: Arc<ProcessRegistry>,
    id: u64,
    cancel: CancellationToken,
}

impl Registration {
    /// Resolves once [`ProcessRegistry::cancel_all`] has been called for this process.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.entries.lock().remove(&self.id);
        tracing::debug!(id = self.id, "Deregistered fetcher process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_guard_deregisters() {
        let registry = ProcessRegistry::new();
        {
            let _a = registry.register_process("depot 1", Some(10));
            let _b = registry.register_process("depot 2", None);
            assert_eq!(registry.len(), 2);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_from_another_thread() {
        let registry = ProcessRegistry::new();
        let reg = registry.register_process("depot 1", Some(42));

        let remote = Arc::clone(&registry);
        let handle = std::thread::spawn(move || remote.cancel_all());

        tokio::time::timeout(Duration::from_secs(5), reg.cancelled())
            .await
            .expect("cancellation not delivered");
        assert_eq!(handle.join().unwrap(), 1);

        drop(reg);
        assert_eq!(registry.cancel_all(), 0);
    }

    #[tokio::test]
    async fn test_registration_after_cancel_starts_cancelled() {
        let registry = ProcessRegistry::new();
        assert!(!registry.is_cancelled());
        assert_eq!(registry.cancel_all(), 0);
        assert!(registry.is_cancelled());

        let late = registry.register_process("depot 2", None);
        tokio::time::timeout(Duration::from_millis(100), late.cancelled())
            .await
            .expect("late registration not cancelled");
        tokio::time::timeout(Duration::from_millis(100), registry.cancelled())
            .await
            .expect("registry not cancelled");
    }
}
