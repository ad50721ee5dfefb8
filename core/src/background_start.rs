use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Process-wide record of resource keys with an outstanding or recently
/// started pairing.
///
/// A claim is made before the owning UI surface exists and consulted when
/// the surface later mounts, so a remount never triggers a second start.
/// Claims are cleared on explicit acknowledgment, on failure rollback, or
/// in bulk when a project or session resets its terminals.
///
/// Handles are cheap clones over shared state; inject one per process
/// rather than reaching for a global so tests can run isolated instances.
#[derive(Debug, Clone, Default)]
pub struct BackgroundStartRegistry {
    marked: Arc<Mutex<HashSet<String>>>,
}

impl BackgroundStartRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `key`. Returns `false` when the key was already
    /// claimed, in which case the caller must not start another pairing.
    pub fn claim(&self, key: &str) -> bool {
        self.lock().insert(key.to_string())
    }

    pub fn has(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    /// Clear a single claim: completion acknowledgment from the owning
    /// surface, or rollback after a failed start.
    pub fn release(&self, key: &str) -> bool {
        self.lock().remove(key)
    }

    /// Bulk clear for the "reset terminals" signal, scoped by key prefix
    /// (e.g. every terminal belonging to one project).
    pub fn release_prefix(&self, prefix: &str) -> usize {
        let mut marked = self.lock();
        let before = marked.len();
        marked.retain(|key| !key.starts_with(prefix));
        before - marked.len()
    }

    /// Bulk clear for an explicit set of keys.
    pub fn release_keys<I, S>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut marked = self.lock();
        keys.into_iter()
            .filter(|key| marked.remove(key.as_ref()))
            .count()
    }

    /// Debug/test hook: every currently claimed key, sorted.
    pub fn marked_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().iter().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.marked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
