use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;

type SharedOp<T> = Shared<BoxFuture<'static, T>>;

/// Keyed deduplication of in-flight operations.
///
/// Concurrent callers of [`SingleFlight::run`] for the same key join the
/// one outstanding operation and all observe the identical result. The
/// entry is removed unconditionally when the operation settles, so a call
/// issued after settlement always starts fresh work. This is pure
/// deduplication: no queuing, no retry.
pub struct SingleFlight<T> {
    inflight: Mutex<HashMap<String, SharedOp<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` under `key`, or join the operation already in flight
    /// for that key. `make` is only invoked when no operation is
    /// outstanding; joined callers share the registered future instead.
    ///
    /// Errors travel through `T` (typically `Result<_, E>` with a
    /// cloneable `E`), so joiners share failures the same way they share
    /// successes, and the key is freed as soon as the operation settles.
    pub async fn run<F>(&self, key: &str, make: F) -> T
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        // The lock is only held to register or look up the entry, never
        // across an await.
        let shared = {
            let mut inflight = self.lock();
            if let Some(existing) = inflight.get(key) {
                existing.clone()
            } else {
                let shared = make().shared();
                inflight.insert(key.to_string(), shared.clone());
                shared
            }
        };

        let value = shared.clone().await;

        // Whichever caller settles first deregisters the key. `ptr_eq`
        // keeps a slow waiter from evicting a newer generation that was
        // registered after this one completed.
        let mut inflight = self.lock();
        if let Some(current) = inflight.get(key) {
            if current.ptr_eq(&shared) {
                inflight.remove(key);
            }
        }
        value
    }

    /// Read-only visibility for callers that want to skip scheduling
    /// redundant work without joining the in-flight operation.
    pub fn has_inflight(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SharedOp<T>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
