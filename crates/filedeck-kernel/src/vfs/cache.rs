//! Per-driver memoization of stat and listing lookups.
//!
//! The in-flight lookup is memoized, not just its result, so concurrent
//! callers within one driver share a single backend round trip. Failed
//! lookups are evicted so the next caller retries.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;

use super::VfsResult;
use super::types::{FileStat, Listed};

type Lookup<T> = Shared<BoxFuture<'static, VfsResult<T>>>;

/// Memo table for one driver. Never shared across requests.
#[derive(Default)]
pub struct RequestCache {
    stats: Mutex<HashMap<String, Lookup<Option<FileStat>>>>,
    dirs: Mutex<HashMap<String, Lookup<Vec<Listed>>>>,
}

impl std::fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCache")
            .field("stats", &self.stats.lock().len())
            .field("dirs", &self.dirs.lock().len())
            .finish()
    }
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stat through the cache, starting `lookup` only on a miss.
    pub async fn stat<F, Fut>(&self, id: &str, lookup: F) -> VfsResult<Option<FileStat>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VfsResult<Option<FileStat>>> + Send + 'static,
    {
        memoize(&self.stats, id, lookup).await
    }

    /// List through the cache, starting `lookup` only on a miss.
    pub async fn readdir<F, Fut>(&self, id: &str, lookup: F) -> VfsResult<Vec<Listed>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VfsResult<Vec<Listed>>> + Send + 'static,
    {
        memoize(&self.dirs, id, lookup).await
    }

    /// Seed a stat unless one is already cached or in flight.
    pub fn seed_stat(&self, id: &str, stat: FileStat) {
        self.stats
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| ready(Some(stat)));
    }

    /// Store a stat, replacing anything cached.
    pub fn put_stat(&self, id: &str, stat: Option<FileStat>) {
        self.stats.lock().insert(id.to_string(), ready(stat));
    }

    pub fn invalidate_stat(&self, id: &str) {
        self.stats.lock().remove(id);
    }

    pub fn invalidate_dir(&self, id: &str) {
        self.dirs.lock().remove(id);
    }

    pub fn clear_dirs(&self) {
        self.dirs.lock().clear();
    }

    /// Returns true if a stat for `id` is cached or in flight.
    pub fn has_stat(&self, id: &str) -> bool {
        self.stats.lock().contains_key(id)
    }

    /// Returns true if a listing for `id` is cached or in flight.
    pub fn has_dir(&self, id: &str) -> bool {
        self.dirs.lock().contains_key(id)
    }
}

fn ready<T: Clone + Send + Sync + 'static>(value: T) -> Lookup<T> {
    futures::future::ready(Ok(value)).boxed().shared()
}

async fn memoize<T, F, Fut>(
    map: &Mutex<HashMap<String, Lookup<T>>>,
    id: &str,
    lookup: F,
) -> VfsResult<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = VfsResult<T>> + Send + 'static,
{
    let shared = {
        let mut map = map.lock();
        match map.get(id) {
            Some(existing) => existing.clone(),
            None => {
                let fut = lookup().boxed().shared();
                map.insert(id.to_string(), fut.clone());
                fut
            }
        }
    };

    let result = shared.clone().await;
    if result.is_err() {
        let mut map = map.lock();
        if map.get(id).is_some_and(|cur| cur.ptr_eq(&shared)) {
            map.remove(id);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::VfsError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(
        calls: &Arc<AtomicUsize>,
        size: u64,
    ) -> impl Future<Output = VfsResult<Option<FileStat>>> + Send + 'static {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Some(FileStat::file("a.txt", Some("/".into()), size, 0)))
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_lookup() {
        let cache = RequestCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            cache.stat("/a.txt", || counted(&calls, 1)),
            cache.stat("/a.txt", || counted(&calls, 2)),
        );
        assert_eq!(a.unwrap().unwrap().size, 1);
        assert_eq!(b.unwrap().unwrap().size, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_lookup() {
        let cache = RequestCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        cache.stat("/a.txt", || counted(&calls, 1)).await.unwrap();
        cache.invalidate_stat("/a.txt");
        let again = cache.stat("/a.txt", || counted(&calls, 7)).await.unwrap();
        assert_eq!(again.unwrap().size, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_evicted() {
        let cache = RequestCache::new();
        let err = cache
            .stat("/x", || async { Err(VfsError::protocol("boom")) })
            .await;
        assert!(err.is_err());
        assert!(!cache.has_stat("/x"));
    }

    #[tokio::test]
    async fn test_seed_does_not_override() {
        let cache = RequestCache::new();
        cache.put_stat("/a", Some(FileStat::file("a", None, 3, 0)));
        cache.seed_stat("/a", FileStat::file("a", None, 9, 0));
        let stat = cache
            .stat("/a", || async { Ok(None) })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stat.size, 3);

        cache.readdir("/", || async { Ok(vec![]) }).await.unwrap();
        assert!(cache.has_dir("/"));
        cache.clear_dirs();
        assert!(!cache.has_dir("/"));
    }
}
