//! One-shot expiry timers for released resources.

use crate::error::ContainerError;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Invoked with the resource ID when its timer fires.
pub type ExpiryHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Time left before a resource created at `created` expires.
pub fn remaining(expiry: Duration, created: SystemTime) -> Duration {
    let age = SystemTime::now()
        .duration_since(created)
        .unwrap_or(Duration::ZERO);
    expiry.saturating_sub(age)
}

struct Entry {
    generation: u64,
    token: CancellationToken,
}

/// Keeps at most one timer per resource ID.
pub struct ResourcesWatcher {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    next_generation: AtomicU64,
    tasks: Mutex<JoinSet<()>>,
    root: CancellationToken,
}

impl Default for ResourcesWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourcesWatcher {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            tasks: Mutex::new(JoinSet::new()),
            root: CancellationToken::new(),
        }
    }

    /// Calls `handler` with `id` once `delay` has passed.
    pub fn watch(
        &self,
        id: &str,
        delay: Duration,
        handler: ExpiryHandler,
    ) -> Result<(), ContainerError> {
        if self.root.is_cancelled() {
            return Err(ContainerError::Disposed);
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = {
            let mut entries = self.entries.lock();
            if entries.contains_key(id) {
                return Err(ContainerError::AlreadyWatched(id.to_string()));
            }
            let token = self.root.child_token();
            entries.insert(
                id.to_string(),
                Entry {
                    generation,
                    token: token.clone(),
                },
            );
            token
        };

        let entries = self.entries.clone();
        let id = id.to_string();
        let mut tasks = self.tasks.lock();
        // Finished timers are reaped here so the set does not grow unbounded.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Expiry of {} cancelled", id);
                }
                _ = tokio::time::sleep(delay) => {
                    // A later watch of the same ID owns the entry now.
                    let ours = {
                        let mut entries = entries.lock();
                        match entries.get(&id) {
                            Some(e) if e.generation == generation && !e.token.is_cancelled() => {
                                entries.remove(&id);
                                true
                            }
                            _ => false,
                        }
                    };
                    if ours {
                        handler(id).await;
                    }
                }
            }
        });
        Ok(())
    }

    /// Cancels the timer of `id`; returns whether one existed.
    pub fn unwatch(&self, id: &str) -> bool {
        match self.entries.lock().remove(id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_watched(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Cancels every timer and waits for the timer tasks to finish.
    pub async fn dispose(&self) {
        self.root.cancel();
        self.entries.lock().clear();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: Arc<AtomicUsize>, fired: Arc<Mutex<Vec<String>>>) -> ExpiryHandler {
        Arc::new(move |id| {
            let counter = counter.clone();
            let fired = fired.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                fired.lock().push(id);
            })
        })
    }

    #[test]
    fn test_remaining() {
        let expiry = Duration::from_secs(60);
        let old = SystemTime::now() - Duration::from_secs(120);
        assert_eq!(remaining(expiry, old), Duration::ZERO);
        let fresh = SystemTime::now();
        assert!(remaining(expiry, fresh) > Duration::from_secs(59));
        let future = SystemTime::now() + Duration::from_secs(30);
        assert_eq!(remaining(expiry, future), expiry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once() {
        let watcher = ResourcesWatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(Mutex::new(Vec::new()));
        watcher
            .watch(
                "img",
                Duration::from_secs(5),
                counting(count.clone(), fired.clone()),
            )
            .unwrap();
        assert!(watcher.is_watched("img"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*fired.lock(), vec!["img".to_string()]);
        assert!(!watcher.is_watched("img"));
    }

    #[tokio::test]
    async fn test_second_watch_rejected() {
        let watcher = ResourcesWatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(Mutex::new(Vec::new()));
        let handler = counting(count, fired);
        watcher
            .watch("img", Duration::from_secs(60), handler.clone())
            .unwrap();
        let err = watcher
            .watch("img", Duration::from_secs(60), handler)
            .unwrap_err();
        assert!(matches!(err, ContainerError::AlreadyWatched(ref id) if id == "img"));
        watcher.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatch_cancels() {
        let watcher = ResourcesWatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(Mutex::new(Vec::new()));
        watcher
            .watch(
                "img",
                Duration::from_secs(5),
                counting(count.clone(), fired),
            )
            .unwrap();
        assert!(watcher.unwatch("img"));
        assert!(!watcher.unwatch("img"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispose_cancels_and_joins() {
        let watcher = ResourcesWatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(Mutex::new(Vec::new()));
        for id in ["a", "b", "c"] {
            watcher
                .watch(
                    id,
                    Duration::from_secs(3600),
                    counting(count.clone(), fired.clone()),
                )
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), watcher.dispose())
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!watcher.is_watched("a"));
        assert!(matches!(
            watcher.watch("d", Duration::ZERO, counting(count, fired)),
            Err(ContainerError::Disposed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewatch_keeps_new_deadline() {
        let watcher = ResourcesWatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(Mutex::new(Vec::new()));
        watcher
            .watch(
                "img",
                Duration::from_secs(5),
                counting(count.clone(), fired.clone()),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(watcher.unwatch("img"));
        watcher
            .watch(
                "img",
                Duration::from_secs(10),
                counting(count.clone(), fired.clone()),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(watcher.is_watched("img"));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!watcher.is_watched("img"));
    }
}
