use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;

use super::{Result, StorageHandle};

/// How often a waiting subscription checks for commits from other
/// connections, which never go through this process's notifier.
pub const EXTERNAL_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) type Loader<T> = Arc<dyn Fn(&StorageHandle) -> Result<T> + Send + Sync>;

/// Write-side half of the live views: a generation counter plus one
/// coalescing signal channel per subscriber.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    generation: AtomicU64,
    subscribers: Mutex<Vec<Sender<u64>>>,
}

impl ChangeNotifier {
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> Receiver<u64> {
        let (tx, rx) = bounded(1);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn notify(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut subscribers = self.subscribers.lock();
        // a full slot already holds an unread signal
        subscribers.retain(|tx| match tx.try_send(generation) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
        generation
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// A live query. Each change to the store makes the next call to
/// [`Subscription::next`] re-run the query; several writes between two reads
/// collapse into a single refresh. Writes through other handles or processes
/// are noticed within [`EXTERNAL_POLL_INTERVAL`] while waiting. Dropping the
/// subscription unsubscribes.
pub struct Subscription<T> {
    storage: StorageHandle,
    changes: Receiver<u64>,
    loader: Loader<T>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(storage: StorageHandle, loader: Loader<T>) -> Self {
        // fixes the external baseline so later commits elsewhere are seen
        storage.sync_generation();
        let changes = storage.notifier().subscribe();
        Self {
            storage,
            changes,
            loader,
        }
    }

    /// Runs the query against the current contents of the store.
    pub fn current(&self) -> Result<T> {
        (self.loader)(&self.storage)
    }

    /// Blocks until the store changes, then returns the refreshed result.
    pub fn next(&self) -> Result<T> {
        loop {
            match self.changes.recv_timeout(EXTERNAL_POLL_INTERVAL) {
                Ok(_) => break,
                Err(RecvTimeoutError::Timeout) => {
                    self.storage.sync_generation();
                }
                // the notifier lives as long as `self.storage`, so this only
                // happens while the process is tearing down
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("change channel closed, returning current snapshot");
                    break;
                }
            }
        }
        self.current()
    }

    pub fn next_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = deadline
                .saturating_duration_since(Instant::now())
                .min(EXTERNAL_POLL_INTERVAL);
            match self.changes.recv_timeout(wait) {
                Ok(_) => return self.current().map(Some),
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
                Err(RecvTimeoutError::Timeout) => {
                    self.storage.sync_generation();
                    if Instant::now() >= deadline {
                        return self.try_next_signalled();
                    }
                }
            }
        }
    }

    pub fn try_next(&self) -> Result<Option<T>> {
        self.storage.sync_generation();
        self.try_next_signalled()
    }

    fn try_next_signalled(&self) -> Result<Option<T>> {
        match self.changes.try_recv() {
            Ok(_) => self.current().map(Some),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Ok(None),
        }
    }
}

struct Cached<T> {
    generation: Option<u64>,
    value: Arc<T>,
}

/// One cached snapshot of a query, shared by every reader. The query re-runs
/// at most once per store generation, counting commits made through other
/// connections; until the first successful load the snapshot is
/// `T::default()`.
pub struct SharedView<T> {
    storage: StorageHandle,
    loader: Loader<T>,
    cache: Mutex<Cached<T>>,
    loads: AtomicU64,
}

impl<T: Default> SharedView<T> {
    pub(crate) fn new(storage: StorageHandle, loader: Loader<T>) -> Self {
        Self {
            storage,
            loader,
            cache: Mutex::new(Cached {
                generation: None,
                value: Arc::new(T::default()),
            }),
            loads: AtomicU64::new(0),
        }
    }
}

impl<T> SharedView<T> {
    pub fn get(&self) -> Arc<T> {
        let generation = self.storage.sync_generation();
        let mut cache = self.cache.lock();
        if cache.generation == Some(generation) {
            return Arc::clone(&cache.value);
        }
        match (self.loader)(&self.storage) {
            Ok(value) => {
                self.loads.fetch_add(1, Ordering::Relaxed);
                cache.generation = Some(generation);
                cache.value = Arc::new(value);
            }
            Err(err) => {
                tracing::warn!(%err, "reload failed, keeping previous snapshot");
            }
        }
        Arc::clone(&cache.value)
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription::new(self.storage.clone(), Arc::clone(&self.loader))
    }

    /// Number of times the underlying query actually ran.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_coalesces_and_prunes() {
        let notifier = ChangeNotifier::default();
        let rx = notifier.subscribe();
        let dropped = notifier.subscribe();
        drop(dropped);

        assert_eq!(notifier.notify(), 1);
        assert_eq!(notifier.notify(), 2);
        assert_eq!(notifier.subscriber_count(), 1);

        // first signal is kept, the second found the slot full
        assert_eq!(rx.try_recv().ok(), Some(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(notifier.generation(), 2);
    }
}
