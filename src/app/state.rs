use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

/// A single piece of in-memory UI state with change signalling. Setting a
/// value equal to the current one is silent.
#[derive(Debug, Default)]
pub struct Observable<T> {
    value: RwLock<T>,
    watchers: Mutex<Vec<Sender<()>>>,
}

impl<T: Clone + PartialEq> Observable<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: RwLock::new(value),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Stores `value`. Returns `true` if it differed from the previous one.
    pub fn set(&self, value: T) -> bool {
        {
            let mut current = self.value.write();
            if *current == value {
                return false;
            }
            *current = value;
        }
        self.signal();
        true
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        let changed = {
            let mut current = self.value.write();
            let before = current.clone();
            f(&mut current);
            *current != before
        };
        if changed {
            self.signal();
        }
        changed
    }

    pub fn subscribe(&self) -> Watcher<'_, T> {
        let (tx, rx) = bounded(1);
        self.watchers.lock().push(tx);
        Watcher {
            source: self,
            changes: rx,
        }
    }

    fn signal(&self) {
        self.watchers
            .lock()
            .retain(|tx| !matches!(tx.try_send(()), Err(TrySendError::Disconnected(_))));
    }
}

/// Receiving side of an [`Observable`]. Changes made between two reads
/// collapse into one.
pub struct Watcher<'a, T> {
    source: &'a Observable<T>,
    changes: Receiver<()>,
}

impl<T: Clone + PartialEq> Watcher<'_, T> {
    pub fn current(&self) -> T {
        self.source.get()
    }

    pub fn changed(&self) -> bool {
        self.changes.try_recv().is_ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        match self.changes.recv_timeout(timeout) {
            Ok(()) => Some(self.source.get()),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// In-memory preferences and session state. Nothing here is persisted.
#[derive(Debug, Default)]
pub struct EphemeralState {
    pub dark_mode: Observable<bool>,
    pub haptic_feedback: Observable<bool>,
    pub sound_effects: Observable<bool>,
    pub current_user: Observable<Option<String>>,
    pub search_query: Observable<String>,
    pub refreshing: Observable<bool>,
    pub last_error: Observable<Option<String>>,
}

impl EphemeralState {
    pub fn new(dark_mode: bool, haptic_feedback: bool, sound_effects: bool) -> Self {
        Self {
            dark_mode: Observable::new(dark_mode),
            haptic_feedback: Observable::new(haptic_feedback),
            sound_effects: Observable::new(sound_effects),
            ..Self::default()
        }
    }
}
