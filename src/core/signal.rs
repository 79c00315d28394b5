//! Observable value cells

use tokio::sync::watch;

/// A value with a defined initial state that pushes every change to its
/// subscribers. New subscribers start from the current value.
#[derive(Debug)]
pub struct Signal<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq> Signal<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Store `value`, notifying subscribers only if it differs from the current one
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    /// Store `value` and notify subscribers even if it is unchanged
    pub fn replace(&self, value: T) -> T {
        self.tx.send_replace(value)
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + PartialEq + Default> Default for Signal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
