//! Monotonic set-once cells.
//!
//! A [`SetOnce`] starts unset and can be set exactly once; later writes are
//! ignored. Once a reader has observed the value, it never changes for the
//! cell's remaining lifetime. Waits are event-driven and bounded.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// Why a bounded wait on a [`SetOnce`] did not produce a value.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("value was not set within {0:?}")]
    Timeout(Duration),
}

/// A write-once, read-many cell with bounded asynchronous waits.
#[derive(Debug)]
pub struct SetOnce<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> SetOnce<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Publish the value. The first call wins; any later call is a no-op and
    /// returns `false`.
    pub fn set(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = value.take();
                true
            } else {
                false
            }
        })
    }

    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until the value is published, up to `timeout`.
    pub async fn wait(&self, timeout: Duration) -> Result<T, WaitError> {
        let mut rx = self.tx.subscribe();

        let waited = tokio::time::timeout(timeout, rx.wait_for(|slot| slot.is_some())).await;
        match waited {
            Ok(Ok(slot)) => Ok(slot.clone().expect("guarded by wait_for")),
            // The sender lives inside `self`, so the channel cannot close
            // while we are borrowing it.
            Ok(Err(_)) => unreachable!("watch sender dropped while borrowed"),
            Err(_) => Err(WaitError::Timeout(timeout)),
        }
    }
}

impl<T: Clone> Default for SetOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_set_wins() {
        let cell = SetOnce::new();
        assert!(!cell.is_set());
        assert!(cell.set(7u16));
        assert!(!cell.set(9));
        assert_eq!(cell.get(), Some(7));
    }

    #[tokio::test]
    async fn wait_resolves_when_set_from_another_task() {
        let cell = std::sync::Arc::new(SetOnce::new());

        let setter = cell.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set(42u32);
        });

        let got = cell.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(got, 42);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_when_never_set() {
        let cell: SetOnce<u16> = SetOnce::new();
        let err = cell.wait(Duration::from_secs(20)).await.unwrap_err();
        assert_eq!(err, WaitError::Timeout(Duration::from_secs(20)));
    }

    #[tokio::test]
    async fn value_is_stable_once_observed() {
        let cell = SetOnce::new();
        cell.set("first".to_string());
        let seen = cell.get();
        cell.set("second".to_string());
        assert_eq!(cell.get(), seen);
    }
}
