//! Shared connection registry.
//!
//! Sessions for the two halves of a pairing rendezvous here. The registry
//! resolves sessions by structural predicate and reference-counts every
//! record so that no session is freed while another worker still reads its
//! fields. A single mutex serializes insert, find and release; the critical
//! section of a find covers both the search and the watcher increment, so a
//! concurrent release can never free a record between the two.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

pub mod flag;
mod session;

pub use flag::{SetOnce, WaitError};
pub use session::Session;

/// Why a bounded registry search came up empty.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no matching session within {0:?}")]
    FindTimeout(Duration),
}

#[derive(Debug)]
struct Entry {
    session: Arc<Session>,
    watchers: usize,
}

/// The registry proper. Shared between the listener and every session worker.
#[derive(Debug)]
pub struct Registry {
    entries: Mutex<Vec<Entry>>,
    inserted: Notify,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            inserted: Notify::new(),
        })
    }

    /// Add a session. The returned reference is the inserting worker's own
    /// watch on the record; dropping it is the matching release.
    pub fn insert(self: &Arc<Self>, session: Session) -> SessionRef {
        let session = Arc::new(session);

        {
            let mut entries = self.entries.lock().expect("registry mutex");
            entries.push(Entry {
                session: session.clone(),
                watchers: 1,
            });
        }
        trace!(observed = %session.observed(), "session registered");
        self.inserted.notify_waiters();

        SessionRef {
            registry: self.clone(),
            session,
        }
    }

    /// Find the first session satisfying `predicate` and take a watch on it.
    ///
    /// The watcher increment happens under the same lock as the search.
    pub fn find<P>(self: &Arc<Self>, predicate: P) -> Option<SessionRef>
    where
        P: Fn(&Session) -> bool,
    {
        let mut entries = self.entries.lock().expect("registry mutex");
        let entry = entries.iter_mut().find(|e| predicate(e.session.as_ref()))?;

        entry.watchers += 1;
        Some(SessionRef {
            registry: self.clone(),
            session: entry.session.clone(),
        })
    }

    /// Like [`Registry::find`], but waits for a matching session to appear,
    /// up to `timeout`.
    ///
    /// Insertions wake the search immediately. A record can also *start*
    /// matching when its fields are published after insertion (a session
    /// becomes a findable buddy only once its HELLO is recorded), so the
    /// search additionally re-checks at a short interval.
    pub async fn find_timeout<P>(
        self: &Arc<Self>,
        predicate: P,
        timeout: Duration,
    ) -> Result<SessionRef, RegistryError>
    where
        P: Fn(&Session) -> bool,
    {
        const RECHECK_INTERVAL: Duration = Duration::from_millis(250);

        let deadline = Instant::now() + timeout;

        loop {
            // Arm the notification before searching so an insert landing
            // between the search and the wait is not lost.
            let inserted = self.inserted.notified();

            if let Some(found) = self.find(&predicate) {
                return Ok(found);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RegistryError::FindTimeout(timeout));
            }

            let wait = RECHECK_INTERVAL.min(deadline - now);
            // Either outcome loops back into another search; only the
            // deadline ends the wait.
            let _ = tokio::time::timeout(wait, inserted).await;
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, session: &Arc<Session>) {
        let mut entries = self.entries.lock().expect("registry mutex");
        let Some(at) = entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.session, session))
        else {
            debug_assert!(false, "release of an unregistered session");
            return;
        };

        entries[at].watchers -= 1;
        if entries[at].watchers == 0 {
            trace!(observed = %session.observed(), "session removed");
            entries.swap_remove(at);
        }
    }

    fn watchers(&self, session: &Arc<Session>) -> usize {
        let entries = self.entries.lock().expect("registry mutex");
        entries
            .iter()
            .find(|e| Arc::ptr_eq(&e.session, session))
            .map(|e| e.watchers)
            .unwrap_or(0)
    }
}

/// A counted reference to a registered session.
///
/// Exists for every successful insert or find; dropping it performs the
/// release. The record is removed from the registry when its last reference
/// goes away.
#[derive(Debug)]
pub struct SessionRef {
    registry: Arc<Registry>,
    session: Arc<Session>,
}

impl SessionRef {
    /// Current watcher count of the underlying record (0 once removed).
    pub fn watchers(&self) -> usize {
        self.registry.watchers(&self.session)
    }
}

impl std::ops::Deref for SessionRef {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionRef {
    fn drop(&mut self) {
        self.registry.release(&self.session);
    }
}
