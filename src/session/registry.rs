//! Concurrent session registry with per-id mutual exclusion.
//!
//! A fixed-width stripe of async locks keyed by session-id hash
//! serializes CONNECT handling against DATA delivery: the CONNECT
//! handler holds the id's lock across backend dial and insert, so a
//! DATA frame can never observe a half-created slot. Lock acquisition
//! is a suspension point; no stripe is held across anything but the
//! guarded section.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::relay::SubMessage;
use crate::session::CancelHandle;

/// Number of lock stripes. Collisions only cost contention, never
/// correctness.
const STRIPES: usize = 64;

/// What the registry keeps per live session.
#[derive(Clone)]
pub struct SessionHandle {
    /// Feeds raw stream events into the session's inbound queue
    pub inbound: mpsc::Sender<SubMessage>,
    /// Cancels the session's tasks
    pub cancel: CancelHandle,
}

/// Concurrent map `session id → handle` plus the stripe locks.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    stripes: Vec<Mutex<()>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Acquires the stripe lock guarding `id`.
    ///
    /// Hold the guard across dial-plus-insert on CONNECT and across
    /// lookup-plus-delivery on DATA.
    pub async fn lock(&self, id: &Uuid) -> MutexGuard<'_, ()> {
        self.stripes[stripe_of(id)].lock().await
    }

    /// Registers a session. Returns `false` when the id already exists
    /// (the existing session is left untouched).
    pub fn insert(&self, id: Uuid, handle: SessionHandle) -> bool {
        use std::collections::hash_map::Entry;
        match self.sessions.write().entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    /// Looks up a session.
    pub fn get(&self, id: &Uuid) -> Option<SessionHandle> {
        self.sessions.read().get(id).cloned()
    }

    /// Whether a session is registered.
    pub fn contains(&self, id: &Uuid) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Removes a session, returning its handle if it was present.
    pub fn remove(&self, id: &Uuid) -> Option<SessionHandle> {
        self.sessions.write().remove(id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Cancels every registered session and clears the map.
    pub fn cancel_all(&self) {
        let drained: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write();
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in drained {
            handle.cancel.cancel();
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn stripe_of(id: &Uuid) -> usize {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() as usize) % STRIPES
}
