//! Advisory cache from client to its current open session.
//!
//! Never authoritative. Writers must follow two rules:
//! - `set` only after the store has confirmed the session row exists and is open.
//! - `invalidate` before a close is acknowledged to the caller.
//!
//! Readers treat a hit as a candidate and re-check it against the store. A
//! backing failure degrades to a miss.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::types::{ClientId, PractitionerId, SessionId};

pub trait ActiveSessionIndex: Send + Sync {
    fn get(&self, owner: &PractitionerId, client: &ClientId) -> Option<SessionId>;
    fn set(&self, owner: &PractitionerId, client: &ClientId, session: &SessionId);
    fn invalidate(&self, owner: &PractitionerId, client: &ClientId);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type IndexKey = (PractitionerId, ClientId);

/// In-process index. A single short-lived mutex makes per-key reads and
/// writes linearizable; the lock is never held across a store call.
#[derive(Debug, Default)]
pub struct InMemoryActiveIndex {
    entries: Mutex<HashMap<IndexKey, SessionId>>,
}

impl InMemoryActiveIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Option<MutexGuard<'_, HashMap<IndexKey, SessionId>>> {
        match self.entries.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::warn!("Active session index lock poisoned; treating as miss");
                None
            }
        }
    }

    // A poisoned map may hold a half-applied write; drop everything so no stale
    // positive entry survives.
    fn clear_poisoned(&self) {
        if let Err(poisoned) = self.entries.lock() {
            poisoned.into_inner().clear();
            self.entries.clear_poison();
        }
    }
}

impl ActiveSessionIndex for InMemoryActiveIndex {
    fn get(&self, owner: &PractitionerId, client: &ClientId) -> Option<SessionId> {
        let entries = self.entries()?;
        entries.get(&(owner.clone(), client.clone())).cloned()
    }

    fn set(&self, owner: &PractitionerId, client: &ClientId, session: &SessionId) {
        if let Some(mut entries) = self.entries() {
            entries.insert((owner.clone(), client.clone()), session.clone());
        }
    }

    fn invalidate(&self, owner: &PractitionerId, client: &ClientId) {
        match self.entries() {
            Some(mut entries) => {
                entries.remove(&(owner.clone(), client.clone()));
            }
            None => self.clear_poisoned(),
        }
    }

    fn len(&self) -> usize {
        self.entries().map(|entries| entries.len()).unwrap_or(0)
    }
}
