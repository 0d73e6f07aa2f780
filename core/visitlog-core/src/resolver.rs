//! Find-or-create-or-resume for a client's visit session.
//!
//! The index is consulted first as a hint, the store is ground truth. Every
//! path that closes a session invalidates the index entry before returning.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::active_index::ActiveSessionIndex;
use crate::error::{Result, VisitError};
use crate::staleness;
use crate::store::{ClientDirectory, CloseOutcome, SessionStore};
use crate::types::{ClientId, PractitionerId, Session, SessionId};

/// Upper bound on `Conflict → re-resolve` rounds for one call.
pub const MAX_RESOLVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// An open, fresh session already existed and is returned unchanged.
    Resumed(Session),
    /// A new session was created. `expired` is the stale session closed on the way.
    Created {
        session: Session,
        expired: Option<Session>,
    },
}

impl Resolution {
    pub fn session(&self) -> &Session {
        match self {
            Resolution::Resumed(session) => session,
            Resolution::Created { session, .. } => session,
        }
    }

    pub fn into_session(self) -> Session {
        match self {
            Resolution::Resumed(session) => session,
            Resolution::Created { session, .. } => session,
        }
    }

    pub fn was_resumed(&self) -> bool {
        matches!(self, Resolution::Resumed(_))
    }
}

pub struct SessionResolver {
    store: Arc<dyn SessionStore>,
    clients: Arc<dyn ClientDirectory>,
    index: Arc<dyn ActiveSessionIndex>,
}

impl SessionResolver {
    pub fn new(
        store: Arc<dyn SessionStore>,
        clients: Arc<dyn ClientDirectory>,
        index: Arc<dyn ActiveSessionIndex>,
    ) -> Self {
        Self {
            store,
            clients,
            index,
        }
    }

    /// Returns an open session for `(owner, client)`, resuming, expiring, or
    /// creating as needed. Only store failures (or an unknown client) escape.
    pub fn resolve(
        &self,
        owner: &PractitionerId,
        client: &ClientId,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        if self.clients.get_client(owner, client)?.is_none() {
            return Err(VisitError::not_found("client", client.as_str()));
        }

        let mut expired = None;
        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            match self.resolve_once(owner, client, now, &mut expired) {
                Err(VisitError::Conflict { .. }) if attempt < MAX_RESOLVE_ATTEMPTS => {
                    debug!(
                        client_id = %client,
                        attempt,
                        "Concurrent session create detected; re-resolving"
                    );
                }
                other => return other,
            }
        }

        Err(VisitError::Conflict {
            client: client.to_string(),
        })
    }

    fn resolve_once(
        &self,
        owner: &PractitionerId,
        client: &ClientId,
        now: DateTime<Utc>,
        expired: &mut Option<Session>,
    ) -> Result<Resolution> {
        if let Some(candidate) = self.candidate(owner, client)? {
            if !staleness::is_stale(&candidate, now) {
                debug!(session_id = %candidate.id, client_id = %client, "Resuming open session");
                return Ok(Resolution::Resumed(candidate));
            }

            info!(
                session_id = %candidate.id,
                client_id = %client,
                calendar_date = %candidate.calendar_date,
                "Auto-expiring stale session"
            );
            if let Some(closed) = self.close(owner, &candidate, now)? {
                *expired = Some(closed);
            }
        }

        let session = self
            .store
            .insert_session(owner, client, now.date_naive())?;
        self.index.set(owner, client, &session.id);
        info!(
            session_id = %session.id,
            client_id = %client,
            calendar_date = %session.calendar_date,
            "Session created"
        );

        Ok(Resolution::Created {
            session,
            expired: expired.clone(),
        })
    }

    /// The open session the index or the store currently points at.
    fn candidate(&self, owner: &PractitionerId, client: &ClientId) -> Result<Option<Session>> {
        if let Some(session_id) = self.index.get(owner, client) {
            match self.store.get_session(owner, &session_id)? {
                Some(session) if session.is_open() && session.client == *client => {
                    debug!(session_id = %session_id, client_id = %client, "Active index hit");
                    return Ok(Some(session));
                }
                _ => {
                    warn!(
                        session_id = %session_id,
                        client_id = %client,
                        "Active index pointed at a session that is not open; invalidating"
                    );
                    self.index.invalidate(owner, client);
                }
            }
        } else {
            debug!(client_id = %client, "Active index miss");
        }

        self.store.find_open_session(owner, client)
    }

    /// Opens a session by id for viewing. A stale open session is closed here,
    /// by the same rule `resolve` uses, and returned closed.
    pub fn open_for_view(
        &self,
        owner: &PractitionerId,
        id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let session = self
            .store
            .get_session(owner, id)?
            .ok_or_else(|| VisitError::not_found("session", id.as_str()))?;

        if !staleness::is_stale(&session, now) {
            return Ok(session);
        }

        info!(
            session_id = %session.id,
            client_id = %session.client,
            calendar_date = %session.calendar_date,
            "Auto-expiring stale session on view"
        );
        match self.close(owner, &session, now)? {
            Some(closed) => Ok(closed),
            None => self
                .store
                .get_session(owner, id)?
                .ok_or_else(|| VisitError::not_found("session", id.as_str())),
        }
    }

    /// Closes every stale open session across all owners. Returns the sessions
    /// this call closed.
    pub fn sweep_stale(&self, now: DateTime<Utc>) -> Result<Vec<Session>> {
        let mut closed = Vec::new();
        for session in self.store.list_all_open_sessions()? {
            if !staleness::is_stale(&session, now) {
                continue;
            }
            if let Some(row) = self.close(&session.owner, &session, now)? {
                info!(
                    session_id = %row.id,
                    client_id = %row.client,
                    calendar_date = %row.calendar_date,
                    "Swept stale session"
                );
                closed.push(row);
            }
        }
        Ok(closed)
    }

    /// Open sessions that may still be resumed, without closing stale ones.
    pub fn active_sessions(
        &self,
        owner: &PractitionerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        Ok(self
            .store
            .list_open_sessions(owner)?
            .into_iter()
            .filter(|session| !staleness::is_stale(session, now))
            .collect())
    }

    /// Conditional close plus index invalidation. `None` when another caller
    /// closed it first or the row vanished.
    fn close(
        &self,
        owner: &PractitionerId,
        session: &Session,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let outcome = self.store.close_session(owner, &session.id, now)?;
        self.index.invalidate(owner, &session.client);
        Ok(match outcome {
            CloseOutcome::Closed(closed) => Some(closed),
            CloseOutcome::AlreadyClosed(_) | CloseOutcome::Missing => None,
        })
    }
}
