//! The narrow persistence contract the engine consumes.
//!
//! Implementations must make each call atomic at single-row granularity and
//! must make `insert_session` refuse a second open session for the same
//! `(owner, client)` with [`VisitError::Conflict`](crate::VisitError::Conflict),
//! either through a transactional check-and-insert or a uniqueness constraint.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::Result;
use crate::types::{
    Client, ClientId, NoteId, PractitionerId, Session, SessionId, SessionNote, SessionSummary,
};

/// Result of a conditional close (`closed_at IS NULL` guard).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// This call performed the Open → Closed transition.
    Closed(Session),
    /// Someone else closed it first; carries the row as it stands.
    AlreadyClosed(Session),
    /// No such session for this owner.
    Missing,
}

pub trait SessionStore: Send + Sync {
    fn find_open_session(
        &self,
        owner: &PractitionerId,
        client: &ClientId,
    ) -> Result<Option<Session>>;

    fn get_session(&self, owner: &PractitionerId, id: &SessionId) -> Result<Option<Session>>;

    /// Creates an open session, or fails with `Conflict` if one already exists.
    fn insert_session(
        &self,
        owner: &PractitionerId,
        client: &ClientId,
        calendar_date: NaiveDate,
    ) -> Result<Session>;

    fn close_session(
        &self,
        owner: &PractitionerId,
        id: &SessionId,
        closed_at: DateTime<Utc>,
    ) -> Result<CloseOutcome>;

    /// Client history, newest calendar date first.
    fn list_sessions(
        &self,
        owner: &PractitionerId,
        client: &ClientId,
    ) -> Result<Vec<SessionSummary>>;

    fn list_open_sessions(&self, owner: &PractitionerId) -> Result<Vec<Session>>;

    /// Open sessions across every owner; used by the periodic sweep.
    fn list_all_open_sessions(&self) -> Result<Vec<Session>>;

    /// Appends a note. `created_at` is clamped to be no earlier than the
    /// session's latest note so insertion order and time order agree.
    fn insert_note(
        &self,
        owner: &PractitionerId,
        session: &SessionId,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<SessionNote>;

    fn update_note(
        &self,
        owner: &PractitionerId,
        id: &NoteId,
        content: &str,
    ) -> Result<SessionNote>;

    /// Returns whether a row was removed.
    fn delete_note(&self, owner: &PractitionerId, id: &NoteId) -> Result<bool>;

    /// Notes ordered by `(created_at, sequence)` ascending.
    fn list_notes(&self, owner: &PractitionerId, session: &SessionId)
        -> Result<Vec<SessionNote>>;
}

/// Read access to client profiles owned by another subsystem.
pub trait ClientDirectory: Send + Sync {
    fn get_client(&self, owner: &PractitionerId, id: &ClientId) -> Result<Option<Client>>;
}
