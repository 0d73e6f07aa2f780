//! Ordered note log for one session.
//!
//! Content is validated before any store call, so a rejected note never
//! costs a round trip. Each operation is a single store call and is safe to
//! retry.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, VisitError};
use crate::store::SessionStore;
use crate::types::{NoteId, PractitionerId, SessionId, SessionNote};

pub struct NoteLog {
    store: Arc<dyn SessionStore>,
}

impl NoteLog {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn append(
        &self,
        owner: &PractitionerId,
        session: &SessionId,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionNote> {
        let content = validate_content(content)?;
        let note = self.store.insert_note(owner, session, content, now)?;
        debug!(session_id = %session, note_id = %note.id, sequence = note.sequence, "Note appended");
        Ok(note)
    }

    /// Replaces a note's content; its timestamp and position are kept.
    pub fn edit(
        &self,
        owner: &PractitionerId,
        note: &NoteId,
        content: &str,
    ) -> Result<SessionNote> {
        let content = validate_content(content)?;
        let note = self.store.update_note(owner, note, content)?;
        debug!(session_id = %note.session, note_id = %note.id, "Note edited");
        Ok(note)
    }

    /// Idempotent: deleting a note that is already gone succeeds.
    pub fn delete(&self, owner: &PractitionerId, note: &NoteId) -> Result<()> {
        let removed = self.store.delete_note(owner, note)?;
        debug!(note_id = %note, removed, "Note delete");
        Ok(())
    }

    pub fn list(&self, owner: &PractitionerId, session: &SessionId) -> Result<Vec<SessionNote>> {
        self.store.list_notes(owner, session)
    }
}

fn validate_content(content: &str) -> Result<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(VisitError::validation("note content must not be empty"));
    }
    Ok(trimmed)
}
