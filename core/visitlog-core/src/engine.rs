//! VisitEngine - the single entry point the daemon drives.
//!
//! Every operation asks the supplied [`IdentityProvider`] for the current
//! practitioner before touching anything, and every store call is scoped to
//! that practitioner. Time comes from the injected [`Clock`].

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::active_index::ActiveSessionIndex;
use crate::clock::Clock;
use crate::error::{Result, VisitError};
use crate::finish::{FinishProtocol, FinishReceipt};
use crate::identity::IdentityProvider;
use crate::notes::NoteLog;
use crate::resolver::{Resolution, SessionResolver};
use crate::send::SendChannel;
use crate::store::{ClientDirectory, SessionStore};
use crate::suggestions::CategoryCatalog;
use crate::transcript;
use crate::types::{
    CategorySuggestion, Client, ClientId, NoteId, PractitionerId, Session, SessionId, SessionNote,
    SessionSummary,
};

/// What the session screen shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub session: Session,
    pub client_name: String,
    pub notes: Vec<SessionNote>,
}

pub struct VisitEngine {
    store: Arc<dyn SessionStore>,
    clients: Arc<dyn ClientDirectory>,
    index: Arc<dyn ActiveSessionIndex>,
    clock: Arc<dyn Clock>,
    catalog: CategoryCatalog,
    resolver: SessionResolver,
    notes: NoteLog,
    finish: FinishProtocol,
}

impl VisitEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        clients: Arc<dyn ClientDirectory>,
        index: Arc<dyn ActiveSessionIndex>,
        channel: Arc<dyn SendChannel>,
        clock: Arc<dyn Clock>,
        catalog: CategoryCatalog,
    ) -> Self {
        let resolver = SessionResolver::new(store.clone(), clients.clone(), index.clone());
        let notes = NoteLog::new(store.clone());
        let finish = FinishProtocol::new(store.clone(), clients.clone(), index.clone(), channel);
        Self {
            store,
            clients,
            index,
            clock,
            catalog,
            resolver,
            notes,
            finish,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session lifecycle
    // ─────────────────────────────────────────────────────────────────────

    pub fn start_visit(
        &self,
        identity: &dyn IdentityProvider,
        client: &ClientId,
    ) -> Result<Resolution> {
        let owner = identity.current_owner()?;
        self.resolver.resolve(&owner, client, self.clock.now())
    }

    /// Loads a session for display, expiring it first if it has gone stale.
    pub fn view_session(
        &self,
        identity: &dyn IdentityProvider,
        session: &SessionId,
    ) -> Result<SessionView> {
        let owner = identity.current_owner()?;
        let session = self
            .resolver
            .open_for_view(&owner, session, self.clock.now())?;
        let client = self.client(&owner, &session.client)?;
        let notes = self.notes.list(&owner, &session.id)?;
        Ok(SessionView {
            session,
            client_name: client.name,
            notes,
        })
    }

    pub fn finish(
        &self,
        identity: &dyn IdentityProvider,
        session: &SessionId,
        final_text: &str,
    ) -> Result<FinishReceipt> {
        let owner = identity.current_owner()?;
        self.finish
            .finish(&owner, session, final_text, self.clock.now())
    }

    pub fn end_session(
        &self,
        identity: &dyn IdentityProvider,
        session: &SessionId,
    ) -> Result<Session> {
        let owner = identity.current_owner()?;
        self.finish.end_session(&owner, session, self.clock.now())
    }

    pub fn resend(
        &self,
        identity: &dyn IdentityProvider,
        session: &SessionId,
        text: &str,
    ) -> Result<FinishReceipt> {
        let owner = identity.current_owner()?;
        self.finish.resend(&owner, session, text)
    }

    /// Closes stale open sessions for every practitioner.
    pub fn sweep_stale(&self) -> Result<Vec<Session>> {
        self.resolver.sweep_stale(self.clock.now())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Notes
    // ─────────────────────────────────────────────────────────────────────

    pub fn append_note(
        &self,
        identity: &dyn IdentityProvider,
        session: &SessionId,
        content: &str,
    ) -> Result<SessionNote> {
        let owner = identity.current_owner()?;
        self.notes.append(&owner, session, content, self.clock.now())
    }

    /// Appends a catalog phrase as a note.
    pub fn quick_add(
        &self,
        identity: &dyn IdentityProvider,
        session: &SessionId,
        category_id: &str,
        phrase_index: usize,
    ) -> Result<SessionNote> {
        let owner = identity.current_owner()?;
        let phrase = self.catalog.phrase(category_id, phrase_index)?;
        self.notes.append(&owner, session, phrase, self.clock.now())
    }

    pub fn edit_note(
        &self,
        identity: &dyn IdentityProvider,
        note: &NoteId,
        content: &str,
    ) -> Result<SessionNote> {
        let owner = identity.current_owner()?;
        self.notes.edit(&owner, note, content)
    }

    pub fn delete_note(&self, identity: &dyn IdentityProvider, note: &NoteId) -> Result<()> {
        let owner = identity.current_owner()?;
        self.notes.delete(&owner, note)
    }

    pub fn list_notes(
        &self,
        identity: &dyn IdentityProvider,
        session: &SessionId,
    ) -> Result<Vec<SessionNote>> {
        let owner = identity.current_owner()?;
        self.notes.list(&owner, session)
    }

    /// Default transcript for the session's current notes. Reads only.
    pub fn compose_transcript(
        &self,
        identity: &dyn IdentityProvider,
        session: &SessionId,
    ) -> Result<String> {
        let owner = identity.current_owner()?;
        let session = self
            .store
            .get_session(&owner, session)?
            .ok_or_else(|| VisitError::not_found("session", session.as_str()))?;
        let client = self.client(&owner, &session.client)?;
        let notes = self.notes.list(&owner, &session.id)?;
        Ok(transcript::compose(&session, &client.name, &notes))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dashboard & history
    // ─────────────────────────────────────────────────────────────────────

    /// All sessions for a client, newest calendar date first, with note counts.
    pub fn client_history(
        &self,
        identity: &dyn IdentityProvider,
        client: &ClientId,
    ) -> Result<Vec<SessionSummary>> {
        let owner = identity.current_owner()?;
        self.client(&owner, client)?;
        self.store.list_sessions(&owner, client)
    }

    /// Client to the session `start_visit` would resume right now. Answered
    /// from the store; stale sessions are left for the next resolve or sweep.
    pub fn active_sessions(
        &self,
        identity: &dyn IdentityProvider,
    ) -> Result<BTreeMap<ClientId, SessionId>> {
        let owner = identity.current_owner()?;
        Ok(self
            .resolver
            .active_sessions(&owner, self.clock.now())?
            .into_iter()
            .map(|session| (session.client, session.id))
            .collect())
    }

    pub fn categories(&self) -> &[CategorySuggestion] {
        self.catalog.categories()
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    fn client(&self, owner: &PractitionerId, client: &ClientId) -> Result<Client> {
        self.clients
            .get_client(owner, client)?
            .ok_or_else(|| VisitError::not_found("client", client.as_str()))
    }
}
