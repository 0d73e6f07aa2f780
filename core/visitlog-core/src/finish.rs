//! Closing a session, with or without a transcript.
//!
//! Ordering for `finish`: validate, commit the close, invalidate the index,
//! then hand off. A failed close never reaches the channel. A failed hand-off
//! after a committed close is reported as `HandOffFailed` and not rolled
//! back; `resend` retries it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::active_index::ActiveSessionIndex;
use crate::error::{Result, VisitError};
use crate::store::{ClientDirectory, CloseOutcome, SessionStore};
use crate::types::{Client, PractitionerId, Session, SessionId};
use crate::send::SendChannel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinishReceipt {
    pub session: Session,
    pub destination: String,
}

pub struct FinishProtocol {
    store: Arc<dyn SessionStore>,
    clients: Arc<dyn ClientDirectory>,
    index: Arc<dyn ActiveSessionIndex>,
    channel: Arc<dyn SendChannel>,
}

impl FinishProtocol {
    pub fn new(
        store: Arc<dyn SessionStore>,
        clients: Arc<dyn ClientDirectory>,
        index: Arc<dyn ActiveSessionIndex>,
        channel: Arc<dyn SendChannel>,
    ) -> Self {
        Self {
            store,
            clients,
            index,
            channel,
        }
    }

    /// Open → Closed, then hand `final_text` to the send channel.
    pub fn finish(
        &self,
        owner: &PractitionerId,
        session_id: &SessionId,
        final_text: &str,
        now: DateTime<Utc>,
    ) -> Result<FinishReceipt> {
        if final_text.trim().is_empty() {
            return Err(VisitError::validation("transcript must not be empty"));
        }

        let session = self.load(owner, session_id)?;
        if !session.is_open() {
            return Err(VisitError::SessionClosed(session_id.to_string()));
        }
        let destination = self.destination(owner, &session)?;

        let closed = match self.store.close_session(owner, session_id, now)? {
            CloseOutcome::Closed(closed) => closed,
            CloseOutcome::AlreadyClosed(_) => {
                self.index.invalidate(owner, &session.client);
                return Err(VisitError::SessionClosed(session_id.to_string()));
            }
            CloseOutcome::Missing => {
                return Err(VisitError::not_found("session", session_id.as_str()))
            }
        };
        self.index.invalidate(owner, &closed.client);
        info!(session_id = %closed.id, client_id = %closed.client, "Session finished");

        self.hand_off(&closed, &destination, final_text)?;
        Ok(FinishReceipt {
            session: closed,
            destination,
        })
    }

    /// Open → Closed with no transcript. Ending a closed session is a no-op.
    pub fn end_session(
        &self,
        owner: &PractitionerId,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        match self.store.close_session(owner, session_id, now)? {
            CloseOutcome::Closed(closed) => {
                self.index.invalidate(owner, &closed.client);
                info!(session_id = %closed.id, client_id = %closed.client, "Session ended without transcript");
                Ok(closed)
            }
            CloseOutcome::AlreadyClosed(session) => {
                self.index.invalidate(owner, &session.client);
                Ok(session)
            }
            CloseOutcome::Missing => Err(VisitError::not_found("session", session_id.as_str())),
        }
    }

    /// Hands a transcript off again for a session that is already closed.
    pub fn resend(
        &self,
        owner: &PractitionerId,
        session_id: &SessionId,
        text: &str,
    ) -> Result<FinishReceipt> {
        if text.trim().is_empty() {
            return Err(VisitError::validation("transcript must not be empty"));
        }
        let session = self.load(owner, session_id)?;
        if session.is_open() {
            return Err(VisitError::validation(
                "session is still open; finish it instead of resending",
            ));
        }
        let destination = self.destination(owner, &session)?;

        self.hand_off(&session, &destination, text)?;
        info!(session_id = %session.id, "Transcript resent");
        Ok(FinishReceipt {
            session,
            destination,
        })
    }

    fn load(&self, owner: &PractitionerId, session_id: &SessionId) -> Result<Session> {
        self.store
            .get_session(owner, session_id)?
            .ok_or_else(|| VisitError::not_found("session", session_id.as_str()))
    }

    fn destination(&self, owner: &PractitionerId, session: &Session) -> Result<String> {
        let client: Client = self
            .clients
            .get_client(owner, &session.client)?
            .ok_or_else(|| VisitError::not_found("client", session.client.as_str()))?;
        client
            .destination()
            .map(str::to_string)
            .ok_or_else(|| VisitError::validation(format!("client {} has no phone number", client.name)))
    }

    fn hand_off(&self, session: &Session, destination: &str, text: &str) -> Result<()> {
        self.channel.hand_off(destination, text).map_err(|reason| {
            warn!(session_id = %session.id, error = %reason, "Transcript hand-off failed");
            VisitError::HandOffFailed {
                session_id: session.id.to_string(),
                reason,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active_index::InMemoryActiveIndex;
    use crate::store::SqliteStore;
    use crate::types::{ClientId, NoteId, SessionNote, SessionSummary};
    use chrono::NaiveDate;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl SendChannel for RecordingChannel {
        fn hand_off(&self, destination: &str, text: &str) -> std::result::Result<(), String> {
            if self.fail {
                return Err("carrier unreachable".to_string());
            }
            self.sent
                .lock()
                .unwrap()
                .push((destination.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        index: Arc<InMemoryActiveIndex>,
        channel: Arc<RecordingChannel>,
        protocol: FinishProtocol,
        session: Session,
    }

    fn owner() -> PractitionerId {
        PractitionerId::new("practitioner-1")
    }

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn fixture_with(phone: Option<&str>, fail: bool) -> Fixture {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(SqliteStore::new(dir.path().join("visitlog.db")).expect("store"));
        let client = ClientId::new("client-ada");
        store
            .upsert_client(&Client {
                id: client.clone(),
                owner: owner(),
                name: "Ada".to_string(),
                phone: phone.map(str::to_string),
            })
            .expect("seed client");
        let session = store
            .insert_session(&owner(), &client, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
            .expect("session");
        let index = Arc::new(InMemoryActiveIndex::new());
        index.set(&owner(), &client, &session.id);
        let channel = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
            fail,
        });
        let protocol =
            FinishProtocol::new(store.clone(), store.clone(), index.clone(), channel.clone());
        Fixture {
            _dir: dir,
            store,
            index,
            channel,
            protocol,
            session,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Some("555-0100"), false)
    }

    #[test]
    fn finish_closes_invalidates_and_sends() {
        let fx = fixture();
        let receipt = fx
            .protocol
            .finish(&owner(), &fx.session.id, "Hi Ada", at("2024-03-01T12:00:00Z"))
            .expect("finish");

        assert_eq!(receipt.session.closed_at, Some(at("2024-03-01T12:00:00Z")));
        assert_eq!(receipt.destination, "555-0100");
        assert_eq!(fx.index.get(&owner(), &fx.session.client), None);
        assert_eq!(
            *fx.channel.sent.lock().unwrap(),
            vec![("555-0100".to_string(), "Hi Ada".to_string())]
        );
    }

    #[test]
    fn finish_twice_never_sends_twice() {
        let fx = fixture();
        fx.protocol
            .finish(&owner(), &fx.session.id, "Hi Ada", at("2024-03-01T12:00:00Z"))
            .expect("finish");
        let err = fx
            .protocol
            .finish(&owner(), &fx.session.id, "Hi Ada", at("2024-03-01T12:05:00Z"))
            .expect_err("second finish");
        assert!(matches!(err, VisitError::SessionClosed(_)));
        assert_eq!(fx.channel.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn finish_without_phone_leaves_session_open() {
        let fx = fixture_with(None, false);
        let err = fx
            .protocol
            .finish(&owner(), &fx.session.id, "Hi Ada", at("2024-03-01T12:00:00Z"))
            .expect_err("no phone");
        assert!(matches!(err, VisitError::Validation(_)));

        let row = fx
            .store
            .get_session(&owner(), &fx.session.id)
            .unwrap()
            .unwrap();
        assert!(row.is_open());
        assert_eq!(
            fx.index.get(&owner(), &fx.session.client),
            Some(fx.session.id.clone())
        );
        assert!(fx.channel.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_transcript_is_rejected_before_close() {
        let fx = fixture();
        let err = fx
            .protocol
            .finish(&owner(), &fx.session.id, "  ", at("2024-03-01T12:00:00Z"))
            .expect_err("empty text");
        assert!(matches!(err, VisitError::Validation(_)));
        assert!(fx
            .store
            .get_session(&owner(), &fx.session.id)
            .unwrap()
            .unwrap()
            .is_open());
    }

    #[test]
    fn hand_off_failure_keeps_session_closed_and_allows_resend() {
        let fx = fixture_with(Some("555-0100"), true);
        let err = fx
            .protocol
            .finish(&owner(), &fx.session.id, "Hi Ada", at("2024-03-01T12:00:00Z"))
            .expect_err("hand-off fails");
        assert!(matches!(err, VisitError::HandOffFailed { .. }));

        let row = fx
            .store
            .get_session(&owner(), &fx.session.id)
            .unwrap()
            .unwrap();
        assert!(!row.is_open());
        assert_eq!(fx.index.get(&owner(), &fx.session.client), None);

        let retry = FinishProtocol::new(
            fx.store.clone(),
            fx.store.clone(),
            fx.index.clone(),
            Arc::new(RecordingChannel::default()),
        );
        let receipt = retry
            .resend(&owner(), &fx.session.id, "Hi Ada")
            .expect("resend");
        assert_eq!(receipt.session.id, fx.session.id);
    }

    #[test]
    fn resend_requires_closed_session() {
        let fx = fixture();
        let err = fx
            .protocol
            .resend(&owner(), &fx.session.id, "Hi Ada")
            .expect_err("open session");
        assert!(matches!(err, VisitError::Validation(_)));
    }

    #[test]
    fn end_session_is_idempotent() {
        let fx = fixture();
        let first = fx
            .protocol
            .end_session(&owner(), &fx.session.id, at("2024-03-01T12:00:00Z"))
            .expect("end");
        let second = fx
            .protocol
            .end_session(&owner(), &fx.session.id, at("2024-03-01T13:00:00Z"))
            .expect("end again");

        assert_eq!(first.closed_at, Some(at("2024-03-01T12:00:00Z")));
        assert_eq!(second.closed_at, first.closed_at);
        assert_eq!(fx.index.get(&owner(), &fx.session.client), None);
        assert!(fx.channel.sent.lock().unwrap().is_empty());
    }

    /// SQLite for everything except the close, which reports the store as down.
    struct CloseFailsStore {
        inner: Arc<SqliteStore>,
    }

    impl SessionStore for CloseFailsStore {
        fn find_open_session(
            &self,
            owner: &PractitionerId,
            client: &ClientId,
        ) -> Result<Option<Session>> {
            self.inner.find_open_session(owner, client)
        }

        fn get_session(&self, owner: &PractitionerId, id: &SessionId) -> Result<Option<Session>> {
            self.inner.get_session(owner, id)
        }

        fn insert_session(
            &self,
            owner: &PractitionerId,
            client: &ClientId,
            calendar_date: NaiveDate,
        ) -> Result<Session> {
            self.inner.insert_session(owner, client, calendar_date)
        }

        fn close_session(
            &self,
            _owner: &PractitionerId,
            _id: &SessionId,
            _closed_at: DateTime<Utc>,
        ) -> Result<CloseOutcome> {
            Err(VisitError::StoreUnavailable("database is locked".to_string()))
        }

        fn list_sessions(
            &self,
            owner: &PractitionerId,
            client: &ClientId,
        ) -> Result<Vec<SessionSummary>> {
            self.inner.list_sessions(owner, client)
        }

        fn list_open_sessions(&self, owner: &PractitionerId) -> Result<Vec<Session>> {
            self.inner.list_open_sessions(owner)
        }

        fn list_all_open_sessions(&self) -> Result<Vec<Session>> {
            self.inner.list_all_open_sessions()
        }

        fn insert_note(
            &self,
            owner: &PractitionerId,
            session: &SessionId,
            content: &str,
            created_at: DateTime<Utc>,
        ) -> Result<SessionNote> {
            self.inner.insert_note(owner, session, content, created_at)
        }

        fn update_note(
            &self,
            owner: &PractitionerId,
            id: &NoteId,
            content: &str,
        ) -> Result<SessionNote> {
            self.inner.update_note(owner, id, content)
        }

        fn delete_note(&self, owner: &PractitionerId, id: &NoteId) -> Result<bool> {
            self.inner.delete_note(owner, id)
        }

        fn list_notes(
            &self,
            owner: &PractitionerId,
            session: &SessionId,
        ) -> Result<Vec<SessionNote>> {
            self.inner.list_notes(owner, session)
        }
    }

    #[test]
    fn failed_close_never_hands_off_and_leaves_session_open() {
        let fx = fixture();
        let protocol = FinishProtocol::new(
            Arc::new(CloseFailsStore {
                inner: fx.store.clone(),
            }),
            fx.store.clone(),
            fx.index.clone(),
            fx.channel.clone(),
        );

        let err = protocol
            .finish(&owner(), &fx.session.id, "Hi Ada", at("2024-03-01T12:00:00Z"))
            .expect_err("store down");
        assert!(matches!(err, VisitError::StoreUnavailable(_)));
        assert!(err.is_retryable());

        assert!(fx.channel.sent.lock().unwrap().is_empty());
        let row = fx
            .store
            .get_session(&owner(), &fx.session.id)
            .unwrap()
            .unwrap();
        assert!(row.is_open());
        assert_eq!(
            fx.index.get(&owner(), &fx.session.client),
            Some(fx.session.id.clone())
        );

        let receipt = fx
            .protocol
            .finish(&owner(), &fx.session.id, "Hi Ada", at("2024-03-01T12:05:00Z"))
            .expect("retry once the store is back");
        assert!(!receipt.session.is_open());
        assert_eq!(fx.channel.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn end_unknown_session_is_not_found() {
        let fx = fixture();
        let err = fx
            .protocol
            .end_session(&owner(), &SessionId::new("missing"), at("2024-03-01T12:00:00Z"))
            .expect_err("missing");
        assert!(matches!(err, VisitError::NotFound { .. }));
    }
}
