use chrono::{DateTime, NaiveDate, Utc};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use visitlog_core::{
    ActiveSessionIndex, CategoryCatalog, Client, ClientId, InMemoryActiveIndex, ManualClock,
    OutboxChannel, PractitionerId, Resolution, SessionStore, SqliteStore, StaticIdentity,
    VisitEngine,
};

struct Harness {
    dir: TempDir,
    store: Arc<SqliteStore>,
    index: Arc<InMemoryActiveIndex>,
    clock: Arc<ManualClock>,
    engine: VisitEngine,
}

fn at(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .expect("timestamp")
        .with_timezone(&Utc)
}

fn doula() -> StaticIdentity {
    StaticIdentity(PractitionerId::new("doula-1"))
}

fn ada() -> ClientId {
    ClientId::new("client-ada")
}

fn seed_ada(store: &SqliteStore) {
    store
        .upsert_client(&Client {
            id: ada(),
            owner: PractitionerId::new("doula-1"),
            name: "Ada".to_string(),
            phone: Some("555-0100".to_string()),
        })
        .expect("seed client");
}

fn harness(now: &str) -> Harness {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(SqliteStore::new(dir.path().join("visitlog.db")).expect("open store"));
    seed_ada(&store);
    let index = Arc::new(InMemoryActiveIndex::new());
    let clock = Arc::new(ManualClock::new(at(now)));
    let engine = VisitEngine::new(
        store.clone(),
        store.clone(),
        index.clone(),
        Arc::new(OutboxChannel::new(dir.path().join("outbox.jsonl"))),
        clock.clone(),
        CategoryCatalog::default(),
    );
    Harness {
        dir,
        store,
        index,
        clock,
        engine,
    }
}

fn outbox_lines(dir: &Path) -> usize {
    OutboxChannel::new(dir.join("outbox.jsonl"))
        .read_entries()
        .expect("outbox")
        .len()
}

#[test]
fn first_resolve_creates_one_open_session_and_indexes_it() {
    let h = harness("2024-03-01T10:00:00Z");
    let resolution = h.engine.start_visit(&doula(), &ada()).expect("resolve");

    let session = match resolution {
        Resolution::Created { session, expired } => {
            assert!(expired.is_none());
            session
        }
        other => panic!("expected a new session, got {other:?}"),
    };
    assert!(session.is_open());
    assert_eq!(
        session.calendar_date,
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    );
    assert_eq!(
        h.index.get(&PractitionerId::new("doula-1"), &ada()),
        Some(session.id.clone())
    );
    assert_eq!(
        h.store
            .list_sessions(&PractitionerId::new("doula-1"), &ada())
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn ada_visit_finish_then_new_visit() {
    let h = harness("2024-03-01T10:00:00Z");
    let session = h
        .engine
        .start_visit(&doula(), &ada())
        .expect("resolve")
        .into_session();

    h.engine
        .append_note(&doula(), &session.id, "Good latch observed")
        .expect("append 1");
    h.engine
        .append_note(&doula(), &session.id, "Wet diaper")
        .expect("append 2");
    let contents: Vec<String> = h
        .engine
        .list_notes(&doula(), &session.id)
        .expect("list")
        .into_iter()
        .map(|note| note.content)
        .collect();
    assert_eq!(contents, vec!["Good latch observed", "Wet diaper"]);

    let text = h
        .engine
        .compose_transcript(&doula(), &session.id)
        .expect("compose");
    let receipt = h
        .engine
        .finish(&doula(), &session.id, &text)
        .expect("finish");
    assert!(!receipt.session.is_open());
    assert_eq!(h.engine.index_len(), 0);
    assert_eq!(outbox_lines(h.dir.path()), 1);

    h.clock.set(at("2024-03-01T15:00:00Z"));
    let next = h
        .engine
        .start_visit(&doula(), &ada())
        .expect("resolve again");
    assert!(!next.was_resumed());
    assert_ne!(next.session().id, session.id);
}

#[test]
fn stale_session_is_expired_and_replaced() {
    let h = harness("2024-03-01T10:00:00Z");
    let first = h
        .engine
        .start_visit(&doula(), &ada())
        .expect("resolve")
        .into_session();

    h.clock.set(at("2024-03-03T09:00:00Z"));
    match h.engine.start_visit(&doula(), &ada()).expect("resolve") {
        Resolution::Created { session, expired } => {
            let expired = expired.expect("stale session closed");
            assert_eq!(expired.id, first.id);
            assert_eq!(expired.closed_at, Some(at("2024-03-03T09:00:00Z")));
            assert_ne!(session.id, first.id);
            assert_eq!(
                session.calendar_date,
                NaiveDate::from_ymd_opt(2024, 3, 3).unwrap()
            );
        }
        other => panic!("expected a new session, got {other:?}"),
    }

    let history = h
        .engine
        .client_history(&doula(), &ada())
        .expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(
        history[0].session.calendar_date,
        NaiveDate::from_ymd_opt(2024, 3, 3).unwrap()
    );
}

#[test]
fn fresh_session_resumes_across_midnight() {
    let h = harness("2024-03-01T22:00:00Z");
    let first = h
        .engine
        .start_visit(&doula(), &ada())
        .expect("resolve")
        .into_session();

    h.clock.set(at("2024-03-02T08:00:00Z"));
    let again = h.engine.start_visit(&doula(), &ada()).expect("resolve");
    assert!(again.was_resumed());
    assert_eq!(again.session().id, first.id);
}

#[test]
fn compose_never_mutates_notes() {
    let h = harness("2024-03-01T10:00:00Z");
    let session = h
        .engine
        .start_visit(&doula(), &ada())
        .expect("resolve")
        .into_session();
    h.engine
        .quick_add(&doula(), &session.id, "diapers", 1)
        .expect("quick add");

    let before = h.engine.list_notes(&doula(), &session.id).unwrap();
    let first = h.engine.compose_transcript(&doula(), &session.id).unwrap();
    let second = h.engine.compose_transcript(&doula(), &session.id).unwrap();
    let after = h.engine.list_notes(&doula(), &session.id).unwrap();

    assert_eq!(first.as_bytes(), second.as_bytes());
    assert_eq!(before, after);
    assert!(h
        .engine
        .view_session(&doula(), &session.id)
        .unwrap()
        .session
        .is_open());
}

#[test]
fn sweep_closes_only_stale_sessions() {
    let h = harness("2024-03-01T10:00:00Z");
    let stale = h
        .engine
        .start_visit(&doula(), &ada())
        .expect("resolve")
        .into_session();

    h.clock.set(at("2024-03-02T09:00:00Z"));
    assert!(h.engine.sweep_stale().expect("sweep").is_empty());

    h.clock.set(at("2024-03-03T09:00:00Z"));
    let swept = h.engine.sweep_stale().expect("sweep");
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].id, stale.id);
    assert!(h.engine.active_sessions(&doula()).unwrap().is_empty());
}
