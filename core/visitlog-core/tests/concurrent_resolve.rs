use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use visitlog_core::{
    CategoryCatalog, Client, ClientId, InMemoryActiveIndex, OutboxChannel, PractitionerId,
    SessionStore, SqliteStore, StaticIdentity, SystemClock, VisitEngine,
};

const CALLERS: usize = 8;

fn owner() -> PractitionerId {
    PractitionerId::new("doula-1")
}

fn client() -> ClientId {
    ClientId::new("client-ada")
}

fn engine_for(db: &Path, outbox: &Path) -> VisitEngine {
    let store = Arc::new(SqliteStore::new(db.to_path_buf()).expect("open store"));
    VisitEngine::new(
        store.clone(),
        store,
        Arc::new(InMemoryActiveIndex::new()),
        Arc::new(OutboxChannel::new(outbox.to_path_buf())),
        Arc::new(SystemClock),
        CategoryCatalog::default(),
    )
}

fn seed(db: &Path) {
    SqliteStore::new(db.to_path_buf())
        .expect("open store")
        .upsert_client(&Client {
            id: client(),
            owner: owner(),
            name: "Ada".to_string(),
            phone: Some("555-0100".to_string()),
        })
        .expect("seed client");
}

fn assert_single_session(db: &Path, ids: Vec<String>) {
    let distinct: HashSet<_> = ids.iter().collect();
    assert_eq!(distinct.len(), 1, "callers saw different sessions: {ids:?}");

    let store = SqliteStore::new(db.to_path_buf()).expect("open store");
    let history = store.list_sessions(&owner(), &client()).expect("history");
    assert_eq!(history.len(), 1);
    assert!(history[0].session.is_open());
}

#[test]
fn concurrent_resolves_on_shared_engine_create_one_session() {
    let dir = tempfile::tempdir().expect("temp dir");
    let db = dir.path().join("visitlog.db");
    seed(&db);
    let engine = Arc::new(engine_for(&db, &dir.path().join("outbox.jsonl")));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine
                    .start_visit(&StaticIdentity(owner()), &client())
                    .expect("resolve")
                    .into_session()
                    .id
                    .to_string()
            })
        })
        .collect();

    let ids = handles
        .into_iter()
        .map(|handle| handle.join().expect("caller thread"))
        .collect();
    assert_single_session(&db, ids);
}

#[test]
fn concurrent_resolves_across_independent_engines_create_one_session() {
    let dir = tempfile::tempdir().expect("temp dir");
    let db = dir.path().join("visitlog.db");
    seed(&db);
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let engine = engine_for(&db, &dir.path().join("outbox.jsonl"));
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine
                    .start_visit(&StaticIdentity(owner()), &client())
                    .expect("resolve")
                    .into_session()
                    .id
                    .to_string()
            })
        })
        .collect();

    let ids = handles
        .into_iter()
        .map(|handle| handle.join().expect("caller thread"))
        .collect();
    assert_single_session(&db, ids);
}
