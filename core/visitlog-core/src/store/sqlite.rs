//! SQLite store adapter.
//!
//! One connection per call, WAL journal, and a busy timeout that bounds how
//! long any call may wait on another writer. The one-open-session-per-client
//! rule is enforced twice: a check inside an IMMEDIATE transaction and a
//! partial unique index, so a racing insert surfaces as `Conflict`.

use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{ClientDirectory, CloseOutcome, SessionStore};
use crate::error::{Result, VisitError};
use crate::types::{
    Client, ClientId, NoteId, PractitionerId, Session, SessionId, SessionNote, SessionSummary,
};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);
const SESSION_COLUMNS: &str = "session_id, owner_id, client_id, session_date, closed_at";
const NOTE_COLUMNS: &str = "note_id, session_id, content, created_at, seq";
const TIMESTAMP_DIGITS: u16 = 6;

pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        Self::with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Opens the store; every later call gives up after `busy_timeout` of lock contention.
    pub fn with_busy_timeout(path: PathBuf, busy_timeout: Duration) -> Result<Self> {
        let store = Self { path, busy_timeout };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seeds or refreshes a client profile row. Profile editing lives elsewhere;
    /// this only keeps the fields the engine reads.
    pub fn upsert_client(&self, client: &Client) -> Result<()> {
        let now = format_timestamp(Utc::now());
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO clients (owner_id, client_id, name, phone, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(owner_id, client_id) DO UPDATE SET \
                    name = excluded.name, \
                    phone = excluded.phone, \
                    updated_at = excluded.updated_at",
                params![
                    client.owner.as_str(),
                    client.id.as_str(),
                    client.name,
                    client.phone,
                    now
                ],
            )
            .map_err(sql_err("Failed to upsert client"))?;
            Ok(())
        })
    }

    fn load_session(
        conn: &Connection,
        owner: &PractitionerId,
        id: &SessionId,
    ) -> Result<Option<Session>> {
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1 AND owner_id = ?2"),
            params![id.as_str(), owner.as_str()],
            session_from_row,
        )
        .optional()
        .map_err(sql_err("Failed to query session"))
    }

    /// Looks up a note together with the open/closed state of its session.
    fn load_note_scope(
        conn: &Connection,
        owner: &PractitionerId,
        id: &NoteId,
    ) -> Result<Option<(SessionId, bool)>> {
        conn.query_row(
            "SELECT n.session_id, s.closed_at IS NULL \
             FROM session_notes n JOIN sessions s ON s.session_id = n.session_id \
             WHERE n.note_id = ?1 AND s.owner_id = ?2",
            params![id.as_str(), owner.as_str()],
            |row| Ok((SessionId::new(row.get::<_, String>(0)?), row.get::<_, bool>(1)?)),
        )
        .optional()
        .map_err(sql_err("Failed to query note"))
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS clients (
                    owner_id TEXT NOT NULL,
                    client_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    phone TEXT,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (owner_id, client_id)
                 );
                 CREATE TABLE IF NOT EXISTS sessions (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL UNIQUE,
                    owner_id TEXT NOT NULL,
                    client_id TEXT NOT NULL,
                    session_date TEXT NOT NULL,
                    closed_at TEXT
                 );
                 CREATE UNIQUE INDEX IF NOT EXISTS sessions_one_open_per_client
                    ON sessions (owner_id, client_id) WHERE closed_at IS NULL;
                 CREATE INDEX IF NOT EXISTS sessions_by_client
                    ON sessions (owner_id, client_id, session_date);
                 CREATE TABLE IF NOT EXISTS session_notes (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    note_id TEXT NOT NULL UNIQUE,
                    session_id TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS session_notes_order
                    ON session_notes (session_id, created_at, seq);
                 COMMIT;",
            )
            .map_err(sql_err("Failed to initialize schema"))
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|err| VisitError::Io {
                context: "Failed to create store data dir".to_string(),
                source: err,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(sql_err("Failed to open sqlite db"))?;

        conn.pragma_update(None, "busy_timeout", self.busy_timeout.as_millis() as i64)
            .map_err(sql_err("Failed to set busy_timeout"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sql_err("Failed to enable WAL"))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(sql_err("Failed to set synchronous"))?;

        Ok(conn)
    }
}

impl SessionStore for SqliteStore {
    fn find_open_session(
        &self,
        owner: &PractitionerId,
        client: &ClientId,
    ) -> Result<Option<Session>> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     WHERE owner_id = ?1 AND client_id = ?2 AND closed_at IS NULL \
                     ORDER BY seq DESC LIMIT 1"
                ),
                params![owner.as_str(), client.as_str()],
                session_from_row,
            )
            .optional()
            .map_err(sql_err("Failed to query open session"))
        })
    }

    fn get_session(&self, owner: &PractitionerId, id: &SessionId) -> Result<Option<Session>> {
        self.with_connection(|conn| Self::load_session(conn, owner, id))
    }

    fn insert_session(
        &self,
        owner: &PractitionerId,
        client: &ClientId,
        calendar_date: NaiveDate,
    ) -> Result<Session> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err("Failed to begin session insert"))?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT session_id FROM sessions \
                     WHERE owner_id = ?1 AND client_id = ?2 AND closed_at IS NULL LIMIT 1",
                    params![owner.as_str(), client.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err("Failed to check for open session"))?;
            if existing.is_some() {
                return Err(VisitError::Conflict {
                    client: client.to_string(),
                });
            }

            let session = Session {
                id: SessionId::generate(),
                owner: owner.clone(),
                client: client.clone(),
                calendar_date,
                closed_at: None,
            };
            tx.execute(
                "INSERT INTO sessions (session_id, owner_id, client_id, session_date) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    session.id.as_str(),
                    owner.as_str(),
                    client.as_str(),
                    format_date(calendar_date)
                ],
            )
            .map_err(|err| {
                if is_constraint_violation(&err) {
                    VisitError::Conflict {
                        client: client.to_string(),
                    }
                } else {
                    sql_err("Failed to insert session")(err)
                }
            })?;
            tx.commit().map_err(sql_err("Failed to commit session insert"))?;

            Ok(session)
        })
    }

    fn close_session(
        &self,
        owner: &PractitionerId,
        id: &SessionId,
        closed_at: DateTime<Utc>,
    ) -> Result<CloseOutcome> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err("Failed to begin session close"))?;

            let updated = tx
                .execute(
                    "UPDATE sessions SET closed_at = ?1 \
                     WHERE session_id = ?2 AND owner_id = ?3 AND closed_at IS NULL",
                    params![format_timestamp(closed_at), id.as_str(), owner.as_str()],
                )
                .map_err(sql_err("Failed to close session"))?;
            let current = Self::load_session(&tx, owner, id)?;
            tx.commit().map_err(sql_err("Failed to commit session close"))?;

            Ok(match current {
                None => CloseOutcome::Missing,
                Some(session) if updated == 1 => CloseOutcome::Closed(session),
                Some(session) => CloseOutcome::AlreadyClosed(session),
            })
        })
    }

    fn list_sessions(
        &self,
        owner: &PractitionerId,
        client: &ClientId,
    ) -> Result<Vec<SessionSummary>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT s.session_id, s.owner_id, s.client_id, s.session_date, s.closed_at, \
                            (SELECT COUNT(*) FROM session_notes n WHERE n.session_id = s.session_id) \
                     FROM sessions s \
                     WHERE s.owner_id = ?1 AND s.client_id = ?2 \
                     ORDER BY s.session_date DESC, s.seq DESC",
                )
                .map_err(sql_err("Failed to prepare session history query"))?;

            let rows = stmt
                .query_map(params![owner.as_str(), client.as_str()], |row| {
                    Ok(SessionSummary {
                        session: session_from_row(row)?,
                        note_count: row.get::<_, i64>(5)? as u32,
                    })
                })
                .map_err(sql_err("Failed to query session history"))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row.map_err(sql_err("Failed to decode session row"))?);
            }
            Ok(sessions)
        })
    }

    fn list_open_sessions(&self, owner: &PractitionerId) -> Result<Vec<Session>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     WHERE owner_id = ?1 AND closed_at IS NULL ORDER BY seq ASC"
                ))
                .map_err(sql_err("Failed to prepare open sessions query"))?;
            let rows = stmt
                .query_map(params![owner.as_str()], session_from_row)
                .map_err(sql_err("Failed to query open sessions"))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row.map_err(sql_err("Failed to decode session row"))?);
            }
            Ok(sessions)
        })
    }

    fn list_all_open_sessions(&self) -> Result<Vec<Session>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE closed_at IS NULL ORDER BY seq ASC"
                ))
                .map_err(sql_err("Failed to prepare open sessions query"))?;
            let rows = stmt
                .query_map([], session_from_row)
                .map_err(sql_err("Failed to query open sessions"))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row.map_err(sql_err("Failed to decode session row"))?);
            }
            Ok(sessions)
        })
    }

    fn insert_note(
        &self,
        owner: &PractitionerId,
        session: &SessionId,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<SessionNote> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err("Failed to begin note insert"))?;

            let parent = Self::load_session(&tx, owner, session)?
                .ok_or_else(|| VisitError::not_found("session", session.as_str()))?;
            if !parent.is_open() {
                return Err(VisitError::SessionClosed(session.to_string()));
            }

            let latest: Option<String> = tx
                .query_row(
                    "SELECT MAX(created_at) FROM session_notes WHERE session_id = ?1",
                    params![session.as_str()],
                    |row| row.get(0),
                )
                .map_err(sql_err("Failed to query latest note time"))?;
            // Match stored precision so the returned note equals what `list_notes` reads.
            let created_at = created_at.trunc_subsecs(TIMESTAMP_DIGITS);
            let created_at = match latest.as_deref().and_then(parse_timestamp) {
                Some(latest) if latest > created_at => latest,
                _ => created_at,
            };

            let id = NoteId::generate();
            tx.execute(
                "INSERT INTO session_notes (note_id, session_id, content, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.as_str(),
                    session.as_str(),
                    content,
                    format_timestamp(created_at)
                ],
            )
            .map_err(sql_err("Failed to insert note"))?;
            let sequence = tx.last_insert_rowid();
            tx.commit().map_err(sql_err("Failed to commit note insert"))?;

            Ok(SessionNote {
                id,
                session: session.clone(),
                content: content.to_string(),
                created_at,
                sequence,
            })
        })
    }

    fn update_note(
        &self,
        owner: &PractitionerId,
        id: &NoteId,
        content: &str,
    ) -> Result<SessionNote> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err("Failed to begin note update"))?;

            let (session, open) = Self::load_note_scope(&tx, owner, id)?
                .ok_or_else(|| VisitError::not_found("note", id.as_str()))?;
            if !open {
                return Err(VisitError::SessionClosed(session.to_string()));
            }

            tx.execute(
                "UPDATE session_notes SET content = ?1 WHERE note_id = ?2",
                params![content, id.as_str()],
            )
            .map_err(sql_err("Failed to update note"))?;
            let note = tx
                .query_row(
                    &format!("SELECT {NOTE_COLUMNS} FROM session_notes WHERE note_id = ?1"),
                    params![id.as_str()],
                    note_from_row,
                )
                .map_err(sql_err("Failed to reload note"))?;
            tx.commit().map_err(sql_err("Failed to commit note update"))?;

            Ok(note)
        })
    }

    fn delete_note(&self, owner: &PractitionerId, id: &NoteId) -> Result<bool> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err("Failed to begin note delete"))?;

            let (session, open) = match Self::load_note_scope(&tx, owner, id)? {
                Some(scope) => scope,
                None => return Ok(false),
            };
            if !open {
                return Err(VisitError::SessionClosed(session.to_string()));
            }

            let removed = tx
                .execute(
                    "DELETE FROM session_notes WHERE note_id = ?1",
                    params![id.as_str()],
                )
                .map_err(sql_err("Failed to delete note"))?;
            tx.commit().map_err(sql_err("Failed to commit note delete"))?;

            Ok(removed > 0)
        })
    }

    fn list_notes(
        &self,
        owner: &PractitionerId,
        session: &SessionId,
    ) -> Result<Vec<SessionNote>> {
        self.with_connection(|conn| {
            if Self::load_session(conn, owner, session)?.is_none() {
                return Err(VisitError::not_found("session", session.as_str()));
            }

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {NOTE_COLUMNS} FROM session_notes \
                     WHERE session_id = ?1 ORDER BY created_at ASC, seq ASC"
                ))
                .map_err(sql_err("Failed to prepare notes query"))?;
            let rows = stmt
                .query_map(params![session.as_str()], note_from_row)
                .map_err(sql_err("Failed to query notes"))?;

            let mut notes = Vec::new();
            for row in rows {
                notes.push(row.map_err(sql_err("Failed to decode note row"))?);
            }
            Ok(notes)
        })
    }
}

impl ClientDirectory for SqliteStore {
    fn get_client(&self, owner: &PractitionerId, id: &ClientId) -> Result<Option<Client>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT client_id, owner_id, name, phone FROM clients \
                 WHERE owner_id = ?1 AND client_id = ?2",
                params![owner.as_str(), id.as_str()],
                |row| {
                    Ok(Client {
                        id: ClientId::new(row.get::<_, String>(0)?),
                        owner: PractitionerId::new(row.get::<_, String>(1)?),
                        name: row.get(2)?,
                        phone: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(sql_err("Failed to query client"))
        })
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let date_raw: String = row.get(3)?;
    let calendar_date = parse_date(&date_raw)
        .ok_or_else(|| conversion_error(3, format!("Invalid session date: {}", date_raw)))?;
    let closed_at = match row.get::<_, Option<String>>(4)? {
        Some(raw) => Some(
            parse_timestamp(&raw)
                .ok_or_else(|| conversion_error(4, format!("Invalid closed_at: {}", raw)))?,
        ),
        None => None,
    };

    Ok(Session {
        id: SessionId::new(row.get::<_, String>(0)?),
        owner: PractitionerId::new(row.get::<_, String>(1)?),
        client: ClientId::new(row.get::<_, String>(2)?),
        calendar_date,
        closed_at,
    })
}

fn note_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionNote> {
    let created_raw: String = row.get(3)?;
    let created_at = parse_timestamp(&created_raw)
        .ok_or_else(|| conversion_error(3, format!("Invalid created_at: {}", created_raw)))?;

    Ok(SessionNote {
        id: NoteId::new(row.get::<_, String>(0)?),
        session: SessionId::new(row.get::<_, String>(1)?),
        content: row.get(2)?,
        created_at,
        sequence: row.get(4)?,
    })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn sql_err(context: &'static str) -> impl Fn(rusqlite::Error) -> VisitError {
    move |err| VisitError::StoreUnavailable(format!("{}: {}", context, err))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// Fixed-width UTC form so text comparison in SQL matches time order.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn format_date(value: NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}
