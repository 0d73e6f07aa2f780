//! # visitlog-core
//!
//! Visit-session lifecycle and note log for home-visit practitioners.
//!
//! A practitioner starts (or resumes) one open session per client per visit
//! day, appends timestamped notes, and either finishes with a transcript
//! handed to a send channel or ends without one. Sessions left open past the
//! freshness window are closed on next contact.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use visitlog_core::*;
//!
//! let store = Arc::new(SqliteStore::new(path)?);
//! let engine = VisitEngine::new(
//!     store.clone(),
//!     store,
//!     Arc::new(InMemoryActiveIndex::new()),
//!     Arc::new(OutboxChannel::new(outbox_path)),
//!     Arc::new(SystemClock),
//!     CategoryCatalog::default(),
//! );
//! let session = engine.start_visit(&identity, &client)?.into_session();
//! ```

pub mod active_index;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod finish;
pub mod identity;
pub mod notes;
pub mod resolver;
pub mod send;
pub mod staleness;
pub mod store;
pub mod suggestions;
pub mod transcript;
pub mod types;

pub use active_index::{ActiveSessionIndex, InMemoryActiveIndex};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, VisitlogConfig};
pub use engine::{SessionView, VisitEngine};
pub use error::{Result, VisitError};
pub use finish::FinishReceipt;
pub use identity::{IdentityProvider, PractitionerCredential, StaticIdentity, TokenRegistry};
pub use resolver::Resolution;
pub use send::{sms_uri, OutboxChannel, OutboxEntry, SendChannel};
pub use store::{ClientDirectory, CloseOutcome, SessionStore, SqliteStore};
pub use suggestions::CategoryCatalog;
pub use types::*;
