//! Daemon-owned state: the engine, the token table, and sweep bookkeeping.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use visitlog_core::identity::TokenIdentity;
use visitlog_core::{
    CategoryCatalog, Client, ClientId, IdentityProvider, InMemoryActiveIndex, OutboxChannel,
    Result, SqliteStore, SystemClock, TokenRegistry, VisitEngine, VisitError, VisitlogConfig,
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSnapshot {
    pub runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_closed: usize,
    pub total_closed: u64,
    pub last_error: Option<String>,
}

pub struct SharedState {
    engine: VisitEngine,
    store: Arc<SqliteStore>,
    tokens: TokenRegistry,
    sweep_interval: Option<Duration>,
    sweep: Mutex<SweepSnapshot>,
}

impl SharedState {
    pub fn from_config(config: &VisitlogConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::with_busy_timeout(
            config.store_path()?,
            config.busy_timeout(),
        )?);
        let outbox = Arc::new(OutboxChannel::new(config.outbox_path()?));
        let engine = VisitEngine::new(
            store.clone(),
            store.clone(),
            Arc::new(InMemoryActiveIndex::new()),
            outbox,
            Arc::new(SystemClock),
            CategoryCatalog::new(config.categories.clone()),
        );
        let tokens = TokenRegistry::from_credentials(&config.practitioners);
        if tokens.is_empty() {
            tracing::warn!("No practitioner tokens configured; every authenticated call will fail");
        }

        Ok(Self {
            engine,
            store,
            tokens,
            sweep_interval: config.sweep_interval(),
            sweep: Mutex::new(SweepSnapshot::default()),
        })
    }

    pub fn engine(&self) -> &VisitEngine {
        &self.engine
    }

    pub fn identify(&self, token: Option<&str>) -> TokenIdentity<'_> {
        self.tokens.identify(token)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval
    }

    /// Creates or updates a client profile owned by the caller.
    pub fn register_client(
        &self,
        identity: &dyn IdentityProvider,
        id: ClientId,
        name: &str,
        phone: Option<String>,
    ) -> Result<Client> {
        let owner = identity.current_owner()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(VisitError::validation("client name must not be empty"));
        }
        let client = Client {
            id,
            owner,
            name: name.to_string(),
            phone: phone
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        };
        self.store.upsert_client(&client)?;
        tracing::info!(client_id = %client.id, "Client registered");
        Ok(client)
    }

    pub fn run_sweep(&self, trigger: &str) -> Result<usize> {
        let result = self.engine.sweep_stale();
        let mut snapshot = match self.sweep.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        snapshot.runs += 1;
        snapshot.last_run_at = Some(Utc::now());
        match &result {
            Ok(closed) => {
                snapshot.last_closed = closed.len();
                snapshot.total_closed += closed.len() as u64;
                snapshot.last_error = None;
                if !closed.is_empty() {
                    tracing::info!(trigger, closed = closed.len(), "Stale session sweep closed sessions");
                }
            }
            Err(err) => {
                snapshot.last_error = Some(err.to_string());
            }
        }
        result.map(|closed| closed.len())
    }

    pub fn sweep_snapshot(&self) -> SweepSnapshot {
        match self.sweep.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
