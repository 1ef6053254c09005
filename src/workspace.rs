//! The `.resv/` state directory shared by every `resv` process.
//!
//! A command opens the workspace, which takes the process lock, loads the
//! persisted reservations into a fresh [`ReservationStore`] and sweeps lapsed
//! leases. It then operates through the usual services and calls
//! [`Workspace::commit`] to write the table and the new audit events back.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::api::{ReservationClient, TtlLimits};
use crate::audit::AuditService;
use crate::clock::SystemClock;
use crate::config::{CONFIG_FILE, Config};
use crate::error::{Result, ResvError};
use crate::events::MemoryFeed;
use crate::model::ReservationRecord;
use crate::resolver::ConflictResolver;
use crate::store::db::ReservationDb;
use crate::store::lock::{DEFAULT_LOCK_WAIT, acquire_lock, release_lock};
use crate::store::reservations::ReservationStore;
use crate::store::sweeper::LeaseSweeper;

pub const STATE_DIR: &str = ".resv";
const DB_FILE: &str = "reservations.db";
const LOCK_FILE: &str = "store.lock";

/// `RESV_DIR` if set, otherwise the nearest `.resv/` at or above the
/// current directory.
pub fn find_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env_state_dir() {
        return if dir.is_dir() {
            Ok(dir)
        } else {
            Err(ResvError::NotInitialized)
        };
    }
    let mut dir = std::env::current_dir()?;
    loop {
        let candidate = dir.join(STATE_DIR);
        if candidate.is_dir() {
            return Ok(candidate);
        }
        if !dir.pop() {
            return Err(ResvError::NotInitialized);
        }
    }
}

fn env_state_dir() -> Option<PathBuf> {
    std::env::var_os("RESV_DIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Where `resv init` creates state: `RESV_DIR`, else `<cwd>/.resv`.
pub fn default_state_dir(cwd: &Path) -> PathBuf {
    env_state_dir().unwrap_or_else(|| cwd.join(STATE_DIR))
}

/// Create the state directory (default config plus empty database). Safe to
/// run on an existing directory; nothing is overwritten.
pub fn init(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let config_path = dir.join(CONFIG_FILE);
    if !config_path.exists() {
        fs::write(&config_path, Config::default().to_yaml()?)?;
    }
    ReservationDb::open(&dir.join(DB_FILE))?;
    Ok(())
}

pub struct Workspace {
    config: Config,
    db: ReservationDb,
    feed: Arc<MemoryFeed>,
    store: Arc<ReservationStore>,
    swept: Vec<ReservationRecord>,
    lock: File,
}

impl Workspace {
    /// Lock, load and sweep the workspace at `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let lock = acquire_lock(&dir.join(LOCK_FILE), DEFAULT_LOCK_WAIT)?;
        let config = Config::load(dir)?;
        let db = ReservationDb::open(&dir.join(DB_FILE))?;

        let feed = Arc::new(MemoryFeed::new());
        let store = Arc::new(ReservationStore::new(Arc::new(SystemClock), feed.clone()));
        let records = db.load_records()?;
        debug!(records = records.len(), dir = %dir.display(), "workspace loaded");
        store.restore(records)?;

        let mut workspace = Self {
            config,
            db,
            feed,
            store,
            swept: Vec::new(),
            lock,
        };
        workspace.swept = workspace.sweeper().sweep_once()?;
        Ok(workspace)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<ReservationStore> {
        &self.store
    }

    /// Leases that lapsed while nobody had the workspace open.
    pub fn swept(&self) -> &[ReservationRecord] {
        &self.swept
    }

    pub fn db(&self) -> &ReservationDb {
        &self.db
    }

    pub fn client(&self) -> ReservationClient {
        ReservationClient::new(
            Arc::clone(&self.store),
            TtlLimits {
                default_secs: self.config.default_ttl_secs,
                max_secs: self.config.max_ttl_secs,
            },
        )
    }

    pub fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(Arc::clone(&self.store), self.config.coordinator_token.clone())
    }

    pub fn audit(&self) -> AuditService {
        AuditService::new(
            Arc::clone(&self.store),
            self.config.stale_after(),
            self.config.expiring_soon(),
        )
    }

    pub fn sweeper(&self) -> LeaseSweeper {
        LeaseSweeper::new(Arc::clone(&self.store), self.config.history_retention())
    }

    /// Persist every change made since `open` and append the events they
    /// produced, then give up the process lock.
    pub fn commit(self) -> Result<()> {
        self.persist()?;
        release_lock(self.lock)
    }

    /// Persist without giving up the lock.
    pub fn persist(&self) -> Result<()> {
        self.store.verify_invariants()?;
        self.db.save_records(&self.store.snapshot()?)?;
        let events = self.feed.drain();
        self.db.append_events(&events)?;
        let cutoff = self
            .store
            .now()
            .checked_sub_signed(self.config.history_retention())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.db.prune_events(cutoff)?;
        debug!(events = events.len(), "workspace persisted");
        Ok(())
    }
}
