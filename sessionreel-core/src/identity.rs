//! Session identity: generation, persistence and idle rotation
//!
//! A session id is reused across reloads for as long as the persisted record
//! has been seen within the idle timeout. After that the record is ignored
//! and overwritten with a fresh id.
//!
//! Without a store the identity runs in degraded mode: every call produces a
//! fresh id and nothing is persisted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::PersistedSessionRecord;

/// Fixed key the session record is stored under
pub const SESSION_STORAGE_KEY: &str = "sessionreel_session";

/// Length of the random base-36 suffix of a session id
const SESSION_SUFFIX_LEN: usize = 9;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Durable storage for the session record
pub trait SessionStore: Send + Sync + fmt::Debug {
    /// Read the stored record, if any
    fn load(&self) -> Result<Option<PersistedSessionRecord>>;

    /// Overwrite the stored record
    fn save(&self, record: &PersistedSessionRecord) -> Result<()>;
}

/// In-process store, mainly for tests and hosts without durable storage
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    record: Mutex<Option<PersistedSessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<PersistedSessionRecord>> {
        let record = self
            .record
            .lock()
            .map_err(|_| Error::Storage("session record lock poisoned".to_string()))?;
        Ok(record.clone())
    }

    fn save(&self, record: &PersistedSessionRecord) -> Result<()> {
        let mut slot = self
            .record
            .lock()
            .map_err(|_| Error::Storage("session record lock poisoned".to_string()))?;
        *slot = Some(record.clone());
        Ok(())
    }
}

/// JSON file store
///
/// Writes go through a temporary sibling file and a rename so a crash never
/// leaves a half-written record behind.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `$XDG_STATE_HOME/sessionreel/sessionreel_session.json`
    pub fn default_location() -> Self {
        Self::new(Config::session_record_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<PersistedSessionRecord>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // A corrupt record is as good as no record; it will be overwritten.
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring unreadable session record");
                Ok(None)
            }
        }
    }

    fn save(&self, record: &PersistedSessionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(record)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Owns the session id and decides between reuse and rotation
#[derive(Debug)]
pub struct SessionIdentity {
    store: Option<Arc<dyn SessionStore>>,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    current: Mutex<Option<String>>,
}

impl SessionIdentity {
    pub fn new(
        store: Option<Arc<dyn SessionStore>>,
        clock: Arc<dyn Clock>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            idle_timeout,
            current: Mutex::new(None),
        }
    }

    /// Whether ids are persisted (false means degraded mode)
    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    /// The id most recently handed out by this identity
    pub fn current(&self) -> Option<String> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    /// Return the persisted id if it is still fresh, otherwise rotate.
    pub fn get_or_create_session_id(&self) -> String {
        let Some(store) = &self.store else {
            let id = generate_session_id(self.clock.as_ref());
            self.remember(&id);
            return id;
        };

        let now_ms = self.clock.now_ms();
        let existing = store.load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read session record, starting a new session");
            None
        });

        if let Some(record) = existing {
            let idle_ms = now_ms.saturating_sub(record.last_seen_at);
            // A record stamped ahead of our clock (skew, another tab) counts as fresh
            let fresh = u128::try_from(idle_ms)
                .map_or(true, |idle| idle < self.idle_timeout.as_millis());
            if fresh {
                tracing::debug!(session_id = %record.session_id, idle_ms, "Reusing session");
                self.remember(&record.session_id);
                return record.session_id;
            }
            tracing::debug!(session_id = %record.session_id, idle_ms, "Session idle, rotating");
        }

        self.rotate()
    }

    /// Generate and persist a new id regardless of the stored record
    pub fn rotate(&self) -> String {
        let id = generate_session_id(self.clock.as_ref());
        self.persist(&id);
        self.remember(&id);
        tracing::info!(session_id = %id, "Started new session id");
        id
    }

    /// Mark the current session as seen now
    pub fn touch(&self) {
        if let Some(id) = self.current() {
            self.persist(&id);
        }
    }

    fn persist(&self, id: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let record = PersistedSessionRecord {
            session_id: id.to_string(),
            last_seen_at: self.clock.now_ms(),
        };
        if let Err(e) = store.save(&record) {
            tracing::warn!(session_id = %id, error = %e, "Failed to persist session record");
        }
    }

    fn remember(&self, id: &str) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(id.to_string());
        }
    }
}

/// Generate `session_<epoch-ms>_<random-base36>` from local entropy
pub fn generate_session_id(clock: &dyn Clock) -> String {
    let mut entropy = uuid::Uuid::new_v4().as_u128();
    let mut suffix = String::with_capacity(SESSION_SUFFIX_LEN);
    for _ in 0..SESSION_SUFFIX_LEN {
        suffix.push(BASE36[(entropy % 36) as usize] as char);
        entropy /= 36;
    }
    format!("session_{}_{}", clock.now_ms(), suffix)
}
