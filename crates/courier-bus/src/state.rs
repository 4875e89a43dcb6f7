//! Durable, versioned persistence of bus checkpoints and publish results.
//!
//! Two JSON files per account live under the state directory:
//! - `bus-state-<account>.json` — the resumption checkpoint
//!   ([`BusState`]): last processed timestamp, gateway start time, and the
//!   bounded list of recently processed event ids used to reseed dedup.
//! - `profile-state-<account>.json` — profile publish bookkeeping
//!   ([`ProfileState`]).
//!
//! Reads fail open: a missing, corrupt, or unreadable file is treated as
//! "no prior state", never as a fatal error. Writes are atomic (temp file in
//! the same directory, then rename) and restricted to owner read/write.
//!
//! # Schema Versioning
//!
//! `BusState` is at version 2. A version-1 record, which predates
//! `recent_event_ids`, is migrated in memory to version 2 with an empty
//! list; nothing else is lost.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Current `BusState` schema version.
pub const BUS_STATE_VERSION: u32 = 2;

/// Current `ProfileState` schema version.
pub const PROFILE_STATE_VERSION: u32 = 1;

/// Persisted resumption checkpoint for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusState {
    /// Schema version.
    pub version: u32,
    /// `created_at` of the newest successfully processed event.
    #[serde(default)]
    pub last_processed_at: Option<u64>,
    /// Unix timestamp of the most recent bus startup.
    #[serde(default)]
    pub gateway_started_at: Option<u64>,
    /// Recently processed event ids (hex), newest appended last.
    #[serde(default)]
    pub recent_event_ids: Vec<String>,
}

impl Default for BusState {
    fn default() -> Self {
        Self {
            version: BUS_STATE_VERSION,
            last_processed_at: None,
            gateway_started_at: None,
            recent_event_ids: Vec::new(),
        }
    }
}

/// Outcome of one relay's profile publish attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    /// Whether the relay accepted the event.
    pub ok: bool,
    /// Failure detail when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PublishOutcome {
    /// An accepted publish.
    pub fn success() -> Self {
        Self { ok: true, error: None }
    }

    /// A rejected or skipped publish.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Persisted profile publish bookkeeping for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileState {
    /// Schema version.
    pub version: u32,
    /// Unix timestamp of the last publish attempt.
    #[serde(default)]
    pub last_published_at: Option<u64>,
    /// Id of the last published profile event (hex).
    #[serde(default)]
    pub last_published_event_id: Option<String>,
    /// Per-relay outcome of the last publish.
    #[serde(default)]
    pub last_publish_results: HashMap<String, PublishOutcome>,
}

impl Default for ProfileState {
    fn default() -> Self {
        Self {
            version: PROFILE_STATE_VERSION,
            last_published_at: None,
            last_published_event_id: None,
            last_publish_results: HashMap::new(),
        }
    }
}

/// File-backed store for [`BusState`] and [`ProfileState`] records.
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn bus_state_path(&self, account: &str) -> PathBuf {
        self.dir.join(format!("bus-state-{}.json", account))
    }

    fn profile_state_path(&self, account: &str) -> PathBuf {
        self.dir.join(format!("profile-state-{}.json", account))
    }

    /// Load the bus checkpoint for `account`.
    ///
    /// Returns `None` for a missing, corrupt, or unknown-version file.
    /// A version-1 record is migrated to version 2 with an empty id list.
    pub fn load_bus_state(&self, account: &str) -> Option<BusState> {
        let path = self.bus_state_path(account);
        let mut state: BusState = read_json(&path)?;

        match state.version {
            1 => {
                state.version = BUS_STATE_VERSION;
                state.recent_event_ids = Vec::new();
            }
            BUS_STATE_VERSION => {}
            other => {
                tracing::warn!(
                    "Unknown bus state version {} in {}, treating as absent",
                    other,
                    path.display()
                );
                return None;
            }
        }
        Some(state)
    }

    /// Atomically write the bus checkpoint for `account`.
    pub fn save_bus_state(&self, account: &str, state: &BusState) -> Result<()> {
        write_json_atomic(&self.bus_state_path(account), state)
    }

    /// Load the profile publish state for `account`.
    ///
    /// Returns `None` for a missing, corrupt, or unknown-version file.
    pub fn load_profile_state(&self, account: &str) -> Option<ProfileState> {
        let path = self.profile_state_path(account);
        let state: ProfileState = read_json(&path)?;
        if state.version != PROFILE_STATE_VERSION {
            tracing::warn!(
                "Unknown profile state version {} in {}, treating as absent",
                state.version,
                path.display()
            );
            return None;
        }
        Some(state)
    }

    /// Atomically write the profile publish state for `account`.
    pub fn save_profile_state(&self, account: &str, state: &ProfileState) -> Result<()> {
        write_json_atomic(&self.profile_state_path(account), state)
    }
}

/// Parse a JSON file, failing open to `None` on any read or parse error.
fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!("Failed to read {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(
                "Corrupt state file {}, treating as absent: {}",
                path.display(),
                e
            );
            None
        }
    }
}

/// Write JSON via a temp file in the same directory, then rename.
///
/// A crash mid-write leaves the previous file intact. Permissions are
/// restricted to owner read/write before the rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::State(format!("invalid state path {}", path.display())))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

    fs::write(&tmp_path, &json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}
