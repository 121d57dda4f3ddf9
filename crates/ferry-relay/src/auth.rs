//! Origin authorization gate.
//!
//! An origin may connect to the relay only once it is on the allow-list.
//! Adding it requires a human decision, and the relay has to restart before
//! the new list takes effect, so the triggering operation is persisted and
//! resumed on the next start.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferry_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

pub const ALLOW_LIST_FILE: &str = "origins.json";
pub const PENDING_OPERATION_FILE: &str = "pending_operation.json";

/// Operation interrupted by an approval-triggered restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub origin: String,
    pub requested_at: DateTime<Utc>,
}

impl PendingOperation {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            requested_at: Utc::now(),
        }
    }
}

/// Human-in-the-loop decision for adding an origin.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, origin: &str) -> Result<bool>;
}

/// Answers every approval request the same way.
#[derive(Debug, Clone, Copy)]
pub struct StaticApprover(pub bool);

#[async_trait]
impl Approver for StaticApprover {
    async fn approve(&self, _origin: &str) -> Result<bool> {
        Ok(self.0)
    }
}

#[async_trait]
pub trait OriginGate: Send + Sync {
    fn is_authorized(&self, origin: &str) -> bool;

    /// Ask for `origin` to be added. `Ok(true)` means it was approved and
    /// persisted; it takes effect after the relay restarts.
    async fn request_authorization(&self, origin: &str) -> Result<bool>;

    fn persist_pending_operation(&self, op: &PendingOperation) -> Result<()>;

    /// Read and remove the pending operation, if any.
    fn consume_pending_operation(&self) -> Result<Option<PendingOperation>>;

    fn clear_pending_operation(&self) -> Result<()>;
}

/// Reduce an origin or match pattern to `scheme://host[:port]`.
///
/// `https://A.test/*`, `https://a.test:443` and `https://a.test/` all
/// normalize to `https://a.test`.
pub fn normalize_origin(origin: &str) -> Result<String> {
    let url = Url::parse(origin.trim())
        .map_err(|e| Error::denied(format!("invalid origin {origin:?}: {e}")))?;
    let origin = url.origin();
    if !origin.is_tuple() {
        return Err(Error::denied(format!(
            "origin {:?} has no scheme/host",
            url.as_str()
        )));
    }
    Ok(origin.ascii_serialization())
}

pub fn origin_pattern(origin: &str) -> Result<String> {
    Ok(format!("{}/*", normalize_origin(origin)?))
}

/// Allow-list file contents. Unknown keys are kept on rewrite.
#[derive(Debug, Default, Serialize, Deserialize)]
struct AllowList {
    #[serde(default)]
    matches: Vec<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl AllowList {
    fn allows(&self, origin: &str) -> bool {
        self.matches.iter().any(|pattern| match normalize_origin(pattern) {
            Ok(allowed) => allowed == origin,
            Err(_) => {
                debug!("Skipping malformed allow-list entry {:?}", pattern);
                false
            }
        })
    }

    /// Merge or replace, keeping first-seen order without duplicates.
    fn set(&mut self, patterns: Vec<String>, replace: bool) {
        let mut merged = if replace {
            Vec::new()
        } else {
            std::mem::take(&mut self.matches)
        };
        merged.extend(patterns);

        let mut seen = std::collections::HashSet::new();
        merged.retain(|p| seen.insert(p.clone()));
        self.matches = merged;
    }
}

/// Allow-list and pending marker stored as JSON under a state directory.
pub struct FileOriginGate {
    dir: PathBuf,
    approver: Arc<dyn Approver>,
}

impl FileOriginGate {
    pub fn open(dir: impl Into<PathBuf>, approver: Arc<dyn Approver>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, approver })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn allow_list_path(&self) -> PathBuf {
        self.dir.join(ALLOW_LIST_FILE)
    }

    pub fn pending_path(&self) -> PathBuf {
        self.dir.join(PENDING_OPERATION_FILE)
    }

    /// Current allow-list patterns.
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.load()?.matches)
    }

    /// Add `origin` to the allow-list. Returns false if it was already there.
    pub fn add(&self, origin: &str) -> Result<bool> {
        let normalized = normalize_origin(origin)?;
        let mut list = self.load()?;
        if list.allows(&normalized) {
            return Ok(false);
        }
        list.set(vec![format!("{normalized}/*")], false);
        self.store(&list)?;
        info!("Added {} to allow-list", normalized);
        Ok(true)
    }

    /// Replace the whole allow-list; an empty list revokes everything.
    pub fn reset(&self, origins: &[String]) -> Result<()> {
        let patterns = origins
            .iter()
            .map(|o| origin_pattern(o))
            .collect::<Result<Vec<_>>>()?;
        let mut list = self.load()?;
        list.set(patterns, true);
        self.store(&list)?;
        info!("Allow-list reset to {} entries", list.matches.len());
        Ok(())
    }

    fn load(&self) -> Result<AllowList> {
        let path = self.allow_list_path();
        if !path.exists() {
            return Ok(AllowList::default());
        }
        let text = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn store(&self, list: &AllowList) -> Result<()> {
        write_json(&self.allow_list_path(), list)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl OriginGate for FileOriginGate {
    fn is_authorized(&self, origin: &str) -> bool {
        let Ok(normalized) = normalize_origin(origin) else {
            return false;
        };
        match self.load() {
            Ok(list) => list.allows(&normalized),
            Err(e) => {
                warn!("Failed to read allow-list {:?}: {}", self.allow_list_path(), e);
                false
            }
        }
    }

    async fn request_authorization(&self, origin: &str) -> Result<bool> {
        let normalized = normalize_origin(origin)?;
        if !self.approver.approve(&normalized).await? {
            info!("Authorization for {} declined", normalized);
            return Ok(false);
        }
        self.add(&normalized)?;
        Ok(true)
    }

    fn persist_pending_operation(&self, op: &PendingOperation) -> Result<()> {
        write_json(&self.pending_path(), op)?;
        debug!("Persisted pending operation for {}", op.origin);
        Ok(())
    }

    fn consume_pending_operation(&self) -> Result<Option<PendingOperation>> {
        let path = self.pending_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        fs::remove_file(&path)?;
        match serde_json::from_str(&text) {
            Ok(op) => Ok(Some(op)),
            Err(e) => {
                warn!("Discarding unreadable pending operation: {}", e);
                Ok(None)
            }
        }
    }

    fn clear_pending_operation(&self) -> Result<()> {
        match fs::remove_file(self.pending_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
