//! Durable deployment state.
//!
//! Layout under the state directory:
//!
//! - `records.jsonl`: append-only log, one [`DeploymentRecord`] per line.
//! - `active`: id of the active record, replaced by atomic rename.
//! - `journal.json`: in-flight intent of the attempt switching traffic.
//!
//! Only the reconciler writes. Readers go through the in-memory index and
//! never observe a half-written pointer.

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use thiserror::Error;
use uuid::Uuid;

use crate::model::{DeploymentRecord, Journal};

const RECORDS_FILE: &str = "records.jsonl";
const ACTIVE_FILE: &str = "active";
const JOURNAL_FILE: &str = "journal.json";

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error on {0:?}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("Corrupt state in {0:?} at line {1}: {2}")]
    Corrupt(PathBuf, usize, serde_json::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Active record changed concurrently (expected {expected:?}, found {found:?})")]
    ActiveChanged {
        expected: Option<Uuid>,
        found: Option<Uuid>,
    },
    #[error("Record {0} is not in the log")]
    UnknownRecord(Uuid),
    #[error("Active pointer names unknown record {0}")]
    DanglingActive(Uuid),
}

/// Write `bytes` to `path` so that readers see either the old or the new
/// content, never a mix.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    let tmp = path.with_file_name(format!(".{file_name}.steward-tmp"));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    sync_parent(path)
}

fn sync_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

struct StoreInner {
    records: Vec<DeploymentRecord>,
    active: Option<Uuid>,
}

pub struct StateStore {
    dir: PathBuf,
    inner: RwLock<StoreInner>,
}

impl StateStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io(dir.clone(), e))?;

        let records_path = dir.join(RECORDS_FILE);
        let (records, torn) = load_records(&records_path)?;
        if torn {
            // Drop the torn tail so the next append starts on a fresh line
            let mut content = Vec::new();
            for record in &records {
                content.extend(serde_json::to_vec(record)?);
                content.push(b'\n');
            }
            write_atomic(&records_path, &content).map_err(|e| StoreError::Io(records_path, e))?;
        }

        let active_path = dir.join(ACTIVE_FILE);
        let active = match std::fs::read_to_string(&active_path) {
            Ok(raw) => {
                let id = Uuid::parse_str(raw.trim())
                    .map_err(|e| StoreError::Io(active_path.clone(), std::io::Error::other(e)))?;
                if !records.iter().any(|r| r.id == id) {
                    return Err(StoreError::DanglingActive(id));
                }
                Some(id)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::Io(active_path, e)),
        };

        log::info!(
            "Opened state store at {dir:?}: {} records, active {:?}",
            records.len(),
            active
        );

        Ok(Self {
            dir,
            inner: RwLock::new(StoreInner { records, active }),
        })
    }

    /// Append a record to the log. The record does not become active.
    pub fn append(&self, record: &DeploymentRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let path = self.dir.join(RECORDS_FILE);

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let io = |e| StoreError::Io(path.clone(), e);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io)?;
        file.write_all(&line).map_err(io)?;
        file.sync_data().map_err(io)?;

        inner.records.push(record.clone());
        log::debug!("Appended record {} ({})", record.id, record.result.as_ref());
        Ok(())
    }

    /// Move the active pointer from `expected` to `id`.
    pub fn activate(&self, expected: Option<Uuid>, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.active != expected {
            return Err(StoreError::ActiveChanged {
                expected,
                found: inner.active,
            });
        }
        if !inner.records.iter().any(|r| r.id == id) {
            return Err(StoreError::UnknownRecord(id));
        }

        let path = self.dir.join(ACTIVE_FILE);
        write_atomic(&path, id.to_string().as_bytes()).map_err(|e| StoreError::Io(path, e))?;
        inner.active = Some(id);
        log::info!("Record {id} is now active");
        Ok(())
    }

    pub fn active_id(&self) -> Option<Uuid> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
    }

    pub fn active(&self) -> Option<DeploymentRecord> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let id = inner.active?;
        inner.records.iter().rev().find(|r| r.id == id).cloned()
    }

    pub fn get(&self, id: Uuid) -> Option<DeploymentRecord> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.records.iter().rev().find(|r| r.id == id).cloned()
    }

    /// The record that concluded the given spec, if any.
    pub fn find_by_spec(&self, spec_id: Uuid) -> Option<DeploymentRecord> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .records
            .iter()
            .rev()
            .find(|r| r.spec_id == spec_id)
            .cloned()
    }

    /// Most recent records first.
    pub fn history(&self, limit: usize) -> Vec<DeploymentRecord> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.records.iter().rev().take(limit).cloned().collect()
    }

    pub fn write_journal(&self, journal: &Journal) -> Result<()> {
        let path = self.dir.join(JOURNAL_FILE);
        let bytes = serde_json::to_vec_pretty(journal)?;
        write_atomic(&path, &bytes).map_err(|e| StoreError::Io(path, e))
    }

    pub fn read_journal(&self) -> Result<Option<Journal>> {
        let path = self.dir.join(JOURNAL_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(path, e)),
        }
    }

    pub fn clear_journal(&self) -> Result<()> {
        let path = self.dir.join(JOURNAL_FILE);
        match std::fs::remove_file(&path) {
            Ok(()) => sync_parent(&path).map_err(|e| StoreError::Io(path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(path, e)),
        }
    }
}

fn load_records(path: &Path) -> Result<(Vec<DeploymentRecord>, bool)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
        Err(e) => return Err(StoreError::Io(path.to_path_buf(), e)),
    };

    let lines = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| StoreError::Io(path.to_path_buf(), e))?;

    let mut records = Vec::with_capacity(lines.len());
    let mut torn = false;
    let last = lines.len().saturating_sub(1);
    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            // A crash in the middle of an append leaves a torn last line.
            // That record was never activated, so it is safe to drop.
            Err(e) if index == last => {
                log::warn!("Ignoring torn last line {} of {path:?}: {e}", index + 1);
                torn = true;
            }
            Err(e) => return Err(StoreError::Corrupt(path.to_path_buf(), index + 1, e)),
        }
    }
    Ok((records, torn))
}
