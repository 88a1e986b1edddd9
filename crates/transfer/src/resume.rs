use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::TransferError;

/// Schema version of the resume persistence file.
pub const RESUME_FORMAT_VERSION: u32 = 1;

/// Durable continuation state for one transfer.
///
/// A record is only valid for resumption while `total_size` still matches
/// the live source file; the executor restarts from zero otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRecord {
    pub transfer_id: String,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub total_size: u64,
    pub transferred: u64,
    pub last_modified: DateTime<Utc>,
    /// Optional per-chunk offsets for multi-file transfers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_offsets: Option<HashMap<String, u64>>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeFile {
    version: u32,
    records: Vec<ResumeRecord>,
}

/// Durable store of in-flight transfer progress, keyed by transfer id.
///
/// The whole record set is rewritten on every mutation via a temp file and
/// atomic rename. Save failures degrade resumability but never abort a
/// transfer: they are logged and swallowed.
pub struct ResumeStore {
    path: PathBuf,
    records: Mutex<HashMap<String, ResumeRecord>>,
}

impl ResumeStore {
    /// Loads the store from `path`. A missing file is an empty set, not an
    /// error; an unreadable or unknown-version file starts empty with a
    /// warning.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let path = path.into();
        let records = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<ResumeFile>(&bytes) {
                Ok(file) if file.version == RESUME_FORMAT_VERSION => {
                    debug!(records = file.records.len(), path = %path.display(), "loaded resume state");
                    file.records
                        .into_iter()
                        .map(|r| (r.transfer_id.clone(), r))
                        .collect()
                }
                Ok(file) => {
                    warn!(
                        version = file.version,
                        expected = RESUME_FORMAT_VERSION,
                        "unknown resume file version, starting empty"
                    );
                    HashMap::new()
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "corrupt resume file, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(TransferError::Io(e)),
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Returns the record for `transfer_id`, if any.
    pub fn get(&self, transfer_id: &str) -> Option<ResumeRecord> {
        self.records.lock().unwrap().get(transfer_id).cloned()
    }

    /// Inserts or replaces a record and persists the store.
    pub fn set(&self, record: ResumeRecord) {
        {
            let mut records = self.records.lock().unwrap();
            records.insert(record.transfer_id.clone(), record);
        }
        self.save();
    }

    /// Removes the record for `transfer_id` (if present) and persists.
    pub fn delete(&self, transfer_id: &str) {
        let removed = self.records.lock().unwrap().remove(transfer_id).is_some();
        if removed {
            self.save();
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Atomically rewrites the backing file with the full record set.
    ///
    /// I/O errors are logged and swallowed.
    pub fn save(&self) {
        if let Err(e) = self.try_save() {
            warn!(error = %e, path = %self.path.display(), "failed to persist resume state");
        }
    }

    fn try_save(&self) -> Result<(), TransferError> {
        let file = {
            let records = self.records.lock().unwrap();
            let mut list: Vec<ResumeRecord> = records.values().cloned().collect();
            // Stable on-disk ordering.
            list.sort_by(|a, b| a.transfer_id.cmp(&b.transfer_id));
            ResumeFile {
                version: RESUME_FORMAT_VERSION,
                records: list,
            }
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = tmp_path(&self.path);
        let json = serde_json::to_vec_pretty(&file)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}
