#![forbid(unsafe_code)]

//! Append-only evidence ledger.
//!
//! In memory by default. `open_dir` makes it durable: every accepted blob and
//! row is appended to `ledger_journal.jsonl` (fsynced) and blob bytes live
//! under `blobs/`, written before their journal line. Opening a directory
//! replays the journal; a torn final line left by a crash is truncated.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use custody_contracts::admission::AdmissionStatus;
use custody_contracts::evidence::{Fingerprint, SubmissionId};
use custody_contracts::ledger::{is_valid_storage_path, LedgerRecord, LedgerWriteRequest};
use custody_contracts::{ContractViolation, UnixTimeMs, Validate};
use custody_engines::admission::{verify_ticket, ADMISSION_DIFFICULTY_BITS_DEFAULT};
use custody_engines::fingerprint::{FingerprintError, FingerprintService};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsutil::{append_line, atomic_write};

pub const LEDGER_BLOB_MAX_BYTES_DEFAULT: usize = 100 * 1024 * 1024;
pub const LEDGER_ADMISSION_FLOOR_BITS_DEFAULT: u8 = ADMISSION_DIFFICULTY_BITS_DEFAULT;
pub const LEDGER_JOURNAL_FILE: &str = "ledger_journal.jsonl";
pub const LEDGER_BLOB_DIR: &str = "blobs";
const LEDGER_JOURNAL_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("{table}: referenced key {key} does not exist")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("{table}: key {key} already holds different content")]
    DuplicateKey { table: &'static str, key: String },
    #[error("{table} is append-only")]
    AppendOnlyViolation { table: &'static str },
    #[error("{table}: {size} bytes exceeds quota of {max} bytes")]
    QuotaExceeded {
        table: &'static str,
        size: usize,
        max: usize,
    },
    #[error("stored content at {key} does not match the row: {reason}")]
    ContentMismatch { key: String, reason: &'static str },
    #[error("ledger storage i/o failed: {0}")]
    Io(String),
    #[error("ledger journal {file} is corrupt at line {line}")]
    Corrupt { file: String, line: usize },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

impl From<FingerprintError> for StorageError {
    fn from(err: FingerprintError) -> Self {
        match err {
            FingerprintError::Invalid(violation) => Self::ContractViolation(violation),
            other => Self::Io(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerAppendOutcome {
    Accepted(LedgerRecord),
    /// Same id and fingerprint already recorded; nothing was written.
    Duplicate(LedgerRecord),
}

impl LedgerAppendOutcome {
    pub fn record(&self) -> &LedgerRecord {
        match self {
            Self::Accepted(r) | Self::Duplicate(r) => r,
        }
    }

    pub fn into_record(self) -> LedgerRecord {
        match self {
            Self::Accepted(r) | Self::Duplicate(r) => r,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobPutOutcome {
    Stored,
    AlreadyStored,
}

#[derive(Debug, Clone)]
struct BlobEntry {
    size_bytes: u64,
    sha256: Fingerprint,
    /// Bytes held in memory; `None` when they live on disk.
    resident: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum LedgerJournalEvent {
    Blob {
        path: String,
        size_bytes: u64,
        sha256: Fingerprint,
    },
    Record {
        record: LedgerRecord,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerJournalEntry {
    schema_version: u8,
    #[serde(flatten)]
    event: LedgerJournalEvent,
}

impl LedgerJournalEntry {
    fn v1(event: LedgerJournalEvent) -> Self {
        Self {
            schema_version: LEDGER_JOURNAL_SCHEMA_VERSION,
            event,
        }
    }
}

#[derive(Debug, Clone)]
struct LedgerPersistence {
    journal_path: PathBuf,
    blob_dir: PathBuf,
}

/// Append-only evidence ledger plus the blob store its rows reference.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    records: Vec<LedgerRecord>,
    by_submission: BTreeMap<SubmissionId, usize>,
    blobs: BTreeMap<String, BlobEntry>,
    spent_seeds: BTreeSet<String>,
    blob_max_bytes: usize,
    admission_floor_bits: u8,
    persistence: Option<LedgerPersistence>,
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

impl LedgerStore {
    pub fn new_in_memory() -> Self {
        Self::with_blob_quota(LEDGER_BLOB_MAX_BYTES_DEFAULT)
    }

    pub fn with_blob_quota(blob_max_bytes: usize) -> Self {
        Self {
            records: Vec::new(),
            by_submission: BTreeMap::new(),
            blobs: BTreeMap::new(),
            spent_seeds: BTreeSet::new(),
            blob_max_bytes,
            admission_floor_bits: LEDGER_ADMISSION_FLOOR_BITS_DEFAULT,
            persistence: None,
        }
    }

    /// Opens (or creates) a durable ledger under `dir` and replays its journal.
    pub fn open_dir(dir: impl AsRef<Path>, blob_max_bytes: usize) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        let persistence = LedgerPersistence {
            journal_path: dir.join(LEDGER_JOURNAL_FILE),
            blob_dir: dir.join(LEDGER_BLOB_DIR),
        };
        fs::create_dir_all(&persistence.blob_dir).map_err(|e| io_error(&persistence.blob_dir, e))?;
        let mut store = Self::with_blob_quota(blob_max_bytes);
        for event in read_journal(&persistence.journal_path)? {
            store.replay(event);
        }
        tracing::info!(
            dir = %dir.display(),
            records = store.records.len(),
            blobs = store.blobs.len(),
            "evidence ledger opened"
        );
        store.persistence = Some(persistence);
        Ok(store)
    }

    /// Minimum proof-of-work difficulty the ledger accepts as verified.
    pub fn with_admission_floor(mut self, bits: u8) -> Self {
        self.admission_floor_bits = bits;
        self
    }

    pub fn admission_floor_bits(&self) -> u8 {
        self.admission_floor_bits
    }

    pub fn is_durable(&self) -> bool {
        self.persistence.is_some()
    }

    fn replay(&mut self, event: LedgerJournalEvent) {
        match event {
            LedgerJournalEvent::Blob {
                path,
                size_bytes,
                sha256,
            } => {
                self.blobs.insert(
                    path,
                    BlobEntry {
                        size_bytes,
                        sha256,
                        resident: None,
                    },
                );
            }
            LedgerJournalEvent::Record { record } => {
                if self.by_submission.contains_key(&record.submission_id) {
                    return;
                }
                self.spent_seeds
                    .insert(record.admission.challenge_seed.clone());
                self.by_submission
                    .insert(record.submission_id, self.records.len());
                self.records.push(record);
            }
        }
    }

    fn journal(&self, event: LedgerJournalEvent) -> Result<(), StorageError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let line = serde_json::to_vec(&LedgerJournalEntry::v1(event))
            .map_err(|e| StorageError::Io(format!("journal encode failed: {e}")))?;
        append_line(&persistence.journal_path, &line)
            .map_err(|e| io_error(&persistence.journal_path, e))
    }

    /// Idempotent for identical bytes at the same path.
    pub fn put_blob(&mut self, path: &str, bytes: &[u8]) -> Result<BlobPutOutcome, StorageError> {
        if !is_valid_storage_path(path) {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "blob.path",
                    reason: "must match {epochMillis}_{prefix16}.{ext}",
                },
            ));
        }
        if bytes.is_empty() {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "blob.bytes",
                    reason: "must not be empty",
                },
            ));
        }
        if bytes.len() > self.blob_max_bytes {
            return Err(StorageError::QuotaExceeded {
                table: "evidence_blobs",
                size: bytes.len(),
                max: self.blob_max_bytes,
            });
        }
        let sha256 = FingerprintService::default().fingerprint_bytes(bytes)?;
        if let Some(existing) = self.blobs.get(path) {
            if existing.sha256 == sha256 && existing.size_bytes == bytes.len() as u64 {
                return Ok(BlobPutOutcome::AlreadyStored);
            }
            return Err(StorageError::DuplicateKey {
                table: "evidence_blobs",
                key: path.to_string(),
            });
        }
        let resident = match &self.persistence {
            Some(persistence) => {
                let file = persistence.blob_dir.join(path);
                atomic_write(&file, bytes).map_err(|e| io_error(&file, e))?;
                None
            }
            None => Some(bytes.to_vec()),
        };
        self.journal(LedgerJournalEvent::Blob {
            path: path.to_string(),
            size_bytes: bytes.len() as u64,
            sha256: sha256.clone(),
        })?;
        self.blobs.insert(
            path.to_string(),
            BlobEntry {
                size_bytes: bytes.len() as u64,
                sha256,
                resident,
            },
        );
        Ok(BlobPutOutcome::Stored)
    }

    pub fn append_record(
        &mut self,
        req: LedgerWriteRequest,
        recorded_at: UnixTimeMs,
    ) -> Result<LedgerAppendOutcome, StorageError> {
        req.validate()?;

        if let Some(idx) = self.by_submission.get(&req.id) {
            let existing = &self.records[*idx];
            if existing.fingerprint != req.fingerprint {
                return Err(StorageError::DuplicateKey {
                    table: "evidence_ledger.submission_id",
                    key: req.id.to_string(),
                });
            }
            // Retry of an accepted write: return the original row untouched.
            return Ok(LedgerAppendOutcome::Duplicate(existing.clone()));
        }

        self.check_content(&req)?;
        let admission_status = self.assess_admission(&req);
        let record = LedgerRecord::from_request_v1(req, admission_status, recorded_at)?;
        self.journal(LedgerJournalEvent::Record {
            record: record.clone(),
        })?;
        self.spent_seeds
            .insert(record.admission.challenge_seed.clone());
        self.by_submission
            .insert(record.submission_id, self.records.len());
        self.records.push(record.clone());
        Ok(LedgerAppendOutcome::Accepted(record))
    }

    fn check_content(&self, req: &LedgerWriteRequest) -> Result<(), StorageError> {
        let meta = &req.metadata;
        let Some(blob) = self.blobs.get(&meta.storage_path) else {
            return Err(StorageError::ForeignKeyViolation {
                table: "evidence_ledger.storage_path",
                key: meta.storage_path.clone(),
            });
        };
        if blob.sha256 != req.fingerprint {
            return Err(StorageError::ContentMismatch {
                key: meta.storage_path.clone(),
                reason: "blob digest differs from the fingerprint",
            });
        }
        if blob.size_bytes != meta.size_bytes {
            return Err(StorageError::ContentMismatch {
                key: meta.storage_path.clone(),
                reason: "blob size differs from size_bytes",
            });
        }
        if let Some(claimed) = &meta.context_fingerprint {
            let computed = FingerprintService::default().file_context_fingerprint(
                meta.kind,
                &req.fingerprint,
                meta.contact_info.as_deref(),
                &meta.context_fields,
            )?;
            if computed.as_ref() != Some(claimed) {
                return Err(StorageError::ContentMismatch {
                    key: meta.storage_path.clone(),
                    reason: "context fingerprint does not cover the context fields",
                });
            }
        }
        Ok(())
    }

    fn assess_admission(&self, req: &LedgerWriteRequest) -> AdmissionStatus {
        let ticket = &req.metadata.admission;
        let assessed = verify_ticket(ticket, self.admission_floor_bits);
        if assessed == AdmissionStatus::Verified && self.spent_seeds.contains(&ticket.challenge_seed)
        {
            tracing::warn!(submission_id = %req.id, "admission seed reused; recording unverified");
            return AdmissionStatus::Unverified;
        }
        if assessed != ticket.status {
            tracing::warn!(
                submission_id = %req.id,
                claimed = ticket.status.as_str(),
                "admission ticket failed re-check; recording unverified"
            );
        }
        assessed
    }

    pub fn record(&self, id: &SubmissionId) -> Option<&LedgerRecord> {
        self.by_submission.get(id).map(|idx| &self.records[*idx])
    }

    pub fn records(&self) -> &[LedgerRecord] {
        &self.records
    }

    pub fn blob(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(entry) = self.blobs.get(path) else {
            return Ok(None);
        };
        if let Some(bytes) = &entry.resident {
            return Ok(Some(bytes.clone()));
        }
        let Some(persistence) = &self.persistence else {
            return Ok(None);
        };
        let file = persistence.blob_dir.join(path);
        fs::read(&file).map(Some).map_err(|e| io_error(&file, e))
    }

    pub fn blob_max_bytes(&self) -> usize {
        self.blob_max_bytes
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    pub fn attempt_overwrite_record(&mut self, _id: &SubmissionId) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "evidence_ledger",
        })
    }

    pub fn attempt_delete_blob(&mut self, _path: &str) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "evidence_blobs",
        })
    }
}

fn io_error(path: &Path, err: std::io::Error) -> StorageError {
    StorageError::Io(format!("{}: {err}", path.display()))
}

fn read_journal(path: &Path) -> Result<Vec<LedgerJournalEvent>, StorageError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(path, e)),
    };
    let complete_len = raw.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    if complete_len < raw.len() {
        tracing::warn!(
            journal = %path.display(),
            dropped_bytes = raw.len() - complete_len,
            "truncating torn journal tail"
        );
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| io_error(path, e))?;
        file.set_len(complete_len as u64)
            .and_then(|_| file.sync_all())
            .map_err(|e| io_error(path, e))?;
    }
    let mut events = Vec::new();
    for (line_no, line) in raw[..complete_len].split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let corrupt = || StorageError::Corrupt {
            file: path.display().to_string(),
            line: line_no + 1,
        };
        let entry: LedgerJournalEntry = serde_json::from_slice(line).map_err(|_| corrupt())?;
        if entry.schema_version != LEDGER_JOURNAL_SCHEMA_VERSION {
            return Err(corrupt());
        }
        events.push(entry.event);
    }
    Ok(events)
}
