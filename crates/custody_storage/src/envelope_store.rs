#![forbid(unsafe_code)]

//! Durable local storage for offline envelopes.
//!
//! The file backend seals each submission in its own AES-256-GCM encrypted
//! file under `envelopes/`, and keeps the delivery headers in a small
//! encrypted index. Updating delivery state rewrites only the index; a
//! submission is read back one at a time when it is dispatched. Every file is
//! written atomically (write-then-rename).

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use custody_contracts::envelope::{EnvelopeHeader, OfflineEnvelope};
use custody_contracts::evidence::{EvidenceSubmission, SubmissionId};
use custody_contracts::track::TrackKind;
use custody_contracts::{ContractViolation, UnixTimeMs};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsutil::{atomic_write, write_new_file_restricted};

const ENVELOPE_STORE_SCHEMA_VERSION: u8 = 1;
const MASTER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
pub const ENVELOPE_INDEX_FILE: &str = "offline_index.json";
pub const ENVELOPE_BODY_DIR: &str = "envelopes";
pub const ENVELOPE_MASTER_KEY_FILE: &str = "offline_envelopes.master.key";

#[derive(Debug, Error)]
pub enum EnvelopeStoreError {
    #[error("envelope store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("envelope store json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope store decode error: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("envelope store cryptographic operation failed")]
    Crypto,
    #[error("envelope store schema version {0} is not supported")]
    UnsupportedSchema(u8),
    #[error("envelope {0} not found")]
    NotFound(SubmissionId),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error("envelope store lock poisoned")]
    Poisoned,
}

/// Keyed by submission id; `headers` returns envelopes in enqueue order.
pub trait EnvelopeStore: Send + Sync {
    /// Returns `None` when an envelope for this submission already exists.
    fn enqueue(
        &self,
        track_kind: TrackKind,
        submission: EvidenceSubmission,
        queued_at: UnixTimeMs,
    ) -> Result<Option<EnvelopeHeader>, EnvelopeStoreError>;
    /// Persists the delivery state of an existing envelope.
    fn update(&self, header: &EnvelopeHeader) -> Result<(), EnvelopeStoreError>;
    fn remove(&self, id: &SubmissionId) -> Result<bool, EnvelopeStoreError>;
    /// Headers only; no submission body is read.
    fn headers(&self) -> Result<Vec<EnvelopeHeader>, EnvelopeStoreError>;
    fn load(&self, id: &SubmissionId) -> Result<Option<OfflineEnvelope>, EnvelopeStoreError>;
}

fn in_enqueue_order<'a>(headers: impl Iterator<Item = &'a EnvelopeHeader>) -> Vec<EnvelopeHeader> {
    let mut out: Vec<EnvelopeHeader> = headers.cloned().collect();
    out.sort_by_key(|h| h.enqueue_seq);
    out
}

#[derive(Debug, Default)]
struct MemorySet {
    next_seq: u64,
    entries: BTreeMap<SubmissionId, OfflineEnvelope>,
}

#[derive(Debug, Default)]
pub struct MemoryEnvelopeStore {
    set: Mutex<MemorySet>,
}

impl MemoryEnvelopeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnvelopeStore for MemoryEnvelopeStore {
    fn enqueue(
        &self,
        track_kind: TrackKind,
        submission: EvidenceSubmission,
        queued_at: UnixTimeMs,
    ) -> Result<Option<EnvelopeHeader>, EnvelopeStoreError> {
        let mut set = self.set.lock().map_err(|_| EnvelopeStoreError::Poisoned)?;
        if set.entries.contains_key(&submission.id()) {
            return Ok(None);
        }
        let envelope = OfflineEnvelope::v1(track_kind, submission, queued_at, set.next_seq)?;
        set.next_seq = set.next_seq.saturating_add(1);
        let header = envelope.header.clone();
        set.entries.insert(header.submission_id, envelope);
        Ok(Some(header))
    }

    fn update(&self, header: &EnvelopeHeader) -> Result<(), EnvelopeStoreError> {
        let mut set = self.set.lock().map_err(|_| EnvelopeStoreError::Poisoned)?;
        let slot = set
            .entries
            .get_mut(&header.submission_id)
            .ok_or(EnvelopeStoreError::NotFound(header.submission_id))?;
        slot.header.apply_delivery_state(header);
        Ok(())
    }

    fn remove(&self, id: &SubmissionId) -> Result<bool, EnvelopeStoreError> {
        let mut set = self.set.lock().map_err(|_| EnvelopeStoreError::Poisoned)?;
        Ok(set.entries.remove(id).is_some())
    }

    fn headers(&self) -> Result<Vec<EnvelopeHeader>, EnvelopeStoreError> {
        let set = self.set.lock().map_err(|_| EnvelopeStoreError::Poisoned)?;
        Ok(in_enqueue_order(set.entries.values().map(|e| &e.header)))
    }

    fn load(&self, id: &SubmissionId) -> Result<Option<OfflineEnvelope>, EnvelopeStoreError> {
        let set = self.set.lock().map_err(|_| EnvelopeStoreError::Poisoned)?;
        Ok(set.entries.get(id).cloned())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EnvelopeIndex {
    next_seq: u64,
    headers: BTreeMap<SubmissionId, EnvelopeHeader>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedDocument {
    schema_version: u8,
    nonce_b64: String,
    ciphertext_b64: String,
}

#[derive(Debug)]
pub struct EncryptedFileEnvelopeStore {
    index_path: PathBuf,
    body_dir: PathBuf,
    key_path: PathBuf,
    io_lock: Mutex<()>,
}

impl EncryptedFileEnvelopeStore {
    pub fn in_dir(dir: PathBuf) -> Self {
        let key_path = dir.join(ENVELOPE_MASTER_KEY_FILE);
        Self::with_key_path(dir, key_path)
    }

    pub fn with_key_path(dir: PathBuf, key_path: PathBuf) -> Self {
        Self {
            index_path: dir.join(ENVELOPE_INDEX_FILE),
            body_dir: dir.join(ENVELOPE_BODY_DIR),
            key_path,
            io_lock: Mutex::new(()),
        }
    }

    fn body_path(&self, id: &SubmissionId) -> PathBuf {
        self.body_dir.join(format!("env-{id}.bin"))
    }

    fn with_index<T>(
        &self,
        mutate: impl FnOnce(&mut EnvelopeIndex) -> Result<(T, bool), EnvelopeStoreError>,
    ) -> Result<T, EnvelopeStoreError> {
        let _guard = self.io_lock.lock().map_err(|_| EnvelopeStoreError::Poisoned)?;
        let mut index = self.read_index()?;
        let (out, dirty) = mutate(&mut index)?;
        if dirty {
            self.write_sealed(&self.index_path, &index)?;
        }
        Ok(out)
    }

    fn ensure_dirs(&self) -> Result<(), EnvelopeStoreError> {
        fs::create_dir_all(&self.body_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn read_index(&self) -> Result<EnvelopeIndex, EnvelopeStoreError> {
        if !self.index_path.exists() {
            return Ok(EnvelopeIndex::default());
        }
        let raw = fs::read_to_string(&self.index_path)?;
        if raw.trim().is_empty() {
            return Ok(EnvelopeIndex::default());
        }
        self.open_sealed(&raw)
    }

    fn open_sealed<T: DeserializeOwned>(&self, raw: &str) -> Result<T, EnvelopeStoreError> {
        let doc = serde_json::from_str::<SealedDocument>(raw)?;
        if doc.schema_version != ENVELOPE_STORE_SCHEMA_VERSION {
            return Err(EnvelopeStoreError::UnsupportedSchema(doc.schema_version));
        }
        let key = self.load_or_create_master_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| EnvelopeStoreError::Crypto)?;
        let nonce_raw = BASE64.decode(doc.nonce_b64.as_bytes())?;
        if nonce_raw.len() != NONCE_LEN {
            return Err(EnvelopeStoreError::Crypto);
        }
        let ciphertext = BASE64.decode(doc.ciphertext_b64.as_bytes())?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_raw), ciphertext.as_ref())
            .map_err(|_| EnvelopeStoreError::Crypto)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn write_sealed<T: Serialize>(
        &self,
        path: &std::path::Path,
        value: &T,
    ) -> Result<(), EnvelopeStoreError> {
        self.ensure_dirs()?;
        let key = self.load_or_create_master_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| EnvelopeStoreError::Crypto)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let plaintext = serde_json::to_vec(value)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|_| EnvelopeStoreError::Crypto)?;
        let doc = SealedDocument {
            schema_version: ENVELOPE_STORE_SCHEMA_VERSION,
            nonce_b64: BASE64.encode(nonce_bytes),
            ciphertext_b64: BASE64.encode(ciphertext),
        };
        atomic_write(path, &serde_json::to_vec(&doc)?)?;
        Ok(())
    }

    fn load_or_create_master_key(&self) -> Result<[u8; MASTER_KEY_LEN], EnvelopeStoreError> {
        if self.key_path.exists() {
            let encoded = fs::read_to_string(&self.key_path)?;
            let decoded = BASE64.decode(encoded.trim().as_bytes())?;
            if decoded.len() != MASTER_KEY_LEN {
                return Err(EnvelopeStoreError::Crypto);
            }
            let mut key = [0u8; MASTER_KEY_LEN];
            key.copy_from_slice(&decoded);
            return Ok(key);
        }

        self.ensure_dirs()?;
        let mut key = [0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        write_new_file_restricted(&self.key_path, BASE64.encode(key).as_bytes())?;
        Ok(key)
    }
}

impl EnvelopeStore for EncryptedFileEnvelopeStore {
    fn enqueue(
        &self,
        track_kind: TrackKind,
        submission: EvidenceSubmission,
        queued_at: UnixTimeMs,
    ) -> Result<Option<EnvelopeHeader>, EnvelopeStoreError> {
        self.with_index(|index| {
            if index.headers.contains_key(&submission.id()) {
                return Ok((None, false));
            }
            let envelope = OfflineEnvelope::v1(track_kind, submission, queued_at, index.next_seq)?;
            // Body first: an index entry never points at a missing file.
            self.write_sealed(&self.body_path(&envelope.submission_id()), &envelope.submission)?;
            index.next_seq = index.next_seq.saturating_add(1);
            index
                .headers
                .insert(envelope.submission_id(), envelope.header.clone());
            Ok((Some(envelope.header), true))
        })
    }

    fn update(&self, header: &EnvelopeHeader) -> Result<(), EnvelopeStoreError> {
        self.with_index(|index| {
            let slot = index
                .headers
                .get_mut(&header.submission_id)
                .ok_or(EnvelopeStoreError::NotFound(header.submission_id))?;
            slot.apply_delivery_state(header);
            Ok(((), true))
        })
    }

    fn remove(&self, id: &SubmissionId) -> Result<bool, EnvelopeStoreError> {
        let removed = self.with_index(|index| {
            let removed = index.headers.remove(id).is_some();
            Ok((removed, removed))
        })?;
        if removed {
            match fs::remove_file(self.body_path(id)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    fn headers(&self) -> Result<Vec<EnvelopeHeader>, EnvelopeStoreError> {
        let _guard = self.io_lock.lock().map_err(|_| EnvelopeStoreError::Poisoned)?;
        Ok(in_enqueue_order(self.read_index()?.headers.values()))
    }

    fn load(&self, id: &SubmissionId) -> Result<Option<OfflineEnvelope>, EnvelopeStoreError> {
        let _guard = self.io_lock.lock().map_err(|_| EnvelopeStoreError::Poisoned)?;
        let Some(header) = self.read_index()?.headers.remove(id) else {
            return Ok(None);
        };
        let raw = fs::read_to_string(self.body_path(id))?;
        let submission: EvidenceSubmission = self.open_sealed(&raw)?;
        Ok(Some(OfflineEnvelope::from_parts(header, submission)?))
    }
}
