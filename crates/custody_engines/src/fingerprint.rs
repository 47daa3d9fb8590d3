#![forbid(unsafe_code)]

//! Content fingerprints for evidence.
//!
//! File payloads are hashed as raw bytes so a submitter can recompute the
//! digest with any stock SHA-256 tool. Text payloads are hashed over a
//! labeled, delimited encoding:
//!
//! ```text
//! "custody-text-v1" RS "kind" US <kind> RS ( <label> US <value> RS )*
//! ```
//!
//! The first entry after `kind` is `statement`, then `contact` when present,
//! then the context fields in their stored order. RS/US never occur inside a
//! label or value (contract validation rejects them), so distinct field
//! splits cannot encode to the same bytes.
//!
//! The canonical text encoding is also the content delivered to the ledger,
//! so a stored text blob re-hashes to its record's fingerprint. Context
//! fields of a file submission travel beside the file and are bound to it
//! by a second digest over the same encoding, headed by the file digest:
//!
//! ```text
//! "custody-file-context-v1" RS "kind" US <kind> RS "content_sha256" US <hex> RS ...
//! ```

use std::borrow::Cow;
use std::io::Read;

use custody_contracts::evidence::{
    ContextField, EvidenceKind, EvidencePayload, EvidenceSubmission, Fingerprint,
    CANONICAL_RECORD_SEPARATOR, CANONICAL_UNIT_SEPARATOR, TEXT_MEDIA_TYPE,
};
use custody_contracts::ledger::{storage_path, ContentRef};
use custody_contracts::{ContractViolation, UnixTimeMs, Validate};
use sha2::{Digest, Sha256};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

pub const CANONICAL_TEXT_TAG: &str = "custody-text-v1";
pub const FILE_CONTEXT_TAG: &str = "custody-file-context-v1";
pub const TEXT_CONTENT_EXTENSION: &str = "txt";
const STREAM_CHUNK_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FingerprintError {
    /// The SHA-256 primitive cannot be used on this device. There is no fallback.
    #[error("secure digest primitive unavailable: {0}; retry on a compliant device")]
    DigestUnavailable(String),
    #[error("invalid submission content: {0}")]
    Invalid(#[from] ContractViolation),
    #[error("read failed while hashing: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental SHA-256 state.
pub trait DigestSession {
    fn update(&mut self, chunk: &[u8]);
    fn finish(self: Box<Self>) -> [u8; 32];
}

/// Source of SHA-256 sessions. Implementations report unavailability instead of degrading.
pub trait DigestPrimitive: Send + Sync {
    fn begin(&self) -> Result<Box<dyn DigestSession>, FingerprintError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha2Primitive;

struct Sha2Session(Sha256);

impl DigestSession for Sha2Session {
    fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    fn finish(self: Box<Self>) -> [u8; 32] {
        self.0.finalize().into()
    }
}

impl DigestPrimitive for Sha2Primitive {
    fn begin(&self) -> Result<Box<dyn DigestSession>, FingerprintError> {
        Ok(Box::new(Sha2Session(Sha256::new())))
    }
}

pub struct FingerprintService {
    primitive: Box<dyn DigestPrimitive>,
}

impl Default for FingerprintService {
    fn default() -> Self {
        Self::new(Box::new(Sha2Primitive))
    }
}

impl std::fmt::Debug for FingerprintService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintService").finish_non_exhaustive()
    }
}

impl FingerprintService {
    pub fn new(primitive: Box<dyn DigestPrimitive>) -> Self {
        Self { primitive }
    }

    pub fn fingerprint_bytes(&self, bytes: &[u8]) -> Result<Fingerprint, FingerprintError> {
        let mut session = self.primitive.begin()?;
        session.update(bytes);
        Ok(Fingerprint::from_digest(&session.finish()))
    }

    pub fn fingerprint_reader<R: Read>(&self, mut reader: R) -> Result<Fingerprint, FingerprintError> {
        let mut session = self.primitive.begin()?;
        let mut buf = vec![0u8; STREAM_CHUNK_LEN];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            session.update(&buf[..n]);
        }
        Ok(Fingerprint::from_digest(&session.finish()))
    }

    /// Fingerprint of exactly what will be delivered for this submission.
    pub fn fingerprint_submission(
        &self,
        submission: &EvidenceSubmission,
    ) -> Result<Fingerprint, FingerprintError> {
        submission.validate()?;
        match submission.payload() {
            EvidencePayload::File { bytes, .. } => self.fingerprint_bytes(bytes),
            EvidencePayload::Text { text } => {
                let encoded = canonical_text_encoding(
                    submission.kind(),
                    text,
                    submission.contact_info(),
                    submission.context_fields(),
                )?;
                self.fingerprint_bytes(&encoded)
            }
        }
    }
}

/// The bytes delivered to the ledger for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContent<'a> {
    pub bytes: Cow<'a, [u8]>,
    pub media_type: String,
    pub extension: String,
    pub context_fingerprint: Option<Fingerprint>,
}

impl DeliveryContent<'_> {
    pub fn content_ref(&self, created_at: UnixTimeMs, fingerprint: &Fingerprint) -> ContentRef {
        ContentRef {
            storage_path: storage_path(created_at, fingerprint, &self.extension),
            media_type: self.media_type.clone(),
            size_bytes: self.bytes.len() as u64,
            context_fingerprint: self.context_fingerprint.clone(),
        }
    }
}

impl FingerprintService {
    /// Content to upload for a finalized submission: the raw file, or the
    /// canonical text encoding. Either way its SHA-256 is the fingerprint.
    pub fn delivery_content<'a>(
        &self,
        submission: &'a EvidenceSubmission,
    ) -> Result<DeliveryContent<'a>, FingerprintError> {
        submission.validate()?;
        match submission.payload() {
            EvidencePayload::Text { text } => Ok(DeliveryContent {
                bytes: Cow::Owned(canonical_text_encoding(
                    submission.kind(),
                    text,
                    submission.contact_info(),
                    submission.context_fields(),
                )?),
                media_type: TEXT_MEDIA_TYPE.to_string(),
                extension: TEXT_CONTENT_EXTENSION.to_string(),
                context_fingerprint: None,
            }),
            EvidencePayload::File {
                bytes, media_type, ..
            } => {
                let context_fingerprint = self.file_context_fingerprint(
                    submission.kind(),
                    &self.fingerprint_bytes(bytes)?,
                    submission.contact_info(),
                    submission.context_fields(),
                )?;
                Ok(DeliveryContent {
                    bytes: Cow::Borrowed(bytes.as_slice()),
                    media_type: media_type.clone(),
                    extension: submission
                        .payload()
                        .file_extension()
                        .unwrap_or_else(|| "bin".to_string()),
                    context_fingerprint,
                })
            }
        }
    }

    /// `None` when the file has neither context fields nor contact info.
    pub fn file_context_fingerprint(
        &self,
        kind: EvidenceKind,
        content: &Fingerprint,
        contact: Option<&str>,
        fields: &[ContextField],
    ) -> Result<Option<Fingerprint>, FingerprintError> {
        if fields.is_empty() && contact.is_none() {
            return Ok(None);
        }
        let encoded = file_context_encoding(kind, content, contact, fields)?;
        self.fingerprint_bytes(&encoded).map(Some)
    }
}

pub fn canonical_text_encoding(
    kind: EvidenceKind,
    statement: &str,
    contact: Option<&str>,
    fields: &[ContextField],
) -> Result<Vec<u8>, ContractViolation> {
    labeled_encoding(CANONICAL_TEXT_TAG, kind, ("statement", statement), contact, fields)
}

pub fn file_context_encoding(
    kind: EvidenceKind,
    content: &Fingerprint,
    contact: Option<&str>,
    fields: &[ContextField],
) -> Result<Vec<u8>, ContractViolation> {
    labeled_encoding(
        FILE_CONTEXT_TAG,
        kind,
        ("content_sha256", content.as_str()),
        contact,
        fields,
    )
}

fn labeled_encoding(
    tag: &str,
    kind: EvidenceKind,
    head: (&str, &str),
    contact: Option<&str>,
    fields: &[ContextField],
) -> Result<Vec<u8>, ContractViolation> {
    let mut entries: Vec<ContextField> = Vec::with_capacity(fields.len() + 2);
    entries.push(ContextField {
        label: head.0.to_string(),
        value: head.1.to_string(),
    });
    if let Some(contact) = contact {
        entries.push(ContextField {
            label: "contact".to_string(),
            value: contact.to_string(),
        });
    }
    entries.extend(fields.iter().cloned());

    let mut out = String::new();
    out.push_str(tag);
    out.push(CANONICAL_RECORD_SEPARATOR);
    push_entry(&mut out, "kind", kind.as_str())?;
    for entry in &entries {
        let label: String = entry.label.nfc().collect();
        let value: String = entry.value.nfc().collect();
        push_entry(&mut out, &label, &value)?;
    }
    Ok(out.into_bytes())
}

fn push_entry(out: &mut String, label: &str, value: &str) -> Result<(), ContractViolation> {
    for (field, s) in [("canonical.label", label), ("canonical.value", value)] {
        if s.contains(CANONICAL_RECORD_SEPARATOR) || s.contains(CANONICAL_UNIT_SEPARATOR) {
            return Err(ContractViolation::InvalidValue {
                field,
                reason: "must not contain reserved separator characters",
            });
        }
    }
    out.push_str(label);
    out.push(CANONICAL_UNIT_SEPARATOR);
    out.push_str(value);
    out.push(CANONICAL_RECORD_SEPARATOR);
    Ok(())
}
