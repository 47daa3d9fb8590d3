#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::admission::{AdmissionStatus, AdmissionTicket};
use crate::common::validate_text;
use crate::evidence::{
    ContextField, EvidenceKind, EvidencePayload, EvidenceSubmission, Fingerprint, SubmissionId,
    MAX_CONTACT_INFO_LEN,
};
use crate::{ContractViolation, UnixTimeMs, Validate};

/// Object-storage path for raw evidence bytes: `{epochMillis}_{fingerprintPrefix16}.{ext}`.
pub fn storage_path(created_at: UnixTimeMs, fingerprint: &Fingerprint, ext: &str) -> String {
    format!("{}_{}.{}", created_at.0, fingerprint.prefix16(), ext)
}

pub fn is_valid_storage_path(path: &str) -> bool {
    let Some((stem, ext)) = path.split_once('.') else {
        return false;
    };
    let Some((millis, prefix)) = stem.split_once('_') else {
        return false;
    };
    !millis.is_empty()
        && millis.bytes().all(|b| b.is_ascii_digit())
        && prefix.len() == 16
        && prefix
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        && !ext.is_empty()
        && ext.len() <= 8
        && ext.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Where the delivered content of a submission lives and what it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRef {
    pub storage_path: String,
    pub media_type: String,
    pub size_bytes: u64,
    /// Digest binding a file's context fields and contact info to its content.
    pub context_fingerprint: Option<Fingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMetadata {
    pub kind: EvidenceKind,
    /// Size of the stored blob, not of the draft payload.
    pub size_bytes: u64,
    pub media_type: String,
    pub storage_path: String,
    /// Context of a file submission. Text submissions carry theirs inside the blob.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_fields: Vec<ContextField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_fingerprint: Option<Fingerprint>,
    pub admission: AdmissionTicket,
    pub created_at: UnixTimeMs,
}

/// Wire body of the ledger write endpoint: `{id, fingerprint, metadata, timestamp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerWriteRequest {
    pub id: SubmissionId,
    pub fingerprint: Fingerprint,
    pub metadata: LedgerMetadata,
    pub timestamp: UnixTimeMs,
}

impl LedgerWriteRequest {
    /// Builds the request for a finalized submission whose content is stored at `content`.
    pub fn for_submission(
        submission: &EvidenceSubmission,
        content: ContentRef,
        timestamp: UnixTimeMs,
    ) -> Result<Self, ContractViolation> {
        let fingerprint = submission
            .fingerprint()
            .cloned()
            .ok_or(ContractViolation::InvalidValue {
                field: "ledger_write_request.fingerprint",
                reason: "submission must be finalized before delivery",
            })?;
        let admission = submission
            .admission()
            .cloned()
            .ok_or(ContractViolation::InvalidValue {
                field: "ledger_write_request.admission",
                reason: "submission must carry an admission ticket",
            })?;
        let (context_fields, contact_info) = match submission.payload() {
            EvidencePayload::File { .. } => (
                submission.context_fields().to_vec(),
                submission.contact_info().map(str::to_string),
            ),
            EvidencePayload::Text { .. } => (Vec::new(), None),
        };
        let req = Self {
            id: submission.id(),
            fingerprint,
            metadata: LedgerMetadata {
                kind: submission.kind(),
                size_bytes: content.size_bytes,
                media_type: content.media_type,
                storage_path: content.storage_path,
                context_fields,
                contact_info,
                context_fingerprint: content.context_fingerprint,
                admission,
                created_at: submission.created_at(),
            },
            timestamp,
        };
        req.validate()?;
        Ok(req)
    }
}

impl Validate for LedgerWriteRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.id.validate()?;
        let meta = &self.metadata;
        validate_text("ledger_write_request.media_type", &meta.media_type, 128)?;
        if !is_valid_storage_path(&meta.storage_path) {
            return Err(ContractViolation::InvalidValue {
                field: "ledger_write_request.storage_path",
                reason: "must match {epochMillis}_{prefix16}.{ext}",
            });
        }
        if !meta.storage_path.contains(self.fingerprint.prefix16()) {
            return Err(ContractViolation::InvalidValue {
                field: "ledger_write_request.storage_path",
                reason: "must embed the fingerprint prefix",
            });
        }
        if meta.size_bytes == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "ledger_write_request.size_bytes",
                reason: "must be > 0",
            });
        }
        for field in &meta.context_fields {
            field.validate()?;
        }
        if let Some(contact) = &meta.contact_info {
            validate_text(
                "ledger_write_request.contact_info",
                contact,
                MAX_CONTACT_INFO_LEN,
            )?;
        }
        let has_context = !meta.context_fields.is_empty() || meta.contact_info.is_some();
        if has_context != meta.context_fingerprint.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "ledger_write_request.context_fingerprint",
                reason: "required exactly when context fields or contact info are present",
            });
        }
        meta.admission.validate()?;
        if self.timestamp.0 == 0 || meta.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "ledger_write_request.timestamp",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// One immutable row of the append-only evidence ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub submission_id: SubmissionId,
    pub fingerprint: Fingerprint,
    pub kind: EvidenceKind,
    pub size_bytes: u64,
    pub media_type: String,
    pub storage_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_fields: Vec<ContextField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_fingerprint: Option<Fingerprint>,
    /// Ticket as submitted, kept for audit.
    pub admission: AdmissionTicket,
    /// Status as re-checked by the ledger, which may be lower than the ticket claims.
    pub admission_status: AdmissionStatus,
    pub created_at: UnixTimeMs,
    pub recorded_at: UnixTimeMs,
}

impl LedgerRecord {
    pub fn from_request_v1(
        req: LedgerWriteRequest,
        admission_status: AdmissionStatus,
        recorded_at: UnixTimeMs,
    ) -> Result<Self, ContractViolation> {
        req.validate()?;
        let meta = req.metadata;
        Ok(Self {
            submission_id: req.id,
            fingerprint: req.fingerprint,
            kind: meta.kind,
            size_bytes: meta.size_bytes,
            media_type: meta.media_type,
            storage_path: meta.storage_path,
            context_fields: meta.context_fields,
            contact_info: meta.contact_info,
            context_fingerprint: meta.context_fingerprint,
            admission: meta.admission,
            admission_status,
            created_at: meta.created_at,
            recorded_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerWriteOutcome {
    Accepted,
    Duplicate,
    Rejected,
}

/// Response body of the ledger write endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerWriteResponse {
    pub outcome: LedgerWriteOutcome,
    pub record: Option<LedgerRecord>,
    pub reason: Option<String>,
}

impl LedgerWriteResponse {
    pub fn accepted(record: LedgerRecord) -> Self {
        Self {
            outcome: LedgerWriteOutcome::Accepted,
            record: Some(record),
            reason: None,
        }
    }

    pub fn duplicate(record: LedgerRecord) -> Self {
        Self {
            outcome: LedgerWriteOutcome::Duplicate,
            record: Some(record),
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            outcome: LedgerWriteOutcome::Rejected,
            record: None,
            reason: Some(reason.into()),
        }
    }
}
