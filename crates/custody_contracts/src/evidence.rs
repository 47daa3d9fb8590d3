#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::admission::AdmissionTicket;
use crate::common::validate_text;
use crate::{ContractViolation, UnixTimeMs, Validate};

/// Separates labeled entries in the canonical text encoding.
pub const CANONICAL_RECORD_SEPARATOR: char = '\u{1E}';
/// Separates a label from its value in the canonical text encoding.
pub const CANONICAL_UNIT_SEPARATOR: char = '\u{1F}';

pub const MAX_LABEL_LEN: usize = 64;
pub const MAX_FIELD_VALUE_LEN: usize = 8 * 1024;
pub const MAX_TEXT_PAYLOAD_LEN: usize = 256 * 1024;
pub const MAX_FILE_PAYLOAD_BYTES: usize = 100 * 1024 * 1024;
pub const MAX_CONTACT_INFO_LEN: usize = 256;
pub const MAX_FILE_NAME_LEN: usize = 255;

pub const TEXT_MEDIA_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(Uuid);

impl SubmissionId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| ContractViolation::InvalidValue {
                field: "submission_id",
                reason: "must be a UUID",
            })
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl Validate for SubmissionId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.is_nil() {
            return Err(ContractViolation::InvalidValue {
                field: "submission_id",
                reason: "must not be nil",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvidenceKind {
    Testimony,
    Document,
    PhysicalNotice,
    DirectContact,
}

impl EvidenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Testimony => "testimony",
            Self::Document => "document",
            Self::PhysicalNotice => "physical-notice",
            Self::DirectContact => "direct-contact",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "testimony" => Some(Self::Testimony),
            "document" => Some(Self::Document),
            "physical-notice" => Some(Self::PhysicalNotice),
            "direct-contact" => Some(Self::DirectContact),
            _ => None,
        }
    }
}

/// 64-char lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub const HEX_LEN: usize = 64;

    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        let ok = raw.len() == Self::HEX_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !ok {
            return Err(ContractViolation::InvalidValue {
                field: "fingerprint",
                reason: "must be 64 lowercase hex chars",
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn from_digest(digest: &[u8; 32]) -> Self {
        let mut out = String::with_capacity(Self::HEX_LEN);
        for b in digest {
            out.push_str(&format!("{b:02x}"));
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn prefix16(&self) -> &str {
        &self.0[..16]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextField {
    pub label: String,
    pub value: String,
}

impl Validate for ContextField {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("context_field.label", &self.label, MAX_LABEL_LEN)?;
        reject_delimiters("context_field.label", &self.label)?;
        if self.value.len() > MAX_FIELD_VALUE_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "context_field.value",
                reason: "exceeds max length",
            });
        }
        reject_delimiters("context_field.value", &self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvidencePayload {
    Text {
        text: String,
    },
    File {
        file_name: String,
        media_type: String,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
}

impl EvidencePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn file(
        file_name: impl Into<String>,
        media_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self::File {
            file_name: file_name.into(),
            media_type: media_type.into(),
            bytes,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::Text { text } => text.len() as u64,
            Self::File { bytes, .. } => bytes.len() as u64,
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            Self::Text { .. } => TEXT_MEDIA_TYPE,
            Self::File { media_type, .. } => media_type,
        }
    }

    /// Storage extension for file payloads; `None` for text.
    pub fn file_extension(&self) -> Option<String> {
        let Self::File {
            file_name,
            media_type,
            ..
        } = self
        else {
            return None;
        };
        let from_name = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| {
                !ext.is_empty() && ext.len() <= 8 && ext.bytes().all(|b| b.is_ascii_alphanumeric())
            });
        if let Some(ext) = from_name {
            return Some(ext);
        }
        let mapped = match media_type.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" => "jpg",
            "image/png" => "png",
            "image/heic" => "heic",
            "application/pdf" => "pdf",
            "video/mp4" => "mp4",
            "audio/mpeg" => "mp3",
            _ => "bin",
        };
        Some(mapped.to_string())
    }
}

impl Validate for EvidencePayload {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            Self::Text { text } => {
                validate_text("payload.text", text, MAX_TEXT_PAYLOAD_LEN)?;
                reject_delimiters("payload.text", text)
            }
            Self::File {
                file_name,
                media_type,
                bytes,
            } => {
                validate_text("payload.file_name", file_name, MAX_FILE_NAME_LEN)?;
                validate_text("payload.media_type", media_type, 128)?;
                if bytes.is_empty() {
                    return Err(ContractViolation::InvalidValue {
                        field: "payload.bytes",
                        reason: "must not be empty",
                    });
                }
                if bytes.len() > MAX_FILE_PAYLOAD_BYTES {
                    return Err(ContractViolation::InvalidValue {
                        field: "payload.bytes",
                        reason: "exceeds max size",
                    });
                }
                Ok(())
            }
        }
    }
}

/// Witness-supplied material for one track.
///
/// Mutable while the form is being filled. `finalize` freezes the
/// fingerprint and admission ticket; every later mutation is refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSubmission {
    id: SubmissionId,
    kind: EvidenceKind,
    payload: EvidencePayload,
    context_fields: Vec<ContextField>,
    contact_info: Option<String>,
    created_at: UnixTimeMs,
    fingerprint: Option<Fingerprint>,
    admission: Option<AdmissionTicket>,
}

impl EvidenceSubmission {
    pub fn draft(kind: EvidenceKind, payload: EvidencePayload, created_at: UnixTimeMs) -> Self {
        Self::draft_with_id(SubmissionId::new_v4(), kind, payload, created_at)
    }

    pub fn draft_with_id(
        id: SubmissionId,
        kind: EvidenceKind,
        payload: EvidencePayload,
        created_at: UnixTimeMs,
    ) -> Self {
        Self {
            id,
            kind,
            payload,
            context_fields: Vec::new(),
            contact_info: None,
            created_at,
            fingerprint: None,
            admission: None,
        }
    }

    pub fn id(&self) -> SubmissionId {
        self.id
    }

    pub fn kind(&self) -> EvidenceKind {
        self.kind
    }

    pub fn payload(&self) -> &EvidencePayload {
        &self.payload
    }

    pub fn context_fields(&self) -> &[ContextField] {
        &self.context_fields
    }

    pub fn contact_info(&self) -> Option<&str> {
        self.contact_info.as_deref()
    }

    pub fn created_at(&self) -> UnixTimeMs {
        self.created_at
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn admission(&self) -> Option<&AdmissionTicket> {
        self.admission.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.fingerprint.is_some()
    }

    /// Sets a context field. An existing label keeps its position and takes the new value.
    pub fn set_context_field(
        &mut self,
        label: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ContractViolation> {
        self.ensure_mutable()?;
        let field = ContextField {
            label: label.into(),
            value: value.into(),
        };
        field.validate()?;
        match self
            .context_fields
            .iter_mut()
            .find(|existing| existing.label == field.label)
        {
            Some(existing) => existing.value = field.value,
            None => self.context_fields.push(field),
        }
        Ok(())
    }

    pub fn set_payload(&mut self, payload: EvidencePayload) -> Result<(), ContractViolation> {
        self.ensure_mutable()?;
        self.payload = payload;
        Ok(())
    }

    pub fn set_contact_info(&mut self, contact: Option<String>) -> Result<(), ContractViolation> {
        self.ensure_mutable()?;
        self.contact_info = contact;
        Ok(())
    }

    pub fn finalize(
        &mut self,
        fingerprint: Fingerprint,
        admission: AdmissionTicket,
    ) -> Result<(), ContractViolation> {
        self.ensure_mutable()?;
        self.validate()?;
        admission.validate()?;
        self.fingerprint = Some(fingerprint);
        self.admission = Some(admission);
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), ContractViolation> {
        if self.is_finalized() {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_submission",
                reason: "finalized submissions are immutable",
            });
        }
        Ok(())
    }
}

impl Validate for EvidenceSubmission {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.id.validate()?;
        self.payload.validate()?;
        match (self.kind, &self.payload) {
            (EvidenceKind::Document, EvidencePayload::Text { .. }) => {
                return Err(ContractViolation::InvalidValue {
                    field: "payload",
                    reason: "document evidence requires a file payload",
                });
            }
            (
                EvidenceKind::PhysicalNotice | EvidenceKind::DirectContact,
                EvidencePayload::File { .. },
            ) => {
                return Err(ContractViolation::InvalidValue {
                    field: "payload",
                    reason: "notice and contact evidence require a text payload",
                });
            }
            _ => {}
        }
        for field in &self.context_fields {
            field.validate()?;
        }
        match &self.contact_info {
            Some(contact) => {
                validate_text("contact_info", contact, MAX_CONTACT_INFO_LEN)?;
                reject_delimiters("contact_info", contact)?;
            }
            None if self.kind == EvidenceKind::DirectContact => {
                return Err(ContractViolation::InvalidValue {
                    field: "contact_info",
                    reason: "direct-contact requires contact info",
                });
            }
            None => {}
        }
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "created_at",
                reason: "must be > 0",
            });
        }
        if let Some(ticket) = &self.admission {
            ticket.validate()?;
        }
        Ok(())
    }
}

fn reject_delimiters(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.contains(CANONICAL_RECORD_SEPARATOR) || value.contains(CANONICAL_UNIT_SEPARATOR) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain reserved separator characters",
        });
    }
    Ok(())
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BASE64.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testimony() -> EvidenceSubmission {
        EvidenceSubmission::draft(
            EvidenceKind::Testimony,
            EvidencePayload::text("I witnessed X"),
            UnixTimeMs(1_700_000_000_000),
        )
    }

    #[test]
    fn at_evidence_01_fingerprint_parse_requires_lower_hex_64() {
        assert!(Fingerprint::parse(&"a".repeat(64)).is_ok());
        assert!(Fingerprint::parse(&"A".repeat(64)).is_err());
        assert!(Fingerprint::parse(&"a".repeat(63)).is_err());
        assert!(Fingerprint::parse(&format!("{}g", "a".repeat(63))).is_err());
    }

    #[test]
    fn at_evidence_02_set_field_replaces_in_place() {
        let mut s = testimony();
        s.set_context_field("place", "Kharkiv").unwrap();
        s.set_context_field("date", "2022-03-01").unwrap();
        s.set_context_field("place", "Izium").unwrap();
        let labels: Vec<_> = s.context_fields().iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, vec!["place", "date"]);
        assert_eq!(s.context_fields()[0].value, "Izium");
    }

    #[test]
    fn at_evidence_03_delimiters_rejected_in_values() {
        let mut s = testimony();
        let err = s
            .set_context_field("place", format!("a{CANONICAL_UNIT_SEPARATOR}b"))
            .unwrap_err();
        assert!(matches!(err, ContractViolation::InvalidValue { .. }));
    }

    #[test]
    fn at_evidence_04_direct_contact_requires_contact_info() {
        let s = EvidenceSubmission::draft(
            EvidenceKind::DirectContact,
            EvidencePayload::text("please call me"),
            UnixTimeMs(5),
        );
        assert!(s.validate().is_err());
    }

    #[test]
    fn at_evidence_05_document_requires_file_payload() {
        let s = EvidenceSubmission::draft(
            EvidenceKind::Document,
            EvidencePayload::text("not a file"),
            UnixTimeMs(5),
        );
        assert!(s.validate().is_err());
    }

    #[test]
    fn at_evidence_06_extension_from_name_then_media_type() {
        let named = EvidencePayload::file("IMG_0001.JPG", "image/jpeg", vec![1]);
        assert_eq!(named.file_extension().as_deref(), Some("jpg"));
        let unnamed = EvidencePayload::file("capture", "application/pdf", vec![1]);
        assert_eq!(unnamed.file_extension().as_deref(), Some("pdf"));
        let unknown = EvidencePayload::file("capture", "application/x-foo", vec![1]);
        assert_eq!(unknown.file_extension().as_deref(), Some("bin"));
        assert_eq!(EvidencePayload::text("x").file_extension(), None);
    }

    #[test]
    fn at_evidence_07_file_payload_serde_uses_base64() {
        let payload = EvidencePayload::file("a.png", "image/png", vec![0, 1, 2, 255]);
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"bytes\":\"AAEC/w==\""));
        let back: EvidencePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
