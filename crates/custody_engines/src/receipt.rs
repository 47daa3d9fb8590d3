#![forbid(unsafe_code)]

//! Human-verifiable receipts.
//!
//! Rendering is a pure function of the ledger record and locale: the same
//! record always yields the same bytes, and nothing here touches I/O.

use custody_contracts::evidence::{Fingerprint, TEXT_MEDIA_TYPE};
use custody_contracts::ledger::LedgerRecord;
use custody_contracts::track::Locale;
use thiserror::Error;

use crate::track_labels::receipt_headings;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiptError {
    #[error("ledger fingerprint {recorded} differs from computed fingerprint {computed}")]
    FingerprintMismatch { computed: String, recorded: String },
}

pub fn descriptor(record: &LedgerRecord) -> String {
    format!(
        "{} | {} | {} bytes | {}",
        record.kind.as_str(),
        record.media_type,
        record.size_bytes,
        record.storage_path
    )
}

pub fn render_receipt(record: &LedgerRecord, locale: Locale) -> String {
    let h = receipt_headings(locale);
    let rule = "=".repeat(h.title.chars().count());
    let verify = if record.media_type == TEXT_MEDIA_TYPE {
        h.verify_text
    } else {
        h.verify_file
    };
    let lines = [
        h.title.to_string(),
        rule,
        format!("{}: {}", h.submission_id, record.submission_id),
        format!("{}: {}", h.fingerprint, record.fingerprint),
        format!("{}: {}", h.recorded_at, record.recorded_at.to_rfc3339_utc()),
        format!("{}: {}", h.created_at, record.created_at.to_rfc3339_utc()),
        format!("{}: {}", h.descriptor, descriptor(record)),
        format!("{}: {}", h.admission, record.admission_status.as_str()),
        String::new(),
        verify.to_string(),
    ];
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Renders only when the ledger holds exactly the fingerprint computed before delivery.
pub fn render_receipt_checked(
    record: &LedgerRecord,
    computed: &Fingerprint,
    locale: Locale,
) -> Result<String, ReceiptError> {
    if &record.fingerprint != computed {
        return Err(ReceiptError::FingerprintMismatch {
            computed: computed.to_string(),
            recorded: record.fingerprint.to_string(),
        });
    }
    Ok(render_receipt(record, locale))
}
