#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::evidence::{EvidenceSubmission, SubmissionId};
use crate::track::TrackKind;
use crate::{ContractViolation, UnixTimeMs, Validate};

pub const MAX_ENVELOPE_ERROR_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeState {
    Pending,
    /// Permanently rejected by the server; kept until the submitter acts on it.
    DeadLetter,
}

/// Delivery state of a queued envelope, stored apart from its submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub submission_id: SubmissionId,
    pub track_kind: TrackKind,
    pub size_bytes: u64,
    pub queued_at: UnixTimeMs,
    /// Sole source of FIFO order; wall-clock `queued_at` is informational.
    pub enqueue_seq: u64,
    pub attempt_count: u16,
    pub last_error: Option<String>,
    pub state: EnvelopeState,
}

impl EnvelopeHeader {
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(bounded_error(message.into()));
    }

    pub fn dead_letter(&mut self, message: impl Into<String>) {
        self.record_failure(message);
        self.state = EnvelopeState::DeadLetter;
    }

    /// Takes the mutable delivery fields from `other`, keeping identity and order.
    pub fn apply_delivery_state(&mut self, other: &EnvelopeHeader) {
        self.attempt_count = other.attempt_count;
        self.last_error = other.last_error.clone();
        self.state = other.state;
    }
}

/// A finalized submission waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineEnvelope {
    pub header: EnvelopeHeader,
    pub submission: EvidenceSubmission,
}

impl OfflineEnvelope {
    pub fn v1(
        track_kind: TrackKind,
        submission: EvidenceSubmission,
        queued_at: UnixTimeMs,
        enqueue_seq: u64,
    ) -> Result<Self, ContractViolation> {
        let header = EnvelopeHeader {
            submission_id: submission.id(),
            track_kind,
            size_bytes: submission.payload().size_bytes(),
            queued_at,
            enqueue_seq,
            attempt_count: 0,
            last_error: None,
            state: EnvelopeState::Pending,
        };
        Self::from_parts(header, submission)
    }

    /// Reassembles an envelope whose header and submission were stored separately.
    pub fn from_parts(
        header: EnvelopeHeader,
        submission: EvidenceSubmission,
    ) -> Result<Self, ContractViolation> {
        let env = Self { header, submission };
        env.validate()?;
        Ok(env)
    }

    pub fn submission_id(&self) -> SubmissionId {
        self.header.submission_id
    }
}

impl Validate for OfflineEnvelope {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.header.submission_id != self.submission.id() {
            return Err(ContractViolation::InvalidValue {
                field: "offline_envelope.submission_id",
                reason: "must match the enclosed submission",
            });
        }
        if !self.submission.is_finalized() {
            return Err(ContractViolation::InvalidValue {
                field: "offline_envelope.submission",
                reason: "only finalized submissions may be queued",
            });
        }
        if self.header.track_kind.evidence_kind() != self.submission.kind() {
            return Err(ContractViolation::InvalidValue {
                field: "offline_envelope.track_kind",
                reason: "must match the submission kind",
            });
        }
        self.submission.validate()
    }
}

fn bounded_error(msg: String) -> String {
    if msg.len() > MAX_ENVELOPE_ERROR_LEN {
        msg.chars().take(MAX_ENVELOPE_ERROR_LEN).collect()
    } else {
        msg
    }
}
