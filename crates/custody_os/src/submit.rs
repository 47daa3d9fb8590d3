#![forbid(unsafe_code)]

//! One submission, end to end: fingerprint and admission first, then the
//! ledger write, falling back to the offline queue on transient failure.
//!
//! `submit` never returns an error. Every path ends in an outcome that maps to
//! a localized status line and a concrete next action.

use std::sync::Arc;
use std::time::Duration;

use custody_contracts::admission::AdmissionTicket;
use custody_contracts::evidence::{EvidenceSubmission, Fingerprint, SubmissionId};
use custody_contracts::ledger::LedgerRecord;
use custody_contracts::track::{Locale, TrackKind};
use custody_contracts::UnixTimeMs;
use custody_engines::admission::{AdmissionChallenge, AdmissionGate};
use custody_engines::fingerprint::{FingerprintError, FingerprintService};
use custody_engines::track_labels::{notice, Notice, NoticeKey};
use custody_storage::envelope_store::EncryptedFileEnvelopeStore;

use crate::config::{CustodyConfig, LEDGER_REQUEST_TIMEOUT_MS_DEFAULT};
use crate::ledger_client::{
    EvidenceLedgerClient, HttpLedgerBackend, LedgerBackend, LedgerError,
    UnconfiguredLedgerBackend,
};
use crate::offline_queue::{deliver_with_timeout, OfflineQueue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    InvalidInput(String),
    DigestUnavailable(String),
    /// Kept as a dead letter; the submitter must use another channel.
    ServerRejected { status: u16, message: String },
    IntegrityFailure { computed: String, recorded: String },
    QueueUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Success {
        record: LedgerRecord,
        duplicate: bool,
    },
    Queued {
        submission_id: SubmissionId,
        fingerprint: Fingerprint,
    },
    Failed(FailureReason),
}

impl SubmitOutcome {
    pub fn notice_key(&self) -> NoticeKey {
        match self {
            Self::Success { .. } => NoticeKey::Delivered,
            Self::Queued { .. } => NoticeKey::Queued,
            Self::Failed(FailureReason::InvalidInput(_)) => NoticeKey::InvalidInput,
            Self::Failed(FailureReason::DigestUnavailable(_)) => NoticeKey::DigestUnavailable,
            Self::Failed(FailureReason::ServerRejected { .. }) => NoticeKey::ServerRejected,
            Self::Failed(FailureReason::IntegrityFailure { .. }) => NoticeKey::IntegrityFailure,
            Self::Failed(FailureReason::QueueUnavailable(_)) => NoticeKey::QueueUnavailable,
        }
    }

    pub fn notice(&self, locale: Locale) -> Notice {
        notice(self.notice_key(), locale)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Clone)]
pub struct SubmissionPipeline {
    fingerprints: Arc<FingerprintService>,
    gate: AdmissionGate,
    client: EvidenceLedgerClient,
    queue: OfflineQueue,
    network_timeout: Duration,
}

impl std::fmt::Debug for SubmissionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionPipeline")
            .field("gate", &self.gate)
            .field("network_timeout", &self.network_timeout)
            .finish_non_exhaustive()
    }
}

impl SubmissionPipeline {
    pub fn new(client: EvidenceLedgerClient, queue: OfflineQueue) -> Self {
        Self {
            fingerprints: Arc::new(FingerprintService::default()),
            gate: AdmissionGate::default(),
            client,
            queue,
            network_timeout: Duration::from_millis(LEDGER_REQUEST_TIMEOUT_MS_DEFAULT),
        }
    }

    /// HTTP ledger when an endpoint is configured. Without one every
    /// submission is queued in the encrypted store under the data directory.
    pub fn from_config(config: &CustodyConfig) -> Self {
        let backend: Arc<dyn LedgerBackend> = match config.ledger.clone() {
            Some(ledger) => Arc::new(HttpLedgerBackend::new(ledger)),
            None => {
                tracing::warn!("no ledger endpoint configured; submissions will be queued");
                Arc::new(UnconfiguredLedgerBackend)
            }
        };
        let store = EncryptedFileEnvelopeStore::in_dir(config.envelope_dir());
        let queue = OfflineQueue::new(Arc::new(store))
            .with_max_in_flight(config.flush_max_in_flight)
            .with_network_timeout(config.network_timeout());
        Self::new(EvidenceLedgerClient::new(backend), queue)
            .with_gate(config.admission_gate())
            .with_network_timeout(config.network_timeout())
    }

    pub fn with_fingerprints(mut self, fingerprints: Arc<FingerprintService>) -> Self {
        self.fingerprints = fingerprints;
        self
    }

    pub fn with_gate(mut self, gate: AdmissionGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn client(&self) -> &EvidenceLedgerClient {
        &self.client
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub async fn submit(&self, track: TrackKind, submission: EvidenceSubmission) -> SubmitOutcome {
        if track.evidence_kind() != submission.kind() {
            return SubmitOutcome::Failed(FailureReason::InvalidInput(format!(
                "track {} does not take {} evidence",
                track.as_str(),
                submission.kind().as_str()
            )));
        }
        let submission = match self.finalize(submission).await {
            Ok(s) => s,
            Err(reason) => return SubmitOutcome::Failed(reason),
        };
        let (id, fingerprint) = match submission.fingerprint() {
            Some(fp) => (submission.id(), fp.clone()),
            None => {
                return SubmitOutcome::Failed(FailureReason::InvalidInput(
                    "submission was not finalized".to_string(),
                ))
            }
        };

        match deliver_with_timeout(self.client.clone(), submission.clone(), self.network_timeout)
            .await
        {
            Ok(ack) => SubmitOutcome::Success {
                record: ack.record,
                duplicate: ack.duplicate,
            },
            Err(LedgerError::TransientNetwork { message, .. }) => {
                tracing::info!(submission_id = %id, reason = %message, "ledger unreachable; queueing");
                match self.queue.enqueue(track, submission, UnixTimeMs::now()) {
                    Ok(_) => SubmitOutcome::Queued {
                        submission_id: id,
                        fingerprint,
                    },
                    Err(err) => {
                        tracing::error!(submission_id = %id, error = %err, "offline queue unavailable");
                        SubmitOutcome::Failed(FailureReason::QueueUnavailable(err.to_string()))
                    }
                }
            }
            Err(LedgerError::Validation(message)) => {
                SubmitOutcome::Failed(FailureReason::InvalidInput(message))
            }
            Err(LedgerError::ServerRejection { status, message }) => {
                if let Err(err) =
                    self.queue
                        .park_rejected(track, submission, &message, UnixTimeMs::now())
                {
                    return SubmitOutcome::Failed(FailureReason::QueueUnavailable(err.to_string()));
                }
                SubmitOutcome::Failed(FailureReason::ServerRejected { status, message })
            }
            Err(LedgerError::Integrity { computed, recorded }) => {
                SubmitOutcome::Failed(FailureReason::IntegrityFailure { computed, recorded })
            }
        }
    }

    /// Freezes the fingerprint and attaches an admission ticket. Both are
    /// CPU-bound and run on the blocking pool concurrently.
    async fn finalize(
        &self,
        mut submission: EvidenceSubmission,
    ) -> Result<EvidenceSubmission, FailureReason> {
        if submission.is_finalized() {
            return Ok(submission);
        }
        let for_digest = submission.clone();
        let fingerprints = self.fingerprints.clone();
        let gate = self.gate;
        let (digest, ticket) = tokio::join!(
            tokio::task::spawn_blocking(move || fingerprints.fingerprint_submission(&for_digest)),
            tokio::task::spawn_blocking(move || gate.admit()),
        );

        let fingerprint = match digest {
            Ok(Ok(fp)) => fp,
            Ok(Err(FingerprintError::Invalid(v))) => {
                return Err(FailureReason::InvalidInput(v.to_string()))
            }
            Ok(Err(err)) => return Err(FailureReason::DigestUnavailable(err.to_string())),
            Err(join_err) => return Err(FailureReason::DigestUnavailable(join_err.to_string())),
        };
        let ticket = ticket.unwrap_or_else(|join_err| {
            tracing::warn!(error = %join_err, "admission worker failed; proceeding unverified");
            AdmissionTicket::unverified(
                AdmissionChallenge::issue(gate.difficulty_bits).seed_hex(),
                gate.difficulty_bits,
                0,
            )
        });
        let status = ticket.status;
        submission
            .finalize(fingerprint, ticket)
            .map_err(|v| FailureReason::InvalidInput(v.to_string()))?;
        tracing::info!(
            submission_id = %submission.id(),
            kind = submission.kind().as_str(),
            admission = status.as_str(),
            "submission finalized"
        );
        Ok(submission)
    }
}
