#![forbid(unsafe_code)]

//! Evidence ledger client.
//!
//! Every submission is written in two phases: its content goes to a
//! content-addressed blob path, then a ledger row referencing that path is
//! inserted. Files upload their raw bytes; text evidence uploads its
//! canonical encoding, so either blob re-hashes to the fingerprint. The blob
//! path is a pure function of `created_at` and the fingerprint, and blob
//! uploads are idempotent, so the pair is always retried together: a replay
//! re-uploads the same bytes to the same path and then inserts the row. The
//! ledger refuses rows whose blob is missing or does not match.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use custody_contracts::evidence::{EvidenceSubmission, Fingerprint};
use custody_contracts::ledger::{
    LedgerRecord, LedgerWriteOutcome, LedgerWriteRequest, LedgerWriteResponse,
};
use custody_contracts::UnixTimeMs;
use custody_engines::fingerprint::{DeliveryContent, FingerprintService};
use custody_storage::ledger::{LedgerAppendOutcome, LedgerStore, StorageError};
use thiserror::Error;

use crate::config::HttpLedgerConfig;

pub const LEDGER_UNIT_ATTEMPTS_DEFAULT: u16 = 3;
pub const LEDGER_RETRY_AFTER_MS_DEFAULT: u32 = 30_000;
const MAX_ERROR_MESSAGE_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Malformed record. Fix locally; never retried.
    #[error("ledger validation error: {0}")]
    Validation(String),
    /// Network loss or server unavailability. Hand off to the offline queue.
    #[error("transient ledger delivery error: {message}")]
    TransientNetwork { message: String, retry_after_ms: u32 },
    /// Quota or policy refusal. Surface to the submitter; never dropped.
    #[error("ledger rejected submission (status {status}): {message}")]
    ServerRejection { status: u16, message: String },
    /// The ledger holds a different fingerprint than the one computed before delivery.
    #[error("integrity violation: computed {computed}, ledger holds {recorded}")]
    Integrity { computed: String, recorded: String },
}

impl LedgerError {
    pub fn transient(message: impl Into<String>, retry_after_ms: u32) -> Self {
        Self::TransientNetwork {
            message: bounded(message.into()),
            retry_after_ms: retry_after_ms.clamp(1_000, 300_000),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerAck {
    pub record: LedgerRecord,
    pub duplicate: bool,
}

/// Remote append-only storage as seen by the client.
pub trait LedgerBackend: Send + Sync {
    fn put_blob(&self, path: &str, media_type: &str, bytes: &[u8]) -> Result<(), LedgerError>;
    fn insert_record(&self, req: &LedgerWriteRequest) -> Result<LedgerAck, LedgerError>;
}

pub fn storage_error_to_ledger_error(err: StorageError) -> LedgerError {
    match err {
        StorageError::ContractViolation(v) => LedgerError::Validation(v.to_string()),
        StorageError::ForeignKeyViolation { .. } | StorageError::ContentMismatch { .. } => {
            LedgerError::Validation(err.to_string())
        }
        StorageError::DuplicateKey { .. } | StorageError::AppendOnlyViolation { .. } => {
            LedgerError::ServerRejection {
                status: 409,
                message: err.to_string(),
            }
        }
        StorageError::QuotaExceeded { .. } => LedgerError::ServerRejection {
            status: 413,
            message: err.to_string(),
        },
        StorageError::Io(_) | StorageError::Corrupt { .. } => {
            LedgerError::transient(err.to_string(), LEDGER_RETRY_AFTER_MS_DEFAULT)
        }
    }
}

/// Stands in when no ledger endpoint is configured. Every write is transient,
/// so submissions stay in the durable offline queue until one is.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredLedgerBackend;

impl UnconfiguredLedgerBackend {
    fn unavailable() -> LedgerError {
        LedgerError::transient(
            "no ledger endpoint configured; set CUSTODY_LEDGER_ENDPOINT",
            LEDGER_RETRY_AFTER_MS_DEFAULT,
        )
    }
}

impl LedgerBackend for UnconfiguredLedgerBackend {
    fn put_blob(&self, _path: &str, _media_type: &str, _bytes: &[u8]) -> Result<(), LedgerError> {
        Err(Self::unavailable())
    }

    fn insert_record(&self, _req: &LedgerWriteRequest) -> Result<LedgerAck, LedgerError> {
        Err(Self::unavailable())
    }
}

/// In-process ledger with an online switch and fault injection.
#[derive(Debug, Default)]
pub struct LoopbackLedgerBackend {
    store: Mutex<LedgerStore>,
    offline: AtomicBool,
    failing_record_inserts: AtomicU32,
    record_insert_calls: AtomicU64,
}

impl LoopbackLedgerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: LedgerStore) -> Self {
        Self {
            store: Mutex::new(store),
            ..Self::default()
        }
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// The next `n` row inserts fail transiently even when online.
    pub fn fail_next_record_inserts(&self, n: u32) {
        self.failing_record_inserts.store(n, Ordering::SeqCst);
    }

    pub fn record_insert_calls(&self) -> u64 {
        self.record_insert_calls.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<LedgerRecord> {
        self.store
            .lock()
            .map(|s| s.records().to_vec())
            .unwrap_or_default()
    }

    pub fn blob(&self, path: &str) -> Option<Vec<u8>> {
        self.store
            .lock()
            .ok()
            .and_then(|s| s.blob(path).ok().flatten())
    }

    pub fn blob_count(&self) -> usize {
        self.store.lock().map(|s| s.blob_count()).unwrap_or(0)
    }

    fn ensure_online(&self) -> Result<(), LedgerError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LedgerError::transient(
                "loopback ledger offline",
                LEDGER_RETRY_AFTER_MS_DEFAULT,
            ));
        }
        Ok(())
    }

    fn lock_store(&self) -> Result<std::sync::MutexGuard<'_, LedgerStore>, LedgerError> {
        self.store.lock().map_err(|_| {
            LedgerError::transient("loopback ledger lock poisoned", LEDGER_RETRY_AFTER_MS_DEFAULT)
        })
    }
}

impl LedgerBackend for LoopbackLedgerBackend {
    fn put_blob(&self, path: &str, _media_type: &str, bytes: &[u8]) -> Result<(), LedgerError> {
        self.ensure_online()?;
        self.lock_store()?
            .put_blob(path, bytes)
            .map(|_| ())
            .map_err(storage_error_to_ledger_error)
    }

    fn insert_record(&self, req: &LedgerWriteRequest) -> Result<LedgerAck, LedgerError> {
        self.record_insert_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;
        let injected = self
            .failing_record_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(LedgerError::transient(
                "loopback ledger injected insert failure",
                LEDGER_RETRY_AFTER_MS_DEFAULT,
            ));
        }
        let outcome = self
            .lock_store()?
            .append_record(req.clone(), UnixTimeMs::now())
            .map_err(storage_error_to_ledger_error)?;
        Ok(match outcome {
            LedgerAppendOutcome::Accepted(record) => LedgerAck {
                record,
                duplicate: false,
            },
            LedgerAppendOutcome::Duplicate(record) => LedgerAck {
                record,
                duplicate: true,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpLedgerBackend {
    config: HttpLedgerConfig,
    agent: ureq::Agent,
}

impl HttpLedgerBackend {
    pub fn new(config: HttpLedgerConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
            .timeout_read(Duration::from_millis(config.request_timeout_ms))
            .timeout_write(Duration::from_millis(config.request_timeout_ms))
            .build();
        Self { config, agent }
    }

    fn authorize(&self, req: ureq::Request) -> ureq::Request {
        match self.config.bearer_token.as_ref() {
            Some(token) => req.set("authorization", &format!("Bearer {token}")),
            None => req,
        }
    }
}

impl LedgerBackend for HttpLedgerBackend {
    fn put_blob(&self, path: &str, media_type: &str, bytes: &[u8]) -> Result<(), LedgerError> {
        let url = format!("{}/{}", self.config.blobs_endpoint, path);
        let req = self
            .authorize(self.agent.put(&url))
            .set("content-type", media_type)
            .set("idempotency-key", path);
        match req.send_bytes(bytes) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, resp)) => {
                let retry_after = resp.header("retry-after").map(str::to_string);
                let body = resp.into_string().unwrap_or_default();
                Err(classify_status(code, retry_after.as_deref(), body))
            }
            Err(ureq::Error::Transport(err)) => Err(LedgerError::transient(
                format!("blob upload transport error: {err}"),
                LEDGER_RETRY_AFTER_MS_DEFAULT,
            )),
        }
    }

    fn insert_record(&self, req: &LedgerWriteRequest) -> Result<LedgerAck, LedgerError> {
        let payload = serde_json::to_string(req)
            .map_err(|err| LedgerError::Validation(format!("record encode failed: {err}")))?;
        let id = req.id.to_string();
        let http = self
            .authorize(self.agent.post(&self.config.records_endpoint))
            .set("content-type", "application/json")
            .set("idempotency-key", &id);
        match http.send_string(&payload) {
            Ok(resp) => {
                let body = resp.into_string().map_err(|err| {
                    LedgerError::transient(
                        format!("ledger response read failed: {err}"),
                        LEDGER_RETRY_AFTER_MS_DEFAULT,
                    )
                })?;
                parse_write_response(&body)
            }
            Err(ureq::Error::Status(code, resp)) => {
                let retry_after = resp.header("retry-after").map(str::to_string);
                let body = resp.into_string().unwrap_or_default();
                let reason = serde_json::from_str::<LedgerWriteResponse>(&body)
                    .ok()
                    .and_then(|r| r.reason)
                    .unwrap_or(body);
                Err(classify_status(code, retry_after.as_deref(), reason))
            }
            Err(ureq::Error::Transport(err)) => Err(LedgerError::transient(
                format!("ledger transport error: {err}"),
                LEDGER_RETRY_AFTER_MS_DEFAULT,
            )),
        }
    }
}

fn parse_write_response(body: &str) -> Result<LedgerAck, LedgerError> {
    // An unreadable 2xx body means the write may or may not have landed; replay is safe.
    let resp: LedgerWriteResponse = serde_json::from_str(body).map_err(|err| {
        LedgerError::transient(
            format!("ledger response decode failed: {err}"),
            LEDGER_RETRY_AFTER_MS_DEFAULT,
        )
    })?;
    match (resp.outcome, resp.record) {
        (LedgerWriteOutcome::Accepted, Some(record)) => Ok(LedgerAck {
            record,
            duplicate: false,
        }),
        (LedgerWriteOutcome::Duplicate, Some(record)) => Ok(LedgerAck {
            record,
            duplicate: true,
        }),
        (LedgerWriteOutcome::Rejected, _) => Err(LedgerError::ServerRejection {
            status: 200,
            message: bounded(resp.reason.unwrap_or_default()),
        }),
        (_, None) => Err(LedgerError::transient(
            "ledger acknowledged without a record",
            LEDGER_RETRY_AFTER_MS_DEFAULT,
        )),
    }
}

pub fn classify_status(code: u16, retry_after: Option<&str>, message: String) -> LedgerError {
    let message = bounded(message);
    match code {
        400 | 422 => LedgerError::Validation(message),
        403 | 409 | 413 | 429 => LedgerError::ServerRejection {
            status: code,
            message,
        },
        408 | 500..=599 => LedgerError::transient(
            format!("ledger http status {code}: {message}"),
            parse_retry_after_ms(retry_after),
        ),
        _ => LedgerError::ServerRejection {
            status: code,
            message,
        },
    }
}

fn parse_retry_after_ms(retry_after_header: Option<&str>) -> u32 {
    let Some(header) = retry_after_header else {
        return LEDGER_RETRY_AFTER_MS_DEFAULT;
    };
    header
        .trim()
        .parse::<u32>()
        .ok()
        .map(|s| s.saturating_mul(1_000))
        .filter(|ms| (1_000..=300_000).contains(ms))
        .unwrap_or(LEDGER_RETRY_AFTER_MS_DEFAULT)
}

fn bounded(msg: String) -> String {
    if msg.len() > MAX_ERROR_MESSAGE_LEN {
        msg.chars().take(MAX_ERROR_MESSAGE_LEN).collect()
    } else {
        msg
    }
}

#[derive(Clone)]
pub struct EvidenceLedgerClient {
    backend: Arc<dyn LedgerBackend>,
    unit_attempts: u16,
}

impl std::fmt::Debug for EvidenceLedgerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceLedgerClient")
            .field("unit_attempts", &self.unit_attempts)
            .finish_non_exhaustive()
    }
}

impl EvidenceLedgerClient {
    pub fn new(backend: Arc<dyn LedgerBackend>) -> Self {
        Self {
            backend,
            unit_attempts: LEDGER_UNIT_ATTEMPTS_DEFAULT,
        }
    }

    pub fn with_unit_attempts(mut self, attempts: u16) -> Self {
        self.unit_attempts = attempts.max(1);
        self
    }

    /// Delivers a finalized submission. Blocking; run it off the async executor.
    pub fn write(
        &self,
        submission: &EvidenceSubmission,
        now: UnixTimeMs,
    ) -> Result<LedgerAck, LedgerError> {
        let fingerprint = submission.fingerprint().cloned().ok_or_else(|| {
            LedgerError::Validation("submission must be finalized before delivery".to_string())
        })?;
        let content = FingerprintService::default()
            .delivery_content(submission)
            .map_err(|err| LedgerError::Validation(err.to_string()))?;
        let req = LedgerWriteRequest::for_submission(
            submission,
            content.content_ref(submission.created_at(), &fingerprint),
            now,
        )
        .map_err(|v| LedgerError::Validation(v.to_string()))?;

        let mut attempt: u16 = 0;
        loop {
            attempt += 1;
            match self.write_unit(&content, &req) {
                Ok(ack) => {
                    verify_ack(&fingerprint, &req, &ack)?;
                    tracing::info!(
                        submission_id = %req.id,
                        fingerprint = %fingerprint,
                        duplicate = ack.duplicate,
                        "ledger write acknowledged"
                    );
                    return Ok(ack);
                }
                Err(err) if err.is_transient() && attempt < self.unit_attempts => {
                    tracing::warn!(
                        submission_id = %req.id,
                        attempt,
                        error = %err,
                        "ledger write unit failed; retrying blob and row together"
                    );
                }
                Err(err) => {
                    tracing::warn!(submission_id = %req.id, attempt, error = %err, "ledger write failed");
                    return Err(err);
                }
            }
        }
    }

    fn write_unit(
        &self,
        content: &DeliveryContent<'_>,
        req: &LedgerWriteRequest,
    ) -> Result<LedgerAck, LedgerError> {
        self.backend
            .put_blob(&req.metadata.storage_path, &content.media_type, &content.bytes)?;
        self.backend.insert_record(req)
    }
}

fn verify_ack(
    computed: &Fingerprint,
    req: &LedgerWriteRequest,
    ack: &LedgerAck,
) -> Result<(), LedgerError> {
    if &ack.record.fingerprint != computed || ack.record.submission_id != req.id {
        tracing::error!(
            submission_id = %req.id,
            computed = %computed,
            recorded = %ack.record.fingerprint,
            "ledger acknowledged a different fingerprint"
        );
        return Err(LedgerError::Integrity {
            computed: computed.to_string(),
            recorded: ack.record.fingerprint.to_string(),
        });
    }
    Ok(())
}
