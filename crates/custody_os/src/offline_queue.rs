#![forbid(unsafe_code)]

//! Offline durability queue.
//!
//! Envelopes leave the store only after the ledger acknowledges them. A
//! flush dispatches pending envelopes in enqueue order with a bounded number
//! in flight; each completion is handled on its own, so one failure never
//! holds back the rest.
//!
//! `run_flusher` retries on its own: it ticks on a fixed interval and backs
//! off exponentially after failed flushes, never sooner than the ledger's
//! retry-after hint.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use custody_contracts::envelope::{EnvelopeHeader, EnvelopeState};
use custody_contracts::evidence::{EvidenceSubmission, SubmissionId};
use custody_contracts::track::TrackKind;
use custody_contracts::UnixTimeMs;
use custody_storage::envelope_store::{EnvelopeStore, EnvelopeStoreError};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;

use crate::config::{
    FLUSH_INTERVAL_MS_DEFAULT, FLUSH_MAX_BACKOFF_MS_DEFAULT, FLUSH_MAX_IN_FLIGHT_DEFAULT,
    LEDGER_REQUEST_TIMEOUT_MS_DEFAULT,
};
use crate::ledger_client::{
    EvidenceLedgerClient, LedgerAck, LedgerError, LEDGER_RETRY_AFTER_MS_DEFAULT,
};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] EnvelopeStoreError),
    #[error("flush halted: integrity violation for submission {submission_id}: {source}")]
    Integrity {
        submission_id: SubmissionId,
        source: LedgerError,
    },
    #[error("flush worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    AlreadyQueued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub dispatched: u32,
    pub delivered: u32,
    pub retry_scheduled: u32,
    pub dead_lettered: u32,
    pub remaining: u32,
    /// Largest retry-after hint among transient failures.
    pub retry_after_ms: Option<u32>,
}

/// Pacing of the background flusher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSchedule {
    pub interval: Duration,
    pub max_backoff: Duration,
}

impl Default for FlushSchedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(FLUSH_INTERVAL_MS_DEFAULT),
            max_backoff: Duration::from_millis(FLUSH_MAX_BACKOFF_MS_DEFAULT),
        }
    }
}

impl FlushSchedule {
    /// Wait before the next flush after `consecutive_failures` failed ones.
    ///
    /// Zero failures waits one interval. Each failure doubles it up to
    /// `max_backoff`; a retry-after hint is honored even above that cap.
    pub fn next_delay(&self, consecutive_failures: u32, retry_after_ms: Option<u32>) -> Duration {
        let factor = 1u32
            .checked_shl(consecutive_failures.min(16))
            .unwrap_or(u32::MAX);
        let backoff = self
            .interval
            .saturating_mul(factor)
            .min(self.max_backoff.max(self.interval));
        let hint = Duration::from_millis(u64::from(retry_after_ms.unwrap_or(0)));
        backoff.max(hint)
    }
}

/// Runs one blocking ledger write off the executor, bounded by `timeout`.
///
/// A timed-out write keeps running in the background; the caller treats it as
/// transient, and a later replay with the same id is a duplicate at worst.
pub async fn deliver_with_timeout(
    client: EvidenceLedgerClient,
    submission: EvidenceSubmission,
    timeout: Duration,
) -> Result<LedgerAck, LedgerError> {
    let job = tokio::task::spawn_blocking(move || client.write(&submission, UnixTimeMs::now()));
    match tokio::time::timeout(timeout, job).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(LedgerError::transient(
            format!("ledger worker failed: {join_err}"),
            LEDGER_RETRY_AFTER_MS_DEFAULT,
        )),
        Err(_) => Err(LedgerError::transient(
            format!("ledger write exceeded {} ms", timeout.as_millis()),
            LEDGER_RETRY_AFTER_MS_DEFAULT,
        )),
    }
}

#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<dyn EnvelopeStore>,
    max_in_flight: usize,
    network_timeout: Duration,
    flush_lock: Arc<AsyncMutex<()>>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("max_in_flight", &self.max_in_flight)
            .field("network_timeout", &self.network_timeout)
            .finish_non_exhaustive()
    }
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn EnvelopeStore>) -> Self {
        Self {
            store,
            max_in_flight: FLUSH_MAX_IN_FLIGHT_DEFAULT,
            network_timeout: Duration::from_millis(LEDGER_REQUEST_TIMEOUT_MS_DEFAULT),
            flush_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn enqueue(
        &self,
        track_kind: TrackKind,
        submission: EvidenceSubmission,
        now: UnixTimeMs,
    ) -> Result<EnqueueOutcome, QueueError> {
        let id = submission.id();
        match self.store.enqueue(track_kind, submission, now)? {
            Some(header) => {
                tracing::info!(
                    submission_id = %id,
                    track = track_kind.as_str(),
                    enqueue_seq = header.enqueue_seq,
                    "envelope queued"
                );
                Ok(EnqueueOutcome::Queued)
            }
            None => {
                tracing::debug!(submission_id = %id, "envelope already queued");
                Ok(EnqueueOutcome::AlreadyQueued)
            }
        }
    }

    /// Keeps a permanently rejected submission as a dead letter.
    pub fn park_rejected(
        &self,
        track_kind: TrackKind,
        submission: EvidenceSubmission,
        reason: &str,
        now: UnixTimeMs,
    ) -> Result<(), QueueError> {
        let id = submission.id();
        let mut header = match self.store.enqueue(track_kind, submission, now)? {
            Some(header) => header,
            None => self
                .store
                .headers()?
                .into_iter()
                .find(|h| h.submission_id == id)
                .ok_or(EnvelopeStoreError::NotFound(id))?,
        };
        header.dead_letter(reason);
        self.store.update(&header)?;
        tracing::warn!(submission_id = %id, "rejected submission kept as dead letter");
        Ok(())
    }

    pub fn pending(&self) -> Result<Vec<EnvelopeHeader>, QueueError> {
        Ok(self.list_in_state(EnvelopeState::Pending)?)
    }

    pub fn dead_letters(&self) -> Result<Vec<EnvelopeHeader>, QueueError> {
        Ok(self.list_in_state(EnvelopeState::DeadLetter)?)
    }

    /// Drops a dead-lettered envelope once the submitter has taken it elsewhere.
    pub fn discard_dead_letter(&self, id: &SubmissionId) -> Result<bool, QueueError> {
        let is_dead = self
            .dead_letters()?
            .iter()
            .any(|e| &e.submission_id == id);
        if !is_dead {
            return Ok(false);
        }
        Ok(self.store.remove(id)?)
    }

    fn list_in_state(
        &self,
        state: EnvelopeState,
    ) -> Result<Vec<EnvelopeHeader>, EnvelopeStoreError> {
        Ok(self
            .store
            .headers()?
            .into_iter()
            .filter(|h| h.state == state)
            .collect())
    }

    pub async fn flush(&self, client: &EvidenceLedgerClient) -> Result<FlushReport, QueueError> {
        let _flush_guard = self.flush_lock.lock().await;
        let pending = self.pending()?;
        let mut report = FlushReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let halted = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        for header in pending {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|err| QueueError::Worker(err.to_string()))?;
            if halted.load(Ordering::SeqCst) {
                break;
            }
            // Bodies are loaded at dispatch, so at most `max_in_flight` are held.
            let Some(envelope) = self.store.load(&header.submission_id)? else {
                continue;
            };
            report.dispatched += 1;
            let client = client.clone();
            let halted = halted.clone();
            let timeout = self.network_timeout;
            tasks.spawn(async move {
                let result = deliver_with_timeout(client, envelope.submission, timeout).await;
                if matches!(result, Err(LedgerError::Integrity { .. })) {
                    halted.store(true, Ordering::SeqCst);
                }
                drop(permit);
                (envelope.header, result)
            });
        }

        let mut integrity: Option<QueueError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (mut header, result) =
                joined.map_err(|err| QueueError::Worker(err.to_string()))?;
            let id = header.submission_id;
            match result {
                Ok(ack) => {
                    self.store.remove(&id)?;
                    report.delivered += 1;
                    tracing::info!(
                        submission_id = %id,
                        duplicate = ack.duplicate,
                        "queued envelope delivered"
                    );
                }
                Err(err @ LedgerError::TransientNetwork { .. }) => {
                    if let LedgerError::TransientNetwork { retry_after_ms, .. } = &err {
                        report.retry_after_ms = report.retry_after_ms.max(Some(*retry_after_ms));
                    }
                    header.record_failure(err.to_string());
                    self.store.update(&header)?;
                    report.retry_scheduled += 1;
                    tracing::warn!(
                        submission_id = %id,
                        attempt_count = header.attempt_count,
                        error = %err,
                        "queued envelope delivery failed; will retry"
                    );
                }
                Err(err @ LedgerError::Integrity { .. }) => {
                    header.dead_letter(err.to_string());
                    self.store.update(&header)?;
                    report.dead_lettered += 1;
                    tracing::error!(submission_id = %id, error = %err, "flush halted");
                    if integrity.is_none() {
                        integrity = Some(QueueError::Integrity {
                            submission_id: id,
                            source: err,
                        });
                    }
                }
                Err(err) => {
                    header.dead_letter(err.to_string());
                    self.store.update(&header)?;
                    report.dead_lettered += 1;
                    tracing::warn!(
                        submission_id = %id,
                        error = %err,
                        "queued envelope permanently rejected; dead-lettered"
                    );
                }
            }
        }

        if let Some(err) = integrity {
            return Err(err);
        }
        report.remaining = u32::try_from(self.pending()?.len()).unwrap_or(u32::MAX);
        tracing::info!(
            dispatched = report.dispatched,
            delivered = report.delivered,
            retry_scheduled = report.retry_scheduled,
            dead_lettered = report.dead_lettered,
            remaining = report.remaining,
            "offline queue flush finished"
        );
        Ok(report)
    }

    /// Flushes on `schedule` until `shutdown` resolves.
    ///
    /// Store and worker errors are logged and retried with backoff. An
    /// integrity violation stops the loop and is returned.
    pub async fn run_flusher(
        &self,
        client: &EvidenceLedgerClient,
        schedule: FlushSchedule,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), QueueError> {
        tokio::pin!(shutdown);
        let mut consecutive_failures: u32 = 0;
        let mut delay = Duration::ZERO;
        tracing::info!(
            interval_ms = schedule.interval.as_millis() as u64,
            "offline queue flusher started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("offline queue flusher stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
            let retry_after_ms = match self.flush(client).await {
                Ok(report) if report.retry_scheduled > 0 => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    report.retry_after_ms
                }
                Ok(_) => {
                    consecutive_failures = 0;
                    None
                }
                Err(err @ QueueError::Integrity { .. }) => return Err(err),
                Err(err) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    tracing::warn!(error = %err, "offline queue flush failed; backing off");
                    None
                }
            };
            delay = schedule.next_delay(consecutive_failures, retry_after_ms);
            if consecutive_failures > 0 {
                tracing::debug!(
                    consecutive_failures,
                    delay_ms = delay.as_millis() as u64,
                    "next flush scheduled"
                );
            }
        }
    }
}
