#![forbid(unsafe_code)]

//! HTTP surface of the evidence ledger: blob uploads and reads, append-only
//! record writes, record lookup and health. The shipped binary keeps its
//! ledger in a durable journal under `CUSTODY_LEDGER_DIR`.

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use custody_contracts::evidence::SubmissionId;
use custody_contracts::ledger::{LedgerRecord, LedgerWriteRequest, LedgerWriteResponse};
use custody_contracts::UnixTimeMs;
use custody_storage::ledger::{
    BlobPutOutcome, LedgerAppendOutcome, LedgerStore, StorageError,
    LEDGER_ADMISSION_FLOOR_BITS_DEFAULT, LEDGER_BLOB_MAX_BYTES_DEFAULT,
};
use serde::{Deserialize, Serialize};

/// Headroom over the blob quota so oversized uploads reach the store and get its 413.
const BODY_LIMIT_SLACK_BYTES: usize = 64 * 1024;
pub const LEDGER_DIR_DEFAULT: &str = "custody-ledger";

pub type SharedLedgerRuntime = Arc<Mutex<LedgerServiceRuntime>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHealthResponse {
    pub status: String,
    pub record_count: usize,
    pub blob_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPutResponse {
    pub status: String,
    pub outcome: String,
    pub path: String,
    pub reason: Option<String>,
}

impl BlobPutResponse {
    fn ok(path: &str, outcome: &str) -> Self {
        Self {
            status: "ok".to_string(),
            outcome: outcome.to_string(),
            path: path.to_string(),
            reason: None,
        }
    }

    fn rejected(path: &str, reason: String) -> Self {
        Self {
            status: "error".to_string(),
            outcome: "REJECTED".to_string(),
            path: path.to_string(),
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerServiceRuntime {
    store: LedgerStore,
}

impl LedgerServiceRuntime {
    pub fn new(store: LedgerStore) -> Self {
        Self { store }
    }

    /// Opens the durable ledger at `CUSTODY_LEDGER_DIR` with the configured
    /// blob quota and admission floor.
    pub fn default_from_env() -> Result<Self, StorageError> {
        let store = LedgerStore::open_dir(ledger_dir_from_env(), blob_max_bytes_from_env())?
            .with_admission_floor(admission_floor_bits_from_env());
        Ok(Self::new(store))
    }

    pub fn is_durable(&self) -> bool {
        self.store.is_durable()
    }

    pub fn blob_max_bytes(&self) -> usize {
        self.store.blob_max_bytes()
    }

    pub fn health_report(&self) -> LedgerHealthResponse {
        LedgerHealthResponse {
            status: "ok".to_string(),
            record_count: self.store.records().len(),
            blob_count: self.store.blob_count(),
        }
    }

    pub fn put_blob(&mut self, path: &str, bytes: &[u8]) -> (StatusCode, BlobPutResponse) {
        match self.store.put_blob(path, bytes) {
            Ok(BlobPutOutcome::Stored) => {
                tracing::info!(path, size = bytes.len(), "blob stored");
                (StatusCode::CREATED, BlobPutResponse::ok(path, "STORED"))
            }
            Ok(BlobPutOutcome::AlreadyStored) => {
                tracing::debug!(path, "blob already stored");
                (StatusCode::OK, BlobPutResponse::ok(path, "ALREADY_STORED"))
            }
            Err(err) => {
                let status = match &err {
                    StorageError::ContractViolation(_) => StatusCode::BAD_REQUEST,
                    _ => status_for_storage_error(&err),
                };
                tracing::warn!(path, status = status.as_u16(), error = %err, "blob rejected");
                (status, BlobPutResponse::rejected(path, err.to_string()))
            }
        }
    }

    pub fn write_record(
        &mut self,
        req: LedgerWriteRequest,
        now: UnixTimeMs,
    ) -> (StatusCode, LedgerWriteResponse) {
        let id = req.id;
        match self.store.append_record(req, now) {
            Ok(LedgerAppendOutcome::Accepted(record)) => {
                tracing::info!(submission_id = %id, fingerprint = %record.fingerprint, "ledger record accepted");
                (StatusCode::CREATED, LedgerWriteResponse::accepted(record))
            }
            Ok(LedgerAppendOutcome::Duplicate(record)) => {
                tracing::info!(submission_id = %id, "ledger record duplicate");
                (StatusCode::OK, LedgerWriteResponse::duplicate(record))
            }
            Err(err) => {
                let status = status_for_storage_error(&err);
                tracing::warn!(submission_id = %id, status = status.as_u16(), error = %err, "ledger record rejected");
                (status, LedgerWriteResponse::rejected(err.to_string()))
            }
        }
    }

    pub fn record(&self, raw_id: &str) -> Result<Option<LedgerRecord>, String> {
        let id = SubmissionId::parse(raw_id).map_err(|v| v.to_string())?;
        Ok(self.store.record(&id).cloned())
    }

    /// Stored bytes and the media type of the record that references them.
    pub fn blob(&self, path: &str) -> Result<Option<(String, Vec<u8>)>, StorageError> {
        let Some(bytes) = self.store.blob(path)? else {
            return Ok(None);
        };
        let media_type = self
            .store
            .records()
            .iter()
            .find(|r| r.storage_path == path)
            .map(|r| r.media_type.clone())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Ok(Some((media_type, bytes)))
    }
}

fn status_for_storage_error(err: &StorageError) -> StatusCode {
    match err {
        StorageError::ContractViolation(_) | StorageError::ForeignKeyViolation { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        StorageError::DuplicateKey { .. } | StorageError::AppendOnlyViolation { .. } => {
            StatusCode::CONFLICT
        }
        StorageError::ContentMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        StorageError::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        StorageError::Io(_) | StorageError::Corrupt { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn ledger_dir_from_env() -> PathBuf {
    env::var("CUSTODY_LEDGER_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(LEDGER_DIR_DEFAULT))
}

pub fn admission_floor_bits_from_env() -> u8 {
    env::var("CUSTODY_ADMISSION_FLOOR_BITS")
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .filter(|v| *v <= 32)
        .unwrap_or(LEDGER_ADMISSION_FLOOR_BITS_DEFAULT)
}

pub fn blob_max_bytes_from_env() -> usize {
    env::var("CUSTODY_BLOB_MAX_BYTES")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(LEDGER_BLOB_MAX_BYTES_DEFAULT)
}

pub fn router(runtime: SharedLedgerRuntime) -> Router {
    let body_limit = runtime
        .lock()
        .map(|r| r.blob_max_bytes())
        .unwrap_or(LEDGER_BLOB_MAX_BYTES_DEFAULT)
        .saturating_add(BODY_LIMIT_SLACK_BYTES);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/blobs/:path", get(get_blob).put(put_blob))
        .route("/v1/ledger/records", post(write_record))
        .route("/v1/ledger/records/:id", get(get_record))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(runtime)
}

const LOCK_POISONED: &str = "ledger runtime lock poisoned";

async fn healthz(
    State(runtime): State<SharedLedgerRuntime>,
) -> (StatusCode, Json<LedgerHealthResponse>) {
    match runtime.lock() {
        Ok(runtime) => (StatusCode::OK, Json(runtime.health_report())),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(LedgerHealthResponse {
                status: "error".to_string(),
                record_count: 0,
                blob_count: 0,
            }),
        ),
    }
}

async fn put_blob(
    State(runtime): State<SharedLedgerRuntime>,
    Path(path): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<BlobPutResponse>) {
    let mut runtime = match runtime.lock() {
        Ok(runtime) => runtime,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(BlobPutResponse::rejected(&path, LOCK_POISONED.to_string())),
            )
        }
    };
    let (status, response) = runtime.put_blob(&path, &body);
    (status, Json(response))
}

async fn get_blob(
    State(runtime): State<SharedLedgerRuntime>,
    Path(path): Path<String>,
) -> Response {
    let runtime = match runtime.lock() {
        Ok(runtime) => runtime,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, LOCK_POISONED).into_response(),
    };
    match runtime.blob(&path) {
        Ok(Some((media_type, bytes))) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, media_type)], bytes).into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            tracing::error!(path = %path, error = %err, "blob read failed");
            (status_for_storage_error(&err), err.to_string()).into_response()
        }
    }
}

async fn write_record(
    State(runtime): State<SharedLedgerRuntime>,
    Json(request): Json<LedgerWriteRequest>,
) -> (StatusCode, Json<LedgerWriteResponse>) {
    let mut runtime = match runtime.lock() {
        Ok(runtime) => runtime,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(LedgerWriteResponse::rejected(LOCK_POISONED)),
            )
        }
    };
    let (status, response) = runtime.write_record(request, UnixTimeMs::now());
    (status, Json(response))
}

async fn get_record(
    State(runtime): State<SharedLedgerRuntime>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Option<LedgerRecord>>) {
    let runtime = match runtime.lock() {
        Ok(runtime) => runtime,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, Json(None)),
    };
    match runtime.record(&id) {
        Ok(Some(record)) => (StatusCode::OK, Json(Some(record))),
        Ok(None) => (StatusCode::NOT_FOUND, Json(None)),
        Err(_) => (StatusCode::BAD_REQUEST, Json(None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_contracts::admission::{AdmissionStatus, AdmissionTicket};
    use custody_contracts::evidence::{EvidenceKind, EvidencePayload, EvidenceSubmission};
    use custody_contracts::ledger::{storage_path, LedgerWriteOutcome};
    use custody_engines::fingerprint::FingerprintService;
    use custody_os::config::HttpLedgerConfig;
    use custody_os::ledger_client::{EvidenceLedgerClient, HttpLedgerBackend, LedgerError};

    fn finalized(kind: EvidenceKind, payload: EvidencePayload) -> EvidenceSubmission {
        let mut s = EvidenceSubmission::draft(kind, payload, UnixTimeMs(1_700_000_000_000));
        let fp = FingerprintService::default().fingerprint_submission(&s).unwrap();
        s.finalize(fp, AdmissionTicket::unverified("0".repeat(32), 16, 3))
            .unwrap();
        s
    }

    fn photo() -> EvidenceSubmission {
        finalized(
            EvidenceKind::Document,
            EvidencePayload::file("photo.jpg", "image/jpeg", vec![0xff, 0xd8, 0xff, 0xe1]),
        )
    }

    fn request_for(s: &EvidenceSubmission) -> LedgerWriteRequest {
        let content = FingerprintService::default().delivery_content(s).unwrap();
        let content_ref = content.content_ref(s.created_at(), s.fingerprint().unwrap());
        LedgerWriteRequest::for_submission(s, content_ref, UnixTimeMs(1_700_000_000_500)).unwrap()
    }

    /// Uploads the submission's content and returns the matching write request.
    fn upload(rt: &mut LedgerServiceRuntime, s: &EvidenceSubmission) -> LedgerWriteRequest {
        let content = FingerprintService::default().delivery_content(s).unwrap();
        let req = request_for(s);
        assert!(rt
            .put_blob(&req.metadata.storage_path, &content.bytes)
            .0
            .is_success());
        req
    }

    fn temp_dir(name: &str) -> PathBuf {
        let suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(1);
        std::env::temp_dir().join(format!("custody-adapter-{name}-{suffix}"))
    }

    async fn serve(runtime: SharedLedgerRuntime) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(runtime)).await;
        });
        format!("http://{addr}")
    }

    #[test]
    fn at_adapter_01_blob_statuses() {
        let mut rt = LedgerServiceRuntime::new(LedgerStore::with_blob_quota(16));
        let s = photo();
        let path = request_for(&s).metadata.storage_path;

        assert_eq!(rt.put_blob(&path, b"abc").0, StatusCode::CREATED);
        assert_eq!(rt.put_blob(&path, b"abc").0, StatusCode::OK);
        assert_eq!(rt.put_blob(&path, b"xyz").0, StatusCode::CONFLICT);
        assert_eq!(rt.put_blob("../escape", b"abc").0, StatusCode::BAD_REQUEST);
        let other = storage_path(UnixTimeMs(5), s.fingerprint().unwrap(), "bin");
        assert_eq!(
            rt.put_blob(&other, &[0u8; 17]).0,
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn at_adapter_02_record_statuses() {
        let mut rt = LedgerServiceRuntime::new(LedgerStore::new_in_memory());
        let s = photo();
        let req = request_for(&s);

        let (status, body) = rt.write_record(req.clone(), UnixTimeMs(10));
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.outcome, LedgerWriteOutcome::Rejected);

        let path = req.metadata.storage_path.clone();
        rt.put_blob(&path, &[0xff, 0xd8, 0xff, 0xe1]);
        assert_eq!(rt.write_record(req.clone(), UnixTimeMs(11)).0, StatusCode::CREATED);
        let (status, body) = rt.write_record(req, UnixTimeMs(12));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.outcome, LedgerWriteOutcome::Duplicate);
        assert_eq!(body.record.unwrap().recorded_at, UnixTimeMs(11));
        assert_eq!(rt.health_report().record_count, 1);
    }

    #[test]
    fn at_adapter_03_record_lookup() {
        let mut rt = LedgerServiceRuntime::new(LedgerStore::new_in_memory());
        let s = finalized(EvidenceKind::Testimony, EvidencePayload::text("I witnessed X"));
        let req = upload(&mut rt, &s);
        assert_eq!(rt.write_record(req, UnixTimeMs(21)).0, StatusCode::CREATED);

        let found = rt.record(&s.id().to_string()).unwrap().unwrap();
        assert_eq!(Some(&found.fingerprint), s.fingerprint());
        assert!(found.storage_path.ends_with(".txt"));
        assert_eq!(found.admission_status, AdmissionStatus::Unverified);
        assert_eq!(rt.record(&SubmissionId::new_v4().to_string()).unwrap(), None);
        assert!(rt.record("not-a-uuid").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn at_adapter_04_http_backend_end_to_end() {
        let runtime: SharedLedgerRuntime =
            Arc::new(Mutex::new(LedgerServiceRuntime::new(LedgerStore::new_in_memory())));
        let base = serve(runtime.clone()).await;
        let client = EvidenceLedgerClient::new(Arc::new(HttpLedgerBackend::new(
            HttpLedgerConfig::for_base_url(&base),
        )));
        let s = photo();
        let expected = s.fingerprint().cloned();

        let (first, second) = tokio::task::spawn_blocking(move || {
            let first = client.write(&s, UnixTimeMs::now());
            let second = client.write(&s, UnixTimeMs::now());
            (first, second)
        })
        .await
        .unwrap();

        let first = first.unwrap();
        let second = second.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(Some(first.record.fingerprint), expected);
        let health = runtime.lock().unwrap().health_report();
        assert_eq!(health.record_count, 1);
        assert_eq!(health.blob_count, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn at_adapter_05_http_backend_maps_quota_to_rejection() {
        let runtime: SharedLedgerRuntime =
            Arc::new(Mutex::new(LedgerServiceRuntime::new(LedgerStore::with_blob_quota(2))));
        let base = serve(runtime).await;
        let client = EvidenceLedgerClient::new(Arc::new(HttpLedgerBackend::new(
            HttpLedgerConfig::for_base_url(&base),
        )));
        let s = photo();

        let err = tokio::task::spawn_blocking(move || client.write(&s, UnixTimeMs::now()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::ServerRejection { status: 413, .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn at_adapter_06_unreachable_ledger_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = EvidenceLedgerClient::new(Arc::new(HttpLedgerBackend::new(
            HttpLedgerConfig::for_base_url(&format!("http://{addr}")),
        )))
        .with_unit_attempts(1);
        let s = photo();

        let err = tokio::task::spawn_blocking(move || client.write(&s, UnixTimeMs::now()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn at_adapter_07_durable_runtime_keeps_records_across_restart() {
        let dir = temp_dir("durable");
        let s = finalized(EvidenceKind::Testimony, EvidencePayload::text("I witnessed X"));
        let path = {
            let mut rt = LedgerServiceRuntime::new(LedgerStore::open_dir(&dir, 1024).unwrap());
            assert!(rt.is_durable());
            let req = upload(&mut rt, &s);
            assert_eq!(rt.write_record(req.clone(), UnixTimeMs(30)).0, StatusCode::CREATED);
            req.metadata.storage_path
        };

        let mut rt = LedgerServiceRuntime::new(LedgerStore::open_dir(&dir, 1024).unwrap());
        assert_eq!(rt.health_report().record_count, 1);
        assert_eq!(rt.health_report().blob_count, 1);
        let found = rt.record(&s.id().to_string()).unwrap().unwrap();
        assert_eq!(found.recorded_at, UnixTimeMs(30));
        let (media_type, bytes) = rt.blob(&path).unwrap().unwrap();
        assert_eq!(media_type, "text/plain; charset=utf-8");
        assert_eq!(
            Some(&FingerprintService::default().fingerprint_bytes(&bytes).unwrap()),
            s.fingerprint()
        );
        let (status, body) = rt.write_record(request_for(&s), UnixTimeMs(40));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.outcome, LedgerWriteOutcome::Duplicate);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn at_adapter_08_blob_read_route() {
        let runtime: SharedLedgerRuntime =
            Arc::new(Mutex::new(LedgerServiceRuntime::new(LedgerStore::new_in_memory())));
        let s = photo();
        let path = {
            let mut rt = runtime.lock().unwrap();
            let req = upload(&mut rt, &s);
            rt.write_record(req.clone(), UnixTimeMs(50));
            req.metadata.storage_path
        };
        let base = serve(runtime).await;

        let (found, missing) = tokio::task::spawn_blocking(move || {
            let found = ureq::get(&format!("{base}/v1/blobs/{path}")).call().unwrap();
            let media_type = found.content_type().to_string();
            let mut bytes = Vec::new();
            std::io::Read::read_to_end(&mut found.into_reader(), &mut bytes).unwrap();
            let missing = ureq::get(&format!("{base}/v1/blobs/1_0000000000000000.bin"))
                .call()
                .map(|r| r.status())
                .unwrap_or_else(|e| match e {
                    ureq::Error::Status(code, _) => code,
                    ureq::Error::Transport(_) => 0,
                });
            ((media_type, bytes), missing)
        })
        .await
        .unwrap();

        assert_eq!(found.0, "image/jpeg");
        assert_eq!(found.1, vec![0xff, 0xd8, 0xff, 0xe1]);
        assert_eq!(missing, 404);
    }
}
