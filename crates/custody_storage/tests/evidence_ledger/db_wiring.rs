#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use custody_contracts::admission::{AdmissionStatus, AdmissionTicket};
use custody_contracts::evidence::{ContextField, EvidenceKind, SubmissionId};
use custody_contracts::ledger::{storage_path, LedgerMetadata, LedgerWriteRequest};
use custody_contracts::UnixTimeMs;
use custody_engines::admission::{AdmissionChallenge, AdmissionGate, SolveBudget};
use custody_engines::fingerprint::FingerprintService;
use custody_storage::ledger::{BlobPutOutcome, LedgerAppendOutcome, LedgerStore, StorageError};

fn temp_dir(name: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    std::env::temp_dir().join(format!("custody-ledger-db-{name}-{suffix}"))
}

fn unsolved() -> AdmissionTicket {
    AdmissionTicket::unverified("0".repeat(32), 16, 1)
}

/// Request for `bytes` stored at the path their fingerprint implies.
fn write_req(id: SubmissionId, bytes: &[u8], admission: AdmissionTicket) -> LedgerWriteRequest {
    let fingerprint = FingerprintService::default().fingerprint_bytes(bytes).unwrap();
    LedgerWriteRequest {
        id,
        metadata: LedgerMetadata {
            kind: EvidenceKind::Document,
            size_bytes: bytes.len() as u64,
            media_type: "image/png".to_string(),
            storage_path: storage_path(UnixTimeMs(1_000), &fingerprint, "png"),
            context_fields: Vec::new(),
            contact_info: None,
            context_fingerprint: None,
            admission,
            created_at: UnixTimeMs(1_000),
        },
        fingerprint,
        timestamp: UnixTimeMs(2_000),
    }
}

fn put(store: &mut LedgerStore, bytes: &[u8]) -> LedgerWriteRequest {
    let req = write_req(SubmissionId::new_v4(), bytes, unsolved());
    store.put_blob(&req.metadata.storage_path, bytes).unwrap();
    req
}

#[test]
fn at_ledger_db_01_append_only_enforced() {
    let mut s = LedgerStore::new_in_memory();
    let req = put(&mut s, b"\x89PNG one");
    let id = req.id;
    s.append_record(req, UnixTimeMs(3_000)).unwrap();

    assert!(matches!(
        s.attempt_overwrite_record(&id),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
    assert_eq!(s.records().len(), 1);
}

#[test]
fn at_ledger_db_02_duplicate_id_returns_original_row() {
    let mut s = LedgerStore::new_in_memory();
    let req = put(&mut s, b"\x89PNG two");
    let first = s.append_record(req.clone(), UnixTimeMs(3_000)).unwrap();
    let second = s.append_record(req, UnixTimeMs(9_000)).unwrap();

    assert!(matches!(first, LedgerAppendOutcome::Accepted(_)));
    assert!(matches!(second, LedgerAppendOutcome::Duplicate(_)));
    assert_eq!(second.record().recorded_at, UnixTimeMs(3_000));
    assert_eq!(s.records().len(), 1);
}

#[test]
fn at_ledger_db_03_reused_id_with_other_fingerprint_rejected() {
    let mut s = LedgerStore::new_in_memory();
    let first = put(&mut s, b"original");
    let id = first.id;
    s.append_record(first, UnixTimeMs(3_000)).unwrap();

    let mut other = put(&mut s, b"different");
    other.id = id;
    assert!(matches!(
        s.append_record(other, UnixTimeMs(4_000)),
        Err(StorageError::DuplicateKey { .. })
    ));
    assert_eq!(s.records().len(), 1);
}

#[test]
fn at_ledger_db_04_row_without_blob_is_dangling_and_refused() {
    let mut s = LedgerStore::new_in_memory();
    let req = write_req(SubmissionId::new_v4(), b"\x89PNG", unsolved());
    let path = req.metadata.storage_path.clone();

    assert!(matches!(
        s.append_record(req.clone(), UnixTimeMs(3_000)),
        Err(StorageError::ForeignKeyViolation { .. })
    ));

    assert_eq!(s.put_blob(&path, b"\x89PNG").unwrap(), BlobPutOutcome::Stored);
    let out = s.append_record(req, UnixTimeMs(3_001)).unwrap();
    assert_eq!(out.record().storage_path, path);
    assert_eq!(s.blob(&path).unwrap().as_deref(), Some(&b"\x89PNG"[..]));
}

#[test]
fn at_ledger_db_05_blob_put_is_idempotent_but_never_overwrites() {
    let mut s = LedgerStore::new_in_memory();
    let f = FingerprintService::default().fingerprint_bytes(b"one").unwrap();
    let path = storage_path(UnixTimeMs(1_000), &f, "jpg");

    assert_eq!(s.put_blob(&path, b"one").unwrap(), BlobPutOutcome::Stored);
    assert_eq!(
        s.put_blob(&path, b"one").unwrap(),
        BlobPutOutcome::AlreadyStored
    );
    assert!(matches!(
        s.put_blob(&path, b"two"),
        Err(StorageError::DuplicateKey { .. })
    ));
    assert!(matches!(
        s.attempt_delete_blob(&path),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
    assert_eq!(s.blob_count(), 1);
}

#[test]
fn at_ledger_db_06_blob_quota_enforced() {
    let mut s = LedgerStore::with_blob_quota(8);
    let req = write_req(SubmissionId::new_v4(), &[1u8; 9], unsolved());
    assert!(matches!(
        s.put_blob(&req.metadata.storage_path, &[1u8; 9]),
        Err(StorageError::QuotaExceeded { .. })
    ));
    assert!(matches!(
        s.put_blob("../../etc/passwd", b"x"),
        Err(StorageError::ContractViolation(_))
    ));
}

#[test]
fn at_ledger_db_07_row_must_match_stored_content() {
    let mut s = LedgerStore::new_in_memory();
    let claimed = write_req(SubmissionId::new_v4(), b"what the row claims", unsolved());
    s.put_blob(&claimed.metadata.storage_path, b"what was uploaded")
        .unwrap();
    assert!(matches!(
        s.append_record(claimed, UnixTimeMs(3_000)),
        Err(StorageError::ContentMismatch { .. })
    ));

    let mut wrong_size = put(&mut s, b"twelve bytes");
    wrong_size.metadata.size_bytes = 13;
    assert!(matches!(
        s.append_record(wrong_size, UnixTimeMs(3_000)),
        Err(StorageError::ContentMismatch { .. })
    ));
    assert!(s.records().is_empty());
}

#[test]
fn at_ledger_db_08_file_context_must_be_covered_by_its_fingerprint() {
    let svc = FingerprintService::default();
    let mut s = LedgerStore::new_in_memory();
    let mut req = put(&mut s, b"scan of a notice");
    let fields = vec![ContextField {
        label: "place".to_string(),
        value: "Izium".to_string(),
    }];
    let bound = svc
        .file_context_fingerprint(EvidenceKind::Document, &req.fingerprint, None, &fields)
        .unwrap();
    req.metadata.context_fields = fields;
    req.metadata.context_fingerprint = bound;

    let mut tampered = req.clone();
    tampered.metadata.context_fields[0].value = "Kupiansk".to_string();
    assert!(matches!(
        s.append_record(tampered, UnixTimeMs(3_000)),
        Err(StorageError::ContentMismatch { .. })
    ));
    let record = s.append_record(req, UnixTimeMs(3_000)).unwrap().into_record();
    assert_eq!(record.context_fields[0].value, "Izium");
}

#[test]
fn at_ledger_db_09_admission_rechecked_and_seeds_spent_once() {
    let mut s = LedgerStore::new_in_memory().with_admission_floor(8);
    let mut forged = put(&mut s, b"claims verified");
    forged.metadata.admission = AdmissionTicket::verified("ab".repeat(16), 0, 30, 1);
    let forged = s.append_record(forged, UnixTimeMs(3_000)).unwrap();
    assert_eq!(forged.record().admission_status, AdmissionStatus::Unverified);
    assert_eq!(forged.record().admission.status, AdmissionStatus::Verified);

    let gate = AdmissionGate::new(8, SolveBudget::default());
    let solved = gate.admit_challenge(&AdmissionChallenge::with_seed([7u8; 16], 8));
    assert_eq!(solved.status, AdmissionStatus::Verified);

    let mut first = put(&mut s, b"honest one");
    first.metadata.admission = solved.clone();
    let first = s.append_record(first, UnixTimeMs(3_001)).unwrap();
    assert_eq!(first.record().admission_status, AdmissionStatus::Verified);

    let mut replayed = put(&mut s, b"honest two");
    replayed.metadata.admission = solved;
    let replayed = s.append_record(replayed, UnixTimeMs(3_002)).unwrap();
    assert_eq!(replayed.record().admission_status, AdmissionStatus::Unverified);
}

#[test]
fn at_ledger_db_10_durable_ledger_survives_reopen() {
    let dir = temp_dir("durable");
    let bytes = b"\x89PNG persisted evidence".to_vec();
    let req = {
        let mut s = LedgerStore::open_dir(&dir, 1024).unwrap();
        assert!(s.is_durable());
        let req = put(&mut s, &bytes);
        s.append_record(req.clone(), UnixTimeMs(3_000)).unwrap();
        req
    };

    let mut reopened = LedgerStore::open_dir(&dir, 1024).unwrap();
    assert_eq!(reopened.records().len(), 1);
    assert_eq!(reopened.records()[0].recorded_at, UnixTimeMs(3_000));
    assert_eq!(
        reopened.blob(&req.metadata.storage_path).unwrap(),
        Some(bytes.clone())
    );
    assert_eq!(
        reopened
            .put_blob(&req.metadata.storage_path, &bytes)
            .unwrap(),
        BlobPutOutcome::AlreadyStored
    );
    assert!(matches!(
        reopened.append_record(req, UnixTimeMs(9_000)).unwrap(),
        LedgerAppendOutcome::Duplicate(_)
    ));
    assert_eq!(LedgerStore::open_dir(&dir, 1024).unwrap().records().len(), 1);
    fs::remove_dir_all(dir).unwrap();
}
