#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use custody_contracts::admission::AdmissionTicket;
use custody_contracts::envelope::EnvelopeState;
use custody_contracts::evidence::{EvidenceKind, EvidencePayload, EvidenceSubmission, Fingerprint};
use custody_contracts::track::TrackKind;
use custody_contracts::UnixTimeMs;
use custody_storage::envelope_store::{
    EncryptedFileEnvelopeStore, EnvelopeStore, EnvelopeStoreError, ENVELOPE_INDEX_FILE,
    ENVELOPE_MASTER_KEY_FILE,
};

fn temp_dir(name: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    std::env::temp_dir().join(format!("custody-envelope-db-{name}-{suffix}"))
}

fn photo(bytes: Vec<u8>) -> EvidenceSubmission {
    let mut s = EvidenceSubmission::draft(
        EvidenceKind::Document,
        EvidencePayload::file("photo.jpg", "image/jpeg", bytes),
        UnixTimeMs(1_000),
    );
    s.finalize(
        Fingerprint::parse(&"ab".repeat(32)).unwrap(),
        AdmissionTicket::unverified("0".repeat(32), 16, 1),
    )
    .unwrap();
    s
}

#[test]
fn at_envelope_db_01_binary_payload_survives_reopen_byte_for_byte() {
    let dir = temp_dir("binary");
    let bytes: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let s = photo(bytes.clone());
    EncryptedFileEnvelopeStore::in_dir(dir.clone())
        .enqueue(TrackKind::Digital, s.clone(), UnixTimeMs(10))
        .unwrap();

    let reopened = EncryptedFileEnvelopeStore::in_dir(dir.clone());
    let headers = reopened.headers().unwrap();
    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].state, EnvelopeState::Pending);
    assert_eq!(headers[0].size_bytes, 4096);
    let loaded = reopened.load(&s.id()).unwrap().unwrap();
    assert_eq!(loaded.submission, s);
    match loaded.submission.payload() {
        EvidencePayload::File { bytes: stored, .. } => assert_eq!(stored, &bytes),
        EvidencePayload::Text { .. } => panic!("payload kind changed"),
    }
    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn at_envelope_db_02_corrupt_index_is_an_error_not_an_empty_queue() {
    let dir = temp_dir("corrupt");
    let store = EncryptedFileEnvelopeStore::in_dir(dir.clone());
    store
        .enqueue(TrackKind::Digital, photo(vec![1, 2, 3]), UnixTimeMs(10))
        .unwrap();
    fs::write(dir.join(ENVELOPE_INDEX_FILE), b"{\"schema_version\":1,").unwrap();

    assert!(matches!(store.headers(), Err(EnvelopeStoreError::Json(_))));
    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn at_envelope_db_03_foreign_master_key_cannot_decrypt() {
    let dir = temp_dir("key");
    EncryptedFileEnvelopeStore::in_dir(dir.clone())
        .enqueue(TrackKind::Digital, photo(vec![9; 32]), UnixTimeMs(10))
        .unwrap();
    let other = temp_dir("key-other");
    let foreign = EncryptedFileEnvelopeStore::with_key_path(
        dir.clone(),
        other.join(ENVELOPE_MASTER_KEY_FILE),
    );

    assert!(matches!(foreign.headers(), Err(EnvelopeStoreError::Crypto)));
    fs::remove_dir_all(dir).unwrap();
    fs::remove_dir_all(other).unwrap();
}

#[cfg(unix)]
#[test]
fn at_envelope_db_04_master_key_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = temp_dir("perms");
    EncryptedFileEnvelopeStore::in_dir(dir.clone())
        .enqueue(TrackKind::Digital, photo(vec![5; 8]), UnixTimeMs(10))
        .unwrap();
    let mode = fs::metadata(dir.join(ENVELOPE_MASTER_KEY_FILE))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn at_envelope_db_05_large_queue_loads_one_body_at_a_time() {
    let dir = temp_dir("many");
    let store = EncryptedFileEnvelopeStore::in_dir(dir.clone());
    let mut ids = Vec::new();
    for i in 0..5u8 {
        let s = photo(vec![i; 64 * 1024]);
        ids.push(s.id());
        store
            .enqueue(TrackKind::Digital, s, UnixTimeMs(10))
            .unwrap();
    }
    let index_len = fs::metadata(dir.join(ENVELOPE_INDEX_FILE)).unwrap().len();
    assert!(index_len < 16 * 1024);

    let mut header = store.headers().unwrap()[2].clone();
    header.record_failure("offline");
    store.update(&header).unwrap();
    assert!(store.remove(&ids[0]).unwrap());

    let remaining: Vec<_> = store
        .headers()
        .unwrap()
        .into_iter()
        .map(|h| h.submission_id)
        .collect();
    assert_eq!(remaining, ids[1..].to_vec());
    let third = store.load(&ids[2]).unwrap().unwrap();
    assert_eq!(third.header.attempt_count, 1);
    match third.submission.payload() {
        EvidencePayload::File { bytes, .. } => assert_eq!(bytes, &vec![2u8; 64 * 1024]),
        EvidencePayload::Text { .. } => panic!("payload kind changed"),
    }
    fs::remove_dir_all(dir).unwrap();
}
