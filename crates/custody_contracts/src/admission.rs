#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, Validate};

pub const MIN_DIFFICULTY_BITS: u8 = 1;
pub const MAX_DIFFICULTY_BITS: u8 = 32;
pub const CHALLENGE_SEED_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionStatus {
    Verified,
    /// Solving ran out of budget; the submission proceeds anyway.
    Unverified,
}

impl AdmissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Unverified => "unverified",
        }
    }
}

/// Proof-of-work evidence attached to a submission for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionTicket {
    /// Hex encoding of the 16-byte challenge seed.
    pub challenge_seed: String,
    pub nonce: Option<u64>,
    pub difficulty_bits: u8,
    pub attempts: u64,
    pub status: AdmissionStatus,
}

impl AdmissionTicket {
    pub fn verified(challenge_seed: String, nonce: u64, difficulty_bits: u8, attempts: u64) -> Self {
        Self {
            challenge_seed,
            nonce: Some(nonce),
            difficulty_bits,
            attempts,
            status: AdmissionStatus::Verified,
        }
    }

    pub fn unverified(challenge_seed: String, difficulty_bits: u8, attempts: u64) -> Self {
        Self {
            challenge_seed,
            nonce: None,
            difficulty_bits,
            attempts,
            status: AdmissionStatus::Unverified,
        }
    }
}

impl Validate for AdmissionTicket {
    fn validate(&self) -> Result<(), ContractViolation> {
        let seed_ok = self.challenge_seed.len() == CHALLENGE_SEED_LEN * 2
            && self
                .challenge_seed
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !seed_ok {
            return Err(ContractViolation::InvalidValue {
                field: "admission_ticket.challenge_seed",
                reason: "must be 32 lowercase hex chars",
            });
        }
        if !(MIN_DIFFICULTY_BITS..=MAX_DIFFICULTY_BITS).contains(&self.difficulty_bits) {
            return Err(ContractViolation::InvalidRange {
                field: "admission_ticket.difficulty_bits",
                min: MIN_DIFFICULTY_BITS as f64,
                max: MAX_DIFFICULTY_BITS as f64,
                got: self.difficulty_bits as f64,
            });
        }
        if self.status == AdmissionStatus::Verified && self.nonce.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "admission_ticket.nonce",
                reason: "verified tickets must carry a nonce",
            });
        }
        Ok(())
    }
}
