#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use custody_contracts::admission::{
    AdmissionStatus, AdmissionTicket, CHALLENGE_SEED_LEN, MAX_DIFFICULTY_BITS,
    MIN_DIFFICULTY_BITS,
};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const ADMISSION_DIFFICULTY_BITS_DEFAULT: u8 = 16;
pub const ADMISSION_BUDGET_MS_DEFAULT: u64 = 2_000;
pub const ADMISSION_MAX_ATTEMPTS_DEFAULT: u64 = 1 << 22;
const CLOCK_CHECK_INTERVAL: u64 = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionChallenge {
    pub seed: [u8; CHALLENGE_SEED_LEN],
    pub difficulty_bits: u8,
}

impl AdmissionChallenge {
    pub fn issue(difficulty_bits: u8) -> Self {
        let mut seed = [0u8; CHALLENGE_SEED_LEN];
        OsRng.fill_bytes(&mut seed);
        Self::with_seed(seed, difficulty_bits)
    }

    pub fn with_seed(seed: [u8; CHALLENGE_SEED_LEN], difficulty_bits: u8) -> Self {
        Self {
            seed,
            difficulty_bits: difficulty_bits.clamp(MIN_DIFFICULTY_BITS, MAX_DIFFICULTY_BITS),
        }
    }

    pub fn seed_hex(&self) -> String {
        self.seed.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolveBudget {
    pub max_duration: Duration,
    pub max_attempts: u64,
}

impl Default for SolveBudget {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_millis(ADMISSION_BUDGET_MS_DEFAULT),
            max_attempts: ADMISSION_MAX_ATTEMPTS_DEFAULT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveOutcome {
    Solved { nonce: u64, attempts: u64 },
    Exhausted { attempts: u64 },
}

pub fn pow_digest(seed: &[u8], nonce: u64) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(seed);
    h.update(nonce.to_be_bytes());
    h.finalize().into()
}

pub fn leading_zero_bits(digest: &[u8; 32]) -> u32 {
    let mut bits = 0;
    for b in digest {
        if *b == 0 {
            bits += 8;
            continue;
        }
        bits += b.leading_zeros();
        break;
    }
    bits
}

pub fn verify(seed: &[u8], nonce: u64, difficulty_bits: u8) -> bool {
    leading_zero_bits(&pow_digest(seed, nonce)) >= u32::from(difficulty_bits)
}

pub fn parse_seed_hex(raw: &str) -> Option<[u8; CHALLENGE_SEED_LEN]> {
    if raw.len() != CHALLENGE_SEED_LEN * 2 || !raw.is_ascii() {
        return None;
    }
    let mut seed = [0u8; CHALLENGE_SEED_LEN];
    for (i, out) in seed.iter_mut().enumerate() {
        *out = u8::from_str_radix(&raw[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(seed)
}

/// Re-checks a ticket the way the ledger does. A ticket is only `Verified`
/// when its nonce solves its own seed at no less than `floor_bits`.
pub fn verify_ticket(ticket: &AdmissionTicket, floor_bits: u8) -> AdmissionStatus {
    let (AdmissionStatus::Verified, Some(nonce)) = (ticket.status, ticket.nonce) else {
        return AdmissionStatus::Unverified;
    };
    if ticket.difficulty_bits < floor_bits {
        return AdmissionStatus::Unverified;
    }
    match parse_seed_hex(&ticket.challenge_seed) {
        Some(seed) if verify(&seed, nonce, ticket.difficulty_bits) => AdmissionStatus::Verified,
        _ => AdmissionStatus::Unverified,
    }
}

/// Searches nonces from 0 upward until the target is met or the budget runs out.
pub fn solve(challenge: &AdmissionChallenge, budget: SolveBudget) -> SolveOutcome {
    let started = Instant::now();
    let target = u32::from(challenge.difficulty_bits);
    let mut attempts: u64 = 0;
    let mut nonce: u64 = 0;
    while attempts < budget.max_attempts {
        attempts += 1;
        if leading_zero_bits(&pow_digest(&challenge.seed, nonce)) >= target {
            return SolveOutcome::Solved { nonce, attempts };
        }
        nonce = nonce.wrapping_add(1);
        if attempts % CLOCK_CHECK_INTERVAL == 0 && started.elapsed() >= budget.max_duration {
            break;
        }
    }
    SolveOutcome::Exhausted { attempts }
}

/// Client-side proof-of-work gate. Never blocks a submission: an exhausted
/// budget yields an unverified ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionGate {
    pub difficulty_bits: u8,
    pub budget: SolveBudget,
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self {
            difficulty_bits: ADMISSION_DIFFICULTY_BITS_DEFAULT,
            budget: SolveBudget::default(),
        }
    }
}

impl AdmissionGate {
    pub fn new(difficulty_bits: u8, budget: SolveBudget) -> Self {
        Self {
            difficulty_bits: difficulty_bits.clamp(MIN_DIFFICULTY_BITS, MAX_DIFFICULTY_BITS),
            budget,
        }
    }

    pub fn admit(&self) -> AdmissionTicket {
        self.admit_challenge(&AdmissionChallenge::issue(self.difficulty_bits))
    }

    pub fn admit_challenge(&self, challenge: &AdmissionChallenge) -> AdmissionTicket {
        match solve(challenge, self.budget) {
            SolveOutcome::Solved { nonce, attempts } => {
                tracing::debug!(
                    difficulty_bits = challenge.difficulty_bits,
                    attempts,
                    "admission challenge solved"
                );
                AdmissionTicket::verified(
                    challenge.seed_hex(),
                    nonce,
                    challenge.difficulty_bits,
                    attempts,
                )
            }
            SolveOutcome::Exhausted { attempts } => {
                tracing::warn!(
                    difficulty_bits = challenge.difficulty_bits,
                    attempts,
                    "admission budget exhausted; proceeding unverified"
                );
                AdmissionTicket::unverified(challenge.seed_hex(), challenge.difficulty_bits, attempts)
            }
        }
    }
}
