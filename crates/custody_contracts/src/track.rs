#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::evidence::EvidenceKind;
use crate::{ContractViolation, Validate};

/// One category of evidence within a session. Declaration order is the canonical traversal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackKind {
    Testimony,
    Physical,
    Digital,
    DirectContact,
}

impl TrackKind {
    pub const CANONICAL_ORDER: [TrackKind; 4] = [
        TrackKind::Testimony,
        TrackKind::Physical,
        TrackKind::Digital,
        TrackKind::DirectContact,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Testimony => "testimony",
            Self::Physical => "physical",
            Self::Digital => "digital",
            Self::DirectContact => "direct-contact",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "testimony" => Some(Self::Testimony),
            "physical" => Some(Self::Physical),
            "digital" => Some(Self::Digital),
            "direct-contact" => Some(Self::DirectContact),
            _ => None,
        }
    }

    pub fn evidence_kind(self) -> EvidenceKind {
        match self {
            Self::Testimony => EvidenceKind::Testimony,
            Self::Physical => EvidenceKind::PhysicalNotice,
            Self::Digital => EvidenceKind::Document,
            Self::DirectContact => EvidenceKind::DirectContact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    En,
    Uk,
}

impl Locale {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "en" => Some(Self::En),
            "uk" => Some(Self::Uk),
            _ => None,
        }
    }
}

/// Persisted traversal position of the track queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub tracks: Vec<TrackKind>,
    pub cursor: usize,
}

impl QueueState {
    /// Canonicalizes a selection: fixed traversal order, duplicates removed, cursor at 0.
    pub fn from_selection(selection: &[TrackKind]) -> Result<Self, ContractViolation> {
        let mut tracks = selection.to_vec();
        tracks.sort();
        tracks.dedup();
        let state = Self { tracks, cursor: 0 };
        state.validate()?;
        Ok(state)
    }

    pub fn current(&self) -> Option<TrackKind> {
        self.tracks.get(self.cursor).copied()
    }

    pub fn remaining(&self) -> &[TrackKind] {
        self.tracks.get(self.cursor..).unwrap_or(&[])
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.tracks.len()
    }
}

impl Validate for QueueState {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.tracks.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "queue_state.tracks",
                reason: "must not be empty",
            });
        }
        if self.tracks.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ContractViolation::InvalidValue {
                field: "queue_state.tracks",
                reason: "must be unique and in canonical order",
            });
        }
        if self.cursor > self.tracks.len() {
            return Err(ContractViolation::InvalidRange {
                field: "queue_state.cursor",
                min: 0.0,
                max: self.tracks.len() as f64,
                got: self.cursor as f64,
            });
        }
        Ok(())
    }
}
