#![forbid(unsafe_code)]

pub mod admission;
pub mod fingerprint;
pub mod receipt;
pub mod track_labels;
