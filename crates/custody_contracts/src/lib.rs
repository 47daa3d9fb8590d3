#![forbid(unsafe_code)]

pub mod admission;
pub mod common;
pub mod envelope;
pub mod evidence;
pub mod ledger;
pub mod track;

pub use common::{ContractViolation, UnixTimeMs, Validate};
