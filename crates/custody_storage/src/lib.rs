#![forbid(unsafe_code)]

pub mod envelope_store;
mod fsutil;
pub mod ledger;
pub mod session;
