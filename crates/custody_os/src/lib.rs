#![forbid(unsafe_code)]

pub mod config;
pub mod ledger_client;
pub mod offline_queue;
pub mod submit;
pub mod track_queue;
