#![forbid(unsafe_code)]

pub mod custody_cli;
