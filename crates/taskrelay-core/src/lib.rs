//! Core taskrelay library (job model, ledger, cursor, agent output, config).

pub mod config;
pub mod cursor;
pub mod job;
pub mod output;
pub mod store;
