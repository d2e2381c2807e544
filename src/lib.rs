//! Escrow lifecycle coordinator
//!
//! Keeps an off-chain record store (SQLite via diesel) in step with an
//! on-chain settlement ledger reached over JSON-RPC. Lifecycle
//! transitions flow through a single coordinator that authorizes the
//! actor, consults the pure state machine, fires the ledger call, and
//! commits through a compare-and-set on the stored status. Background
//! sweeps drive the time-based transitions (auto-release, auto-refund,
//! creation expiry) and a report-only reconciliation pass.

pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod models;
pub mod schema;
pub mod services;
pub mod state_machine;
