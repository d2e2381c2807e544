//! Settlement-ledger abstraction
//!
//! The contract itself is a black box behind [`LedgerGateway`]; the
//! coordinator and scheduler only ever see the trait. Every mutating
//! call is at-least-once: the production implementation maps
//! "semantically already applied" contract errors to success, so callers
//! may retry freely.

pub mod events;
pub mod gateway;
pub mod rpc;

pub use events::{escrow_created_id, ParsedEvent, RawLog};
pub use gateway::{LedgerCreate, LedgerGateway};
pub use rpc::RpcLedgerGateway;
