//! Database models

pub mod escrow;

pub use escrow::{Escrow, EscrowChanges, EscrowDraft};
