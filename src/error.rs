//! Typed error taxonomy for escrow lifecycle operations
//!
//! Every fallible operation in the coordinator, record store, ledger
//! gateway, and scheduler resolves to one of these variants. The
//! propagation policy is encoded in the helper methods: request-terminal
//! errors are surfaced as-is, `StaleState` invites a reload-and-retry,
//! and `ChainCall` is logged but does not necessarily block the
//! off-chain commit (see the coordinator for which transitions tolerate it).

use thiserror::Error;

/// Errors that can occur while driving an escrow through its lifecycle
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Malformed or incomplete request (empty proof, zero amount, ...)
    #[error("invalid request: {0}")]
    Validation(String),

    /// No escrow with the given id
    #[error("escrow {0} not found")]
    NotFound(String),

    /// Actor proof does not match the party required for this action
    #[error("actor is not authorized for this action")]
    Unauthorized,

    /// Requested transition is not defined from the current status
    #[error("transition '{action}' is not permitted from status '{from}'")]
    InvalidTransition { from: String, action: &'static str },

    /// Compare-and-set lost a race: the stored status moved underneath us
    #[error("stale state: expected status '{expected}', found '{actual}'")]
    StaleState { expected: String, actual: String },

    /// Ledger call failed for a reason other than "already applied"
    #[error("ledger call failed: {0}")]
    ChainCall(String),

    /// Database query or write failure
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Connection pool exhausted or unavailable
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Unexpected internal state (task join failure, corrupt row, ...)
    #[error("internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// True if the caller should re-read the record and retry the request.
    ///
    /// Only `StaleState` qualifies: the compare-and-set lost a race, the
    /// record is intact, and the same request may well succeed against
    /// the reloaded state (or collapse into an idempotent no-op).
    pub fn is_retryable(&self) -> bool {
        matches!(self, EscrowError::StaleState { .. })
    }

    /// True if this error is terminal for the request (no retry).
    pub fn is_request_terminal(&self) -> bool {
        matches!(
            self,
            EscrowError::Validation(_)
                | EscrowError::NotFound(_)
                | EscrowError::Unauthorized
                | EscrowError::InvalidTransition { .. }
        )
    }

    /// Non-leaking message suitable for an end user.
    ///
    /// Internal detail (stored status, ledger error text) stays in the
    /// logs; callers get a stable, generic phrasing.
    pub fn user_message(&self) -> &'static str {
        match self {
            EscrowError::Validation(_) => "the request was malformed",
            EscrowError::NotFound(_) => "escrow not found",
            EscrowError::Unauthorized => "not authorized",
            EscrowError::InvalidTransition { .. } => {
                "this action is not available in the escrow's current state"
            }
            EscrowError::StaleState { .. } => "the escrow changed, please retry",
            EscrowError::ChainCall(_) => "action recorded, on-chain settlement pending",
            _ => "internal error",
        }
    }
}

/// Result type for escrow lifecycle operations
pub type EscrowResult<T> = Result<T, EscrowError>;
