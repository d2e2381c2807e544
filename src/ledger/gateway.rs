//! Ledger gateway trait

use async_trait::async_trait;

use crate::error::EscrowResult;

/// Outcome of the escrow-creating ledger call.
///
/// The ledger id is parsed out of the transaction's event logs; when the
/// expected event is absent the id stays `None` and is backfilled later.
#[derive(Debug, Clone)]
pub struct LedgerCreate {
    pub tx_hash: String,
    pub ledger_escrow_id: Option<i64>,
}

/// Operations mirroring the settlement contract.
///
/// Mutating calls are at-least-once; implementations must treat
/// "already applied" contract errors as success. Genuine failures
/// (transport, revert, out-of-gas, timeout) surface as
/// `EscrowError::ChainCall`.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Create the on-chain escrow; returns the transaction hash and, when
    /// the creation event could be decoded, the ledger-assigned id.
    async fn create(
        &self,
        seller: &str,
        token: &str,
        amount: i64,
        release_time_unix: i64,
    ) -> EscrowResult<LedgerCreate>;

    async fn mark_funded(&self, ledger_escrow_id: i64, buyer: &str) -> EscrowResult<()>;

    async fn mark_shipped(&self, ledger_escrow_id: i64) -> EscrowResult<()>;

    async fn release(&self, ledger_escrow_id: i64) -> EscrowResult<()>;

    async fn refund(&self, ledger_escrow_id: i64) -> EscrowResult<()>;

    /// Current contract-side status string for a ledger escrow.
    async fn get_status(&self, ledger_escrow_id: i64) -> EscrowResult<String>;
}
