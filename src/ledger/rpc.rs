//! JSON-RPC implementation of the ledger gateway
//!
//! Talks to the settlement-contract adapter over JSON-RPC 2.0. Every
//! mutating call is at-least-once: contract errors meaning "this was
//! already applied" are classified and mapped to success, everything
//! else (transport, revert, out-of-gas, timeout) becomes `ChainCall`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::LedgerConfig;
use crate::error::{EscrowError, EscrowResult};
use crate::ledger::events::{self, RawLog};
use crate::ledger::gateway::{LedgerCreate, LedgerGateway};

/// How an RPC failure should be handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcFailure {
    /// The contract reports the operation was already performed; the
    /// caller's intent is satisfied
    AlreadyApplied,
    /// Genuine failure, surfaced to the caller
    Genuine(String),
}

/// Classify a contract/RPC error message into the two retry buckets.
///
/// The contract reverts with stable "already ..." messages when a
/// duplicate mutation arrives; those are successes from the caller's
/// point of view.
pub fn classify_failure(message: &str) -> RpcFailure {
    let lower = message.to_lowercase();
    const ALREADY: [&str; 5] = [
        "already funded",
        "already shipped",
        "already released",
        "already refunded",
        "already applied",
    ];
    if ALREADY.iter().any(|needle| lower.contains(needle)) {
        RpcFailure::AlreadyApplied
    } else {
        RpcFailure::Genuine(message.to_string())
    }
}

#[derive(Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u32,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcEnvelope<R> {
    result: Option<R>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    #[allow(dead_code)]
    code: i64,
    message: String,
}

/// Receipt returned by mutating contract calls
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxReceipt {
    tx_hash: String,
    #[serde(default)]
    logs: Vec<RawLog>,
}

/// Production ledger gateway speaking JSON-RPC to the contract adapter.
///
/// Constructed explicitly and injected into the coordinator and
/// scheduler; there is no process-wide singleton.
pub struct RpcLedgerGateway {
    client: reqwest::Client,
    config: LedgerConfig,
}

impl RpcLedgerGateway {
    pub fn new(config: LedgerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build ledger RPC client")?;
        Ok(Self { client, config })
    }

    /// One JSON-RPC round trip. Transport and envelope problems are
    /// genuine failures; contract errors go through [`classify_failure`].
    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, RpcFailure> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 0,
            method,
            params,
        };

        let response = self
            .client
            .post(&self.config.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcFailure::Genuine(format!("HTTP error: {e}")))?;

        let envelope: RpcEnvelope<R> = response
            .json()
            .await
            .map_err(|e| RpcFailure::Genuine(format!("invalid RPC response: {e}")))?;

        if let Some(error) = envelope.error {
            return Err(classify_failure(&error.message));
        }

        envelope
            .result
            .ok_or_else(|| RpcFailure::Genuine(format!("missing result for {method}")))
    }

    /// Mutating call where "already applied" counts as success.
    async fn call_mutating<P: Serialize>(&self, method: &str, params: P) -> EscrowResult<()> {
        match self.call::<_, TxReceipt>(method, params).await {
            Ok(receipt) => {
                info!(method, tx_hash = %receipt.tx_hash, "ledger call confirmed");
                Ok(())
            }
            Err(RpcFailure::AlreadyApplied) => {
                info!(method, "ledger reports operation already applied, treating as success");
                Ok(())
            }
            Err(RpcFailure::Genuine(message)) => {
                warn!(method, error = %message, "ledger call failed");
                Err(EscrowError::ChainCall(message))
            }
        }
    }
}

#[async_trait]
impl LedgerGateway for RpcLedgerGateway {
    async fn create(
        &self,
        seller: &str,
        token: &str,
        amount: i64,
        release_time_unix: i64,
    ) -> EscrowResult<LedgerCreate> {
        let params = serde_json::json!({
            "contract": self.config.contract_address,
            "seller": seller,
            "token": token,
            "amount": amount,
            "releaseTime": release_time_unix,
        });

        let receipt: TxReceipt = self
            .call("escrow_create", params)
            .await
            .map_err(|failure| match failure {
                // create has no meaningful duplicate; treat as genuine
                RpcFailure::AlreadyApplied => {
                    EscrowError::ChainCall("duplicate create reported by contract".to_string())
                }
                RpcFailure::Genuine(message) => EscrowError::ChainCall(message),
            })?;

        let ledger_escrow_id = events::escrow_created_id(&receipt.logs);
        if ledger_escrow_id.is_none() {
            warn!(
                tx_hash = %receipt.tx_hash,
                "EscrowCreated event not found in receipt logs, ledger id left unset"
            );
        }

        Ok(LedgerCreate {
            tx_hash: receipt.tx_hash,
            ledger_escrow_id,
        })
    }

    async fn mark_funded(&self, ledger_escrow_id: i64, buyer: &str) -> EscrowResult<()> {
        let params = serde_json::json!({
            "contract": self.config.contract_address,
            "escrowId": ledger_escrow_id,
            "buyer": buyer,
        });
        self.call_mutating("escrow_markFunded", params).await
    }

    async fn mark_shipped(&self, ledger_escrow_id: i64) -> EscrowResult<()> {
        let params = serde_json::json!({
            "contract": self.config.contract_address,
            "escrowId": ledger_escrow_id,
        });
        self.call_mutating("escrow_markShipped", params).await
    }

    async fn release(&self, ledger_escrow_id: i64) -> EscrowResult<()> {
        let params = serde_json::json!({
            "contract": self.config.contract_address,
            "escrowId": ledger_escrow_id,
        });
        self.call_mutating("escrow_release", params).await
    }

    async fn refund(&self, ledger_escrow_id: i64) -> EscrowResult<()> {
        let params = serde_json::json!({
            "contract": self.config.contract_address,
            "escrowId": ledger_escrow_id,
        });
        self.call_mutating("escrow_refund", params).await
    }

    async fn get_status(&self, ledger_escrow_id: i64) -> EscrowResult<String> {
        let params = serde_json::json!({
            "contract": self.config.contract_address,
            "escrowId": ledger_escrow_id,
        });
        self.call::<_, String>("escrow_getStatus", params)
            .await
            .map_err(|failure| match failure {
                RpcFailure::AlreadyApplied => {
                    EscrowError::ChainCall("unexpected error on status query".to_string())
                }
                RpcFailure::Genuine(message) => EscrowError::ChainCall(message),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_applied_bucket() {
        assert_eq!(
            classify_failure("execution reverted: escrow already released"),
            RpcFailure::AlreadyApplied
        );
        assert_eq!(
            classify_failure("Already Funded"),
            RpcFailure::AlreadyApplied
        );
        assert_eq!(
            classify_failure("escrow already refunded to buyer"),
            RpcFailure::AlreadyApplied
        );
    }

    #[test]
    fn test_genuine_failure_bucket() {
        assert!(matches!(
            classify_failure("insufficient gas"),
            RpcFailure::Genuine(_)
        ));
        assert!(matches!(
            classify_failure("execution reverted: not the seller"),
            RpcFailure::Genuine(_)
        ));
        assert!(matches!(
            classify_failure("connection reset by peer"),
            RpcFailure::Genuine(_)
        ));
    }
}
