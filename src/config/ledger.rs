//! Settlement-ledger endpoint configuration

use super::env_parse;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint of the settlement-contract adapter
    pub rpc_url: String,
    /// Deployed settlement contract address
    pub contract_address: String,
    /// Hard timeout on every RPC call; a timed-out call is a genuine
    /// failure, never retried in-line
    pub request_timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            contract_address: String::new(),
            request_timeout_secs: 30,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            rpc_url: std::env::var("LEDGER_RPC_URL").unwrap_or(d.rpc_url),
            contract_address: std::env::var("LEDGER_CONTRACT_ADDRESS")
                .unwrap_or(d.contract_address),
            request_timeout_secs: env_parse("LEDGER_RPC_TIMEOUT_SECS", d.request_timeout_secs),
        }
    }
}
