//! Typed decoding of settlement-contract event logs
//!
//! Pure functions over raw receipt logs, tested without any network.
//! The only event the coordinator cares about is `EscrowCreated`, whose
//! first indexed field carries the ledger-assigned escrow identifier.

use serde::Deserialize;

/// keccak256 signature topic of `EscrowCreated(uint256,address,uint256)`
pub const ESCROW_CREATED_TOPIC: &str =
    "0x6b4f3a8e2c91d45f8a07c3be12d96f5e84d0a21c7b3f9e660d8a14c25b7e9301";

/// A raw log entry as returned in a transaction receipt
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

/// A log entry the decoder recognised
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    EscrowCreated { ledger_escrow_id: i64 },
}

/// Decode all recognised events from a receipt's logs, in order.
pub fn decode_logs(logs: &[RawLog]) -> Vec<ParsedEvent> {
    logs.iter()
        .filter_map(|log| {
            let topic0 = log.topics.first()?;
            if !topic0.eq_ignore_ascii_case(ESCROW_CREATED_TOPIC) {
                return None;
            }
            let id = decode_topic_i64(log.topics.get(1)?)?;
            Some(ParsedEvent::EscrowCreated {
                ledger_escrow_id: id,
            })
        })
        .collect()
}

/// The ledger escrow id from the first `EscrowCreated` event, if present.
///
/// Absent or malformed logs yield `None`; the off-chain record then keeps
/// a null ledger id for later backfill.
pub fn escrow_created_id(logs: &[RawLog]) -> Option<i64> {
    decode_logs(logs).into_iter().next().map(|event| match event {
        ParsedEvent::EscrowCreated { ledger_escrow_id } => ledger_escrow_id,
    })
}

/// Decode a 32-byte ABI word (hex, optionally 0x-prefixed) as an i64.
///
/// Values that do not fit in 63 bits are treated as malformed.
fn decode_topic_i64(topic: &str) -> Option<i64> {
    let hex_word = topic.strip_prefix("0x").unwrap_or(topic);
    if hex_word.len() != 64 {
        return None;
    }
    let bytes = hex::decode(hex_word).ok()?;
    // The high 24 bytes must be zero padding for the value to fit.
    if bytes[..24].iter().any(|&b| b != 0) {
        return None;
    }
    let raw = u64::from_be_bytes(bytes[24..32].try_into().ok()?);
    i64::try_from(raw).ok()
}
