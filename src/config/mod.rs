//! Configuration modules for the escrow coordinator

pub mod ledger;
pub mod timeout;

pub use ledger::LedgerConfig;
pub use timeout::TimeoutConfig;

/// Read an env var as an integer, falling back to `default` when unset
/// or unparseable.
fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
