//! Scheduler windows and sweep cadences
//!
//! The three lifecycle windows (`CREATION_EXPIRY_DAYS`,
//! `SHIPPING_DEADLINE_DAYS`, `AUTO_RELEASE_DAYS`) govern eligibility for
//! the automatic transitions. Changing them only affects future sweep
//! evaluations; deadlines are evaluated at sweep time against the
//! constant in effect, never rewritten retroactively into stored rows.

use chrono::Duration;

use super::env_parse;

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Days an unfunded escrow may sit in created/waiting_payment before expiry
    pub creation_expiry_days: i64,
    /// Days a funded escrow may wait for shipment before auto-refund
    pub shipping_deadline_days: i64,
    /// Days after shipment before unconfirmed receipt auto-releases
    pub auto_release_days: i64,
    /// Auto-release sweep cadence
    pub auto_release_sweep_secs: u64,
    /// Auto-refund sweep cadence
    pub auto_refund_sweep_secs: u64,
    /// Expiry sweep cadence
    pub expiry_sweep_secs: u64,
    /// Reconciliation report cadence
    pub reconcile_sweep_secs: u64,
    /// Maximum records pulled per sweep run
    pub sweep_batch_size: i64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            creation_expiry_days: 7,
            shipping_deadline_days: 30,
            auto_release_days: 14,
            auto_release_sweep_secs: 3600,
            auto_refund_sweep_secs: 6 * 3600,
            expiry_sweep_secs: 24 * 3600,
            reconcile_sweep_secs: 6 * 3600,
            sweep_batch_size: 50,
        }
    }
}

impl TimeoutConfig {
    /// Load from environment, keeping defaults for anything unset.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            creation_expiry_days: env_parse("CREATION_EXPIRY_DAYS", d.creation_expiry_days),
            shipping_deadline_days: env_parse("SHIPPING_DEADLINE_DAYS", d.shipping_deadline_days),
            auto_release_days: env_parse("AUTO_RELEASE_DAYS", d.auto_release_days),
            auto_release_sweep_secs: env_parse(
                "AUTO_RELEASE_SWEEP_SECS",
                d.auto_release_sweep_secs,
            ),
            auto_refund_sweep_secs: env_parse("AUTO_REFUND_SWEEP_SECS", d.auto_refund_sweep_secs),
            expiry_sweep_secs: env_parse("EXPIRY_SWEEP_SECS", d.expiry_sweep_secs),
            reconcile_sweep_secs: env_parse("RECONCILE_SWEEP_SECS", d.reconcile_sweep_secs),
            sweep_batch_size: env_parse("SWEEP_BATCH_SIZE", d.sweep_batch_size),
        }
    }

    pub fn creation_expiry(&self) -> Duration {
        Duration::days(self.creation_expiry_days)
    }

    pub fn shipping_deadline(&self) -> Duration {
        Duration::days(self.shipping_deadline_days)
    }

    pub fn auto_release_window(&self) -> Duration {
        Duration::days(self.auto_release_days)
    }
}
