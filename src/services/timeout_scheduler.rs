//! Background sweeps for time-driven transitions
//!
//! Three lifecycle sweeps (auto-release, auto-refund, creation expiry)
//! plus the reconciliation report run on independent cadences. Each
//! sweep pulls a bounded batch of due records and pushes them through
//! the coordinator one by one as the synthetic system actor; one failing
//! record never aborts the rest of the batch.
//!
//! Overlap protection is a per-sweep guard token, not a boolean pair: a
//! run proceeds only while it holds the token, and the token releases
//! itself on drop, so a panicking or cancelled run can never wedge the
//! sweep permanently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::TimeoutConfig;
use crate::db::{self, DbPool};
use crate::error::{EscrowError, EscrowResult};
use crate::ledger::LedgerGateway;
use crate::models::escrow::Escrow;
use crate::services::coordinator::{ActionPayload, ActorProof, ReconciliationCoordinator};
use crate::services::reconciliation;
use crate::state_machine::Action;

/// Single-holder guard for one sweep kind.
pub struct JobGuard {
    name: &'static str,
    busy: AtomicBool,
}

impl JobGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            busy: AtomicBool::new(false),
        }
    }

    /// Try to take the token; `None` means a previous run is still live.
    pub fn try_acquire(&self) -> Option<JobToken<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| JobToken { guard: self })
    }
}

/// Held for the duration of one sweep run; releases on drop, including
/// unwind and task cancellation.
pub struct JobToken<'a> {
    guard: &'a JobGuard,
}

impl Drop for JobToken<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

/// Counters from one sweep run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub transitioned: usize,
    pub failed: usize,
}

pub struct TimeoutScheduler {
    coordinator: Arc<ReconciliationCoordinator>,
    db: DbPool,
    ledger: Arc<dyn LedgerGateway>,
    config: TimeoutConfig,
    auto_release_guard: JobGuard,
    auto_refund_guard: JobGuard,
    expiry_guard: JobGuard,
    reconcile_guard: JobGuard,
}

impl TimeoutScheduler {
    pub fn new(
        coordinator: Arc<ReconciliationCoordinator>,
        db: DbPool,
        ledger: Arc<dyn LedgerGateway>,
        config: TimeoutConfig,
    ) -> Self {
        Self {
            coordinator,
            db,
            ledger,
            config,
            auto_release_guard: JobGuard::new("auto_release"),
            auto_refund_guard: JobGuard::new("auto_refund"),
            expiry_guard: JobGuard::new("expiry"),
            reconcile_guard: JobGuard::new("reconcile"),
        }
    }

    /// Spawn the four periodic sweep tasks. Returns immediately; the
    /// tasks run for the life of the process.
    pub fn start(self: &Arc<Self>) {
        info!(
            auto_release_secs = self.config.auto_release_sweep_secs,
            auto_refund_secs = self.config.auto_refund_sweep_secs,
            expiry_secs = self.config.expiry_sweep_secs,
            reconcile_secs = self.config.reconcile_sweep_secs,
            "starting timeout scheduler"
        );

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                scheduler.config.auto_release_sweep_secs,
            ));
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.run_auto_release_sweep().await {
                    error!(error = %e, "auto-release sweep failed");
                }
            }
        });

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                scheduler.config.auto_refund_sweep_secs,
            ));
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.run_auto_refund_sweep().await {
                    error!(error = %e, "auto-refund sweep failed");
                }
            }
        });

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                scheduler.config.expiry_sweep_secs,
            ));
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.run_expiry_sweep().await {
                    error!(error = %e, "expiry sweep failed");
                }
            }
        });

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                scheduler.config.reconcile_sweep_secs,
            ));
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.run_reconcile_sweep().await {
                    error!(error = %e, "reconciliation sweep failed");
                }
            }
        });
    }

    /// Release escrows shipped longer ago than the auto-release window
    /// whose buyer never confirmed or disputed.
    ///
    /// `Ok(None)` means the previous run still held the token.
    pub async fn run_auto_release_sweep(&self) -> EscrowResult<Option<SweepStats>> {
        let Some(_token) = self.auto_release_guard.try_acquire() else {
            warn!(sweep = self.auto_release_guard.name, "previous run still active, skipping");
            return Ok(None);
        };

        let now = Utc::now().naive_utc();
        let window = self.config.auto_release_window();
        let limit = self.config.sweep_batch_size;
        let due = db::with_conn(&self.db, move |conn| {
            Escrow::due_for_auto_release(conn, now, window, limit)
        })
        .await?;

        let stats = self
            .apply_batch(due, Action::AutoRelease, "auto-release")
            .await;
        Ok(Some(stats))
    }

    /// Refund funded escrows whose seller never shipped within the
    /// shipping deadline.
    pub async fn run_auto_refund_sweep(&self) -> EscrowResult<Option<SweepStats>> {
        let Some(_token) = self.auto_refund_guard.try_acquire() else {
            warn!(sweep = self.auto_refund_guard.name, "previous run still active, skipping");
            return Ok(None);
        };

        let now = Utc::now().naive_utc();
        let window = self.config.shipping_deadline();
        let limit = self.config.sweep_batch_size;
        let due = db::with_conn(&self.db, move |conn| {
            Escrow::due_for_auto_refund(conn, now, window, limit)
        })
        .await?;

        let stats = self.apply_batch(due, Action::AutoRefund, "auto-refund").await;
        Ok(Some(stats))
    }

    /// Expire escrows that never received funding within the creation
    /// window.
    pub async fn run_expiry_sweep(&self) -> EscrowResult<Option<SweepStats>> {
        let Some(_token) = self.expiry_guard.try_acquire() else {
            warn!(sweep = self.expiry_guard.name, "previous run still active, skipping");
            return Ok(None);
        };

        let now = Utc::now().naive_utc();
        let window = self.config.creation_expiry();
        let limit = self.config.sweep_batch_size;
        let due = db::with_conn(&self.db, move |conn| {
            Escrow::due_for_expiry(conn, now, window, limit)
        })
        .await?;

        let stats = self.apply_batch(due, Action::Expire, "expiry").await;
        Ok(Some(stats))
    }

    /// Compare stored statuses against the ledger and log divergences.
    /// Report-only; nothing is mutated.
    pub async fn run_reconcile_sweep(&self) -> EscrowResult<Option<usize>> {
        let Some(_token) = self.reconcile_guard.try_acquire() else {
            warn!(sweep = self.reconcile_guard.name, "previous run still active, skipping");
            return Ok(None);
        };

        let divergences = reconciliation::reconciliation_report(
            &self.db,
            self.ledger.as_ref(),
            self.config.sweep_batch_size,
        )
        .await?;
        Ok(Some(divergences.len()))
    }

    /// Run one batch through the coordinator.
    ///
    /// `StaleState` means an interactive request won a race with the
    /// sweep; that is the CAS doing its job, logged at info and counted
    /// as neither transitioned nor failed.
    async fn apply_batch(&self, due: Vec<Escrow>, action: Action, sweep: &str) -> SweepStats {
        let mut stats = SweepStats {
            scanned: due.len(),
            ..Default::default()
        };

        for escrow in due {
            match self
                .coordinator
                .apply(&escrow.id, action, &ActorProof::System, ActionPayload::default())
                .await
            {
                Ok(_) => {
                    info!(sweep, escrow_id = %escrow.id, "sweep transition applied");
                    stats.transitioned += 1;
                }
                Err(EscrowError::StaleState { expected, actual }) => {
                    info!(
                        sweep,
                        escrow_id = %escrow.id,
                        expected = %expected,
                        actual = %actual,
                        "record moved concurrently, skipping"
                    );
                }
                // The record left the due set between the query and the
                // apply (say, the seller shipped mid-batch). Same lost
                // race as StaleState, just caught one step earlier.
                Err(EscrowError::InvalidTransition { from, action }) => {
                    info!(
                        sweep,
                        escrow_id = %escrow.id,
                        status = %from,
                        action,
                        "record moved concurrently, skipping"
                    );
                }
                Err(e) => {
                    error!(sweep, escrow_id = %escrow.id, error = %e, "sweep transition failed");
                    stats.failed += 1;
                }
            }
        }

        if stats.scanned > 0 {
            info!(
                sweep,
                scanned = stats.scanned,
                transitioned = stats.transitioned,
                failed = stats.failed,
                "sweep finished"
            );
        }
        stats
    }
}
