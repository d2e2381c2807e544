//! Sweep behavior: window boundaries, batch outcomes, CAS races and the
//! reconciliation report.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{Duration, Utc};
use diesel::prelude::*;

use common::{draft, test_pool, MockLedger};
use escrowd::config::TimeoutConfig;
use escrowd::db::DbPool;
use escrowd::error::EscrowError;
use escrowd::models::escrow::{Escrow, EscrowChanges};
use escrowd::schema::escrows;
use escrowd::services::reconciliation;
use escrowd::services::{
    ActorProof, BuyerProof, FundingConfirmation, ReconciliationCoordinator, TimeoutScheduler,
};
use escrowd::state_machine::EscrowStatus;

const SELLER: &str = "0xseller01";
const BUYER: &str = "0xbuyer01";

struct Harness {
    pool: DbPool,
    ledger: Arc<MockLedger>,
    coordinator: Arc<ReconciliationCoordinator>,
    scheduler: TimeoutScheduler,
}

fn setup() -> Harness {
    let pool = test_pool();
    let ledger = Arc::new(MockLedger::new());
    let config = TimeoutConfig::default();
    let coordinator = Arc::new(ReconciliationCoordinator::new(
        pool.clone(),
        ledger.clone(),
        config.clone(),
    ));
    let scheduler = TimeoutScheduler::new(
        coordinator.clone(),
        pool.clone(),
        ledger.clone(),
        config,
    );
    Harness {
        pool,
        ledger,
        coordinator,
        scheduler,
    }
}

fn backdate(pool: &DbPool, escrow_id: &str, column: &str, age: Duration) {
    let ts = Utc::now().naive_utc() - age;
    let mut conn = pool.get().unwrap();
    let target = escrows::table.filter(escrows::id.eq(escrow_id));
    let affected = match column {
        "created_at" => diesel::update(target)
            .set(escrows::created_at.eq(ts))
            .execute(&mut conn),
        "funded_at" => diesel::update(target)
            .set(escrows::funded_at.eq(ts))
            .execute(&mut conn),
        "shipped_at" => diesel::update(target)
            .set(escrows::shipped_at.eq(ts))
            .execute(&mut conn),
        other => panic!("unexpected column {other}"),
    }
    .unwrap();
    assert_eq!(affected, 1);
}

async fn shipped_escrow(h: &Harness) -> Escrow {
    let escrow = h.coordinator.create(draft(SELLER)).await.unwrap();
    let ledger_id = escrow.ledger_escrow_id.unwrap();
    h.ledger.set_status(ledger_id, "funded");
    h.coordinator
        .mark_funded(
            &escrow.id,
            &ActorProof::System,
            FundingConfirmation::LedgerDeposit {
                buyer_address: BUYER.to_string(),
            },
        )
        .await
        .unwrap();
    h.coordinator
        .mark_shipped(
            &escrow.id,
            &ActorProof::Seller(SELLER.to_string()),
            "trk".to_string(),
        )
        .await
        .unwrap()
        .escrow
}

async fn funded_escrow(h: &Harness) -> Escrow {
    let escrow = h.coordinator.create(draft(SELLER)).await.unwrap();
    let ledger_id = escrow.ledger_escrow_id.unwrap();
    h.ledger.set_status(ledger_id, "funded");
    h.coordinator
        .mark_funded(
            &escrow.id,
            &ActorProof::System,
            FundingConfirmation::LedgerDeposit {
                buyer_address: BUYER.to_string(),
            },
        )
        .await
        .unwrap()
        .escrow
}

#[tokio::test]
async fn test_auto_release_sweep_releases_overdue_shipments() {
    let h = setup();
    let escrow = shipped_escrow(&h).await;
    backdate(&h.pool, &escrow.id, "shipped_at", Duration::days(15));

    let stats = h.scheduler.run_auto_release_sweep().await.unwrap().unwrap();
    assert_eq!(stats.scanned, 1);
    assert_eq!(stats.transitioned, 1);
    assert_eq!(stats.failed, 0);

    let reloaded = h.coordinator.get_by_id(&escrow.id).await.unwrap();
    assert_eq!(reloaded.status, "released");
    assert!(reloaded.released_at.is_some());
    // Scheduler release, not a buyer confirmation: no delivery timestamp.
    assert!(reloaded.delivered_at.is_none());
    assert_eq!(h.ledger.release_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_auto_release_window_boundary() {
    let h = setup();
    let escrow = shipped_escrow(&h).await;

    // One minute short of fourteen days: not yet due.
    backdate(
        &h.pool,
        &escrow.id,
        "shipped_at",
        Duration::days(14) - Duration::minutes(1),
    );
    let stats = h.scheduler.run_auto_release_sweep().await.unwrap().unwrap();
    assert_eq!(stats.scanned, 0);
    assert_eq!(
        h.coordinator.get_by_id(&escrow.id).await.unwrap().status,
        "shipped"
    );

    // Exactly fourteen days is eligible. Pin `now` against the stored
    // shipped_at so the query's cutoff comparison is hit at equality
    // instead of drifting with the wall clock.
    let shipped_at = h
        .coordinator
        .get_by_id(&escrow.id)
        .await
        .unwrap()
        .shipped_at
        .unwrap();
    let window = Duration::days(14);
    let at_boundary = shipped_at + window;
    let due = escrowd::db::with_conn(&h.pool, move |conn| {
        Escrow::due_for_auto_release(conn, at_boundary, window, 50)
    })
    .await
    .unwrap();
    assert_eq!(due.len(), 1, "eligible at exactly shipped_at + window");

    let just_before = at_boundary - Duration::seconds(1);
    let due = escrowd::db::with_conn(&h.pool, move |conn| {
        Escrow::due_for_auto_release(conn, just_before, window, 50)
    })
    .await
    .unwrap();
    assert!(due.is_empty(), "not eligible one second before the window");

    // One minute past: due.
    backdate(
        &h.pool,
        &escrow.id,
        "shipped_at",
        Duration::days(14) + Duration::minutes(1),
    );
    let stats = h.scheduler.run_auto_release_sweep().await.unwrap().unwrap();
    assert_eq!(stats.transitioned, 1);
}

#[tokio::test]
async fn test_auto_release_skips_disputed_escrows() {
    let h = setup();
    let escrow = shipped_escrow(&h).await;
    h.coordinator
        .raise_dispute(
            &escrow.id,
            &ActorProof::Buyer(BuyerProof::Address(BUYER.to_string())),
            "wrong item".to_string(),
        )
        .await
        .unwrap();
    backdate(&h.pool, &escrow.id, "shipped_at", Duration::days(20));

    let stats = h.scheduler.run_auto_release_sweep().await.unwrap().unwrap();
    assert_eq!(stats.scanned, 0);
    assert_eq!(
        h.coordinator.get_by_id(&escrow.id).await.unwrap().status,
        "disputed"
    );
}

#[tokio::test]
async fn test_auto_refund_sweep_refunds_unshipped_escrows() {
    let h = setup();
    let overdue = funded_escrow(&h).await;
    backdate(&h.pool, &overdue.id, "funded_at", Duration::days(31));
    let fresh = funded_escrow(&h).await;

    let stats = h.scheduler.run_auto_refund_sweep().await.unwrap().unwrap();
    assert_eq!(stats.scanned, 1);
    assert_eq!(stats.transitioned, 1);

    assert_eq!(
        h.coordinator.get_by_id(&overdue.id).await.unwrap().status,
        "refunded"
    );
    assert_eq!(
        h.coordinator.get_by_id(&fresh.id).await.unwrap().status,
        "funded"
    );
    assert_eq!(h.ledger.refund_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_expiry_sweep_expires_only_unfunded_escrows() {
    let h = setup();
    let stale = h.coordinator.create(draft(SELLER)).await.unwrap();
    backdate(&h.pool, &stale.id, "created_at", Duration::days(8));

    let funded = funded_escrow(&h).await;
    backdate(&h.pool, &funded.id, "created_at", Duration::days(8));

    let stats = h.scheduler.run_expiry_sweep().await.unwrap().unwrap();
    assert_eq!(stats.scanned, 1);
    assert_eq!(stats.transitioned, 1);

    assert_eq!(
        h.coordinator.get_by_id(&stale.id).await.unwrap().status,
        "expired"
    );
    // Funding protects the record even past the creation window.
    assert_eq!(
        h.coordinator.get_by_id(&funded.id).await.unwrap().status,
        "funded"
    );
}

#[tokio::test]
async fn test_sweep_continues_past_failing_record() {
    let h = setup();
    let first = funded_escrow(&h).await;
    let second = funded_escrow(&h).await;
    backdate(&h.pool, &first.id, "funded_at", Duration::days(31));
    backdate(&h.pool, &second.id, "funded_at", Duration::days(32));

    // Point the second record at a ledger escrow that does not exist so
    // its refund fails.
    let mut conn = h.pool.get().unwrap();
    diesel::update(escrows::table.filter(escrows::id.eq(&second.id)))
        .set(escrows::ledger_escrow_id.eq(999i64))
        .execute(&mut conn)
        .unwrap();
    drop(conn);

    let stats = h.scheduler.run_auto_refund_sweep().await.unwrap().unwrap();
    assert_eq!(stats.scanned, 2);
    assert_eq!(stats.transitioned, 1);
    assert_eq!(stats.failed, 1);

    assert_eq!(
        h.coordinator.get_by_id(&first.id).await.unwrap().status,
        "refunded"
    );
    assert_eq!(
        h.coordinator.get_by_id(&second.id).await.unwrap().status,
        "funded"
    );
}

#[tokio::test]
async fn test_guarded_update_rejects_stale_writer() {
    let h = setup();
    let escrow = funded_escrow(&h).await;

    // A writer that read the record back in `created` loses the CAS.
    let id = escrow.id.clone();
    let result = escrowd::db::with_conn(&h.pool, move |conn| {
        Escrow::update_status_guarded(
            conn,
            &id,
            EscrowStatus::Created,
            EscrowStatus::Cancelled,
            EscrowChanges::default(),
        )
    })
    .await;

    match result {
        Err(EscrowError::StaleState { expected, actual }) => {
            assert_eq!(expected, "created");
            assert_eq!(actual, "funded");
        }
        other => panic!("expected StaleState, got {other:?}"),
    }
    assert_eq!(
        h.coordinator.get_by_id(&escrow.id).await.unwrap().status,
        "funded"
    );
}

#[tokio::test]
async fn test_reconciliation_report_flags_divergence() {
    let h = setup();
    let drifted = funded_escrow(&h).await;
    let consistent = funded_escrow(&h).await;

    // The ledger moved on without us.
    h.ledger
        .set_status(drifted.ledger_escrow_id.unwrap(), "released");

    let report =
        reconciliation::reconciliation_report(&h.pool, h.ledger.as_ref(), 50)
            .await
            .unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].escrow_id, drifted.id);
    assert_eq!(report[0].stored_status, "funded");
    assert_eq!(report[0].ledger_status, "released");

    // Nothing was mutated; the report only observes.
    assert_eq!(
        h.coordinator.get_by_id(&drifted.id).await.unwrap().status,
        "funded"
    );
    assert_eq!(
        h.coordinator.get_by_id(&consistent.id).await.unwrap().status,
        "funded"
    );
}

#[tokio::test]
async fn test_reconcile_sweep_counts_divergences() {
    let h = setup();
    let drifted = funded_escrow(&h).await;
    h.ledger
        .set_status(drifted.ledger_escrow_id.unwrap(), "refunded");

    let count = h.scheduler.run_reconcile_sweep().await.unwrap();
    assert_eq!(count, Some(1));
}

#[tokio::test]
async fn test_ledger_id_is_write_once() {
    let h = setup();
    let escrow = h.coordinator.create(draft(SELLER)).await.unwrap();
    assert_eq!(escrow.ledger_escrow_id, Some(1));

    let id = escrow.id.clone();
    let second_write = escrowd::db::with_conn(&h.pool, move |conn| {
        Escrow::set_ledger_escrow_id(conn, &id, 42)
    })
    .await
    .unwrap();
    assert!(!second_write);
    assert_eq!(
        h.coordinator
            .get_by_id(&escrow.id)
            .await
            .unwrap()
            .ledger_escrow_id,
        Some(1)
    );
}
