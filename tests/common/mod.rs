//! Shared test harness: in-memory database pool and a scriptable
//! in-process ledger gateway.

// Each test binary compiles this module separately and uses a subset.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use escrowd::db::{self, DbPool};
use escrowd::error::{EscrowError, EscrowResult};
use escrowd::ledger::{LedgerCreate, LedgerGateway};
use escrowd::models::escrow::EscrowDraft;

/// In-memory SQLite pool. Size 1 so every checkout sees the same
/// in-memory database.
pub fn test_pool() -> DbPool {
    let pool = db::create_pool(":memory:", 1).expect("test pool");
    db::initialize_schema(&pool).expect("test schema");
    pool
}

pub fn draft(seller: &str) -> EscrowDraft {
    EscrowDraft {
        seller_address: seller.to_string(),
        item_name: "mechanical keyboard".to_string(),
        item_description: Some("lightly used".to_string()),
        settlement_token: "USDC".to_string(),
        settlement_amount: 120_000_000,
        fiat_amount: 12_000,
        fiat_currency: "USD".to_string(),
        release_duration_secs: 30 * 86_400,
    }
}

/// Scriptable ledger double.
///
/// Keeps a per-escrow status map and call counters. Mutating calls obey
/// the production at-least-once contract: a duplicate mutation (the
/// escrow is already in the target status) succeeds.
pub struct MockLedger {
    next_id: AtomicI64,
    statuses: Mutex<HashMap<i64, String>>,
    pub create_calls: AtomicUsize,
    pub mark_funded_calls: AtomicUsize,
    pub mark_shipped_calls: AtomicUsize,
    pub release_calls: AtomicUsize,
    pub refund_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    /// When set, `create` succeeds but the creation event is missing
    /// from the receipt, so no ledger id comes back.
    pub omit_created_event: AtomicBool,
    /// Forced failure messages, applied before any state change.
    pub create_error: Mutex<Option<String>>,
    pub mark_funded_error: Mutex<Option<String>>,
    pub mark_shipped_error: Mutex<Option<String>>,
    pub release_error: Mutex<Option<String>>,
    pub refund_error: Mutex<Option<String>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            statuses: Mutex::new(HashMap::new()),
            create_calls: AtomicUsize::new(0),
            mark_funded_calls: AtomicUsize::new(0),
            mark_shipped_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            refund_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            omit_created_event: AtomicBool::new(false),
            create_error: Mutex::new(None),
            mark_funded_error: Mutex::new(None),
            mark_shipped_error: Mutex::new(None),
            release_error: Mutex::new(None),
            refund_error: Mutex::new(None),
        }
    }

    pub fn set_status(&self, ledger_id: i64, status: &str) {
        self.statuses
            .lock()
            .unwrap()
            .insert(ledger_id, status.to_string());
    }

    pub fn status_of(&self, ledger_id: i64) -> Option<String> {
        self.statuses.lock().unwrap().get(&ledger_id).cloned()
    }

    fn forced_error(slot: &Mutex<Option<String>>) -> Option<EscrowError> {
        slot.lock().unwrap().clone().map(EscrowError::ChainCall)
    }

    /// Apply a mutation with at-least-once semantics.
    fn mutate(
        &self,
        ledger_id: i64,
        target: &str,
        error_slot: &Mutex<Option<String>>,
    ) -> EscrowResult<()> {
        if let Some(e) = Self::forced_error(error_slot) {
            return Err(e);
        }
        let mut statuses = self.statuses.lock().unwrap();
        match statuses.get(&ledger_id) {
            None => Err(EscrowError::ChainCall(format!(
                "unknown ledger escrow {ledger_id}"
            ))),
            Some(current) if current == target => Ok(()),
            Some(_) => {
                statuses.insert(ledger_id, target.to_string());
                Ok(())
            }
        }
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerGateway for MockLedger {
    async fn create(
        &self,
        _seller: &str,
        _token: &str,
        _amount: i64,
        _release_time_unix: i64,
    ) -> EscrowResult<LedgerCreate> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = Self::forced_error(&self.create_error) {
            return Err(e);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.set_status(id, "created");

        let ledger_escrow_id = if self.omit_created_event.load(Ordering::SeqCst) {
            None
        } else {
            Some(id)
        };
        Ok(LedgerCreate {
            tx_hash: format!("0xmock{id:04x}"),
            ledger_escrow_id,
        })
    }

    async fn mark_funded(&self, ledger_escrow_id: i64, _buyer: &str) -> EscrowResult<()> {
        self.mark_funded_calls.fetch_add(1, Ordering::SeqCst);
        self.mutate(ledger_escrow_id, "funded", &self.mark_funded_error)
    }

    async fn mark_shipped(&self, ledger_escrow_id: i64) -> EscrowResult<()> {
        self.mark_shipped_calls.fetch_add(1, Ordering::SeqCst);
        self.mutate(ledger_escrow_id, "shipped", &self.mark_shipped_error)
    }

    async fn release(&self, ledger_escrow_id: i64) -> EscrowResult<()> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.mutate(ledger_escrow_id, "released", &self.release_error)
    }

    async fn refund(&self, ledger_escrow_id: i64) -> EscrowResult<()> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.mutate(ledger_escrow_id, "refunded", &self.refund_error)
    }

    async fn get_status(&self, ledger_escrow_id: i64) -> EscrowResult<String> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.status_of(ledger_escrow_id)
            .ok_or_else(|| EscrowError::ChainCall(format!("unknown ledger escrow {ledger_escrow_id}")))
    }
}
