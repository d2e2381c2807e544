//! Reconciliation report: detect off-chain / on-chain drift
//!
//! Best-effort ledger calls mean a record can commit while its on-chain
//! mirror lags. The report walks every non-terminal record that holds a
//! ledger id, asks the contract for its status, and logs any mismatch.
//! Report-only: automatic repair is a human decision, not a sweep's.

use tracing::{error, warn};

use crate::db::{self, DbPool};
use crate::error::EscrowResult;
use crate::ledger::LedgerGateway;
use crate::models::escrow::Escrow;

/// One stored-vs-ledger status mismatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub escrow_id: String,
    pub ledger_escrow_id: i64,
    pub stored_status: String,
    pub ledger_status: String,
}

/// Compare stored statuses against the ledger for up to `limit` active
/// records.
///
/// A failed status query for one record is logged and skipped; it is not
/// a divergence and does not abort the report.
pub async fn reconciliation_report(
    db: &DbPool,
    ledger: &dyn LedgerGateway,
    limit: i64,
) -> EscrowResult<Vec<Divergence>> {
    let records =
        db::with_conn(db, move |conn| Escrow::find_active_with_ledger_id(conn, limit)).await?;

    let mut divergences = Vec::new();
    for record in records {
        // find_active_with_ledger_id filters on a non-null ledger id
        let Some(ledger_id) = record.ledger_escrow_id else {
            continue;
        };

        match ledger.get_status(ledger_id).await {
            Ok(ledger_status) => {
                if ledger_status != record.status {
                    warn!(
                        escrow_id = %record.id,
                        ledger_escrow_id = ledger_id,
                        stored = %record.status,
                        ledger = %ledger_status,
                        "status divergence detected"
                    );
                    divergences.push(Divergence {
                        escrow_id: record.id,
                        ledger_escrow_id: ledger_id,
                        stored_status: record.status,
                        ledger_status,
                    });
                }
            }
            Err(e) => {
                error!(
                    escrow_id = %record.id,
                    ledger_escrow_id = ledger_id,
                    error = %e,
                    "ledger status query failed, skipping record"
                );
            }
        }
    }

    Ok(divergences)
}
