//! Escrow model and transition-safe database operations
//!
//! The status column is only ever written through
//! [`Escrow::update_status_guarded`], a compare-and-set on the expected
//! current status. Concurrent callers (interactive requests and scheduler
//! sweeps racing on the same record) are safe without table locks: the
//! loser of the race gets `StaleState` and may reload and retry.

use chrono::{Duration, NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{EscrowError, EscrowResult};
use crate::schema::escrows;
use crate::state_machine::EscrowStatus;

/// Escrow record - column order MUST match schema.rs exactly!
/// Diesel's Queryable trait requires fields in the same order as the table columns.
#[derive(Debug, Clone, Serialize, Queryable)]
#[diesel(table_name = escrows)]
#[serde(rename_all = "camelCase")]
pub struct Escrow {
    pub id: String,
    /// Ledger-side identifier; NULL until the creating transaction is
    /// mined and its event parsed, immutable once set
    pub ledger_escrow_id: Option<i64>,
    pub seller_address: String,
    /// Set once at funding (ledger path), never overwritten
    pub buyer_address: Option<String>,
    /// Capability token for non-wallet buyers, set once at funding (fiat path)
    #[serde(skip_serializing)]
    pub buyer_token: Option<String>,
    pub item_name: String,
    pub item_description: Option<String>,
    pub settlement_token: String,
    pub settlement_amount: i64,
    pub fiat_amount: i64,
    pub fiat_currency: String,
    #[serde(rename = "releaseDurationSeconds")]
    pub release_duration_secs: i64,
    /// Exposed as unix seconds, not a datetime string
    #[serde(rename = "releaseTimeUnix", serialize_with = "opt_unix_seconds")]
    pub release_time: Option<NaiveDateTime>,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub funded_at: Option<NaiveDateTime>,
    pub shipped_at: Option<NaiveDateTime>,
    pub delivered_at: Option<NaiveDateTime>,
    pub released_at: Option<NaiveDateTime>,
    pub disputed_at: Option<NaiveDateTime>,
    pub auto_release_at: Option<NaiveDateTime>,
    pub shipment_proof: Option<String>,
    pub dispute_reason: Option<String>,
    pub dispute_resolution: Option<String>,
}

fn opt_unix_seconds<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(ts) => serializer.serialize_some(&ts.and_utc().timestamp()),
        None => serializer.serialize_none(),
    }
}

/// Seller-supplied fields for a new escrow
#[derive(Debug, Clone)]
pub struct EscrowDraft {
    pub seller_address: String,
    pub item_name: String,
    pub item_description: Option<String>,
    pub settlement_token: String,
    pub settlement_amount: i64,
    pub fiat_amount: i64,
    pub fiat_currency: String,
    pub release_duration_secs: i64,
}

#[derive(Insertable)]
#[diesel(table_name = escrows)]
struct NewEscrowRow {
    id: String,
    seller_address: String,
    item_name: String,
    item_description: Option<String>,
    settlement_token: String,
    settlement_amount: i64,
    fiat_amount: i64,
    fiat_currency: String,
    release_duration_secs: i64,
    release_time: Option<NaiveDateTime>,
    status: String,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

/// Optional columns written alongside a guarded status change.
///
/// `None` fields are left untouched, which is how write-once timestamps
/// survive later transitions: each transition only ever names its own
/// columns.
#[derive(AsChangeset, Default, Debug)]
#[diesel(table_name = escrows)]
pub struct EscrowChanges {
    pub buyer_address: Option<String>,
    pub buyer_token: Option<String>,
    pub funded_at: Option<NaiveDateTime>,
    pub shipped_at: Option<NaiveDateTime>,
    pub delivered_at: Option<NaiveDateTime>,
    pub released_at: Option<NaiveDateTime>,
    pub disputed_at: Option<NaiveDateTime>,
    pub auto_release_at: Option<NaiveDateTime>,
    pub shipment_proof: Option<String>,
    pub dispute_reason: Option<String>,
    pub dispute_resolution: Option<String>,
}

impl Escrow {
    /// Insert a new escrow in `created` status and return the stored row.
    ///
    /// The absolute release time is computed here, once, from the draft's
    /// release duration; it is never recalculated.
    pub fn create(conn: &mut SqliteConnection, draft: EscrowDraft) -> EscrowResult<Escrow> {
        let now = Utc::now().naive_utc();
        let row = NewEscrowRow {
            id: Uuid::new_v4().to_string(),
            seller_address: draft.seller_address,
            item_name: draft.item_name,
            item_description: draft.item_description,
            settlement_token: draft.settlement_token,
            settlement_amount: draft.settlement_amount,
            fiat_amount: draft.fiat_amount,
            fiat_currency: draft.fiat_currency,
            release_duration_secs: draft.release_duration_secs,
            release_time: Some(now + Duration::seconds(draft.release_duration_secs)),
            status: EscrowStatus::Created.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        let escrow_id = row.id.clone();

        diesel::insert_into(escrows::table)
            .values(&row)
            .execute(conn)?;

        Self::find_by_id(conn, &escrow_id)?
            .ok_or_else(|| EscrowError::Internal("inserted escrow not readable".to_string()))
    }

    pub fn find_by_id(conn: &mut SqliteConnection, escrow_id: &str) -> EscrowResult<Option<Escrow>> {
        escrows::table
            .filter(escrows::id.eq(escrow_id))
            .first(conn)
            .optional()
            .map_err(EscrowError::from)
    }

    /// All escrows for a seller, newest first.
    pub fn find_by_seller(conn: &mut SqliteConnection, seller: &str) -> EscrowResult<Vec<Escrow>> {
        escrows::table
            .filter(escrows::seller_address.eq(seller))
            .order(escrows::created_at.desc())
            .load(conn)
            .map_err(EscrowError::from)
    }

    /// Guarded, atomic compare-and-set status update.
    ///
    /// The write applies only if the stored status still equals `from`.
    /// Zero affected rows means either the id is unknown (`NotFound`) or
    /// another caller moved the status first (`StaleState`); a follow-up
    /// read disambiguates.
    pub fn update_status_guarded(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        from: EscrowStatus,
        to: EscrowStatus,
        changes: EscrowChanges,
    ) -> EscrowResult<Escrow> {
        let now = Utc::now().naive_utc();
        let affected = diesel::update(
            escrows::table
                .filter(escrows::id.eq(escrow_id))
                .filter(escrows::status.eq(from.as_str())),
        )
        .set((
            changes,
            escrows::status.eq(to.as_str()),
            escrows::updated_at.eq(now),
        ))
        .execute(conn)?;

        if affected == 0 {
            return match Self::find_by_id(conn, escrow_id)? {
                None => Err(EscrowError::NotFound(escrow_id.to_string())),
                Some(current) => Err(EscrowError::StaleState {
                    expected: from.as_str().to_string(),
                    actual: current.status,
                }),
            };
        }

        Self::find_by_id(conn, escrow_id)?
            .ok_or_else(|| EscrowError::NotFound(escrow_id.to_string()))
    }

    /// Backfill the ledger-assigned escrow identifier.
    ///
    /// The filter on `ledger_escrow_id IS NULL` enforces immutability: a
    /// second call with a different id silently leaves the first in place.
    pub fn set_ledger_escrow_id(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        ledger_id: i64,
    ) -> EscrowResult<bool> {
        let affected = diesel::update(
            escrows::table
                .filter(escrows::id.eq(escrow_id))
                .filter(escrows::ledger_escrow_id.is_null()),
        )
        .set((
            escrows::ledger_escrow_id.eq(ledger_id),
            escrows::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
        Ok(affected == 1)
    }

    /// Shipped escrows whose auto-release window has elapsed.
    ///
    /// The window is evaluated at sweep time from the constant currently
    /// in effect; `auto_release_at` on the row is an informational
    /// snapshot, not the eligibility source.
    pub fn due_for_auto_release(
        conn: &mut SqliteConnection,
        now: NaiveDateTime,
        window: Duration,
        limit: i64,
    ) -> EscrowResult<Vec<Escrow>> {
        let cutoff = now - window;
        escrows::table
            .filter(escrows::status.eq(EscrowStatus::Shipped.as_str()))
            .filter(escrows::shipped_at.is_not_null())
            .filter(escrows::shipped_at.le(cutoff))
            .order(escrows::shipped_at.asc())
            .limit(limit)
            .load(conn)
            .map_err(EscrowError::from)
    }

    /// Funded escrows whose seller never shipped within the deadline.
    pub fn due_for_auto_refund(
        conn: &mut SqliteConnection,
        now: NaiveDateTime,
        window: Duration,
        limit: i64,
    ) -> EscrowResult<Vec<Escrow>> {
        let cutoff = now - window;
        escrows::table
            .filter(escrows::status.eq(EscrowStatus::Funded.as_str()))
            .filter(escrows::funded_at.is_not_null())
            .filter(escrows::funded_at.le(cutoff))
            .order(escrows::funded_at.asc())
            .limit(limit)
            .load(conn)
            .map_err(EscrowError::from)
    }

    /// Never-funded escrows past the creation-expiry window.
    pub fn due_for_expiry(
        conn: &mut SqliteConnection,
        now: NaiveDateTime,
        window: Duration,
        limit: i64,
    ) -> EscrowResult<Vec<Escrow>> {
        let cutoff = now - window;
        escrows::table
            .filter(
                escrows::status
                    .eq(EscrowStatus::Created.as_str())
                    .or(escrows::status.eq(EscrowStatus::WaitingPayment.as_str())),
            )
            .filter(escrows::created_at.le(cutoff))
            .order(escrows::created_at.asc())
            .limit(limit)
            .load(conn)
            .map_err(EscrowError::from)
    }

    /// Non-terminal escrows that hold a ledger id, for the reconciliation
    /// report sweep.
    pub fn find_active_with_ledger_id(
        conn: &mut SqliteConnection,
        limit: i64,
    ) -> EscrowResult<Vec<Escrow>> {
        escrows::table
            .filter(escrows::ledger_escrow_id.is_not_null())
            .filter(escrows::status.ne(EscrowStatus::Released.as_str()))
            .filter(escrows::status.ne(EscrowStatus::Refunded.as_str()))
            .filter(escrows::status.ne(EscrowStatus::Cancelled.as_str()))
            .filter(escrows::status.ne(EscrowStatus::Expired.as_str()))
            .order(escrows::created_at.asc())
            .limit(limit)
            .load(conn)
            .map_err(EscrowError::from)
    }

    /// Current status as the typed enum.
    pub fn status_enum(&self) -> EscrowResult<EscrowStatus> {
        EscrowStatus::parse(&self.status)
    }
}
