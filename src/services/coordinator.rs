//! Reconciliation coordinator: the single entry point for lifecycle
//! transitions
//!
//! Every transition, whether a human actor's request or a scheduler
//! sweep, flows through [`ReconciliationCoordinator::apply`]: load the
//! record, verify the actor proof, consult the state machine, fire the
//! ledger call where the transition has an on-chain counterpart, then
//! commit via the record store's compare-and-set. One code path, one
//! authorization table, regardless of trigger source.
//!
//! Ledger calls are best-effort for transitions whose trust source is
//! the off-chain confirmation (buyer confirm, dispute resolution, the
//! fiat funding webhook): a `ChainCall` failure is logged, the commit
//! proceeds, and the outcome carries `Settlement::Pending` so the
//! caller can render "action recorded, on-chain settlement pending".
//! Funding detected *on* the ledger is the opposite: the status query
//! must succeed or the transition blocks.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::TimeoutConfig;
use crate::db::{self, DbPool};
use crate::error::{EscrowError, EscrowResult};
use crate::ledger::LedgerGateway;
use crate::models::escrow::{Escrow, EscrowChanges, EscrowDraft};
use crate::state_machine::{self, Action, ActionCtx, EscrowStatus, Plan, RequiredActor, Resolution};

/// Proof of buyer identity: wallet address (ledger path) or bearer
/// capability token (fiat path). Both are compared against the record
/// with simple equality; cryptographic verification is out of scope.
#[derive(Debug, Clone)]
pub enum BuyerProof {
    Address(String),
    Token(String),
}

/// Unified actor proof consumed by every transition.
///
/// `System` is the synthetic actor the scheduler and trusted internal
/// callers (funding monitor, fiat webhook handler) present.
#[derive(Debug, Clone)]
pub enum ActorProof {
    Seller(String),
    Buyer(BuyerProof),
    Admin,
    System,
}

/// How a funding confirmation arrived
#[derive(Debug, Clone)]
pub enum FundingConfirmation {
    /// Deposit observed on the ledger; the gateway status query is
    /// authoritative and a failure blocks the transition
    LedgerDeposit { buyer_address: String },
    /// Fiat provider callback; the off-chain confirmation is
    /// authoritative and a capability token is issued to the buyer
    FiatInvoicePaid { provider_ref: String },
}

/// Request payload accompanying a transition
#[derive(Debug, Default, Clone)]
pub struct ActionPayload {
    pub shipment_proof: Option<String>,
    pub dispute_reason: Option<String>,
    pub funding: Option<FundingConfirmation>,
}

/// On-chain side of a committed transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Ledger call succeeded (or was already applied)
    Confirmed,
    /// Ledger call failed; off-chain commit proceeded, reconciliation
    /// will catch up
    Pending(String),
    /// The transition has no on-chain counterpart
    NotApplicable,
}

/// Result of a successful `apply`
#[derive(Debug)]
pub struct ApplyOutcome {
    pub escrow: Escrow,
    pub settlement: Settlement,
}

pub struct ReconciliationCoordinator {
    db: DbPool,
    ledger: Arc<dyn LedgerGateway>,
    timeouts: TimeoutConfig,
}

impl ReconciliationCoordinator {
    pub fn new(db: DbPool, ledger: Arc<dyn LedgerGateway>, timeouts: TimeoutConfig) -> Self {
        Self {
            db,
            ledger,
            timeouts,
        }
    }

    /// Create a new escrow record and, best-effort, its on-chain
    /// counterpart.
    ///
    /// The record is committed first; a failed ledger create leaves
    /// `ledger_escrow_id` null for later backfill rather than failing
    /// the request.
    pub async fn create(&self, draft: EscrowDraft) -> EscrowResult<Escrow> {
        validate_draft(&draft)?;

        let escrow = db::with_conn(&self.db, move |conn| Escrow::create(conn, draft)).await?;
        info!(escrow_id = %escrow.id, seller = %escrow.seller_address, "escrow created");

        let release_time_unix = escrow
            .release_time
            .map(|t| t.and_utc().timestamp())
            .unwrap_or_default();

        match self
            .ledger
            .create(
                &escrow.seller_address,
                &escrow.settlement_token,
                escrow.settlement_amount,
                release_time_unix,
            )
            .await
        {
            Ok(created) => {
                if let Some(ledger_id) = created.ledger_escrow_id {
                    let escrow_id = escrow.id.clone();
                    db::with_conn(&self.db, move |conn| {
                        Escrow::set_ledger_escrow_id(conn, &escrow_id, ledger_id)
                    })
                    .await?;
                    info!(
                        escrow_id = %escrow.id,
                        ledger_escrow_id = ledger_id,
                        tx_hash = %created.tx_hash,
                        "ledger escrow created"
                    );
                } else {
                    warn!(
                        escrow_id = %escrow.id,
                        tx_hash = %created.tx_hash,
                        "ledger create mined but no EscrowCreated event decoded"
                    );
                }
            }
            Err(e) => {
                warn!(
                    escrow_id = %escrow.id,
                    error = %e,
                    "ledger create failed, record kept with null ledger id"
                );
            }
        }

        self.get_by_id(&escrow.id).await
    }

    pub async fn get_by_id(&self, escrow_id: &str) -> EscrowResult<Escrow> {
        let id = escrow_id.to_string();
        db::with_conn(&self.db, move |conn| Escrow::find_by_id(conn, &id))
            .await?
            .ok_or_else(|| EscrowError::NotFound(escrow_id.to_string()))
    }

    pub async fn list_by_seller(&self, seller: &str) -> EscrowResult<Vec<Escrow>> {
        let seller = seller.to_string();
        db::with_conn(&self.db, move |conn| Escrow::find_by_seller(conn, &seller)).await
    }

    // ------------------------------------------------------------------
    // Named operations (the surface the API layer consumes)
    // ------------------------------------------------------------------

    pub async fn mark_waiting_payment(
        &self,
        escrow_id: &str,
        proof: &ActorProof,
    ) -> EscrowResult<ApplyOutcome> {
        self.apply(escrow_id, Action::AwaitPayment, proof, ActionPayload::default())
            .await
    }

    pub async fn mark_funded(
        &self,
        escrow_id: &str,
        proof: &ActorProof,
        funding: FundingConfirmation,
    ) -> EscrowResult<ApplyOutcome> {
        let payload = ActionPayload {
            funding: Some(funding),
            ..Default::default()
        };
        self.apply(escrow_id, Action::Fund, proof, payload).await
    }

    pub async fn mark_shipped(
        &self,
        escrow_id: &str,
        proof: &ActorProof,
        shipment_proof: String,
    ) -> EscrowResult<ApplyOutcome> {
        let payload = ActionPayload {
            shipment_proof: Some(shipment_proof),
            ..Default::default()
        };
        self.apply(escrow_id, Action::Ship, proof, payload).await
    }

    pub async fn confirm_receipt(
        &self,
        escrow_id: &str,
        proof: &ActorProof,
    ) -> EscrowResult<ApplyOutcome> {
        self.apply(escrow_id, Action::Release, proof, ActionPayload::default())
            .await
    }

    pub async fn raise_dispute(
        &self,
        escrow_id: &str,
        proof: &ActorProof,
        reason: String,
    ) -> EscrowResult<ApplyOutcome> {
        let payload = ActionPayload {
            dispute_reason: Some(reason),
            ..Default::default()
        };
        self.apply(escrow_id, Action::Dispute, proof, payload).await
    }

    pub async fn resolve_dispute(
        &self,
        escrow_id: &str,
        proof: &ActorProof,
        resolution: Resolution,
    ) -> EscrowResult<ApplyOutcome> {
        self.apply(
            escrow_id,
            Action::Resolve(resolution),
            proof,
            ActionPayload::default(),
        )
        .await
    }

    pub async fn refund(&self, escrow_id: &str, proof: &ActorProof) -> EscrowResult<ApplyOutcome> {
        self.apply(escrow_id, Action::Refund, proof, ActionPayload::default())
            .await
    }

    pub async fn cancel(&self, escrow_id: &str, proof: &ActorProof) -> EscrowResult<ApplyOutcome> {
        self.apply(escrow_id, Action::Cancel, proof, ActionPayload::default())
            .await
    }

    // ------------------------------------------------------------------
    // Single entry point
    // ------------------------------------------------------------------

    /// Apply one lifecycle transition.
    ///
    /// Idempotent re-requests (the record is already where the action
    /// would put it) succeed without touching the ledger or the store.
    pub async fn apply(
        &self,
        escrow_id: &str,
        action: Action,
        proof: &ActorProof,
        payload: ActionPayload,
    ) -> EscrowResult<ApplyOutcome> {
        let escrow = self.get_by_id(escrow_id).await?;
        let current = escrow.status_enum()?;

        authorize(&escrow, action, proof)?;

        let ctx = ActionCtx {
            shipment_proof: payload.shipment_proof.as_deref(),
            dispute_reason: payload.dispute_reason.as_deref(),
        };
        let plan = state_machine::plan(current, action, &ctx)?;

        let to = match plan {
            Plan::Noop => {
                info!(
                    escrow_id = %escrow.id,
                    action = action.as_str(),
                    status = %escrow.status,
                    "idempotent re-request, no transition applied"
                );
                return Ok(ApplyOutcome {
                    escrow,
                    settlement: Settlement::NotApplicable,
                });
            }
            Plan::Apply { to } => to,
        };

        let (changes, settlement) = self.side_effects(&escrow, action, &payload).await?;

        let id = escrow.id.clone();
        let updated = db::with_conn(&self.db, move |conn| {
            Escrow::update_status_guarded(conn, &id, current, to, changes)
        })
        .await?;

        info!(
            escrow_id = %updated.id,
            action = action.as_str(),
            from = current.as_str(),
            to = to.as_str(),
            "transition committed"
        );

        Ok(ApplyOutcome {
            escrow: updated,
            settlement,
        })
    }

    /// Ledger side-effect and column writes for an admitted transition.
    ///
    /// Runs before the store commit; no DB connection is held while the
    /// ledger call is in flight.
    async fn side_effects(
        &self,
        escrow: &Escrow,
        action: Action,
        payload: &ActionPayload,
    ) -> EscrowResult<(EscrowChanges, Settlement)> {
        let now = Utc::now().naive_utc();
        let mut changes = EscrowChanges::default();

        let settlement = match action {
            Action::AwaitPayment | Action::Cancel | Action::Expire => Settlement::NotApplicable,

            Action::Fund => {
                let funding = payload.funding.as_ref().ok_or_else(|| {
                    EscrowError::Validation("funding confirmation required".to_string())
                })?;
                changes.funded_at = Some(now);

                match funding {
                    FundingConfirmation::LedgerDeposit { buyer_address } => {
                        // Trust source is the ledger: the status query
                        // must succeed and report the deposit.
                        let ledger_id = escrow.ledger_escrow_id.ok_or_else(|| {
                            EscrowError::ChainCall(
                                "ledger escrow id not yet assigned".to_string(),
                            )
                        })?;
                        let status = self.ledger.get_status(ledger_id).await?;
                        if status != EscrowStatus::Funded.as_str() {
                            return Err(EscrowError::ChainCall(format!(
                                "ledger reports status '{status}', deposit not visible"
                            )));
                        }
                        changes.buyer_address = Some(buyer_address.clone());
                        Settlement::Confirmed
                    }
                    FundingConfirmation::FiatInvoicePaid { provider_ref } => {
                        // Off-chain confirmation is authoritative; issue
                        // the buyer a capability token and mirror the
                        // funding on-chain best-effort.
                        changes.buyer_token = Some(Uuid::new_v4().to_string());
                        match escrow.ledger_escrow_id {
                            Some(ledger_id) => {
                                let buyer_ref = format!("fiat:{provider_ref}");
                                settle(self.ledger.mark_funded(ledger_id, &buyer_ref).await)
                            }
                            None => pending_no_ledger_id(escrow),
                        }
                    }
                }
            }

            Action::Ship => {
                changes.shipped_at = Some(now);
                changes.shipment_proof = payload.shipment_proof.clone();
                changes.auto_release_at = Some(now + self.timeouts.auto_release_window());
                match escrow.ledger_escrow_id {
                    Some(ledger_id) => settle(self.ledger.mark_shipped(ledger_id).await),
                    None => pending_no_ledger_id(escrow),
                }
            }

            Action::Release => {
                changes.delivered_at = Some(now);
                changes.released_at = Some(now);
                match escrow.ledger_escrow_id {
                    Some(ledger_id) => settle(self.ledger.release(ledger_id).await),
                    None => pending_no_ledger_id(escrow),
                }
            }

            Action::AutoRelease => {
                changes.released_at = Some(now);
                match escrow.ledger_escrow_id {
                    Some(ledger_id) => settle(self.ledger.release(ledger_id).await),
                    None => pending_no_ledger_id(escrow),
                }
            }

            Action::Refund | Action::AutoRefund => match escrow.ledger_escrow_id {
                Some(ledger_id) => settle(self.ledger.refund(ledger_id).await),
                None => pending_no_ledger_id(escrow),
            },

            Action::Dispute => {
                // Freezing automatic release is purely an off-chain
                // concern; the contract is untouched until resolution.
                changes.disputed_at = Some(now);
                changes.dispute_reason = payload.dispute_reason.clone();
                Settlement::NotApplicable
            }

            Action::Resolve(resolution) => {
                changes.dispute_resolution = Some(resolution.as_str().to_string());
                if resolution == Resolution::Released {
                    changes.released_at = Some(now);
                }
                match escrow.ledger_escrow_id {
                    Some(ledger_id) => {
                        let result = match resolution {
                            Resolution::Released => self.ledger.release(ledger_id).await,
                            Resolution::Refunded => self.ledger.refund(ledger_id).await,
                        };
                        settle(result)
                    }
                    None => pending_no_ledger_id(escrow),
                }
            }
        };

        Ok((changes, settlement))
    }
}

/// Map a best-effort ledger result onto the settlement marker.
fn settle(result: EscrowResult<()>) -> Settlement {
    match result {
        Ok(()) => Settlement::Confirmed,
        Err(e) => Settlement::Pending(e.to_string()),
    }
}

fn pending_no_ledger_id(escrow: &Escrow) -> Settlement {
    warn!(
        escrow_id = %escrow.id,
        "no ledger escrow id yet, on-chain settlement deferred"
    );
    Settlement::Pending("ledger escrow id not yet assigned".to_string())
}

/// Verify the actor proof against the record for the requested action.
fn authorize(escrow: &Escrow, action: Action, proof: &ActorProof) -> EscrowResult<()> {
    let allowed = match state_machine::required_actor(action) {
        RequiredActor::Seller => {
            matches!(proof, ActorProof::Seller(addr) if *addr == escrow.seller_address)
        }
        RequiredActor::SellerOrSystem => matches!(
            proof,
            ActorProof::System
        ) || matches!(proof, ActorProof::Seller(addr) if *addr == escrow.seller_address),
        RequiredActor::Buyer => match proof {
            ActorProof::Buyer(BuyerProof::Address(addr)) => {
                escrow.buyer_address.as_deref() == Some(addr.as_str())
            }
            ActorProof::Buyer(BuyerProof::Token(token)) => {
                escrow.buyer_token.as_deref() == Some(token.as_str())
            }
            _ => false,
        },
        RequiredActor::Admin => matches!(proof, ActorProof::Admin),
        RequiredActor::System => matches!(proof, ActorProof::System),
    };

    if allowed {
        Ok(())
    } else {
        Err(EscrowError::Unauthorized)
    }
}

fn validate_draft(draft: &EscrowDraft) -> EscrowResult<()> {
    if draft.seller_address.trim().is_empty() {
        return Err(EscrowError::Validation(
            "seller address must be non-empty".to_string(),
        ));
    }
    if draft.item_name.trim().is_empty() {
        return Err(EscrowError::Validation(
            "item name must be non-empty".to_string(),
        ));
    }
    if draft.settlement_amount <= 0 {
        return Err(EscrowError::Validation(
            "settlement amount must be positive".to_string(),
        ));
    }
    if draft.fiat_amount < 0 {
        return Err(EscrowError::Validation(
            "fiat amount must not be negative".to_string(),
        ));
    }
    if draft.release_duration_secs <= 0 {
        return Err(EscrowError::Validation(
            "release duration must be positive".to_string(),
        ));
    }
    Ok(())
}
