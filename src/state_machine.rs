//! Pure transition rules for the escrow lifecycle
//!
//! No I/O lives here. Given the current status and a requested action,
//! [`plan`] decides whether the transition applies, collapses into an
//! idempotent no-op, or is rejected. The coordinator owns authorization
//! and persistence; this module owns the graph.
//!
//! ```text
//! CREATED -> WAITING_PAYMENT -> FUNDED -> SHIPPED -> {RELEASED | DISPUTED}
//! FUNDED -> REFUNDED
//! {CREATED, WAITING_PAYMENT} -> {CANCELLED, EXPIRED}
//! DISPUTED -> {RELEASED | REFUNDED}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{EscrowError, EscrowResult};

/// Lifecycle status of an escrow record.
///
/// The serde form is the same snake_case string `as_str` produces and
/// the store persists; there is exactly one wire spelling per status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Created,
    WaitingPayment,
    Funded,
    Shipped,
    Released,
    Refunded,
    Disputed,
    Cancelled,
    Expired,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Created => "created",
            EscrowStatus::WaitingPayment => "waiting_payment",
            EscrowStatus::Funded => "funded",
            EscrowStatus::Shipped => "shipped",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
            EscrowStatus::Disputed => "disputed",
            EscrowStatus::Cancelled => "cancelled",
            EscrowStatus::Expired => "expired",
        }
    }

    /// Parse a stored status string. Unknown strings indicate a corrupt
    /// row, not a caller mistake, hence `Internal`.
    pub fn parse(s: &str) -> EscrowResult<Self> {
        match s {
            "created" => Ok(EscrowStatus::Created),
            "waiting_payment" => Ok(EscrowStatus::WaitingPayment),
            "funded" => Ok(EscrowStatus::Funded),
            "shipped" => Ok(EscrowStatus::Shipped),
            "released" => Ok(EscrowStatus::Released),
            "refunded" => Ok(EscrowStatus::Refunded),
            "disputed" => Ok(EscrowStatus::Disputed),
            "cancelled" => Ok(EscrowStatus::Cancelled),
            "expired" => Ok(EscrowStatus::Expired),
            other => Err(EscrowError::Internal(format!("unknown status '{other}'"))),
        }
    }

    /// Terminal states are retained for audit and never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Released
                | EscrowStatus::Refunded
                | EscrowStatus::Cancelled
                | EscrowStatus::Expired
        )
    }

    /// All valid successor states from this state.
    pub fn valid_transitions(&self) -> &'static [EscrowStatus] {
        use EscrowStatus::*;
        match self {
            Created => &[WaitingPayment, Funded, Cancelled, Expired],
            WaitingPayment => &[Funded, Cancelled, Expired],
            Funded => &[Shipped, Refunded],
            Shipped => &[Released, Disputed],
            Disputed => &[Released, Refunded],
            Released | Refunded | Cancelled | Expired => &[],
        }
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a resolved dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Released,
    Refunded,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Released => "released",
            Resolution::Refunded => "refunded",
        }
    }

    pub fn target_status(&self) -> EscrowStatus {
        match self {
            Resolution::Released => EscrowStatus::Released,
            Resolution::Refunded => EscrowStatus::Refunded,
        }
    }
}

/// A requested lifecycle transition.
///
/// Manual and scheduler-triggered variants of the same edge are distinct
/// actions because they carry different authorization requirements:
/// `Release` needs the buyer's proof, `AutoRelease` the synthetic system
/// actor, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// CREATED -> WAITING_PAYMENT (payment link / fiat invoice issued)
    AwaitPayment,
    /// {CREATED, WAITING_PAYMENT} -> FUNDED (funding confirmation arrived)
    Fund,
    /// FUNDED -> SHIPPED (seller submits shipment proof)
    Ship,
    /// SHIPPED -> RELEASED (buyer confirms receipt)
    Release,
    /// SHIPPED -> RELEASED (scheduler, auto-release window elapsed)
    AutoRelease,
    /// FUNDED -> REFUNDED (seller cancels before shipping)
    Refund,
    /// FUNDED -> REFUNDED (scheduler, shipping deadline elapsed)
    AutoRefund,
    /// SHIPPED -> DISPUTED (buyer raises a dispute)
    Dispute,
    /// DISPUTED -> {RELEASED, REFUNDED} (admin resolution)
    Resolve(Resolution),
    /// {CREATED, WAITING_PAYMENT} -> CANCELLED (seller withdraws)
    Cancel,
    /// {CREATED, WAITING_PAYMENT} -> EXPIRED (scheduler, never funded)
    Expire,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::AwaitPayment => "await_payment",
            Action::Fund => "fund",
            Action::Ship => "ship",
            Action::Release => "release",
            Action::AutoRelease => "auto_release",
            Action::Refund => "refund",
            Action::AutoRefund => "auto_refund",
            Action::Dispute => "dispute",
            Action::Resolve(_) => "resolve",
            Action::Cancel => "cancel",
            Action::Expire => "expire",
        }
    }
}

/// Which party must prove identity for an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredActor {
    Seller,
    Buyer,
    Admin,
    System,
    SellerOrSystem,
}

/// Authorization table: one entry per action, consumed by the coordinator.
pub fn required_actor(action: Action) -> RequiredActor {
    match action {
        Action::AwaitPayment => RequiredActor::SellerOrSystem,
        Action::Fund => RequiredActor::System,
        Action::Ship => RequiredActor::Seller,
        Action::Release => RequiredActor::Buyer,
        Action::AutoRelease => RequiredActor::System,
        Action::Refund => RequiredActor::Seller,
        Action::AutoRefund => RequiredActor::System,
        Action::Dispute => RequiredActor::Buyer,
        Action::Resolve(_) => RequiredActor::Admin,
        Action::Cancel => RequiredActor::Seller,
        Action::Expire => RequiredActor::System,
    }
}

/// Side-conditions carried by the request, checked by the guards
#[derive(Debug, Default, Clone, Copy)]
pub struct ActionCtx<'a> {
    pub shipment_proof: Option<&'a str>,
    pub dispute_reason: Option<&'a str>,
}

/// Decision returned by [`plan`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Commit the transition to the given status
    Apply { to: EscrowStatus },
    /// The record is already where this action would put it; succeed
    /// without side effects
    Noop,
}

/// Decide whether `action` may proceed from `current`.
///
/// Actions that target the state the record is already in succeed as
/// idempotent no-ops, with one deliberate exception: a second dispute on
/// an already-disputed escrow is rejected.
pub fn plan(current: EscrowStatus, action: Action, ctx: &ActionCtx) -> EscrowResult<Plan> {
    use EscrowStatus::*;

    let invalid = || {
        Err(EscrowError::InvalidTransition {
            from: current.as_str().to_string(),
            action: action.as_str(),
        })
    };

    match action {
        Action::AwaitPayment => match current {
            Created => Ok(Plan::Apply { to: WaitingPayment }),
            WaitingPayment => Ok(Plan::Noop),
            _ => invalid(),
        },
        Action::Fund => match current {
            Created | WaitingPayment => Ok(Plan::Apply { to: Funded }),
            Funded => Ok(Plan::Noop),
            _ => invalid(),
        },
        Action::Ship => match current {
            Funded => {
                match ctx.shipment_proof {
                    Some(proof) if !proof.trim().is_empty() => {}
                    _ => {
                        return Err(EscrowError::Validation(
                            "shipment proof must be non-empty".to_string(),
                        ))
                    }
                }
                Ok(Plan::Apply { to: Shipped })
            }
            Shipped => Ok(Plan::Noop),
            _ => invalid(),
        },
        Action::Release | Action::AutoRelease => match current {
            Shipped => Ok(Plan::Apply { to: Released }),
            Released => Ok(Plan::Noop),
            // A dispute freezes release; only Resolve can move it.
            _ => invalid(),
        },
        Action::Refund | Action::AutoRefund => match current {
            Funded => Ok(Plan::Apply { to: Refunded }),
            Refunded => Ok(Plan::Noop),
            _ => invalid(),
        },
        Action::Dispute => match current {
            Shipped => {
                match ctx.dispute_reason {
                    Some(reason) if !reason.trim().is_empty() => {}
                    _ => {
                        return Err(EscrowError::Validation(
                            "dispute reason must be non-empty".to_string(),
                        ))
                    }
                }
                Ok(Plan::Apply { to: Disputed })
            }
            // Double dispute is explicitly disallowed, not a no-op.
            _ => invalid(),
        },
        Action::Resolve(resolution) => {
            let target = resolution.target_status();
            match current {
                Disputed => Ok(Plan::Apply { to: target }),
                s if s == target => Ok(Plan::Noop),
                _ => invalid(),
            }
        }
        Action::Cancel => match current {
            Created | WaitingPayment => Ok(Plan::Apply { to: Cancelled }),
            Cancelled => Ok(Plan::Noop),
            _ => invalid(),
        },
        Action::Expire => match current {
            Created | WaitingPayment => Ok(Plan::Apply { to: Expired }),
            Expired => Ok(Plan::Noop),
            _ => invalid(),
        },
    }
}
