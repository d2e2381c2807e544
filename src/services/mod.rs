//! Service layer: the coordinator and the background sweeps

pub mod coordinator;
pub mod reconciliation;
pub mod timeout_scheduler;

pub use coordinator::{
    ActionPayload, ActorProof, ApplyOutcome, BuyerProof, FundingConfirmation,
    ReconciliationCoordinator, Settlement,
};
pub use reconciliation::Divergence;
pub use timeout_scheduler::{SweepStats, TimeoutScheduler};
