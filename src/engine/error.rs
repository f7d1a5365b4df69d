//! Error types for ride dispatch.

use std::fmt;

use thiserror::Error;

use crate::fare::FareError;
use crate::ledger::WalletError;
use crate::model::{RideId, RideStatus, UserId};
use crate::settlement::SettlementError;

/// Top-level error returned by [`Engine`](super::Engine) operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Ride(#[from] RideError),

    #[error(transparent)]
    Fare(#[from] FareError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("payment declined: {0}")]
    PaymentDeclined(String),
}

impl From<SettlementError> for EngineError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::Ride(e) => EngineError::Ride(e),
            SettlementError::Wallet(e) => EngineError::Wallet(e),
        }
    }
}

/// Why a requested transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    /// The target is not reachable from the current status.
    NotInGraph,
    /// Only the assigned driver may move the ride forward.
    NotAssignedDriver { caller: UserId },
    /// The ride has no driver to reassign from.
    NoDriver,
    /// Completed and cancelled rides never change again.
    Terminal,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionReason::NotInGraph => f.write_str("transition not allowed"),
            TransitionReason::NotAssignedDriver { caller } => {
                write!(f, "driver {caller} is not assigned to this ride")
            }
            TransitionReason::NoDriver => f.write_str("ride has no assigned driver"),
            TransitionReason::Terminal => f.write_str("ride is already finished"),
        }
    }
}

/// Error from the ride state machine. The ride is left unchanged.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RideError {
    #[error("ride {0} not found")]
    NotFound(RideId),

    #[error("ride {ride}: cannot move from {from} to {to}: {reason}")]
    InvalidTransition {
        ride: RideId,
        from: RideStatus,
        to: RideStatus,
        reason: TransitionReason,
    },

    #[error("ride {0} is no longer available")]
    AlreadyAccepted(RideId),

    #[error("ride {ride} cannot be settled while {status}")]
    NotSettleable { ride: RideId, status: RideStatus },
}
