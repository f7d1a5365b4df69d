//! Ride settlement: the fare debit, platform commission and driver earning posted
//! once per completed ride.
//!
//! The three legs are staged and then applied inside the ledger's critical section,
//! so they are observed all together or not at all. Completing a ride settles it in
//! the same step (see [`Ledger::update_ride_and_settle`]); [`reconcile`] re-runs
//! settlement for a single ride and reports [`SettlementOutcome::AlreadySettled`]
//! without writing when the ride already carries one.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::Amount;
use crate::engine::RideError;
use crate::ledger::{Ledger, WalletError};
use crate::model::{Ride, RideId, RideStatus, TxnId, UserId};

/// Why a settlement could not be posted. Nothing was written.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SettlementError {
    #[error(transparent)]
    Ride(#[from] RideError),

    #[error(transparent)]
    Wallet(#[from] WalletError),
}

/// Amounts to post for one completed ride.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementPlan {
    pub ride: RideId,
    pub customer: UserId,
    pub driver: UserId,
    pub customer_fare: Amount,
    pub commission: Amount,
    pub driver_earning: Amount,
    /// False when the fare was already collected by card.
    pub collect_from_wallet: bool,
}

impl SettlementPlan {
    pub fn for_ride(ride: &Ride) -> Result<Self, RideError> {
        let not_settleable = || RideError::NotSettleable {
            ride: ride.id,
            status: ride.status,
        };
        if ride.status != RideStatus::Completed {
            return Err(not_settleable());
        }
        let driver = ride.driver.ok_or_else(not_settleable)?;

        Ok(Self {
            ride: ride.id,
            customer: ride.customer,
            driver,
            customer_fare: ride.fare.customer_fare,
            commission: ride.fare.commission,
            driver_earning: ride.fare.driver_earning,
            collect_from_wallet: !ride.is_paid(),
        })
    }
}

/// What happened to the customer's side of the settlement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum CustomerLeg {
    Debited(TxnId),
    /// Wallet could not cover the fare; no debit was recorded.
    Insufficient { available: Amount, requested: Amount },
    PaidByCard,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settlement {
    pub ride: RideId,
    pub customer: CustomerLeg,
    pub commission: TxnId,
    pub driver_credit: TxnId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    Posted(Settlement),
    AlreadySettled,
}

/// Settle a completed ride exactly once.
///
/// A short customer wallet does not block settlement: the ride stays completed and
/// the commission and driver earning are still posted from the full fare.
// TODO: decide whether a short wallet should leave the ride owing instead of paying
// the driver and platform from uncollected funds.
pub fn reconcile(
    ledger: &Ledger,
    ride: RideId,
    now: DateTime<Utc>,
) -> Result<SettlementOutcome, SettlementError> {
    let outcome = ledger.settle_ride(ride, now)?;
    log_outcome(ride, &outcome);
    Ok(outcome)
}

pub fn log_outcome(ride: RideId, outcome: &SettlementOutcome) {
    match outcome {
        SettlementOutcome::Posted(settlement) => {
            if let CustomerLeg::Insufficient {
                available,
                requested,
            } = settlement.customer
            {
                warn!(
                    ride,
                    available = %available,
                    requested = %requested,
                    "customer wallet short, fare debit skipped"
                );
            }
            info!(
                ride,
                commission_txn = settlement.commission,
                driver_txn = settlement.driver_credit,
                "ride settled"
            );
        }
        SettlementOutcome::AlreadySettled => {
            info!(ride, "ride already settled");
        }
    }
}
