//! Ride lifecycle state machine.
//!
//! ```text
//! pending -> accepted -> on_the_way -> in_progress -> completed
//!    \___________\____________\_____________\______-> cancelled
//! ```
//!
//! Guards are pure functions over a ride; the ledger runs them inside its lock so a
//! check and its write commit together.

use chrono::{DateTime, Utc};

use super::error::{RideError, TransitionReason};
use crate::model::{Ride, RideStatus, UserId};

/// A requested change to a ride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Accept { driver: UserId },
    /// Driver-driven move to `on_the_way`, `in_progress` or `completed`.
    Advance { driver: UserId, to: RideStatus },
    Cancel,
    /// Admin override of the assigned driver.
    Reassign { driver: UserId },
}

impl Transition {
    pub fn target(&self, current: RideStatus) -> RideStatus {
        match self {
            Transition::Accept { .. } => RideStatus::Accepted,
            Transition::Advance { to, .. } => *to,
            Transition::Cancel => RideStatus::Cancelled,
            Transition::Reassign { .. } => current,
        }
    }
}

/// Whether a transition changed the ride or was an idempotent repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// Status a driver moves the ride to next, if any.
    pub fn next(self) -> Option<RideStatus> {
        match self {
            RideStatus::Pending => Some(RideStatus::Accepted),
            RideStatus::Accepted => Some(RideStatus::OnTheWay),
            RideStatus::OnTheWay => Some(RideStatus::InProgress),
            RideStatus::InProgress => Some(RideStatus::Completed),
            RideStatus::Completed | RideStatus::Cancelled => None,
        }
    }
}

/// Apply `transition` to `ride`. On error the ride is untouched.
///
/// `now` is clamped to the ride's latest transition so timestamps never go backwards.
pub fn apply(
    ride: &mut Ride,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<Applied, RideError> {
    let from = ride.status;
    let to = transition.target(from);
    let now = now.max(ride.last_transition_at());

    let id = ride.id;
    let refuse = |reason| RideError::InvalidTransition {
        ride: id,
        from,
        to,
        reason,
    };

    let applied = match transition {
        Transition::Accept { driver } => match (ride.driver, from) {
            (None, RideStatus::Pending) => {
                ride.driver = Some(driver);
                ride.status = RideStatus::Accepted;
                ride.accepted_at = Some(now);
                Applied::Changed
            }
            // at-least-once delivery of the same acceptance
            (Some(current), RideStatus::Accepted) if current == driver => Applied::Unchanged,
            (Some(current), status) if current == driver => {
                let reason = if status.is_terminal() {
                    TransitionReason::Terminal
                } else {
                    TransitionReason::NotInGraph
                };
                return Err(refuse(reason));
            }
            (Some(_), _) => return Err(RideError::AlreadyAccepted(id)),
            (None, _) => return Err(refuse(TransitionReason::NotInGraph)),
        },

        Transition::Advance { driver, to } => {
            if ride.driver != Some(driver) {
                return Err(refuse(TransitionReason::NotAssignedDriver { caller: driver }));
            }
            if from == to && from != RideStatus::Cancelled {
                Applied::Unchanged
            } else if from.next() == Some(to) && to != RideStatus::Accepted {
                match to {
                    RideStatus::OnTheWay => ride.arrived_at = Some(now),
                    RideStatus::InProgress => ride.picked_up_at = Some(now),
                    RideStatus::Completed => ride.dropped_off_at = Some(now),
                    _ => return Err(refuse(TransitionReason::NotInGraph)),
                }
                ride.status = to;
                Applied::Changed
            } else if from.is_terminal() {
                return Err(refuse(TransitionReason::Terminal));
            } else {
                return Err(refuse(TransitionReason::NotInGraph));
            }
        }

        Transition::Cancel => match from {
            RideStatus::Cancelled => Applied::Unchanged,
            RideStatus::Completed => return Err(refuse(TransitionReason::Terminal)),
            _ => {
                ride.status = RideStatus::Cancelled;
                ride.cancelled_at = Some(now);
                Applied::Changed
            }
        },

        Transition::Reassign { driver } => {
            if from.is_terminal() {
                return Err(refuse(TransitionReason::Terminal));
            }
            match ride.driver {
                None => return Err(refuse(TransitionReason::NoDriver)),
                Some(current) if current == driver => Applied::Unchanged,
                Some(_) => {
                    ride.driver = Some(driver);
                    Applied::Changed
                }
            }
        }
    };

    if applied == Applied::Changed {
        ride.updated_at = now;
    }
    Ok(applied)
}
