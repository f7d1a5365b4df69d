//! Core domain types for the dispatch engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Amount;
use crate::fare::FareQuote;

/// Identifier of a customer, driver or admin.
pub type UserId = u64;

/// Ride identifier.
pub type RideId = u64;

/// Ledger transaction identifier.
pub type TxnId = u64;

/// A point on the map. The address is free text supplied by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    pub address: String,
}

impl Location {
    pub fn new(lat: f64, lng: f64, address: impl Into<String>) -> Self {
        Self {
            lat,
            lng,
            address: address.into(),
        }
    }

    pub fn has_valid_coordinates(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Coordinates in range and a non-blank address.
    pub fn is_valid(&self) -> bool {
        self.has_valid_coordinates() && !self.address.trim().is_empty()
    }
}

/// Who a connection or a broadcast belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Driver,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Customer => "customer",
            Role::Driver => "driver",
            Role::Admin => "admin",
        })
    }
}

/// Ride lifecycle. Moves forward only; `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,
    Accepted,
    OnTheWay,
    InProgress,
    Completed,
    Cancelled,
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RideStatus::Pending => "pending",
            RideStatus::Accepted => "accepted",
            RideStatus::OnTheWay => "on_the_way",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        })
    }
}

impl std::str::FromStr for RideStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RideStatus::Pending),
            "accepted" => Ok(RideStatus::Accepted),
            "on_the_way" => Ok(RideStatus::OnTheWay),
            "in_progress" => Ok(RideStatus::InProgress),
            "completed" => Ok(RideStatus::Completed),
            "cancelled" => Ok(RideStatus::Cancelled),
            other => Err(format!("unknown ride status '{other}'")),
        }
    }
}

/// A customer's request for a ride, before pricing.
#[derive(Debug, Clone)]
pub struct RideRequest {
    pub customer: UserId,
    pub pickup: Location,
    pub dropoff: Location,
    /// Ordered midway stops.
    pub stops: Vec<Location>,
    pub instructions: String,
}

impl RideRequest {
    pub fn new(customer: UserId, pickup: Location, dropoff: Location) -> Self {
        Self {
            customer,
            pickup,
            dropoff,
            stops: Vec::new(),
            instructions: String::new(),
        }
    }

    /// Pickup, stops and dropoff in travel order.
    pub fn route_points(&self) -> Vec<Location> {
        let mut points = Vec::with_capacity(self.stops.len() + 2);
        points.push(self.pickup.clone());
        points.extend(self.stops.iter().cloned());
        points.push(self.dropoff.clone());
        points
    }
}

/// A ride record. Only the ledger mutates it, through the state machine guards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ride {
    pub id: RideId,
    pub customer: UserId,
    pub driver: Option<UserId>,
    pub pickup: Location,
    pub dropoff: Location,
    pub stops: Vec<Location>,
    pub instructions: String,
    pub status: RideStatus,
    pub fare: FareQuote,
    pub requested_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub dropped_off_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Set once the settlement unit has been posted.
    pub settled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Processor payment id when the customer paid by card.
    pub card_payment: Option<String>,
    pub refunded: bool,
}

impl Ride {
    pub fn is_settled(&self) -> bool {
        self.settled_at.is_some()
    }

    pub fn is_paid(&self) -> bool {
        self.card_payment.is_some()
    }

    /// Latest transition timestamp recorded on this ride.
    pub fn last_transition_at(&self) -> DateTime<Utc> {
        [
            self.accepted_at,
            self.arrived_at,
            self.picked_up_at,
            self.dropped_off_at,
            self.cancelled_at,
        ]
        .into_iter()
        .flatten()
        .fold(self.requested_at, |latest, at| latest.max(at))
    }
}

/// Owner of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    Customer(UserId),
    Driver(UserId),
    /// The platform's own commission ledger.
    Platform,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Customer(id) => write!(f, "customer {id}"),
            Owner::Driver(id) => write!(f, "driver {id}"),
            Owner::Platform => f.write_str("platform"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnKind {
    /// Customer fare debit on ride completion.
    RideFare,
    /// Platform commission on ride completion.
    AdminCommission,
    /// Driver earning credit on ride completion.
    Ride,
    Withdrawal,
    /// Held amount returned when a withdrawal is rejected.
    WithdrawalReversal,
    TopUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

/// Only withdrawals move between statuses; everything else is created `Paid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnStatus {
    Pending,
    Approved,
    Paid,
    Rejected,
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TxnStatus::Pending => "pending",
            TxnStatus::Approved => "approved",
            TxnStatus::Paid => "paid",
            TxnStatus::Rejected => "rejected",
        })
    }
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: TxnId,
    pub owner: Owner,
    pub kind: TxnKind,
    pub direction: Direction,
    pub amount: Amount,
    pub status: TxnStatus,
    pub ride: Option<RideId>,
    /// Payout destination for withdrawals.
    pub destination: Option<String>,
    /// Processor reference once paid out.
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Commands accepted by [`Engine::run`](crate::Engine::run).
#[derive(Debug, Clone)]
pub enum Command {
    Connect { user: UserId, role: Role },
    TopUp { customer: UserId, amount: Amount },
    RequestRide(RideRequest),
    Accept { ride: RideId, driver: UserId },
    Advance { ride: RideId, driver: UserId, status: RideStatus },
    Cancel { ride: RideId, reason: String },
    RequestWithdrawal { driver: UserId, amount: Amount, destination: String },
    ApproveWithdrawal { txn: TxnId },
    RejectWithdrawal { txn: TxnId },
}
