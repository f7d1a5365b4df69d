pub mod amount;
pub mod config;
pub mod csv;
pub mod dispatch;
pub mod engine;
pub mod fare;
pub mod ledger;
pub mod model;
pub mod payments;
pub mod presence;
pub mod settlement;

pub use amount::Amount;
pub use engine::{Engine, EngineError};
pub use model::{Command, Location, Owner, Ride, RideId, RideRequest, RideStatus, Role, UserId};
