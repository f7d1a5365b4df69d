//! Who is currently connected, and the push channel to reach them.
//!
//! The registry is an injected value with an explicit lifecycle: an entry exists from
//! `connect` until the matching `disconnect`. Nothing here is persisted; after a
//! restart clients reconnect and re-register.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::model::{Location, Ride, RideId, RideStatus, Role, Transaction, UserId};

/// Push event delivered to a connected user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum Event {
    /// Offer of a pending ride to a driver.
    NewRideRequest(Ride),
    RideAccepted(Ride),
    RideStatusUpdate {
        ride: RideId,
        status: RideStatus,
        driver: Option<UserId>,
    },
    DriverLocationUpdate {
        driver: UserId,
        ride: Option<RideId>,
        location: Location,
    },
    DriverLocationDisconnected {
        driver: UserId,
    },
    WithdrawalRequest(Transaction),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::NewRideRequest(_) => "new-ride-request",
            Event::RideAccepted(_) => "ride-accepted",
            Event::RideStatusUpdate { .. } => "ride-status-update",
            Event::DriverLocationUpdate { .. } => "driver-location-update",
            Event::DriverLocationDisconnected { .. } => "driver-location-disconnected",
            Event::WithdrawalRequest(_) => "withdrawal-request",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("user {0} is not connected")]
    NotConnected(UserId),

    #[error("channel to user {0} is closed")]
    Closed(UserId),
}

/// Best-effort push channel. Callers log and drop delivery errors.
pub trait Notifier: Send + Sync {
    fn send(&self, user: UserId, event: Event) -> Result<(), DeliveryError>;

    /// Deliver to every reachable user of `role`; returns how many were reached.
    fn broadcast_to_role(&self, role: Role, event: &Event) -> usize;

    fn is_reachable(&self, user: UserId) -> bool;

    fn reachable(&self, role: Role) -> Vec<UserId>;
}

/// Identifies one registration of a user.
pub type ConnectionId = u64;

/// The client's end of a registration.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub user: UserId,
    pub role: Role,
    pub events: mpsc::UnboundedReceiver<Event>,
}

#[derive(Debug)]
struct Session {
    connection: ConnectionId,
    role: Role,
    sender: mpsc::UnboundedSender<Event>,
}

/// Last known position of a driver sharing their location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverLocation {
    pub driver: UserId,
    pub ride: Option<RideId>,
    pub location: Location,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    sessions: RwLock<HashMap<UserId, Session>>,
    locations: RwLock<HashMap<UserId, DriverLocation>>,
    last_connection: AtomicU64,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> RwLockReadGuard<'_, HashMap<UserId, Session>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn sessions_mut(&self) -> RwLockWriteGuard<'_, HashMap<UserId, Session>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    fn locations_mut(&self) -> RwLockWriteGuard<'_, HashMap<UserId, DriverLocation>> {
        self.locations.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `user`. A second registration replaces the first for push delivery.
    pub fn connect(&self, user: UserId, role: Role) -> Connection {
        let id = self.last_connection.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, events) = mpsc::unbounded_channel();

        let replaced = self
            .sessions_mut()
            .insert(
                user,
                Session {
                    connection: id,
                    role,
                    sender,
                },
            )
            .is_some();
        info!(user, %role, connection = id, replaced, "user connected");

        Connection {
            id,
            user,
            role,
            events,
        }
    }

    /// Clear the entry if `connection` is still the registered one.
    ///
    /// Returns the role of the removed registration.
    pub fn disconnect(&self, user: UserId, connection: ConnectionId) -> Option<Role> {
        let mut sessions = self.sessions_mut();
        match sessions.get(&user) {
            Some(session) if session.connection == connection => {
                let role = session.role;
                sessions.remove(&user);
                info!(user, connection, "user disconnected");
                Some(role)
            }
            _ => {
                debug!(user, connection, "stale disconnect ignored");
                None
            }
        }
    }

    /// Record a driver's position. Last write wins.
    pub fn set_location(&self, location: DriverLocation) {
        self.locations_mut().insert(location.driver, location);
    }

    pub fn location(&self, driver: UserId) -> Option<DriverLocation> {
        self.locations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&driver)
            .cloned()
    }

    pub fn clear_location(&self, driver: UserId) -> Option<DriverLocation> {
        self.locations_mut().remove(&driver)
    }
}

impl Notifier for PresenceRegistry {
    fn send(&self, user: UserId, event: Event) -> Result<(), DeliveryError> {
        let sessions = self.sessions();
        let session = sessions.get(&user).ok_or(DeliveryError::NotConnected(user))?;
        session
            .sender
            .send(event)
            .map_err(|_| DeliveryError::Closed(user))
    }

    fn broadcast_to_role(&self, role: Role, event: &Event) -> usize {
        self.sessions()
            .values()
            .filter(|s| s.role == role)
            .filter(|s| s.sender.send(event.clone()).is_ok())
            .count()
    }

    fn is_reachable(&self, user: UserId) -> bool {
        self.sessions()
            .get(&user)
            .is_some_and(|s| !s.sender.is_closed())
    }

    fn reachable(&self, role: Role) -> Vec<UserId> {
        self.sessions()
            .iter()
            .filter(|(_, s)| s.role == role && !s.sender.is_closed())
            .map(|(user, _)| *user)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(ride: RideId) -> Event {
        Event::RideStatusUpdate {
            ride,
            status: RideStatus::OnTheWay,
            driver: Some(9),
        }
    }

    #[test]
    fn connected_user_receives_events() {
        let registry = PresenceRegistry::new();
        let mut conn = registry.connect(1, Role::Customer);

        registry.send(1, status(5)).unwrap();
        assert_eq!(conn.events.try_recv().unwrap(), status(5));
        assert!(registry.is_reachable(1));
    }

    #[test]
    fn unknown_user_is_not_connected() {
        let registry = PresenceRegistry::new();
        assert_eq!(
            registry.send(4, status(1)),
            Err(DeliveryError::NotConnected(4))
        );
        assert!(!registry.is_reachable(4));
    }

    #[test]
    fn dropped_receiver_is_unreachable() {
        let registry = PresenceRegistry::new();
        let conn = registry.connect(1, Role::Driver);
        drop(conn);

        assert!(!registry.is_reachable(1));
        assert!(registry.reachable(Role::Driver).is_empty());
        assert_eq!(registry.send(1, status(1)), Err(DeliveryError::Closed(1)));
    }

    #[test]
    fn last_registration_wins() {
        let registry = PresenceRegistry::new();
        let mut phone = registry.connect(9, Role::Driver);
        let mut tablet = registry.connect(9, Role::Driver);

        registry.send(9, status(1)).unwrap();
        assert!(tablet.events.try_recv().is_ok());
        assert!(phone.events.try_recv().is_err());

        // the replaced device going away must not unregister the live one
        assert_eq!(registry.disconnect(9, phone.id), None);
        assert!(registry.is_reachable(9));

        assert_eq!(registry.disconnect(9, tablet.id), Some(Role::Driver));
        assert!(!registry.is_reachable(9));
    }

    #[test]
    fn broadcast_reaches_only_the_role() {
        let registry = PresenceRegistry::new();
        let mut admin = registry.connect(1, Role::Admin);
        let mut other_admin = registry.connect(2, Role::Admin);
        let mut driver = registry.connect(3, Role::Driver);

        assert_eq!(registry.broadcast_to_role(Role::Admin, &status(7)), 2);
        assert!(admin.events.try_recv().is_ok());
        assert!(other_admin.events.try_recv().is_ok());
        assert!(driver.events.try_recv().is_err());

        let mut admins = registry.reachable(Role::Admin);
        admins.sort();
        assert_eq!(admins, [1, 2]);
    }

    #[test]
    fn location_is_last_write_wins() {
        let registry = PresenceRegistry::new();
        let at = Utc::now();
        for (i, lat) in [43.0, 43.1].into_iter().enumerate() {
            registry.set_location(DriverLocation {
                driver: 9,
                ride: Some(1),
                location: Location::new(lat, -79.0, "here"),
                updated_at: at + chrono::Duration::seconds(i as i64),
            });
        }

        assert_eq!(registry.location(9).unwrap().location.lat, 43.1);
        assert!(registry.clear_location(9).is_some());
        assert!(registry.location(9).is_none());
    }

    #[test]
    fn event_names() {
        assert_eq!(status(1).name(), "ride-status-update");
        assert_eq!(
            Event::DriverLocationDisconnected { driver: 1 }.name(),
            "driver-location-disconnected"
        );
    }
}
