//! Ride offers to drivers and the background dispatch timers.
//!
//! Offers are a broadcast to every active, reachable driver in no particular order.
//! Who gets the ride is decided by the acceptance guard in the ledger, never here.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::ledger::Ledger;
use crate::model::{Ride, RideStatus, UserId};
use crate::presence::{Event, Notifier};

/// External list of drivers eligible to receive offers.
pub trait DriverDirectory: Send + Sync {
    fn active_drivers(&self) -> Vec<UserId>;
}

/// In-process driver directory.
#[derive(Debug, Default)]
pub struct ActiveDrivers {
    drivers: RwLock<HashSet<UserId>>,
}

impl ActiveDrivers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self, driver: UserId) {
        self.drivers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(driver);
    }

    pub fn deactivate(&self, driver: UserId) {
        self.drivers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&driver);
    }
}

impl DriverDirectory for ActiveDrivers {
    fn active_drivers(&self) -> Vec<UserId> {
        self.drivers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }
}

pub struct Broadcaster {
    notifier: Arc<dyn Notifier>,
    directory: Arc<dyn DriverDirectory>,
}

impl Broadcaster {
    pub fn new(notifier: Arc<dyn Notifier>, directory: Arc<dyn DriverDirectory>) -> Self {
        Self {
            notifier,
            directory,
        }
    }

    /// Offer `ride` to every active, reachable driver. Returns how many were reached.
    pub fn offer(&self, ride: &Ride) -> usize {
        let offered = self
            .directory
            .active_drivers()
            .into_iter()
            .filter(|driver| self.notifier.is_reachable(*driver))
            .filter(|driver| self.offer_to(*driver, ride))
            .count();
        debug!(ride = ride.id, offered, "ride offered");
        offered
    }

    /// Offer one ride to one driver, logging and dropping delivery failures.
    pub fn offer_to(&self, driver: UserId, ride: &Ride) -> bool {
        match self
            .notifier
            .send(driver, Event::NewRideRequest(ride.clone()))
        {
            Ok(()) => true,
            Err(e) => {
                debug!(ride = ride.id, driver, reason = %e, "offer not delivered");
                false
            }
        }
    }
}

/// Re-offer rides still pending that were requested before `older_than`.
pub fn reannounce(ledger: &Ledger, broadcaster: &Broadcaster, older_than: DateTime<Utc>) -> usize {
    let stale = ledger.rides_where(|r| {
        r.status == RideStatus::Pending && r.driver.is_none() && r.requested_at <= older_than
    });
    for ride in &stale {
        broadcaster.offer(ride);
    }
    if !stale.is_empty() {
        info!(rides = stale.len(), "pending rides re-announced");
    }
    stale.len()
}

/// Delete unaccepted, unpaid rides requested before `cutoff`.
pub fn expire_stale(ledger: &Ledger, cutoff: DateTime<Utc>) -> usize {
    let removed = ledger.remove_stale_pending(cutoff);
    if !removed.is_empty() {
        info!(rides = ?removed, "stale pending rides expired");
    }
    removed.len()
}

/// `now - age`, saturating at the earliest representable instant.
pub fn age_cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn spawn_reannouncer(
    ledger: Arc<Ledger>,
    broadcaster: Arc<Broadcaster>,
    after: Duration,
    every: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("reannouncer", every, shutdown, move || {
        reannounce(&ledger, &broadcaster, age_cutoff(Utc::now(), after));
        std::future::ready(())
    })
}

pub fn spawn_expiry_sweep(
    ledger: Arc<Ledger>,
    ttl: Duration,
    every: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("expiry sweep", every, shutdown, move || {
        expire_stale(&ledger, age_cutoff(Utc::now(), ttl));
        std::future::ready(())
    })
}

/// Run `tick` every `every` until `shutdown` flips to true or its sender is dropped.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(task = name, "background task stopped");
    })
}
