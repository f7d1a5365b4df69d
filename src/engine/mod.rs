//! Ride dispatch engine.
//!
//! The engine is the single entry point for ride, wallet and presence operations. The
//! ledger commits every state change first; notifications and offers are best-effort
//! hooks that run only after the commit and never decide the outcome.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::Amount;
use crate::config::{ConfigError, Pricing, Settings};
use crate::dispatch::{self, Broadcaster, DriverDirectory};
use crate::fare::{FareCalculator, FareQuote, RouteOracle};
use crate::ledger::{Ledger, PlatformSummary, Wallet, WalletError};
use crate::model::{
    Command, Location, Owner, Ride, RideId, RideRequest, RideStatus, Role, Transaction, TxnId,
    TxnStatus, UserId,
};
use crate::payments::{
    ChargeRequest, PaymentProcessor, PaymentReceipt, ProcessorError, charge_key, payout_key,
    refund_key,
};
use crate::presence::{Connection, ConnectionId, DriverLocation, Event, Notifier, PresenceRegistry};
use crate::settlement::{self, SettlementOutcome};

pub mod state;
use state::{Applied, Transition};

mod error;
pub use error::{EngineError, RideError, TransitionReason};

/// Earnings overview for one driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverSummary {
    pub driver: UserId,
    pub balance: Amount,
    pub total_earned: Amount,
    pub total_withdrawn: Amount,
    pub today: Amount,
    pub this_week: Amount,
    pub completed_rides: usize,
}

/// The ride dispatch engine.
///
/// Generic over the route oracle and the payment processor; presence and the driver
/// directory are shared trait objects.
pub struct Engine<O, P> {
    ledger: Arc<Ledger>,
    fares: FareCalculator<O>,
    processor: P,
    presence: Arc<PresenceRegistry>,
    notifier: Arc<dyn Notifier>,
    directory: Arc<dyn DriverDirectory>,
    broadcaster: Arc<Broadcaster>,
    pricing: watch::Sender<Pricing>,
    settings: Settings,
}

/// Public API
impl<O: RouteOracle, P: PaymentProcessor> Engine<O, P> {
    pub fn new(
        settings: Settings,
        oracle: O,
        processor: P,
        directory: Arc<dyn DriverDirectory>,
    ) -> Self {
        let (pricing, pricing_rx) = watch::channel(settings.pricing);
        let fares = FareCalculator::new(
            oracle,
            pricing_rx,
            settings.oracle_timeout,
            settings.oracle_attempts,
        );
        let presence = Arc::new(PresenceRegistry::new());
        let notifier: Arc<dyn Notifier> = presence.clone();
        let broadcaster = Arc::new(Broadcaster::new(notifier.clone(), directory.clone()));

        Self {
            ledger: Arc::new(Ledger::new()),
            fares,
            processor,
            presence,
            notifier,
            directory,
            broadcaster,
            pricing,
            settings,
        }
    }

    /// Deliver push events through `notifier` instead of the built-in registry.
    ///
    /// Connections are still tracked by the registry.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.broadcaster = Arc::new(Broadcaster::new(notifier.clone(), self.directory.clone()));
        self.notifier = notifier;
        self
    }

    /// Run the engine over a command stream.
    ///
    /// Failing commands are logged and skipped. Connections opened along the way are
    /// returned so their channels stay open until the caller drops them.
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) -> Vec<Connection> {
        let mut connections = Vec::new();
        while let Some(command) = stream.next().await {
            // a failed command must not stop the engine; it has already been logged
            if let Ok(Some(connection)) = self.apply(command).await {
                connections.push(connection);
            }
        }
        connections
    }

    /// Apply a single command.
    pub async fn apply(&self, command: Command) -> Result<Option<Connection>, EngineError> {
        match command {
            Command::Connect { user, role } => return Ok(Some(self.connect(user, role))),
            Command::TopUp { customer, amount } => {
                self.top_up(customer, amount)?;
            }
            Command::RequestRide(request) => {
                self.request_ride(request).await?;
            }
            Command::Accept { ride, driver } => {
                self.accept_ride(ride, driver).await?;
            }
            Command::Advance {
                ride,
                driver,
                status,
            } => {
                self.update_status(ride, driver, status).await?;
            }
            Command::Cancel { ride, reason } => {
                self.cancel_ride(ride, &reason).await?;
            }
            Command::RequestWithdrawal {
                driver,
                amount,
                destination,
            } => {
                self.request_withdrawal(driver, amount, &destination)?;
            }
            Command::ApproveWithdrawal { txn } => {
                self.approve_withdrawal(txn).await?;
            }
            Command::RejectWithdrawal { txn } => {
                self.reject_withdrawal(txn)?;
            }
        }
        Ok(None)
    }

    /// Start the pending-ride re-announcer and the stale-ride sweep.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let timing = self.settings.dispatch;
        vec![
            dispatch::spawn_reannouncer(
                self.ledger.clone(),
                self.broadcaster.clone(),
                timing.reannounce_after,
                timing.reannounce_every,
                shutdown.clone(),
            ),
            dispatch::spawn_expiry_sweep(
                self.ledger.clone(),
                timing.pending_ttl,
                timing.sweep_every,
                shutdown,
            ),
        ]
    }
}

/// Rides
impl<O: RouteOracle, P: PaymentProcessor> Engine<O, P> {
    /// Price a route without creating anything.
    pub async fn quote(&self, request: &RideRequest) -> Result<FareQuote, EngineError> {
        validate_request(request)?;
        Ok(self.fares.quote(&request.route_points()).await?)
    }

    /// Price and persist a new pending ride, then offer it to drivers.
    pub async fn request_ride(&self, request: RideRequest) -> Result<Ride, EngineError> {
        let customer = request.customer;
        let result = self.create_ride(request).await;
        log_result("ride request", Subject::User(customer), &result);

        let ride = result?;
        let offered = self.broadcaster.offer(&ride);
        info!(ride = ride.id, offered, fare = %ride.fare.customer_fare, "ride requested");
        Ok(ride)
    }

    /// First acceptance wins; a retry by the same driver is a no-op success.
    pub async fn accept_ride(&self, ride: RideId, driver: UserId) -> Result<Ride, EngineError> {
        self.transition("accept", ride, Transition::Accept { driver })
            .await
    }

    /// Move a ride along on behalf of its driver. Completion settles the ride.
    pub async fn update_status(
        &self,
        ride: RideId,
        driver: UserId,
        status: RideStatus,
    ) -> Result<Ride, EngineError> {
        let transition = match status {
            RideStatus::Accepted => Transition::Accept { driver },
            RideStatus::Cancelled => Transition::Cancel,
            to => Transition::Advance { driver, to },
        };
        self.transition("status update", ride, transition).await
    }

    /// Cancel from any non-terminal status. A card-paid ride is refunded afterwards.
    pub async fn cancel_ride(&self, ride: RideId, reason: &str) -> Result<Ride, EngineError> {
        info!(ride, reason, "cancellation requested");
        self.transition("cancel", ride, Transition::Cancel).await
    }

    /// Admin override of the assigned driver.
    pub async fn reassign_driver(&self, ride: RideId, driver: UserId) -> Result<Ride, EngineError> {
        self.transition("reassign", ride, Transition::Reassign { driver })
            .await
    }

    /// Run settlement for a completed ride. Safe to call repeatedly.
    pub fn settle_ride(&self, ride: RideId) -> Result<SettlementOutcome, EngineError> {
        let result = settlement::reconcile(&self.ledger, ride, Utc::now());
        log_result("settlement", Subject::Ride(ride), &result);
        Ok(result?)
    }

    pub fn ride(&self, id: RideId) -> Result<Ride, EngineError> {
        Ok(self.ledger.ride(id).ok_or(RideError::NotFound(id))?)
    }

    /// Ride history of a customer, newest first.
    pub fn rides_for_customer(&self, customer: UserId) -> Vec<Ride> {
        self.ledger.rides_where(|r| r.customer == customer)
    }

    /// Ride history of a driver, newest first.
    pub fn rides_for_driver(&self, driver: UserId) -> Vec<Ride> {
        self.ledger.rides_where(|r| r.driver == Some(driver))
    }

    pub fn pending_rides(&self) -> Vec<Ride> {
        self.ledger
            .rides_where(|r| r.status == RideStatus::Pending && r.driver.is_none())
    }
}

/// Card payments
impl<O: RouteOracle, P: PaymentProcessor> Engine<O, P> {
    /// Charge the customer fare to a card and mark the ride paid.
    pub async fn pay_by_card(&self, ride: RideId, source_token: &str) -> Result<Ride, EngineError> {
        let result = self.charge_ride(ride, source_token).await;
        log_result("card payment", Subject::Ride(ride), &result);
        result
    }

    /// Refund a cancelled card-paid ride. Retrying reuses the same idempotency key.
    pub async fn refund_ride(&self, ride: RideId) -> Result<PaymentReceipt, EngineError> {
        let result = self.refund_cancelled(ride).await;
        log_result("refund", Subject::Ride(ride), &result);
        result
    }
}

/// Wallets
impl<O: RouteOracle, P: PaymentProcessor> Engine<O, P> {
    pub fn top_up(&self, customer: UserId, amount: Amount) -> Result<Transaction, EngineError> {
        let result = self
            .ledger
            .top_up(Owner::Customer(customer), amount, Utc::now());
        log_result("top-up", Subject::User(customer), &result);
        Ok(result?)
    }

    /// Withdraw from a customer wallet. Fails closed, reporting the shortfall.
    pub fn withdraw(&self, customer: UserId, amount: Amount) -> Result<Transaction, EngineError> {
        let result = self.ledger.withdraw(
            Owner::Customer(customer),
            amount,
            TxnStatus::Paid,
            None,
            Utc::now(),
        );
        log_result("withdrawal", Subject::User(customer), &result);
        Ok(result?)
    }

    /// Hold `amount` from a driver's balance pending admin approval.
    pub fn request_withdrawal(
        &self,
        driver: UserId,
        amount: Amount,
        destination: &str,
    ) -> Result<Transaction, EngineError> {
        let result = if destination.trim().is_empty() {
            Err(EngineError::Validation("payout destination is required".into()))
        } else {
            self.ledger
                .withdraw(
                    Owner::Driver(driver),
                    amount,
                    TxnStatus::Pending,
                    Some(destination.to_string()),
                    Utc::now(),
                )
                .map_err(EngineError::from)
        };
        log_result("withdrawal request", Subject::User(driver), &result);

        let txn = result?;
        let admins = self
            .notifier
            .broadcast_to_role(Role::Admin, &Event::WithdrawalRequest(txn.clone()));
        debug!(txn = txn.id, admins, "withdrawal request announced");
        Ok(txn)
    }

    /// Approve a pending withdrawal and pay it out.
    ///
    /// A failed payout leaves the withdrawal approved; approving again retries it.
    pub async fn approve_withdrawal(&self, txn: TxnId) -> Result<Transaction, EngineError> {
        let result = self.pay_out(txn).await;
        log_result("withdrawal approval", Subject::Txn(txn), &result);
        result
    }

    /// Reject a pending withdrawal, returning the held amount.
    pub fn reject_withdrawal(&self, txn: TxnId) -> Result<Transaction, EngineError> {
        let result = self.ledger.reject_withdrawal(txn, Utc::now());
        log_result("withdrawal rejection", Subject::Txn(txn), &result);
        Ok(result?)
    }

    pub fn wallet(&self, owner: Owner) -> Option<Wallet> {
        self.ledger.wallet(owner)
    }

    pub fn wallets(&self) -> Vec<Wallet> {
        self.ledger.wallets()
    }

    pub fn driver_summary(&self, driver: UserId) -> DriverSummary {
        let now = Utc::now();
        let wallet = self
            .ledger
            .wallet(Owner::Driver(driver))
            .unwrap_or_else(|| Wallet::new(Owner::Driver(driver)));
        let completed_rides = self
            .ledger
            .rides_where(|r| r.driver == Some(driver) && r.status == RideStatus::Completed)
            .len();

        DriverSummary {
            driver,
            balance: wallet.balance,
            total_earned: wallet.total_earned,
            total_withdrawn: wallet.total_withdrawn,
            today: self
                .ledger
                .driver_earnings_since(driver, start_of_day(now)),
            this_week: self
                .ledger
                .driver_earnings_since(driver, start_of_week(now)),
            completed_rides,
        }
    }

    /// Statement for one owner, oldest first.
    pub fn transactions_for(&self, owner: Owner) -> Vec<Transaction> {
        self.ledger.transactions_for(owner)
    }

    pub fn transactions_for_ride(&self, ride: RideId) -> Vec<Transaction> {
        self.ledger.transactions_for_ride(ride)
    }

    pub fn platform_summary(&self) -> PlatformSummary {
        self.ledger.platform_summary()
    }
}

/// Presence
impl<O: RouteOracle, P: PaymentProcessor> Engine<O, P> {
    /// Register a user. An active driver is immediately offered every pending ride.
    pub fn connect(&self, user: UserId, role: Role) -> Connection {
        let connection = self.presence.connect(user, role);
        if role == Role::Driver && self.directory.active_drivers().contains(&user) {
            let pending = self.pending_rides();
            let offered = pending
                .iter()
                .filter(|ride| self.broadcaster.offer_to(user, ride))
                .count();
            debug!(driver = user, offered, "pending rides sent on connect");
        }
        connection
    }

    /// Drop a registration; a driver's location sharing stops with it.
    pub fn disconnect(&self, user: UserId, connection: ConnectionId) {
        if self.presence.disconnect(user, connection) == Some(Role::Driver) {
            self.stop_location_sharing(user);
        }
    }

    /// Record a driver's live position and forward it to the customer of their active
    /// ride. Last write wins.
    pub fn update_driver_location(
        &self,
        driver: UserId,
        location: Location,
    ) -> Result<DriverLocation, EngineError> {
        if !location.has_valid_coordinates() {
            return Err(EngineError::Validation(format!(
                "invalid coordinates ({}, {})",
                location.lat, location.lng
            )));
        }

        let ride = self.active_ride_for(driver);
        let update = DriverLocation {
            driver,
            ride: ride.as_ref().map(|r| r.id),
            location,
            updated_at: Utc::now(),
        };
        self.presence.set_location(update.clone());

        if let Some(ride) = ride {
            self.notify(
                ride.customer,
                Event::DriverLocationUpdate {
                    driver,
                    ride: Some(ride.id),
                    location: update.location.clone(),
                },
            );
        }
        Ok(update)
    }

    /// Clear a driver's location and tell the affected customer.
    pub fn stop_location_sharing(&self, driver: UserId) {
        let Some(last) = self.presence.clear_location(driver) else {
            return;
        };
        if let Some(ride) = last.ride.and_then(|id| self.ledger.ride(id)) {
            self.notify(ride.customer, Event::DriverLocationDisconnected { driver });
        }
        info!(driver, "location sharing stopped");
    }

    /// Current location of the driver assigned to `ride`, if they are sharing it.
    pub fn driver_location(&self, ride: RideId) -> Result<Option<DriverLocation>, EngineError> {
        let ride = self.ride(ride)?;
        Ok(ride
            .driver
            .and_then(|driver| self.presence.location(driver))
            .filter(|location| location.ride == Some(ride.id)))
    }
}

/// Pricing
impl<O: RouteOracle, P: PaymentProcessor> Engine<O, P> {
    pub fn pricing(&self) -> Pricing {
        *self.pricing.borrow()
    }

    /// Swap pricing for subsequent quotes. Invalid pricing is refused and the current
    /// pricing stays.
    pub fn update_pricing(&self, pricing: Pricing) -> Result<(), ConfigError> {
        pricing.validate()?;
        self.pricing.send_replace(pricing);
        info!(
            price_per_km = pricing.price_per_km,
            commission_percent = pricing.commission_percent,
            "pricing updated"
        );
        Ok(())
    }
}

/// Private API
impl<O: RouteOracle, P: PaymentProcessor> Engine<O, P> {
    async fn create_ride(&self, request: RideRequest) -> Result<Ride, EngineError> {
        let fare = self.quote(&request).await?;
        Ok(self.ledger.insert_ride(request, fare, Utc::now()))
    }

    async fn transition(
        &self,
        op: &str,
        ride: RideId,
        transition: Transition,
    ) -> Result<Ride, EngineError> {
        let result = self.commit_transition(ride, transition).await;
        log_result(op, Subject::Ride(ride), &result);
        result
    }

    /// Commit the transition, then run its post-commit effects.
    async fn commit_transition(
        &self,
        id: RideId,
        transition: Transition,
    ) -> Result<Ride, EngineError> {
        // a completion commits together with its settlement unit, or not at all
        let (ride, applied, settled) = self.ledger.update_ride_and_settle(
            id,
            |ride| Ok::<_, EngineError>(state::apply(ride, transition, Utc::now())?),
            Utc::now(),
        )?;
        if let Some(outcome) = &settled {
            settlement::log_outcome(id, outcome);
        }

        if applied == Applied::Changed {
            if let Transition::Accept { .. } = transition {
                self.notify(ride.customer, Event::RideAccepted(ride.clone()));
            }
            self.mirror_status(&ride);
        }

        if ride.status == RideStatus::Cancelled && applied == Applied::Changed && ride.is_paid() {
            if let Err(e) = self.refund_payment(&ride).await {
                warn!(ride = id, reason = %e, "refund failed, retry with refund_ride");
            }
            return Ok(self.ledger.ride(id).unwrap_or(ride));
        }

        Ok(ride)
    }

    async fn charge_ride(&self, id: RideId, source_token: &str) -> Result<Ride, EngineError> {
        let ride = self.ride(id)?;
        if ride.is_paid() || ride.is_settled() {
            return Err(WalletError::AlreadyPaid(id).into());
        }
        if ride.status == RideStatus::Cancelled {
            return Err(EngineError::Validation(format!("ride {id} is cancelled")));
        }

        let request = ChargeRequest {
            source_token: source_token.to_string(),
            amount: ride.fare.customer_fare,
            currency: self.settings.currency.clone(),
            idempotency_key: charge_key(id),
        };
        let receipt = self
            .call_processor("charge", self.processor.charge(request))
            .await?;

        // the ride may have moved on while the processor was working
        let committed = self.ledger.update_ride(id, |r| {
            if r.card_payment.as_deref() == Some(receipt.id.as_str()) {
                return Ok(());
            }
            if r.is_paid() || r.is_settled() {
                return Err(EngineError::from(WalletError::AlreadyPaid(id)));
            }
            if r.status == RideStatus::Cancelled {
                return Err(EngineError::Validation(format!("ride {id} is cancelled")));
            }
            r.card_payment = Some(receipt.id.clone());
            Ok(())
        });

        match committed {
            Ok((ride, ())) => Ok(ride),
            Err(e) => {
                warn!(ride = id, payment = %receipt.id, reason = %e, "charge not recorded, refunding");
                let key = refund_key(id);
                let refund = self.processor.refund(
                    &receipt.id,
                    ride.fare.customer_fare,
                    "charge not recorded",
                    &key,
                );
                if let Err(e) = self.call_processor("refund", refund).await {
                    warn!(ride = id, payment = %receipt.id, reason = %e, "refund of unrecorded charge failed");
                }
                Err(e)
            }
        }
    }

    async fn refund_cancelled(&self, id: RideId) -> Result<PaymentReceipt, EngineError> {
        let ride = self.ride(id)?;
        if ride.status != RideStatus::Cancelled {
            return Err(EngineError::Validation(format!(
                "ride {id} is {}, only cancelled rides are refunded",
                ride.status
            )));
        }
        self.refund_payment(&ride).await
    }

    async fn refund_payment(&self, ride: &Ride) -> Result<PaymentReceipt, EngineError> {
        let payment = ride
            .card_payment
            .as_deref()
            .ok_or(WalletError::NotPaid(ride.id))?;

        let key = refund_key(ride.id);
        let refund = self
            .processor
            .refund(payment, ride.fare.customer_fare, "ride cancelled", &key);
        let receipt = self.call_processor("refund", refund).await?;

        self.ledger.update_ride(ride.id, |r| {
            r.refunded = true;
            Ok::<_, RideError>(())
        })?;
        info!(ride = ride.id, refund = %receipt.id, "ride refunded");
        Ok(receipt)
    }

    async fn pay_out(&self, txn: TxnId) -> Result<Transaction, EngineError> {
        let approved = self.ledger.approve_withdrawal(txn)?;
        let destination = approved.destination.clone().unwrap_or_default();

        let key = payout_key(txn);
        let payout = self.processor.payout(&destination, approved.amount, &key);
        let receipt = self.call_processor("payout", payout).await?;

        Ok(self.ledger.complete_withdrawal(txn, receipt.id)?)
    }

    /// Bound a processor call by the configured timeout and map its failures.
    async fn call_processor(
        &self,
        op: &str,
        call: impl Future<Output = Result<PaymentReceipt, ProcessorError>>,
    ) -> Result<PaymentReceipt, EngineError> {
        let timeout = self.settings.processor_timeout;
        match tokio::time::timeout(timeout, call).await {
            Err(_) => Err(EngineError::UpstreamUnavailable(format!(
                "{op} timed out after {timeout:?}"
            ))),
            Ok(Err(ProcessorError::Unavailable(reason))) => {
                Err(EngineError::UpstreamUnavailable(format!("{op}: {reason}")))
            }
            Ok(Err(ProcessorError::Declined(reason))) => {
                Err(EngineError::PaymentDeclined(format!("{op}: {reason}")))
            }
            Ok(Ok(receipt)) if !receipt.is_completed() => Err(EngineError::PaymentDeclined(
                format!("{op} {} ended {:?}", receipt.id, receipt.status),
            )),
            Ok(Ok(receipt)) => Ok(receipt),
        }
    }

    fn active_ride_for(&self, driver: UserId) -> Option<Ride> {
        self.ledger
            .rides_where(|r| {
                r.driver == Some(driver)
                    && matches!(
                        r.status,
                        RideStatus::Accepted | RideStatus::OnTheWay | RideStatus::InProgress
                    )
            })
            .into_iter()
            .next()
    }

    /// Best-effort push; failures are logged and dropped.
    fn notify(&self, user: UserId, event: Event) {
        let name = event.name();
        if let Err(e) = self.notifier.send(user, event) {
            debug!(user, event = name, reason = %e, "notification not delivered");
        }
    }

    /// Mirror a committed status change to the ride's parties and to admins.
    fn mirror_status(&self, ride: &Ride) {
        let event = Event::RideStatusUpdate {
            ride: ride.id,
            status: ride.status,
            driver: ride.driver,
        };
        if let Some(driver) = ride.driver {
            self.notify(driver, event.clone());
        }
        self.notifier.broadcast_to_role(Role::Admin, &event);
        self.notify(ride.customer, event);
    }
}

#[derive(Debug, Clone, Copy)]
enum Subject {
    Ride(RideId),
    User(UserId),
    Txn(TxnId),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Ride(id) => write!(f, "ride {id}"),
            Subject::User(id) => write!(f, "user {id}"),
            Subject::Txn(id) => write!(f, "txn {id}"),
        }
    }
}

/// Small helper to log operation results
fn log_result<T, E: fmt::Display>(op: &str, subject: Subject, result: &Result<T, E>) {
    match result {
        Ok(_) => info!(subject = %subject, "{op} applied"),
        Err(e) => info!(subject = %subject, reason = %e, "{op} skipped"),
    }
}

fn validate_request(request: &RideRequest) -> Result<(), EngineError> {
    let checks = [("pickup", &request.pickup), ("dropoff", &request.dropoff)];
    for (name, location) in checks {
        if !location.is_valid() {
            return Err(EngineError::Validation(format!(
                "{name} needs valid coordinates and an address"
            )));
        }
    }
    if let Some(i) = request.stops.iter().position(|s| !s.is_valid()) {
        return Err(EngineError::Validation(format!(
            "stop {} needs valid coordinates and an address",
            i + 1
        )));
    }
    Ok(())
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map_or(now, |midnight| midnight.and_utc())
}

/// Monday 00:00 of the current week.
fn start_of_week(now: DateTime<Utc>) -> DateTime<Utc> {
    let days = i64::from(now.weekday().num_days_from_monday());
    start_of_day(now) - Duration::days(days)
}
