//! Ride, wallet and transaction store.
//!
//! Every public method takes the table lock once, performs all of its checks (staging
//! balance changes on copies of the wallets), and only then writes. That makes each
//! method an atomic conditional update: the acceptance race, wallet debits, a ride's
//! completion and its settlement unit are all decided under the same lock that commits
//! them, never by read-then-write from the caller. The lock
//! is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::Amount;
use crate::engine::RideError;
use crate::fare::FareQuote;
use crate::model::{
    Direction, Owner, Ride, RideId, RideRequest, RideStatus, Transaction, TxnId, TxnKind,
    TxnStatus, UserId,
};
use crate::settlement::{
    CustomerLeg, Settlement, SettlementError, SettlementOutcome, SettlementPlan,
};

mod state;
pub use state::{PlatformSummary, Wallet};

mod error;
pub use error::WalletError;

#[derive(Default)]
struct Tables {
    rides: HashMap<RideId, Ride>,
    last_ride_id: RideId,
    wallets: HashMap<Owner, Wallet>,
    txns: HashMap<TxnId, Transaction>,
    last_txn_id: TxnId,
    /// Statement index
    by_owner: HashMap<Owner, Vec<TxnId>>,
    /// Settlement idempotency index
    by_ride: HashMap<RideId, Vec<TxnId>>,
    platform: PlatformSummary,
}

impl Tables {
    #[allow(clippy::too_many_arguments)]
    fn append(
        &mut self,
        owner: Owner,
        kind: TxnKind,
        direction: Direction,
        amount: Amount,
        status: TxnStatus,
        ride: Option<RideId>,
        destination: Option<String>,
        now: DateTime<Utc>,
    ) -> TxnId {
        self.last_txn_id += 1;
        let id = self.last_txn_id;
        self.txns.insert(
            id,
            Transaction {
                id,
                owner,
                kind,
                direction,
                amount,
                status,
                ride,
                destination,
                external_id: None,
                created_at: now,
            },
        );
        self.by_owner.entry(owner).or_default().push(id);
        if let Some(ride) = ride {
            self.by_ride.entry(ride).or_default().push(id);
        }
        id
    }

    /// Copy of the owner's wallet to stage changes on; empty if there is none yet.
    fn staged_wallet(&self, owner: Owner) -> Wallet {
        self.wallets
            .get(&owner)
            .cloned()
            .unwrap_or_else(|| Wallet::new(owner))
    }

    fn collect(&self, ids: Option<&Vec<TxnId>>) -> Vec<Transaction> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.txns.get(id).cloned())
            .collect()
    }
}

/// In-memory store for rides, wallets and the transaction ledger.
#[derive(Default)]
pub struct Ledger {
    tables: Mutex<Tables>,
}

/// Rides
impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        // writes only happen after every check has passed, so a poisoned table is
        // still consistent
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist a new ride in `pending`.
    pub fn insert_ride(&self, request: RideRequest, fare: FareQuote, now: DateTime<Utc>) -> Ride {
        let mut tables = self.tables();
        tables.last_ride_id += 1;
        let ride = Ride {
            id: tables.last_ride_id,
            customer: request.customer,
            driver: None,
            pickup: request.pickup,
            dropoff: request.dropoff,
            stops: request.stops,
            instructions: request.instructions,
            status: RideStatus::Pending,
            fare,
            requested_at: now,
            accepted_at: None,
            arrived_at: None,
            picked_up_at: None,
            dropped_off_at: None,
            cancelled_at: None,
            settled_at: None,
            updated_at: now,
            card_payment: None,
            refunded: false,
        };
        tables.rides.insert(ride.id, ride.clone());
        ride
    }

    pub fn ride(&self, id: RideId) -> Option<Ride> {
        self.tables().rides.get(&id).cloned()
    }

    /// Rides matching `filter`, newest first.
    pub fn rides_where(&self, filter: impl Fn(&Ride) -> bool) -> Vec<Ride> {
        let mut rides: Vec<Ride> = self
            .tables()
            .rides
            .values()
            .filter(|r| filter(*r))
            .cloned()
            .collect();
        rides.sort_by(|a, b| b.requested_at.cmp(&a.requested_at).then(b.id.cmp(&a.id)));
        rides
    }

    /// Atomically run `update` against a ride and commit only if it succeeds.
    ///
    /// The closure sees the current committed ride, so guards evaluated inside it
    /// behave like a compare-and-swap on the stored record.
    pub fn update_ride<T, E>(
        &self,
        id: RideId,
        update: impl FnOnce(&mut Ride) -> Result<T, E>,
    ) -> Result<(Ride, T), E>
    where
        E: From<RideError>,
    {
        let mut tables = self.tables();
        let stored = tables.rides.get_mut(&id).ok_or(RideError::NotFound(id))?;

        let mut draft = stored.clone();
        let output = update(&mut draft)?;
        *stored = draft.clone();
        Ok((draft, output))
    }

    /// Delete pending rides requested before `cutoff` that nobody accepted or paid.
    pub fn remove_stale_pending(&self, cutoff: DateTime<Utc>) -> Vec<RideId> {
        let mut tables = self.tables();
        let Tables { rides, by_ride, .. } = &mut *tables;

        let stale: Vec<RideId> = rides
            .values()
            .filter(|r| {
                r.status == RideStatus::Pending
                    && r.driver.is_none()
                    && !r.is_paid()
                    && r.requested_at < cutoff
                    && !by_ride.contains_key(&r.id)
            })
            .map(|r| r.id)
            .collect();

        for id in &stale {
            rides.remove(id);
        }
        stale
    }
}

/// Settlement
impl Ledger {
    /// Like [`Ledger::update_ride`], but a ride that ends up `completed` is settled in
    /// the same critical section. If settlement fails the update is not committed
    /// either, so the ride and the balances stay as they were.
    pub fn update_ride_and_settle<T, E>(
        &self,
        id: RideId,
        update: impl FnOnce(&mut Ride) -> Result<T, E>,
        now: DateTime<Utc>,
    ) -> Result<(Ride, T, Option<SettlementOutcome>), E>
    where
        E: From<RideError> + From<SettlementError>,
    {
        let mut tables = self.tables();
        let mut draft = tables
            .rides
            .get(&id)
            .cloned()
            .ok_or(RideError::NotFound(id))?;

        let output = update(&mut draft)?;
        let settlement = if draft.status == RideStatus::Completed {
            Some(tables.settle(&mut draft, now)?)
        } else {
            None
        };

        tables.rides.insert(id, draft.clone());
        Ok((draft, output, settlement))
    }

    /// Post the settlement unit for a completed ride, at most once.
    pub fn settle_ride(
        &self,
        id: RideId,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, SettlementError> {
        let mut tables = self.tables();
        let mut ride = tables
            .rides
            .get(&id)
            .cloned()
            .ok_or(RideError::NotFound(id))?;

        let outcome = tables.settle(&mut ride, now)?;
        tables.rides.insert(id, ride);
        Ok(outcome)
    }
}

impl Tables {
    /// Stage every balance change of the settlement, then write them together.
    ///
    /// Sets `settled_at` on `ride`; the caller stores it.
    fn settle(
        &mut self,
        ride: &mut Ride,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, SettlementError> {
        let already_posted = self.by_ride.get(&ride.id).is_some_and(|ids| {
            ids.iter().any(|t| {
                self.txns
                    .get(t)
                    .is_some_and(|t| t.kind == TxnKind::AdminCommission)
            })
        });
        if ride.is_settled() || already_posted {
            return Ok(SettlementOutcome::AlreadySettled);
        }

        let plan = SettlementPlan::for_ride(ride)?;

        // a missing wallet is an empty one; it is not created just to be skipped
        let customer = Owner::Customer(plan.customer);
        let available = self
            .wallets
            .get(&customer)
            .map_or(Amount::ZERO, |w| w.balance);
        let debited = self.wallets.get(&customer).and_then(|wallet| {
            let mut wallet = wallet.clone();
            wallet.debit(plan.customer_fare).ok().map(|()| wallet)
        });

        let driver = Owner::Driver(plan.driver);
        let mut earned = self.staged_wallet(driver);
        earned.earn(plan.driver_earning)?;
        let platform = self.platform.with_settlement(&plan)?;

        let customer_leg = match debited {
            _ if !plan.collect_from_wallet => CustomerLeg::PaidByCard,
            Some(wallet) => {
                self.wallets.insert(customer, wallet);
                CustomerLeg::Debited(self.append(
                    customer,
                    TxnKind::RideFare,
                    Direction::Debit,
                    plan.customer_fare,
                    TxnStatus::Paid,
                    Some(ride.id),
                    None,
                    now,
                ))
            }
            None => CustomerLeg::Insufficient {
                available,
                requested: plan.customer_fare,
            },
        };

        let commission = self.append(
            Owner::Platform,
            TxnKind::AdminCommission,
            Direction::Credit,
            plan.commission,
            TxnStatus::Paid,
            Some(ride.id),
            None,
            now,
        );

        self.wallets.insert(driver, earned);
        let driver_credit = self.append(
            driver,
            TxnKind::Ride,
            Direction::Credit,
            plan.driver_earning,
            TxnStatus::Paid,
            Some(ride.id),
            None,
            now,
        );

        self.platform = platform;
        ride.settled_at = Some(now);

        Ok(SettlementOutcome::Posted(Settlement {
            ride: ride.id,
            customer: customer_leg,
            commission,
            driver_credit,
        }))
    }
}

/// Wallets
impl Ledger {
    pub fn top_up(
        &self,
        owner: Owner,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Result<Transaction, WalletError> {
        ensure_positive(amount)?;
        let mut tables = self.tables();
        let mut wallet = tables.staged_wallet(owner);
        wallet.credit(amount)?;
        tables.wallets.insert(owner, wallet);
        let id = tables.append(
            owner,
            TxnKind::TopUp,
            Direction::Credit,
            amount,
            TxnStatus::Paid,
            None,
            None,
            now,
        );
        Ok(tables.txns[&id].clone())
    }

    /// Conditionally debit `owner` and append a withdrawal in `status`.
    pub fn withdraw(
        &self,
        owner: Owner,
        amount: Amount,
        status: TxnStatus,
        destination: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Transaction, WalletError> {
        ensure_positive(amount)?;
        let mut tables = self.tables();
        match tables.wallets.get_mut(&owner) {
            Some(wallet) => wallet.debit(amount)?,
            None => {
                return Err(WalletError::InsufficientFunds {
                    owner,
                    available: Amount::ZERO,
                    requested: amount,
                });
            }
        }
        let id = tables.append(
            owner,
            TxnKind::Withdrawal,
            Direction::Debit,
            amount,
            status,
            None,
            destination,
            now,
        );
        Ok(tables.txns[&id].clone())
    }

    /// Move a withdrawal from `pending` to `approved`. Already approved is returned
    /// unchanged so a failed payout can be retried.
    pub fn approve_withdrawal(&self, txn: TxnId) -> Result<Transaction, WalletError> {
        let mut tables = self.tables();
        let entry = withdrawal_mut(&mut tables, txn)?;
        match entry.status {
            TxnStatus::Pending => entry.status = TxnStatus::Approved,
            TxnStatus::Approved => {}
            status => return Err(WalletError::InvalidWithdrawalState { txn, status }),
        }
        Ok(entry.clone())
    }

    /// Record a successful payout: `approved` to `paid`.
    pub fn complete_withdrawal(
        &self,
        txn: TxnId,
        external_id: String,
    ) -> Result<Transaction, WalletError> {
        let mut tables = self.tables();
        let (owner, amount) = withdrawal_in(&mut tables, txn, TxnStatus::Approved)?;

        let mut wallet = tables.staged_wallet(owner);
        wallet.record_withdrawal(amount)?;
        tables.wallets.insert(owner, wallet);

        let entry = withdrawal_mut(&mut tables, txn)?;
        entry.status = TxnStatus::Paid;
        entry.external_id = Some(external_id);
        Ok(entry.clone())
    }

    /// `pending` to `rejected`. The held amount goes back to the wallet with a
    /// reversal entry.
    pub fn reject_withdrawal(
        &self,
        txn: TxnId,
        now: DateTime<Utc>,
    ) -> Result<Transaction, WalletError> {
        let mut tables = self.tables();
        let (owner, amount) = withdrawal_in(&mut tables, txn, TxnStatus::Pending)?;

        let mut wallet = tables.staged_wallet(owner);
        wallet.credit(amount)?;
        tables.wallets.insert(owner, wallet);
        tables.append(
            owner,
            TxnKind::WithdrawalReversal,
            Direction::Credit,
            amount,
            TxnStatus::Paid,
            None,
            None,
            now,
        );

        let entry = withdrawal_mut(&mut tables, txn)?;
        entry.status = TxnStatus::Rejected;
        Ok(entry.clone())
    }

    pub fn wallet(&self, owner: Owner) -> Option<Wallet> {
        self.tables().wallets.get(&owner).cloned()
    }

    pub fn wallets(&self) -> Vec<Wallet> {
        self.tables().wallets.values().cloned().collect()
    }

    /// Statement for one owner, oldest first.
    pub fn transactions_for(&self, owner: Owner) -> Vec<Transaction> {
        let tables = self.tables();
        tables.collect(tables.by_owner.get(&owner))
    }

    pub fn transactions_for_ride(&self, ride: RideId) -> Vec<Transaction> {
        let tables = self.tables();
        tables.collect(tables.by_ride.get(&ride))
    }

    /// Ride earnings credited to `driver` at or after `since`.
    pub fn driver_earnings_since(&self, driver: UserId, since: DateTime<Utc>) -> Amount {
        self.transactions_for(Owner::Driver(driver))
            .into_iter()
            .filter(|t| t.kind == TxnKind::Ride && t.created_at >= since)
            .map(|t| t.amount)
            .sum()
    }

    pub fn platform_summary(&self) -> PlatformSummary {
        self.tables().platform
    }
}

fn ensure_positive(amount: Amount) -> Result<(), WalletError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(WalletError::InvalidAmount(amount))
    }
}

fn withdrawal_mut(tables: &mut Tables, txn: TxnId) -> Result<&mut Transaction, WalletError> {
    let entry = tables
        .txns
        .get_mut(&txn)
        .ok_or(WalletError::TransactionNotFound(txn))?;
    if entry.kind != TxnKind::Withdrawal {
        return Err(WalletError::NotAWithdrawal(txn));
    }
    Ok(entry)
}

/// Owner and amount of a withdrawal, provided it is in `expected` status.
fn withdrawal_in(
    tables: &mut Tables,
    txn: TxnId,
    expected: TxnStatus,
) -> Result<(Owner, Amount), WalletError> {
    let entry = withdrawal_mut(tables, txn)?;
    if entry.status != expected {
        return Err(WalletError::InvalidWithdrawalState {
            txn,
            status: entry.status,
        });
    }
    Ok((entry.owner, entry.amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{Transition, apply};
    use crate::model::Location;
    use chrono::Duration;
    use std::sync::Arc;

    fn quote() -> FareQuote {
        FareQuote {
            distance_km: 10.0,
            eta_minutes: 15,
            base_fare: Amount::from_cents(1_500),
            commission: Amount::from_cents(300),
            driver_earning: Amount::from_cents(1_200),
            customer_fare: Amount::from_cents(1_800),
        }
    }

    fn request(customer: UserId) -> RideRequest {
        RideRequest::new(
            customer,
            Location::new(43.0, -79.0, "pickup"),
            Location::new(43.1, -79.1, "dropoff"),
        )
    }

    fn cents(value: i64) -> Amount {
        Amount::from_cents(value)
    }

    // Rides

    #[test]
    fn inserted_rides_get_sequential_ids() {
        let ledger = Ledger::new();
        let a = ledger.insert_ride(request(1), quote(), Utc::now());
        let b = ledger.insert_ride(request(1), quote(), Utc::now());

        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(ledger.ride(1).unwrap().status, RideStatus::Pending);
        assert!(ledger.ride(3).is_none());
    }

    #[test]
    fn rides_where_is_newest_first() {
        let ledger = Ledger::new();
        let t0 = Utc::now();
        ledger.insert_ride(request(1), quote(), t0);
        ledger.insert_ride(request(2), quote(), t0 + Duration::seconds(1));
        ledger.insert_ride(request(1), quote(), t0 + Duration::seconds(2));

        let ids: Vec<_> = ledger
            .rides_where(|r| r.customer == 1)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, [3, 1]);
    }

    #[test]
    fn failed_update_leaves_ride_untouched() {
        let ledger = Ledger::new();
        let ride = ledger.insert_ride(request(1), quote(), Utc::now());

        let result = ledger.update_ride(ride.id, |r| {
            r.instructions = "scribbled".into();
            Err::<(), _>(RideError::AlreadyAccepted(r.id))
        });

        assert!(result.is_err());
        assert_eq!(ledger.ride(ride.id).unwrap().instructions, "");
    }

    #[test]
    fn update_of_missing_ride_is_not_found() {
        let ledger = Ledger::new();
        let result = ledger.update_ride(42, |_| Ok::<_, RideError>(()));
        assert_eq!(result.unwrap_err(), RideError::NotFound(42));
    }

    #[test]
    fn concurrent_acceptance_has_one_winner() {
        let ledger = Arc::new(Ledger::new());
        let ride = ledger.insert_ride(request(1), quote(), Utc::now()).id;

        let handles: Vec<_> = (100..116)
            .map(|driver| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    ledger.update_ride(ride, |r| {
                        apply(r, Transition::Accept { driver }, Utc::now())
                    })
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let losers = results
            .iter()
            .filter(|r| matches!(r, Err(RideError::AlreadyAccepted(_))))
            .count();

        assert_eq!(winners, 1);
        assert_eq!(losers, 15);
        assert!(ledger.ride(ride).unwrap().driver.is_some());
    }

    #[test]
    fn stale_sweep_only_removes_untouched_pending_rides() {
        let ledger = Ledger::new();
        let old = Utc::now() - Duration::minutes(30);
        let stale = ledger.insert_ride(request(1), quote(), old).id;
        let accepted = ledger.insert_ride(request(1), quote(), old).id;
        let paid = ledger.insert_ride(request(1), quote(), old).id;
        let fresh = ledger.insert_ride(request(1), quote(), Utc::now()).id;

        ledger
            .update_ride(accepted, |r| apply(r, Transition::Accept { driver: 9 }, Utc::now()))
            .unwrap();
        ledger
            .update_ride(paid, |r| {
                r.card_payment = Some("pay".into());
                Ok::<_, RideError>(())
            })
            .unwrap();

        let removed = ledger.remove_stale_pending(Utc::now() - Duration::minutes(10));

        assert_eq!(removed, [stale]);
        assert!(ledger.ride(stale).is_none());
        assert!(ledger.ride(accepted).is_some());
        assert!(ledger.ride(paid).is_some());
        assert!(ledger.ride(fresh).is_some());
    }

    // Wallets

    #[test]
    fn top_up_creates_wallet_lazily() {
        let ledger = Ledger::new();
        assert!(ledger.wallet(Owner::Customer(1)).is_none());

        ledger.top_up(Owner::Customer(1), cents(1_000), Utc::now()).unwrap();
        ledger.top_up(Owner::Customer(1), cents(250), Utc::now()).unwrap();

        assert_eq!(ledger.wallet(Owner::Customer(1)).unwrap().balance, cents(1_250));
        assert_eq!(ledger.transactions_for(Owner::Customer(1)).len(), 2);
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        let ledger = Ledger::new();
        assert_eq!(
            ledger.top_up(Owner::Customer(1), cents(0), Utc::now()).unwrap_err(),
            WalletError::InvalidAmount(cents(0))
        );
        assert_eq!(
            ledger
                .withdraw(Owner::Customer(1), cents(-5), TxnStatus::Paid, None, Utc::now())
                .unwrap_err(),
            WalletError::InvalidAmount(cents(-5))
        );
    }

    #[test]
    fn overflowing_top_up_is_refused() {
        let ledger = Ledger::new();
        let huge = Amount::from_cents(i64::MAX / 2 + 1);
        ledger.top_up(Owner::Customer(1), huge, Utc::now()).unwrap();

        assert_eq!(
            ledger.top_up(Owner::Customer(1), huge, Utc::now()).unwrap_err(),
            WalletError::Overflow(Owner::Customer(1))
        );
        assert_eq!(ledger.wallet(Owner::Customer(1)).unwrap().balance, huge);
        assert_eq!(ledger.transactions_for(Owner::Customer(1)).len(), 1);
    }

    #[test]
    fn withdraw_reports_shortfall_and_writes_nothing() {
        let ledger = Ledger::new();
        ledger.top_up(Owner::Customer(1), cents(500), Utc::now()).unwrap();

        let err = ledger
            .withdraw(Owner::Customer(1), cents(800), TxnStatus::Paid, None, Utc::now())
            .unwrap_err();
        assert_eq!(err.shortfall(), Some(cents(300)));
        assert_eq!(ledger.wallet(Owner::Customer(1)).unwrap().balance, cents(500));
        assert_eq!(ledger.transactions_for(Owner::Customer(1)).len(), 1);
    }

    #[test]
    fn withdraw_from_missing_wallet_is_insufficient() {
        let ledger = Ledger::new();
        let err = ledger
            .withdraw(Owner::Driver(3), cents(100), TxnStatus::Pending, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { .. }));
        assert!(ledger.wallet(Owner::Driver(3)).is_none());
    }

    #[test]
    fn concurrent_withdrawals_never_overdraw() {
        let ledger = Arc::new(Ledger::new());
        ledger.top_up(Owner::Customer(1), cents(1_000), Utc::now()).unwrap();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    ledger.withdraw(Owner::Customer(1), cents(300), TxnStatus::Paid, None, Utc::now())
                })
            })
            .collect();
        let succeeded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Result::is_ok)
            .count();

        assert_eq!(succeeded, 3);
        assert_eq!(ledger.wallet(Owner::Customer(1)).unwrap().balance, cents(100));
    }

    #[test]
    fn withdrawal_lifecycle() {
        let ledger = Ledger::new();
        ledger.top_up(Owner::Driver(9), cents(2_000), Utc::now()).unwrap();
        let txn = ledger
            .withdraw(
                Owner::Driver(9),
                cents(1_500),
                TxnStatus::Pending,
                Some("card-1".into()),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(ledger.wallet(Owner::Driver(9)).unwrap().balance, cents(500));

        // cannot pay before approval
        assert!(matches!(
            ledger.complete_withdrawal(txn.id, "po-1".into()),
            Err(WalletError::InvalidWithdrawalState {
                status: TxnStatus::Pending,
                ..
            })
        ));

        assert_eq!(ledger.approve_withdrawal(txn.id).unwrap().status, TxnStatus::Approved);
        assert_eq!(ledger.approve_withdrawal(txn.id).unwrap().status, TxnStatus::Approved);

        let paid = ledger.complete_withdrawal(txn.id, "po-1".into()).unwrap();
        assert_eq!(paid.status, TxnStatus::Paid);
        assert_eq!(paid.external_id.as_deref(), Some("po-1"));

        let wallet = ledger.wallet(Owner::Driver(9)).unwrap();
        assert_eq!(wallet.total_withdrawn, cents(1_500));
        assert_eq!(wallet.balance, cents(500));

        assert!(ledger.reject_withdrawal(txn.id, Utc::now()).is_err());
    }

    #[test]
    fn rejected_withdrawal_restores_balance() {
        let ledger = Ledger::new();
        ledger.top_up(Owner::Driver(9), cents(2_000), Utc::now()).unwrap();
        let txn = ledger
            .withdraw(Owner::Driver(9), cents(700), TxnStatus::Pending, None, Utc::now())
            .unwrap();

        let rejected = ledger.reject_withdrawal(txn.id, Utc::now()).unwrap();
        assert_eq!(rejected.status, TxnStatus::Rejected);
        assert_eq!(ledger.wallet(Owner::Driver(9)).unwrap().balance, cents(2_000));
        assert!(ledger.approve_withdrawal(txn.id).is_err());

        // every balance change has its entry: top-up, hold, reversal
        let entries: Vec<_> = ledger
            .transactions_for(Owner::Driver(9))
            .into_iter()
            .map(|t| (t.kind, t.direction, t.amount))
            .collect();
        assert_eq!(
            entries,
            [
                (TxnKind::TopUp, Direction::Credit, cents(2_000)),
                (TxnKind::Withdrawal, Direction::Debit, cents(700)),
                (TxnKind::WithdrawalReversal, Direction::Credit, cents(700)),
            ]
        );
    }

    #[test]
    fn withdrawal_ops_reject_other_kinds() {
        let ledger = Ledger::new();
        let top_up = ledger.top_up(Owner::Driver(9), cents(100), Utc::now()).unwrap();

        assert_eq!(
            ledger.approve_withdrawal(top_up.id).unwrap_err(),
            WalletError::NotAWithdrawal(top_up.id)
        );
        assert_eq!(
            ledger.reject_withdrawal(999, Utc::now()).unwrap_err(),
            WalletError::TransactionNotFound(999)
        );
    }

    #[test]
    fn earnings_since_filters_by_time_and_kind() {
        let ledger = Ledger::new();
        let ride = ledger.insert_ride(request(1), quote(), Utc::now()).id;
        ledger
            .update_ride(ride, |r| apply(r, Transition::Accept { driver: 9 }, Utc::now()))
            .unwrap();
        for to in [RideStatus::OnTheWay, RideStatus::InProgress, RideStatus::Completed] {
            ledger
                .update_ride(ride, |r| {
                    apply(r, Transition::Advance { driver: 9, to }, Utc::now())
                })
                .unwrap();
        }
        ledger.settle_ride(ride, Utc::now()).unwrap();
        ledger.top_up(Owner::Driver(9), cents(5_000), Utc::now()).unwrap();

        let hour_ago = Utc::now() - Duration::hours(1);
        assert_eq!(ledger.driver_earnings_since(9, hour_ago), cents(1_200));
        assert_eq!(
            ledger.driver_earnings_since(9, Utc::now() + Duration::hours(1)),
            Amount::ZERO
        );
    }

    /// Drive a ride to `in_progress` with driver 9.
    fn ride_in_progress(ledger: &Ledger) -> RideId {
        let ride = ledger.insert_ride(request(1), quote(), Utc::now()).id;
        ledger
            .update_ride(ride, |r| apply(r, Transition::Accept { driver: 9 }, Utc::now()))
            .unwrap();
        for to in [RideStatus::OnTheWay, RideStatus::InProgress] {
            ledger
                .update_ride(ride, |r| {
                    apply(r, Transition::Advance { driver: 9, to }, Utc::now())
                })
                .unwrap();
        }
        ride
    }

    fn complete(ledger: &Ledger, ride: RideId) -> Result<Option<SettlementOutcome>, SettlementError> {
        let complete = Transition::Advance {
            driver: 9,
            to: RideStatus::Completed,
        };
        ledger
            .update_ride_and_settle(
                ride,
                |r| Ok::<_, SettlementError>(apply(r, complete, Utc::now())?),
                Utc::now(),
            )
            .map(|(_, _, settled)| settled)
    }

    #[test]
    fn completion_settles_in_the_same_step() {
        let ledger = Ledger::new();
        ledger.top_up(Owner::Customer(1), cents(5_000), Utc::now()).unwrap();
        let ride = ride_in_progress(&ledger);

        assert!(matches!(
            complete(&ledger, ride).unwrap(),
            Some(SettlementOutcome::Posted(_))
        ));
        let stored = ledger.ride(ride).unwrap();
        assert_eq!(stored.status, RideStatus::Completed);
        assert!(stored.is_settled());
        assert_eq!(ledger.transactions_for_ride(ride).len(), 3);

        // a retried completion finds the settlement already there
        assert_eq!(
            complete(&ledger, ride).unwrap(),
            Some(SettlementOutcome::AlreadySettled)
        );
        assert_eq!(ledger.transactions_for_ride(ride).len(), 3);
    }

    #[test]
    fn completion_that_cannot_settle_is_not_committed() {
        let ledger = Ledger::new();
        ledger.top_up(Owner::Customer(1), cents(5_000), Utc::now()).unwrap();
        ledger
            .top_up(Owner::Driver(9), cents(i64::MAX - 100), Utc::now())
            .unwrap();
        let ride = ride_in_progress(&ledger);

        assert_eq!(
            complete(&ledger, ride).unwrap_err(),
            SettlementError::Wallet(WalletError::Overflow(Owner::Driver(9)))
        );

        let stored = ledger.ride(ride).unwrap();
        assert_eq!(stored.status, RideStatus::InProgress);
        assert_eq!(stored.dropped_off_at, None);
        assert!(!stored.is_settled());
        assert!(ledger.transactions_for_ride(ride).is_empty());
        assert_eq!(ledger.wallet(Owner::Customer(1)).unwrap().balance, cents(5_000));
    }

    #[test]
    fn non_completing_updates_do_not_settle() {
        let ledger = Ledger::new();
        let ride = ledger.insert_ride(request(1), quote(), Utc::now()).id;

        let (stored, _, settled) = ledger
            .update_ride_and_settle(
                ride,
                |r| Ok::<_, SettlementError>(apply(r, Transition::Cancel, Utc::now())?),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(stored.status, RideStatus::Cancelled);
        assert!(settled.is_none());
    }
}
