use serde::Serialize;

use super::WalletError;
use crate::Amount;
use crate::model::Owner;
use crate::settlement::SettlementPlan;

/// A customer or driver wallet.
///
/// `total_earned` and `total_withdrawn` are only meaningful for drivers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Wallet {
    pub owner: Owner,
    pub balance: Amount,
    pub total_earned: Amount,
    pub total_withdrawn: Amount,
}

impl Wallet {
    pub fn new(owner: Owner) -> Self {
        Self {
            owner,
            balance: Amount::ZERO,
            total_earned: Amount::ZERO,
            total_withdrawn: Amount::ZERO,
        }
    }

    /// Add to the balance. Fails without changing anything on overflow.
    pub fn credit(&mut self, amount: Amount) -> Result<(), WalletError> {
        self.balance = self.add(self.balance, amount)?;
        Ok(())
    }

    /// Credit a ride earning, counted in `total_earned` too.
    pub fn earn(&mut self, amount: Amount) -> Result<(), WalletError> {
        let balance = self.add(self.balance, amount)?;
        let total_earned = self.add(self.total_earned, amount)?;
        self.balance = balance;
        self.total_earned = total_earned;
        Ok(())
    }

    /// Count a paid-out withdrawal. The balance was already held at request time.
    pub fn record_withdrawal(&mut self, amount: Amount) -> Result<(), WalletError> {
        self.total_withdrawn = self.add(self.total_withdrawn, amount)?;
        Ok(())
    }

    /// Conditional decrement; fails closed when the balance is short.
    pub fn debit(&mut self, amount: Amount) -> Result<(), WalletError> {
        let Some(rest) = self.balance.checked_debit(amount) else {
            return Err(WalletError::InsufficientFunds {
                owner: self.owner,
                available: self.balance,
                requested: amount,
            });
        };
        self.balance = rest;
        Ok(())
    }

    fn add(&self, total: Amount, amount: Amount) -> Result<Amount, WalletError> {
        total
            .checked_add(amount)
            .ok_or(WalletError::Overflow(self.owner))
    }
}

/// Running totals of the platform's commission ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PlatformSummary {
    pub total_fare_collected: Amount,
    pub total_paid_to_drivers: Amount,
    pub total_admin_earnings: Amount,
    pub settled_rides: u64,
}

impl PlatformSummary {
    /// Totals after posting `plan`, or `Overflow` with `self` untouched.
    pub fn with_settlement(&self, plan: &SettlementPlan) -> Result<Self, WalletError> {
        let add = |total: Amount, amount| {
            total
                .checked_add(amount)
                .ok_or(WalletError::Overflow(Owner::Platform))
        };
        Ok(Self {
            total_fare_collected: add(self.total_fare_collected, plan.customer_fare)?,
            total_paid_to_drivers: add(self.total_paid_to_drivers, plan.driver_earning)?,
            total_admin_earnings: add(self.total_admin_earnings, plan.commission)?,
            settled_rides: self.settled_rides + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_wallet_is_empty() {
        let wallet = Wallet::new(Owner::Customer(1));
        assert_eq!(wallet.balance, Amount::ZERO);
        assert_eq!(wallet.total_earned, Amount::ZERO);
        assert_eq!(wallet.total_withdrawn, Amount::ZERO);
    }

    #[test]
    fn debit_fails_closed() {
        let mut wallet = Wallet::new(Owner::Customer(1));
        wallet.credit(Amount::from_cents(500)).unwrap();

        let err = wallet.debit(Amount::from_cents(1_800)).unwrap_err();
        assert_eq!(err.shortfall(), Some(Amount::from_cents(1_300)));
        assert_eq!(wallet.balance, Amount::from_cents(500));

        wallet.debit(Amount::from_cents(500)).unwrap();
        assert_eq!(wallet.balance, Amount::ZERO);
    }

    #[test]
    fn overflowing_credit_changes_nothing() {
        let mut wallet = Wallet::new(Owner::Driver(9));
        wallet.credit(Amount::from_cents(i64::MAX - 5)).unwrap();

        assert_eq!(
            wallet.credit(Amount::from_cents(6)),
            Err(WalletError::Overflow(Owner::Driver(9)))
        );
        assert_eq!(wallet.balance, Amount::from_cents(i64::MAX - 5));
    }

    #[test]
    fn earn_updates_balance_and_total_together() {
        let mut wallet = Wallet::new(Owner::Driver(9));
        wallet.earn(Amount::from_cents(1_200)).unwrap();
        assert_eq!(wallet.balance, Amount::from_cents(1_200));
        assert_eq!(wallet.total_earned, Amount::from_cents(1_200));

        // balance can overflow while total_earned still fits
        wallet.balance = Amount::from_cents(i64::MAX);
        assert!(wallet.earn(Amount::from_cents(1)).is_err());
        assert_eq!(wallet.total_earned, Amount::from_cents(1_200));
    }
}
