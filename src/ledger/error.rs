use thiserror::Error;

use crate::Amount;
use crate::model::{Owner, RideId, TxnId, TxnStatus};

/// Error during a wallet or payment operation. No balance is changed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WalletError {
    #[error("insufficient funds for {owner}: available {available}, requested {requested}")]
    InsufficientFunds {
        owner: Owner,
        available: Amount,
        requested: Amount,
    },

    #[error("amount must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error("balance of {0} would overflow")]
    Overflow(Owner),

    #[error("transaction {0} not found")]
    TransactionNotFound(TxnId),

    #[error("transaction {0} is not a withdrawal")]
    NotAWithdrawal(TxnId),

    #[error("withdrawal {txn} is {status}")]
    InvalidWithdrawalState { txn: TxnId, status: TxnStatus },

    #[error("ride {0} is already paid")]
    AlreadyPaid(RideId),

    #[error("ride {0} has no card payment to refund")]
    NotPaid(RideId),
}

impl WalletError {
    /// How much more money the operation needed, for `InsufficientFunds`.
    pub fn shortfall(&self) -> Option<Amount> {
        match self {
            WalletError::InsufficientFunds {
                available,
                requested,
                ..
            } => Some(*requested - *available),
            _ => None,
        }
    }
}
