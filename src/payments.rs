//! Card payment processor boundary.
//!
//! Every call carries an idempotency key derived from the ride or withdrawal id, so
//! retrying a call that timed out can never charge or pay out twice.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use thiserror::Error;

use crate::Amount;
use crate::model::{RideId, TxnId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProcessorError {
    #[error("declined: {0}")]
    Declined(String),

    #[error("processor unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Completed,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentReceipt {
    pub id: String,
    pub status: PaymentStatus,
}

impl PaymentReceipt {
    pub fn is_completed(&self) -> bool {
        self.status == PaymentStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRequest {
    /// Card token produced by the client-side payment form.
    pub source_token: String,
    pub amount: Amount,
    pub currency: String,
    pub idempotency_key: String,
}

pub trait PaymentProcessor: Send + Sync + 'static {
    fn charge(
        &self,
        request: ChargeRequest,
    ) -> impl Future<Output = Result<PaymentReceipt, ProcessorError>> + Send;

    fn refund(
        &self,
        payment_id: &str,
        amount: Amount,
        reason: &str,
        idempotency_key: &str,
    ) -> impl Future<Output = Result<PaymentReceipt, ProcessorError>> + Send;

    fn payout(
        &self,
        destination: &str,
        amount: Amount,
        idempotency_key: &str,
    ) -> impl Future<Output = Result<PaymentReceipt, ProcessorError>> + Send;
}

pub fn charge_key(ride: RideId) -> String {
    format!("ride-{ride}")
}

pub fn refund_key(ride: RideId) -> String {
    format!("refund-{ride}")
}

pub fn payout_key(txn: TxnId) -> String {
    format!("withdrawal-{txn}")
}

/// Processor kept in memory. Replays the first receipt for a repeated key.
#[derive(Debug, Default)]
pub struct InMemoryProcessor {
    receipts: Mutex<HashMap<String, PaymentReceipt>>,
    /// Payment ids that have been charged.
    charged: Mutex<HashMap<String, Amount>>,
    unavailable: AtomicBool,
}

impl InMemoryProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail as if the processor were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of distinct operations the processor has performed.
    pub fn operations(&self) -> usize {
        self.receipts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn execute(
        &self,
        key: &str,
        prefix: &str,
        check: impl FnOnce() -> Result<(), ProcessorError>,
    ) -> Result<PaymentReceipt, ProcessorError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProcessorError::Unavailable("connection refused".into()));
        }

        let mut receipts = self.receipts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(receipt) = receipts.get(key) {
            return Ok(receipt.clone());
        }
        check()?;

        let receipt = PaymentReceipt {
            id: format!("{prefix}_{}", receipts.len() + 1),
            status: PaymentStatus::Completed,
        };
        receipts.insert(key.to_string(), receipt.clone());
        Ok(receipt)
    }
}

impl PaymentProcessor for InMemoryProcessor {
    async fn charge(&self, request: ChargeRequest) -> Result<PaymentReceipt, ProcessorError> {
        let receipt = self.execute(&request.idempotency_key, "pay", || {
            if request.source_token.is_empty() {
                return Err(ProcessorError::Declined("missing card token".into()));
            }
            if !request.amount.is_positive() {
                return Err(ProcessorError::Declined("amount must be positive".into()));
            }
            Ok(())
        })?;
        self.charged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(receipt.id.clone(), request.amount);
        Ok(receipt)
    }

    async fn refund(
        &self,
        payment_id: &str,
        amount: Amount,
        _reason: &str,
        idempotency_key: &str,
    ) -> Result<PaymentReceipt, ProcessorError> {
        let charged = self
            .charged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(payment_id)
            .copied();
        self.execute(idempotency_key, "refund", || match charged {
            None => Err(ProcessorError::Declined(format!(
                "unknown payment {payment_id}"
            ))),
            Some(charged) if amount > charged => Err(ProcessorError::Declined(format!(
                "refund {amount} exceeds charge {charged}"
            ))),
            Some(_) => Ok(()),
        })
    }

    async fn payout(
        &self,
        destination: &str,
        amount: Amount,
        idempotency_key: &str,
    ) -> Result<PaymentReceipt, ProcessorError> {
        self.execute(idempotency_key, "payout", || {
            if destination.is_empty() {
                return Err(ProcessorError::Declined("missing payout destination".into()));
            }
            if !amount.is_positive() {
                return Err(ProcessorError::Declined("amount must be positive".into()));
            }
            Ok(())
        })
    }
}
