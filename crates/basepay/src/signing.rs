//! The contract-call surface the payment flow needs from a wallet session.
//!
//! - [`SigningContext`]: one authenticated signer on one chain: reads,
//!   transaction submission, receipt lookup
//! - [`confirm`]: bounded wait for a submitted transaction
//!
//! See [`crate::rpc::RpcSigningContext`] for the alloy-backed implementation.

use std::time::Duration;

use alloy::primitives::{Address, Log, TxHash, U256};

use crate::error::BasePayError;
use crate::invoice::{InvoiceId, OnchainInvoice};

/// Parameters for `createInvoice` on the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceParams {
    pub merchant: Address,
    pub token: Address,
    pub amount: U256,
    pub memo: String,
}

/// The parts of a mined transaction's receipt the flow inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
    /// `false` when execution reverted.
    pub success: bool,
    pub logs: Vec<Log>,
}

/// Capability to read from and sign for one address on one chain.
///
/// Obtained from a [`crate::session::Session`]; the payment flow holds it for
/// one step at a time and never mutates it. `send_*` methods return once the
/// transaction is broadcast; confirmation is awaited separately.
pub trait SigningContext: Send + Sync {
    /// The address this context signs for.
    fn address(&self) -> Address;

    fn chain_id(&self) -> u64;

    fn native_balance(
        &self,
        owner: Address,
    ) -> impl std::future::Future<Output = Result<U256, BasePayError>> + Send;

    fn token_balance(
        &self,
        token: Address,
        owner: Address,
    ) -> impl std::future::Future<Output = Result<U256, BasePayError>> + Send;

    fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> impl std::future::Future<Output = Result<U256, BasePayError>> + Send;

    /// Read `invoices(id)` from the tracker.
    fn invoice(
        &self,
        tracker: Address,
        id: InvoiceId,
    ) -> impl std::future::Future<Output = Result<OnchainInvoice, BasePayError>> + Send;

    fn send_create_invoice(
        &self,
        tracker: Address,
        params: &InvoiceParams,
    ) -> impl std::future::Future<Output = Result<TxHash, BasePayError>> + Send;

    fn send_approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> impl std::future::Future<Output = Result<TxHash, BasePayError>> + Send;

    fn send_pay_invoice(
        &self,
        tracker: Address,
        id: InvoiceId,
    ) -> impl std::future::Future<Output = Result<TxHash, BasePayError>> + Send;

    /// Look up a receipt without waiting. `None` while still pending.
    fn transaction_receipt(
        &self,
        tx: TxHash,
    ) -> impl std::future::Future<Output = Result<Option<TxReceipt>, BasePayError>> + Send;

    /// Wait until `tx` is mined. Unbounded; callers go through [`confirm`].
    fn wait_for_receipt(
        &self,
        tx: TxHash,
    ) -> impl std::future::Future<Output = Result<TxReceipt, BasePayError>> + Send;
}

/// Wait up to `timeout` for `tx` to be mined successfully.
///
/// Timing out yields [`BasePayError::ConfirmationTimeout`]: the transaction
/// may still confirm later. A mined-but-reverted transaction yields
/// [`BasePayError::ContractReverted`].
pub async fn confirm<C: SigningContext>(
    context: &C,
    tx: TxHash,
    timeout: Duration,
    label: &str,
) -> Result<TxReceipt, BasePayError> {
    let receipt = tokio::time::timeout(timeout, context.wait_for_receipt(tx))
        .await
        .map_err(|_| {
            let waited_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(tx = %tx, label, waited_ms, "confirmation timed out");
            BasePayError::ConfirmationTimeout { tx, waited_ms }
        })??;

    if !receipt.success {
        tracing::error!(tx = %tx, label, block = ?receipt.block_number, "transaction reverted");
        return Err(BasePayError::ContractReverted(format!(
            "{label} reverted in tx {tx}"
        )));
    }

    Ok(receipt)
}
