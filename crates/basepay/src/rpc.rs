//! alloy-backed [`SigningContext`] over a wallet-enabled provider.

use alloy::contract::Error as ContractError;
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::{PendingTransactionBuilder, Provider};
use alloy::rpc::types::TransactionReceipt;
use alloy::transports::{RpcError, TransportError};

use crate::invoice::{InvoiceId, OnchainInvoice};
use crate::signing::{InvoiceParams, SigningContext, TxReceipt};
use crate::{BasePayError, InvoiceTracker, ERC20};

/// Signing context backed by an alloy provider whose wallet filler signs for
/// `address`.
pub struct RpcSigningContext<P> {
    provider: P,
    address: Address,
    chain_id: u64,
    required_confirmations: u64,
}

impl<P> RpcSigningContext<P> {
    pub fn new(provider: P, address: Address, chain_id: u64) -> Self {
        Self {
            provider,
            address,
            chain_id,
            required_confirmations: 1,
        }
    }

    /// Blocks to wait for on top of inclusion before a receipt counts (default 1).
    pub fn with_required_confirmations(mut self, confirmations: u64) -> Self {
        self.required_confirmations = confirmations.max(1);
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

impl<P> SigningContext for RpcSigningContext<P>
where
    P: Provider + Send + Sync,
{
    fn address(&self) -> Address {
        self.address
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn native_balance(&self, owner: Address) -> Result<U256, BasePayError> {
        self.provider
            .get_balance(owner)
            .await
            .map_err(|e| classify_transport("eth_getBalance", &e))
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256, BasePayError> {
        let contract = ERC20::new(token, &self.provider);
        contract
            .balanceOf(owner)
            .call()
            .await
            .map_err(|e| classify_contract("balanceOf", &e))
    }

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, BasePayError> {
        let contract = ERC20::new(token, &self.provider);
        contract
            .allowance(owner, spender)
            .call()
            .await
            .map_err(|e| classify_contract("allowance", &e))
    }

    async fn invoice(&self, tracker: Address, id: InvoiceId) -> Result<OnchainInvoice, BasePayError> {
        let contract = InvoiceTracker::new(tracker, &self.provider);
        let record = contract
            .invoices(id)
            .call()
            .await
            .map_err(|e| classify_contract("invoices", &e))?;
        Ok(OnchainInvoice {
            invoice_id: id,
            merchant: record.merchant,
            payer: record.payer,
            token: record.token,
            amount: record.amount,
            is_paid: record.isPaid,
        })
    }

    async fn send_create_invoice(
        &self,
        tracker: Address,
        params: &InvoiceParams,
    ) -> Result<TxHash, BasePayError> {
        let contract = InvoiceTracker::new(tracker, &self.provider);
        let pending = contract
            .createInvoice(params.merchant, params.token, params.amount, params.memo.clone())
            .send()
            .await
            .map_err(|e| classify_contract("createInvoice", &e))?;
        Ok(*pending.tx_hash())
    }

    async fn send_approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<TxHash, BasePayError> {
        let contract = ERC20::new(token, &self.provider);
        let pending = contract
            .approve(spender, amount)
            .send()
            .await
            .map_err(|e| classify_contract("approve", &e))?;
        Ok(*pending.tx_hash())
    }

    async fn send_pay_invoice(&self, tracker: Address, id: InvoiceId) -> Result<TxHash, BasePayError> {
        let contract = InvoiceTracker::new(tracker, &self.provider);
        let pending = contract
            .payInvoice(id)
            .send()
            .await
            .map_err(|e| classify_contract("payInvoice", &e))?;
        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(&self, tx: TxHash) -> Result<Option<TxReceipt>, BasePayError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx)
            .await
            .map_err(|e| classify_transport("eth_getTransactionReceipt", &e))?;
        Ok(receipt.as_ref().map(to_receipt))
    }

    async fn wait_for_receipt(&self, tx: TxHash) -> Result<TxReceipt, BasePayError> {
        let receipt = PendingTransactionBuilder::new(self.provider.root().clone(), tx)
            .with_required_confirmations(self.required_confirmations)
            .get_receipt()
            .await
            .map_err(|e| BasePayError::Transport(format!("receipt for {tx} failed: {e}")))?;
        Ok(to_receipt(&receipt))
    }
}

fn to_receipt(receipt: &TransactionReceipt) -> TxReceipt {
    TxReceipt {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number,
        success: receipt.status(),
        logs: receipt
            .inner
            .logs()
            .iter()
            .map(|log| log.inner.clone())
            .collect(),
    }
}

fn classify_contract(op: &str, err: &ContractError) -> BasePayError {
    match err {
        ContractError::TransportError(e) => classify_transport(op, e),
        other => BasePayError::Transport(format!("{op} failed: {other}")),
    }
}

fn classify_transport(op: &str, err: &TransportError) -> BasePayError {
    match err {
        RpcError::ErrorResp(payload) => classify_rpc_error(op, payload.code, &payload.message),
        // The wallet filler refused to sign.
        RpcError::LocalUsageError(e) => BasePayError::ChainRejected(format!("{op}: {e}")),
        other => BasePayError::Transport(format!("{op} failed: {other}")),
    }
}

/// Map a JSON-RPC error response onto the flow's error kinds.
///
/// EIP-1193 code 4001 and "user denied/rejected" messages are signer
/// rejections; code 3 and revert messages are on-chain execution failures.
pub fn classify_rpc_error(op: &str, code: i64, message: &str) -> BasePayError {
    let lower = message.to_ascii_lowercase();
    if code == 4001
        || lower.contains("user denied")
        || lower.contains("user rejected")
        || lower.contains("rejected by user")
    {
        BasePayError::ChainRejected(format!("{op}: {message}"))
    } else if code == 3 || lower.contains("revert") {
        BasePayError::ContractReverted(format!("{op}: {message}"))
    } else {
        BasePayError::Transport(format!("{op} failed: {message} (code {code})"))
    }
}
