use std::sync::Arc;

use alloy::primitives::{Address, U256};

use crate::invoice::{BalanceAsset, BalanceSnapshot, InvoiceId, OnchainInvoice};
use crate::session::{Session, WalletConnector};
use crate::signing::SigningContext;
use crate::{BasePayError, TokenConfig, NATIVE_DECIMALS};

/// Stateless read-only chain queries through the session's current provider.
///
/// Every call resolves the signing context afresh and fails with
/// [`BasePayError::NoProvider`] when there is none; retrying is up to the caller.
pub struct ChainReader<W: WalletConnector> {
    session: Arc<Session<W>>,
}

impl<W: WalletConnector> Clone for ChainReader<W> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
        }
    }
}

impl<W: WalletConnector> ChainReader<W> {
    pub fn new(session: Arc<Session<W>>) -> Self {
        Self { session }
    }

    fn context(&self) -> Result<Arc<W::Context>, BasePayError> {
        self.session.signing_context().ok_or(BasePayError::NoProvider)
    }

    pub async fn native_balance(&self, address: Address) -> Result<U256, BasePayError> {
        self.context()?.native_balance(address).await
    }

    pub async fn token_balance(&self, token: Address, address: Address) -> Result<U256, BasePayError> {
        self.context()?.token_balance(token, address).await
    }

    /// Native balance wrapped as a fresh snapshot.
    pub async fn native_snapshot(&self, address: Address) -> Result<BalanceSnapshot, BasePayError> {
        let amount = self.native_balance(address).await?;
        Ok(BalanceSnapshot::new(
            address,
            BalanceAsset::Native,
            amount,
            NATIVE_DECIMALS,
        ))
    }

    /// Token balance wrapped as a fresh snapshot.
    pub async fn token_snapshot(
        &self,
        token: &TokenConfig,
        address: Address,
    ) -> Result<BalanceSnapshot, BasePayError> {
        let amount = self.token_balance(token.address, address).await?;
        Ok(BalanceSnapshot::new(
            address,
            BalanceAsset::Token(token.address),
            amount,
            token.decimals,
        ))
    }

    /// Read the tracker's record for `id`.
    pub async fn invoice_record(
        &self,
        tracker: Address,
        id: InvoiceId,
    ) -> Result<OnchainInvoice, BasePayError> {
        self.context()?.invoice(tracker, id).await
    }
}
