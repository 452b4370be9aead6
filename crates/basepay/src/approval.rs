use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, TxHash, U256};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::invoice::{AllowanceGrant, TxRef, TxState};
use crate::signing::{confirm, SigningContext};
use crate::BasePayError;

/// Issues bounded ERC-20 allowances and waits for them to confirm.
///
/// Approvals are serialized per owner: a second approval for the same owner
/// is not submitted until the first has confirmed, failed or timed out, so an
/// unconfirmed grant can never be overwritten by a different amount.
pub struct ApprovalManager {
    /// Per-owner mutex held from submission until the grant is settled.
    /// Entries are dropped again once nobody holds or waits on them.
    owner_locks: Arc<DashMap<Address, Arc<Mutex<()>>>>,
    /// Used by [`approve`](Self::approve).
    confirmation_timeout: Duration,
}

impl ApprovalManager {
    pub fn new(confirmation_timeout: Duration) -> Self {
        Self {
            owner_locks: Arc::new(DashMap::new()),
            confirmation_timeout,
        }
    }

    fn owner_lock(&self, owner: Address) -> Arc<Mutex<()>> {
        self.owner_locks
            .entry(owner)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Whether an approval for `owner` is currently between submission and settlement.
    pub fn is_approving(&self, owner: Address) -> bool {
        self.owner_locks
            .get(&owner)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of owners with a lock entry (held, awaited, or not yet purged).
    pub fn tracked_owners(&self) -> usize {
        self.owner_locks.len()
    }

    /// Drop locks nobody holds or waits on. Returns how many were removed.
    ///
    /// Runs after every settled approval. `retain` holds the shard lock, so an
    /// owner either keeps its entry (clone outstanding) or gets a fresh one.
    pub fn purge_idle(&self) -> usize {
        let before = self.owner_locks.len();
        self.owner_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        before - self.owner_locks.len()
    }

    /// Approve `spender` to move exactly `amount` of `token` from the
    /// context's address, returning only after on-chain confirmation.
    pub async fn approve<C: SigningContext>(
        &self,
        context: &C,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<AllowanceGrant, BasePayError> {
        self.approve_with(
            context,
            token,
            spender,
            amount,
            self.confirmation_timeout,
            |_| {},
        )
        .await
    }

    /// Like [`approve`](Self::approve) with an explicit confirmation
    /// timeout, calling `on_submitted` with the transaction hash as soon as
    /// it is broadcast.
    pub async fn approve_with<C, F>(
        &self,
        context: &C,
        token: Address,
        spender: Address,
        amount: U256,
        timeout: Duration,
        on_submitted: F,
    ) -> Result<AllowanceGrant, BasePayError>
    where
        C: SigningContext,
        F: FnOnce(TxHash) + Send,
    {
        if amount.is_zero() {
            return Err(BasePayError::InvalidRequest(
                "approval amount must be non-zero".to_string(),
            ));
        }
        if amount == U256::MAX {
            return Err(BasePayError::InvalidRequest(
                "unlimited approvals are not allowed".to_string(),
            ));
        }

        let result = {
            let lock = self.owner_lock(context.address());
            let _guard = lock.lock().await;
            Self::settle(context, token, spender, amount, timeout, on_submitted).await
        };
        self.purge_idle();
        result
    }

    /// Submit, confirm and read back one approval. Caller holds the owner lock.
    async fn settle<C, F>(
        context: &C,
        token: Address,
        spender: Address,
        amount: U256,
        timeout: Duration,
        on_submitted: F,
    ) -> Result<AllowanceGrant, BasePayError>
    where
        C: SigningContext,
        F: FnOnce(TxHash) + Send,
    {
        let owner = context.address();
        let tx = context
            .send_approve(token, spender, amount)
            .await
            .inspect_err(|e| {
                tracing::warn!(owner = %owner, spender = %spender, error = %e, "approve not submitted");
            })?;
        tracing::info!(
            owner = %owner,
            spender = %spender,
            amount = %amount,
            tx = %tx,
            "approval submitted"
        );
        on_submitted(tx);

        let receipt = confirm(context, tx, timeout, "approve").await?;

        // Never assume the grant landed at the requested amount.
        let granted = context.allowance(token, owner, spender).await?;
        if granted < amount {
            tracing::error!(
                owner = %owner,
                spender = %spender,
                granted = %granted,
                required = %amount,
                "allowance below required amount after confirmation"
            );
            return Err(BasePayError::InsufficientAllowance {
                required: amount,
                granted,
            });
        }

        tracing::info!(owner = %owner, spender = %spender, tx = %tx, "approval confirmed");

        Ok(AllowanceGrant {
            owner,
            spender,
            token,
            amount,
            tx: TxRef {
                hash: tx,
                state: TxState::Confirmed {
                    block: receipt.block_number,
                },
            },
        })
    }
}
