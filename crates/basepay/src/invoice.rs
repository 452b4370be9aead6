//! Invoice, allowance and balance types, and the invoice status machine.

use alloy::primitives::{Address, TxHash, B256, U256};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::amount::{format_units, parse_units};
use crate::{BasePayError, ChainConfig, FlowStep, TokenConfig};

/// Chain-assigned invoice identifier (the tracker's invoice hash).
pub type InvoiceId = B256;

/// Lifecycle of one payment attempt.
///
/// `Draft → Created → Approving → Paying → Paid | Unpaid`, with `Failed`
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InvoiceStatus {
    Draft,
    Created,
    Approving,
    Paying,
    Paid,
    Unpaid,
    Failed,
}

impl InvoiceStatus {
    /// `true` once no further transition is possible for this attempt.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvoiceStatus::Paid | InvoiceStatus::Unpaid | InvoiceStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        match (self, next) {
            (Draft, Created) | (Created, Approving) | (Approving, Paying) => true,
            (Paying, Paid) | (Paying, Unpaid) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Confirmation state of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum TxState {
    Pending,
    Confirmed { block: Option<u64> },
    Reverted { block: Option<u64> },
}

/// A transaction hash plus what we last observed about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRef {
    pub hash: TxHash,
    pub state: TxState,
}

impl TxRef {
    pub fn pending(hash: TxHash) -> Self {
        Self {
            hash,
            state: TxState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == TxState::Pending
    }
}

/// A confirmed spend limit granted by `owner` to `spender`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceGrant {
    pub owner: Address,
    pub spender: Address,
    pub token: Address,
    pub amount: U256,
    pub tx: TxRef,
}

/// Why an invoice ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReason {
    pub step: FlowStep,
    pub error: BasePayError,
}

/// One payment attempt, as rendered to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    /// Local attempt number. Store writes for any other attempt are dropped.
    pub flow_id: u64,
    pub invoice_id: Option<InvoiceId>,
    pub payer: Address,
    pub merchant: Address,
    pub token: TokenConfig,
    pub token_amount: U256,
    pub memo: String,
    pub status: InvoiceStatus,
    pub create_tx: Option<TxRef>,
    pub allowance: Option<AllowanceGrant>,
    pub pay_tx: Option<TxRef>,
    pub failure: Option<FailureReason>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn draft(flow_id: u64, payer: Address, payment: &ValidatedPayment) -> Self {
        let now = Utc::now();
        Self {
            flow_id,
            invoice_id: None,
            payer,
            merchant: payment.merchant,
            token: payment.token.clone(),
            token_amount: payment.amount,
            memo: payment.memo.clone(),
            status: InvoiceStatus::Draft,
            create_tx: None,
            allowance: None,
            pay_tx: None,
            failure: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, enforcing the status machine.
    pub fn advance(&mut self, next: InvoiceStatus) -> Result<(), BasePayError> {
        if !self.status.can_transition_to(next) {
            return Err(BasePayError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark the invoice failed at `step`. A no-op once terminal.
    pub fn fail(&mut self, step: FlowStep, error: BasePayError) {
        if self.advance(InvoiceStatus::Failed).is_ok() {
            self.failure = Some(FailureReason {
                step,
                error: error.root().clone(),
            });
        }
    }

    /// Decimal form of `token_amount`, e.g. `"8.0"`.
    pub fn display_amount(&self) -> String {
        format_units(self.token_amount, self.token.decimals)
    }

    /// Every transaction reference recorded so far.
    pub fn tx_refs(&self) -> impl Iterator<Item = &TxRef> {
        self.create_tx
            .iter()
            .chain(self.allowance.as_ref().map(|grant| &grant.tx))
            .chain(self.pay_tx.iter())
    }
}

/// A payment as requested by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    /// Token symbol, e.g. `"USDC"`.
    pub token: String,
    /// Decimal amount in whole tokens, e.g. `"8"`.
    pub amount: String,
    pub memo: String,
    /// Merchant address as a hex string.
    pub merchant: String,
}

impl PaymentRequest {
    /// The fixed demo invoice described by `config`.
    pub fn from_config(config: &ChainConfig) -> Self {
        Self {
            token: config.token.symbol.clone(),
            amount: config.invoice_amount.clone(),
            memo: config.invoice_memo.clone(),
            merchant: config.merchant.to_string(),
        }
    }

    /// Check the request against `config` and convert it to on-chain units.
    pub fn validate(&self, config: &ChainConfig) -> Result<ValidatedPayment, BasePayError> {
        if !self.token.eq_ignore_ascii_case(&config.token.symbol) {
            return Err(BasePayError::InvalidRequest(format!(
                "unsupported token '{}': this chain invoices in {}",
                self.token, config.token.symbol
            )));
        }

        let amount = parse_units(&self.amount, config.token.decimals)?;
        if amount.is_zero() {
            return Err(BasePayError::InvalidRequest(
                "amount must be greater than zero".to_string(),
            ));
        }
        if amount == U256::MAX {
            return Err(BasePayError::InvalidRequest(
                "unlimited amounts are not allowed".to_string(),
            ));
        }

        let merchant: Address = self.merchant.trim().parse().map_err(|e| {
            BasePayError::InvalidRequest(format!("invalid merchant '{}': {e}", self.merchant))
        })?;
        if merchant == Address::ZERO {
            return Err(BasePayError::InvalidRequest(
                "merchant address cannot be zero".to_string(),
            ));
        }

        Ok(ValidatedPayment {
            token: config.token.clone(),
            amount,
            memo: self.memo.clone(),
            merchant,
        })
    }
}

/// A [`PaymentRequest`] that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPayment {
    pub token: TokenConfig,
    pub amount: U256,
    pub memo: String,
    pub merchant: Address,
}

/// What a balance is denominated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "address")]
pub enum BalanceAsset {
    Native,
    Token(Address),
}

/// A cached chain read. Never authoritative between reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    pub address: Address,
    pub asset: BalanceAsset,
    pub amount: U256,
    pub decimals: u8,
    pub as_of: DateTime<Utc>,
    /// Set after any state-mutating transaction until the next read.
    pub stale: bool,
}

impl BalanceSnapshot {
    pub fn new(address: Address, asset: BalanceAsset, amount: U256, decimals: u8) -> Self {
        Self {
            address,
            asset,
            amount,
            decimals,
            as_of: Utc::now(),
            stale: false,
        }
    }

    pub fn display_amount(&self) -> String {
        format_units(self.amount, self.decimals)
    }
}

/// The tracker's record of an invoice, as read from `invoices(id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnchainInvoice {
    pub invoice_id: InvoiceId,
    pub merchant: Address,
    pub payer: Address,
    pub token: Address,
    pub amount: U256,
    pub is_paid: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use InvoiceStatus::*;

    const ALL: [InvoiceStatus; 7] = [Draft, Created, Approving, Paying, Paid, Unpaid, Failed];

    #[test]
    fn test_forward_path_is_allowed() {
        assert!(Draft.can_transition_to(Created));
        assert!(Created.can_transition_to(Approving));
        assert!(Approving.can_transition_to(Paying));
        assert!(Paying.can_transition_to(Paid));
        assert!(Paying.can_transition_to(Unpaid));
    }

    #[test]
    fn test_no_skips_or_backtracking() {
        assert!(!Draft.can_transition_to(Paying));
        assert!(!Created.can_transition_to(Paid));
        assert!(!Approving.can_transition_to(Created));
        assert!(!Paying.can_transition_to(Approving));
    }

    #[test]
    fn test_failed_only_from_non_terminal() {
        for status in ALL {
            assert_eq!(status.can_transition_to(Failed), !status.is_terminal());
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for from in [Paid, Unpaid, Failed] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    fn payment() -> ValidatedPayment {
        PaymentRequest::from_config(&ChainConfig::default())
            .validate(&ChainConfig::default())
            .unwrap()
    }

    #[test]
    fn test_fail_records_root_cause_once() {
        let mut invoice = Invoice::draft(1, Address::repeat_byte(1), &payment());
        invoice.advance(Created).unwrap();
        invoice.fail(
            FlowStep::Approve,
            BasePayError::ChainRejected("denied".into()).at(FlowStep::Approve),
        );
        assert_eq!(invoice.status, Failed);
        let failure = invoice.failure.clone().unwrap();
        assert_eq!(failure.step, FlowStep::Approve);
        assert_eq!(failure.error, BasePayError::ChainRejected("denied".into()));

        // A second failure does not overwrite the first
        invoice.fail(FlowStep::Pay, BasePayError::Cancelled);
        assert_eq!(invoice.failure.unwrap().step, FlowStep::Approve);
    }

    #[test]
    fn test_default_request_validates() {
        let validated = payment();
        assert_eq!(validated.amount, U256::from(8_000_000u64));
        assert_eq!(validated.merchant, crate::MERCHANT_ADDRESS);
        assert_eq!(validated.token.symbol, "USDC");
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        let config = ChainConfig::default();
        let base = PaymentRequest::from_config(&config);

        let bad_amount = PaymentRequest {
            amount: "0".into(),
            ..base.clone()
        };
        assert!(matches!(
            bad_amount.validate(&config),
            Err(BasePayError::InvalidRequest(_))
        ));

        let bad_merchant = PaymentRequest {
            merchant: "0x1234".into(),
            ..base.clone()
        };
        assert!(matches!(
            bad_merchant.validate(&config),
            Err(BasePayError::InvalidRequest(_))
        ));

        let bad_token = PaymentRequest {
            token: "DAI".into(),
            ..base
        };
        assert!(matches!(
            bad_token.validate(&config),
            Err(BasePayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_display_amount() {
        let invoice = Invoice::draft(1, Address::ZERO, &payment());
        assert_eq!(invoice.display_amount(), "8.0");
    }
}
