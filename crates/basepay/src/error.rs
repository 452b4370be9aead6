use alloy::primitives::{TxHash, U256};
use serde::Serialize;
use thiserror::Error;

use crate::invoice::InvoiceStatus;

/// The steps of an invoice payment, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowStep {
    Create,
    Approve,
    Pay,
    Verify,
    Refresh,
}

impl std::fmt::Display for FlowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FlowStep::Create => "create",
            FlowStep::Approve => "approve",
            FlowStep::Pay => "pay",
            FlowStep::Verify => "verify",
            FlowStep::Refresh => "refresh",
        };
        f.write_str(name)
    }
}

/// Errors returned by BasePay operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BasePayError {
    #[error("wallet not connected")]
    NotConnected,

    #[error("no provider available for chain reads")]
    NoProvider,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transaction rejected by signer: {0}")]
    ChainRejected(String),

    #[error("contract reverted: {0}")]
    ContractReverted(String),

    #[error("no confirmation for {tx} after {waited_ms}ms")]
    ConfirmationTimeout { tx: TxHash, waited_ms: u64 },

    #[error("signer is on chain {actual}, session configured for chain {expected}")]
    ChainMismatch { expected: u64, actual: u64 },

    #[error("a payment is already in progress")]
    AlreadyInProgress,

    #[error("allowance {granted} is below the required {required}")]
    InsufficientAllowance { required: U256, granted: U256 },

    #[error("payment flow cancelled")]
    Cancelled,

    #[error("invalid invoice transition {from} -> {to}")]
    InvalidTransition {
        from: InvoiceStatus,
        to: InvoiceStatus,
    },

    #[error("unexpected receipt: {0}")]
    UnexpectedReceipt(String),

    #[error("rpc error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("{step} step failed: {source}")]
    Step {
        step: FlowStep,
        source: Box<BasePayError>,
    },
}

impl BasePayError {
    /// Tag an error with the flow step it came from. Already-tagged errors keep
    /// their original step.
    pub fn at(self, step: FlowStep) -> Self {
        match self {
            tagged @ BasePayError::Step { .. } => tagged,
            other => BasePayError::Step {
                step,
                source: Box::new(other),
            },
        }
    }

    /// The step this error was raised in, if it came out of the payment flow.
    pub fn step(&self) -> Option<FlowStep> {
        match self {
            BasePayError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// The underlying error with any step tag removed.
    pub fn root(&self) -> &BasePayError {
        match self {
            BasePayError::Step { source, .. } => source.root(),
            other => other,
        }
    }
}

// Rendered as its display string so store snapshots stay plain JSON.
impl Serialize for BasePayError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
