//! BasePay invoice client for Base.
//!
//! Creates an invoice on the BasePay tracker contract, approves the exact
//! USDC amount, pays it, and verifies the paid flag by reading the contract
//! back, keeping balances and invoice state in sync with the chain
//! throughout.
//!
//! # Components
//!
//! - **Session** ([`Session`]): wraps a [`WalletConnector`] and publishes
//!   connect/disconnect/chain-change events
//! - **Chain reader** ([`ChainReader`]): native and token balances, invoice records
//! - **Approval manager** ([`ApprovalManager`]): confirmed, bounded allowances
//! - **Orchestrator** ([`InvoiceOrchestrator`]): create → approve → pay → verify → refresh
//! - **State store** ([`InvoiceStateStore`]): what the UI renders, with change notification
//!
//! # Quick example
//!
//! ```no_run
//! use std::sync::Arc;
//! use basepay::{ChainConfig, InvoiceOrchestrator, LocalKeyConnector, PaymentRequest, Session};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), basepay::BasePayError> {
//! let config = ChainConfig::default();
//! let connector = LocalKeyConnector::new("0xYOUR_KEY")?;
//! let session = Arc::new(Session::new(connector, config.clone()));
//! session.connect().await?;
//!
//! let orchestrator = InvoiceOrchestrator::new(session);
//! let invoice = orchestrator
//!     .pay_invoice(&PaymentRequest::from_config(&config))
//!     .await?;
//! println!("{:?}", invoice.status);
//! # Ok(())
//! # }
//! ```

// Core types
pub mod amount;
pub mod constants;
pub mod error;
pub mod invoice;
pub mod signing;

// Chain access
pub mod approval;
pub mod reader;
pub mod rpc;
pub mod session;

// Flow and state
pub mod orchestrator;
pub mod store;

use alloy::sol;

// ERC-20 surface used for balances and allowances.
sol! {
    #[sol(rpc)]
    interface ERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 value) external returns (bool);
    }
}

// BasePay invoice tracker. Invoices are keyed by the hash emitted in
// `InvoiceCreated`; `invoices(hash).isPaid` is the source of truth for payment.
sol! {
    #[sol(rpc)]
    interface InvoiceTracker {
        event InvoiceCreated(
            bytes32 indexed invoiceHash,
            address indexed merchant,
            address indexed payer,
            address token,
            uint256 amount,
            string memo
        );

        event InvoicePaid(bytes32 indexed invoiceHash, address indexed payer, uint256 amount);

        function createInvoice(address merchant, address token, uint256 amount, string memo)
            external
            returns (bytes32 invoiceHash);

        function payInvoice(bytes32 invoiceHash) external;

        function invoices(bytes32 invoiceHash)
            external
            view
            returns (address merchant, address payer, address token, uint256 amount, bool isPaid);
    }
}

// Re-exports
pub use constants::*;
pub use error::{BasePayError, FlowStep};
pub use invoice::*;

pub use approval::ApprovalManager;
pub use orchestrator::InvoiceOrchestrator;
pub use reader::ChainReader;
pub use rpc::RpcSigningContext;
pub use session::{LocalKeyConnector, Session, SessionEvent, UserInfo, WalletConnector};
pub use signing::{InvoiceParams, SigningContext, TxReceipt};
pub use store::{BalanceBook, InvoiceStateStore, StoreSnapshot};
