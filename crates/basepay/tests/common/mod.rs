#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{address, keccak256, Address, Log, TxHash, B256, U256};
use alloy::sol_types::SolEvent;
use tokio::sync::Notify;

use basepay::session::Connection;
use basepay::{
    BasePayError, ChainConfig, InvoiceId, InvoiceParams, InvoiceTracker, OnchainInvoice, Session,
    SigningContext, TxReceipt, UserInfo, WalletConnector, INVOICE_TRACKER_ADDRESS,
    MERCHANT_ADDRESS, USDC_ADDRESS,
};

pub const PAYER: Address = address!("00000000000000000000000000000000000000a1");

/// `n` whole USDC in base units.
pub fn usdc(n: u64) -> U256 {
    U256::from(n) * U256::from(1_000_000u64)
}

/// Default chain config with a short confirmation timeout.
pub fn test_config() -> ChainConfig {
    ChainConfig::default().with_confirmation_timeout(Duration::from_millis(250))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxKind {
    Create,
    Approve,
    Pay,
}

/// Pauses the first receipt wait for one kind of transaction until released.
pub struct Gate {
    kind: TxKind,
    pub reached: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Default)]
struct ChainState {
    block: u64,
    nonce: u64,
    native: HashMap<Address, U256>,
    tokens: HashMap<(Address, Address), U256>,
    allowances: HashMap<(Address, Address, Address), U256>,
    invoices: HashMap<InvoiceId, OnchainInvoice>,
    receipts: HashMap<TxHash, (TxKind, TxReceipt)>,
}

/// In-memory ERC-20 plus invoice tracker. Transactions execute on submission;
/// receipt waits can be gated or hung independently of execution.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
    gate: Mutex<Option<Gate>>,
    hang: Mutex<Option<TxKind>>,
    pub reject_approve: AtomicBool,
    /// `approve` is mined with a failed status and grants nothing.
    pub revert_approve: AtomicBool,
    /// Grant at most this much, whatever was requested.
    pub approve_cap: Mutex<Option<U256>>,
    /// `payInvoice` succeeds without setting the paid flag.
    pub skip_paid_flag: AtomicBool,
    pub fail_balance_reads: AtomicBool,
    pub fail_disconnect: AtomicBool,
    /// Every context reports this chain id instead of the one it was opened on.
    pub report_chain_id: Mutex<Option<u64>>,
    pub create_calls: AtomicUsize,
    pub approve_calls: AtomicUsize,
    pub pay_calls: AtomicUsize,
    pub connect_calls: AtomicUsize,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        let chain = Self::default();
        chain.set_native(PAYER, U256::from(10u64).pow(U256::from(17u64)));
        Arc::new(chain)
    }

    pub fn fund(&self, owner: Address, amount: U256) {
        self.state
            .lock()
            .unwrap()
            .tokens
            .insert((USDC_ADDRESS, owner), amount);
    }

    pub fn set_native(&self, owner: Address, amount: U256) {
        self.state.lock().unwrap().native.insert(owner, amount);
    }

    pub fn token_balance_of(&self, owner: Address) -> U256 {
        self.state
            .lock()
            .unwrap()
            .tokens
            .get(&(USDC_ADDRESS, owner))
            .copied()
            .unwrap_or_default()
    }

    pub fn allowance_of(&self, owner: Address, spender: Address) -> U256 {
        self.state
            .lock()
            .unwrap()
            .allowances
            .get(&(USDC_ADDRESS, owner, spender))
            .copied()
            .unwrap_or_default()
    }

    pub fn invoice(&self, id: InvoiceId) -> Option<OnchainInvoice> {
        self.state.lock().unwrap().invoices.get(&id).cloned()
    }

    /// Gate the next receipt wait for `kind`.
    pub fn gate(&self, kind: TxKind) -> (Arc<Notify>, Arc<Notify>) {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Gate {
            kind,
            reached: Arc::clone(&reached),
            release: Arc::clone(&release),
        });
        (reached, release)
    }

    /// Receipt waits for `kind` never resolve (the receipt is still queryable).
    pub fn hang(&self, kind: Option<TxKind>) {
        *self.hang.lock().unwrap() = kind;
    }

    pub fn calls(&self) -> (usize, usize, usize) {
        (
            self.create_calls.load(Ordering::SeqCst),
            self.approve_calls.load(Ordering::SeqCst),
            self.pay_calls.load(Ordering::SeqCst),
        )
    }

    fn take_gate(&self, kind: TxKind) -> Option<Gate> {
        let mut gate = self.gate.lock().unwrap();
        match gate.as_ref() {
            Some(g) if g.kind == kind => gate.take(),
            _ => None,
        }
    }

    /// Mine a transaction: apply `effect` and record the receipt.
    fn mine(
        &self,
        kind: TxKind,
        effect: impl FnOnce(&mut ChainState) -> Option<Vec<Log>>,
    ) -> TxHash {
        let mut state = self.state.lock().unwrap();
        state.nonce += 1;
        state.block += 1;
        let tx_hash = B256::from(U256::from(state.nonce));
        let block = state.block;
        let outcome = effect(&mut state);
        let receipt = TxReceipt {
            tx_hash,
            block_number: Some(block),
            success: outcome.is_some(),
            logs: outcome.unwrap_or_default(),
        };
        state.receipts.insert(tx_hash, (kind, receipt));
        tx_hash
    }
}

pub struct MockContext {
    chain: Arc<MockChain>,
    address: Address,
    chain_id: u64,
}

impl MockContext {
    pub fn new(chain: Arc<MockChain>, address: Address, chain_id: u64) -> Self {
        Self {
            chain,
            address,
            chain_id,
        }
    }
}

impl SigningContext for MockContext {
    fn address(&self) -> Address {
        self.address
    }

    fn chain_id(&self) -> u64 {
        self.chain.report_chain_id.lock().unwrap().unwrap_or(self.chain_id)
    }

    async fn native_balance(&self, owner: Address) -> Result<U256, BasePayError> {
        if self.chain.fail_balance_reads.load(Ordering::SeqCst) {
            return Err(BasePayError::Transport("eth_getBalance failed".to_string()));
        }
        let state = self.chain.state.lock().unwrap();
        Ok(state.native.get(&owner).copied().unwrap_or_default())
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256, BasePayError> {
        if self.chain.fail_balance_reads.load(Ordering::SeqCst) {
            return Err(BasePayError::Transport("balanceOf failed".to_string()));
        }
        let state = self.chain.state.lock().unwrap();
        Ok(state.tokens.get(&(token, owner)).copied().unwrap_or_default())
    }

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, BasePayError> {
        let state = self.chain.state.lock().unwrap();
        Ok(state
            .allowances
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or_default())
    }

    async fn invoice(&self, _tracker: Address, id: InvoiceId) -> Result<OnchainInvoice, BasePayError> {
        let state = self.chain.state.lock().unwrap();
        Ok(state.invoices.get(&id).cloned().unwrap_or(OnchainInvoice {
            invoice_id: id,
            merchant: Address::ZERO,
            payer: Address::ZERO,
            token: Address::ZERO,
            amount: U256::ZERO,
            is_paid: false,
        }))
    }

    async fn send_create_invoice(
        &self,
        tracker: Address,
        params: &InvoiceParams,
    ) -> Result<TxHash, BasePayError> {
        self.chain.create_calls.fetch_add(1, Ordering::SeqCst);
        let payer = self.address;
        let params = params.clone();
        Ok(self.chain.mine(TxKind::Create, |state| {
            let invoice_id = keccak256(state.nonce.to_be_bytes());
            state.invoices.insert(
                invoice_id,
                OnchainInvoice {
                    invoice_id,
                    merchant: params.merchant,
                    payer,
                    token: params.token,
                    amount: params.amount,
                    is_paid: false,
                },
            );
            let event = InvoiceTracker::InvoiceCreated {
                invoiceHash: invoice_id,
                merchant: params.merchant,
                payer,
                token: params.token,
                amount: params.amount,
                memo: params.memo,
            };
            Some(vec![Log {
                address: tracker,
                data: event.encode_log_data(),
            }])
        }))
    }

    async fn send_approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<TxHash, BasePayError> {
        if self.chain.reject_approve.load(Ordering::SeqCst) {
            return Err(BasePayError::ChainRejected(
                "approve failed: User denied transaction signature".to_string(),
            ));
        }
        self.chain.approve_calls.fetch_add(1, Ordering::SeqCst);
        let granted = match *self.chain.approve_cap.lock().unwrap() {
            Some(cap) => amount.min(cap),
            None => amount,
        };
        let owner = self.address;
        let reverts = self.chain.revert_approve.load(Ordering::SeqCst);
        Ok(self.chain.mine(TxKind::Approve, |state| {
            if reverts {
                return None;
            }
            state.allowances.insert((token, owner, spender), granted);
            Some(Vec::new())
        }))
    }

    async fn send_pay_invoice(&self, tracker: Address, id: InvoiceId) -> Result<TxHash, BasePayError> {
        self.chain.pay_calls.fetch_add(1, Ordering::SeqCst);
        let payer = self.address;
        let set_paid = !self.chain.skip_paid_flag.load(Ordering::SeqCst);
        Ok(self.chain.mine(TxKind::Pay, |state| {
            let invoice = state.invoices.get(&id).cloned()?;
            if invoice.is_paid {
                return None;
            }
            let allowance_key = (invoice.token, payer, tracker);
            let allowance = state.allowances.get(&allowance_key).copied().unwrap_or_default();
            let balance = state
                .tokens
                .get(&(invoice.token, payer))
                .copied()
                .unwrap_or_default();
            if allowance < invoice.amount || balance < invoice.amount {
                return None;
            }
            state.allowances.insert(allowance_key, allowance - invoice.amount);
            state
                .tokens
                .insert((invoice.token, payer), balance - invoice.amount);
            *state
                .tokens
                .entry((invoice.token, invoice.merchant))
                .or_default() += invoice.amount;
            if let Some(record) = state.invoices.get_mut(&id) {
                record.payer = payer;
                record.is_paid = set_paid;
            }
            Some(Vec::new())
        }))
    }

    async fn transaction_receipt(&self, tx: TxHash) -> Result<Option<TxReceipt>, BasePayError> {
        let state = self.chain.state.lock().unwrap();
        Ok(state.receipts.get(&tx).map(|(_, receipt)| receipt.clone()))
    }

    async fn wait_for_receipt(&self, tx: TxHash) -> Result<TxReceipt, BasePayError> {
        let kind = self
            .chain
            .state
            .lock()
            .unwrap()
            .receipts
            .get(&tx)
            .map(|(kind, _)| *kind)
            .ok_or_else(|| BasePayError::Transport(format!("unknown tx {tx}")))?;

        if let Some(gate) = self.chain.take_gate(kind) {
            gate.reached.notify_one();
            gate.release.notified().await;
        }
        let hangs = *self.chain.hang.lock().unwrap() == Some(kind);
        if hangs {
            std::future::pending::<()>().await;
        }

        let state = self.chain.state.lock().unwrap();
        state
            .receipts
            .get(&tx)
            .map(|(_, receipt)| receipt.clone())
            .ok_or_else(|| BasePayError::Transport(format!("unknown tx {tx}")))
    }
}

/// Connector handing out [`MockContext`]s for [`PAYER`].
pub struct MockConnector {
    chain: Arc<MockChain>,
}

impl MockConnector {
    pub fn new(chain: Arc<MockChain>) -> Self {
        Self { chain }
    }

    fn connection(&self, chain_id: u64) -> Connection<MockContext> {
        Connection {
            context: MockContext::new(Arc::clone(&self.chain), PAYER, chain_id),
            user: UserInfo {
                name: Some("Test User".to_string()),
                email: Some("test@example.com".to_string()),
                verifier: Some("mock".to_string()),
                ..UserInfo::default()
            },
        }
    }
}

impl WalletConnector for MockConnector {
    type Context = MockContext;

    async fn connect(&self, config: &ChainConfig) -> Result<Connection<MockContext>, BasePayError> {
        self.chain.connect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.connection(config.chain_id))
    }

    async fn disconnect(&self) -> Result<(), BasePayError> {
        if self.chain.fail_disconnect.load(Ordering::SeqCst) {
            return Err(BasePayError::Transport("logout failed".to_string()));
        }
        Ok(())
    }

    async fn switch_chain(&self, config: &ChainConfig) -> Result<Connection<MockContext>, BasePayError> {
        Ok(self.connection(config.chain_id))
    }
}

/// A disconnected session over `chain`, targeting [`test_config`].
pub fn session(chain: &Arc<MockChain>) -> Arc<Session<MockConnector>> {
    Arc::new(Session::new(MockConnector::new(Arc::clone(chain)), test_config()))
}

/// A session over `chain`, already connected with [`test_config`].
pub async fn connected_session(chain: &Arc<MockChain>) -> Arc<Session<MockConnector>> {
    connected_session_with(chain, test_config()).await
}

pub async fn connected_session_with(
    chain: &Arc<MockChain>,
    config: ChainConfig,
) -> Arc<Session<MockConnector>> {
    let session = Arc::new(Session::new(MockConnector::new(Arc::clone(chain)), config));
    session.connect().await.unwrap();
    session
}

pub fn tracker() -> Address {
    INVOICE_TRACKER_ADDRESS
}

pub fn merchant() -> Address {
    MERCHANT_ADDRESS
}
