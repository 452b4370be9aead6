//! Invoice payment orchestration: create → approve → pay → verify → refresh.
//!
//! Steps run strictly in order and each one re-validates the session before
//! touching the chain. The orchestrator owns the [`Invoice`] for the attempt
//! and mirrors every change into the [`InvoiceStateStore`] as it happens, so
//! partial progress (e.g. `Created` while the approval is in flight) is always
//! observable. A failed step marks the invoice `Failed` and halts the flow;
//! nothing already on-chain is rolled back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use alloy::primitives::{Address, TxHash};
use alloy::sol_types::SolEvent;
use tokio::sync::broadcast;

use crate::approval::ApprovalManager;
use crate::invoice::{
    AllowanceGrant, Invoice, InvoiceId, InvoiceStatus, OnchainInvoice, PaymentRequest, TxRef,
    TxState, ValidatedPayment,
};
use crate::reader::ChainReader;
use crate::session::{Session, SessionEvent, WalletConnector};
use crate::signing::{confirm, InvoiceParams, SigningContext, TxReceipt};
use crate::store::{BalanceBook, InvoiceStateStore};
use crate::{BasePayError, ChainConfig, FlowStep, InvoiceTracker, TokenConfig};

/// State carried through one payment attempt.
struct Flow {
    epoch: u64,
    config: ChainConfig,
    payment: ValidatedPayment,
    invoice: Invoice,
}

/// Clears the busy flag when a flow (or reconcile) ends, however it ends.
struct BusyGuard<'a> {
    busy: &'a AtomicBool,
    store: &'a InvoiceStateStore,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
        self.store.set_busy(false);
    }
}

/// Drives invoice payments for one wallet session, on whichever chain the
/// session is currently configured for.
///
/// Only one payment may be in flight at a time: a concurrent
/// [`pay_invoice`](Self::pay_invoice) is rejected with
/// [`BasePayError::AlreadyInProgress`], never queued.
pub struct InvoiceOrchestrator<W: WalletConnector> {
    session: Arc<Session<W>>,
    reader: ChainReader<W>,
    approvals: ApprovalManager,
    store: Arc<InvoiceStateStore>,
    busy: AtomicBool,
    cancel_requested: AtomicBool,
    next_flow_id: AtomicU64,
}

impl<W: WalletConnector> InvoiceOrchestrator<W> {
    pub fn new(session: Arc<Session<W>>) -> Self {
        Self::with_store(session, Arc::new(InvoiceStateStore::new()))
    }

    /// Create an orchestrator that publishes into an existing store.
    pub fn with_store(session: Arc<Session<W>>, store: Arc<InvoiceStateStore>) -> Self {
        Self {
            reader: ChainReader::new(Arc::clone(&session)),
            approvals: ApprovalManager::new(session.chain_config().confirmation_timeout),
            session,
            store,
            busy: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            next_flow_id: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<InvoiceStateStore> {
        &self.store
    }

    pub fn session(&self) -> &Arc<Session<W>> {
        &self.session
    }

    pub fn reader(&self) -> &ChainReader<W> {
        &self.reader
    }

    pub fn approvals(&self) -> &ApprovalManager {
        &self.approvals
    }

    /// The session's current chain configuration.
    pub fn config(&self) -> ChainConfig {
        self.session.chain_config()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Ask the in-flight payment to stop at the next step boundary.
    ///
    /// Best-effort: a transaction already submitted is not retracted, and the
    /// step currently awaiting confirmation runs to completion first. Returns
    /// `false` when nothing is in flight.
    pub fn cancel(&self) -> bool {
        if !self.is_busy() {
            return false;
        }
        self.cancel_requested.store(true, Ordering::Release);
        tracing::info!("cancellation requested");
        true
    }

    fn acquire(&self) -> Result<BusyGuard<'_>, BasePayError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("rejected payment request: another flow is in flight");
            return Err(BasePayError::AlreadyInProgress);
        }
        self.store.set_busy(true);
        Ok(BusyGuard {
            busy: &self.busy,
            store: &self.store,
        })
    }

    /// Create, approve, pay and verify one invoice, then refresh balances.
    ///
    /// Returns the invoice in `Paid` or `Unpaid` state, or the step-tagged
    /// error that moved it to `Failed`.
    pub async fn pay_invoice(&self, request: &PaymentRequest) -> Result<Invoice, BasePayError> {
        let _busy = self.acquire()?;
        self.cancel_requested.store(false, Ordering::Release);

        let epoch = self.session.epoch();
        let config = self.session.chain_config();
        let payer = self
            .session
            .context_for(epoch)
            .and_then(|context| same_chain(context.as_ref(), &config))
            .inspect_err(|e| self.store.set_error(e.clone()))?;
        let payment = request
            .validate(&config)
            .inspect_err(|e| self.store.set_error(e.clone()))?;

        let flow_id = self.next_flow_id.fetch_add(1, Ordering::Relaxed) + 1;
        let invoice = Invoice::draft(flow_id, payer, &payment);
        self.store.begin_invoice(invoice.clone());

        tracing::info!(
            flow = flow_id,
            payer = %payer,
            merchant = %payment.merchant,
            amount = %invoice.display_amount(),
            token = %payment.token.symbol,
            "starting invoice payment"
        );

        let mut flow = Flow {
            epoch,
            config,
            payment,
            invoice,
        };

        if let Err((step, error)) = self.run_steps(&mut flow).await {
            return Err(self.fail(&mut flow, step, error));
        }

        // Non-fatal: failures land in `last_error` only.
        let _ = self
            .refresh_for(flow.payment.merchant, &flow.payment.token)
            .await;

        Ok(flow.invoice)
    }

    /// Run the on-chain steps in order, stopping at the first failure.
    async fn run_steps(&self, flow: &mut Flow) -> Result<(), (FlowStep, BasePayError)> {
        let invoice_id = self
            .create_step(flow)
            .await
            .map_err(|e| (FlowStep::Create, e))?;
        self.approve_step(flow)
            .await
            .map_err(|e| (FlowStep::Approve, e))?;
        self.pay_step(flow, invoice_id)
            .await
            .map_err(|e| (FlowStep::Pay, e))?;
        self.verify_step(flow, invoice_id)
            .await
            .map_err(|e| (FlowStep::Verify, e))
    }

    /// Re-validate the session and honour cancellation before a step. The
    /// context must still sign on the chain the flow's addresses belong to.
    fn checkpoint(&self, flow: &Flow, step: FlowStep) -> Result<Arc<W::Context>, BasePayError> {
        if self.cancel_requested.load(Ordering::Acquire) {
            tracing::warn!(flow = flow.invoice.flow_id, step = %step, "flow cancelled");
            return Err(BasePayError::Cancelled);
        }
        let context = self.session.context_for(flow.epoch).inspect_err(|_| {
            tracing::warn!(
                flow = flow.invoice.flow_id,
                step = %step,
                "session ended mid-flow; abandoning remaining steps"
            );
        })?;
        same_chain(context.as_ref(), &flow.config).inspect_err(|e| {
            tracing::warn!(
                flow = flow.invoice.flow_id,
                step = %step,
                error = %e,
                "signer chain no longer matches the flow"
            );
        })?;
        Ok(context)
    }

    /// Mirror the flow's invoice into the store. Dropped if the attempt was
    /// discarded (disconnect, or a newer flow).
    fn publish(&self, flow: &Flow) {
        self.store
            .update_invoice(flow.invoice.flow_id, |invoice| *invoice = flow.invoice.clone());
    }

    fn fail(&self, flow: &mut Flow, step: FlowStep, error: BasePayError) -> BasePayError {
        let error = error.at(step);
        flow.invoice.fail(step, error.clone());
        self.publish(flow);
        if self.store.invoice().map(|invoice| invoice.flow_id) == Some(flow.invoice.flow_id) {
            self.store.set_error(error.clone());
        }
        tracing::warn!(
            flow = flow.invoice.flow_id,
            invoice = ?flow.invoice.invoice_id,
            step = %step,
            error = %error,
            "invoice payment failed"
        );
        error
    }

    async fn create_step(&self, flow: &mut Flow) -> Result<InvoiceId, BasePayError> {
        let context = self.checkpoint(flow, FlowStep::Create)?;
        let tracker = flow.config.invoice_tracker;
        let params = InvoiceParams {
            merchant: flow.payment.merchant,
            token: flow.payment.token.address,
            amount: flow.payment.amount,
            memo: flow.payment.memo.clone(),
        };

        let tx = context.send_create_invoice(tracker, &params).await?;
        flow.invoice.create_tx = Some(TxRef::pending(tx));
        self.publish(flow);

        let receipt = confirm(
            context.as_ref(),
            tx,
            flow.config.confirmation_timeout,
            "createInvoice",
        )
        .await
        .inspect_err(|e| record_revert(flow.invoice.create_tx.as_mut(), e))?;
        self.store.mark_balances_stale();
        let invoice_id = invoice_id_from_receipt(tracker, &receipt)?;

        flow.invoice.create_tx = Some(confirmed(tx, &receipt));
        flow.invoice.invoice_id = Some(invoice_id);
        flow.invoice.advance(InvoiceStatus::Created)?;
        self.publish(flow);

        tracing::info!(
            flow = flow.invoice.flow_id,
            invoice = %invoice_id,
            tx = %tx,
            "invoice created"
        );
        Ok(invoice_id)
    }

    async fn approve_step(&self, flow: &mut Flow) -> Result<(), BasePayError> {
        let context = self.checkpoint(flow, FlowStep::Approve)?;
        flow.invoice.advance(InvoiceStatus::Approving)?;
        self.publish(flow);

        let owner = context.address();
        let spender = flow.config.invoice_tracker;
        let token = flow.payment.token.address;
        let amount = flow.payment.amount;
        let timeout = flow.config.confirmation_timeout;
        let flow_id = flow.invoice.flow_id;
        let store = self.store.as_ref();

        let grant = self
            .approvals
            .approve_with(context.as_ref(), token, spender, amount, timeout, |tx| {
                store.update_invoice(flow_id, |invoice| {
                    invoice.allowance = Some(AllowanceGrant {
                        owner,
                        spender,
                        token,
                        amount,
                        tx: TxRef::pending(tx),
                    });
                });
            })
            .await;
        // Keep the local copy in step with what was published on submission.
        if let Some(published) = self.store.invoice().filter(|i| i.flow_id == flow_id) {
            flow.invoice.allowance = published.allowance;
        }
        let grant = grant.inspect_err(|e| {
            record_revert(flow.invoice.allowance.as_mut().map(|grant| &mut grant.tx), e)
        })?;
        self.store.mark_balances_stale();

        tracing::info!(
            flow = flow_id,
            spender = %spender,
            amount = %amount,
            tx = %grant.tx.hash,
            "allowance granted"
        );
        flow.invoice.allowance = Some(grant);
        self.publish(flow);
        Ok(())
    }

    async fn pay_step(&self, flow: &mut Flow, invoice_id: InvoiceId) -> Result<(), BasePayError> {
        let context = self.checkpoint(flow, FlowStep::Pay)?;
        flow.invoice.advance(InvoiceStatus::Paying)?;
        self.publish(flow);

        let tx = context
            .send_pay_invoice(flow.config.invoice_tracker, invoice_id)
            .await?;
        flow.invoice.pay_tx = Some(TxRef::pending(tx));
        self.publish(flow);

        let receipt = confirm(
            context.as_ref(),
            tx,
            flow.config.confirmation_timeout,
            "payInvoice",
        )
        .await
        .inspect_err(|e| record_revert(flow.invoice.pay_tx.as_mut(), e))?;
        self.store.mark_balances_stale();

        flow.invoice.pay_tx = Some(confirmed(tx, &receipt));
        self.publish(flow);

        tracing::info!(
            flow = flow.invoice.flow_id,
            invoice = %invoice_id,
            tx = %tx,
            "payment transaction confirmed"
        );
        Ok(())
    }

    /// The paid flag comes from reading the tracker, never from the pay
    /// transaction's success.
    async fn verify_step(&self, flow: &mut Flow, invoice_id: InvoiceId) -> Result<(), BasePayError> {
        let context = self.checkpoint(flow, FlowStep::Verify)?;
        let record = context
            .invoice(flow.config.invoice_tracker, invoice_id)
            .await?;

        let status = if record.is_paid {
            InvoiceStatus::Paid
        } else {
            InvoiceStatus::Unpaid
        };
        flow.invoice.advance(status)?;
        self.publish(flow);

        tracing::info!(
            flow = flow.invoice.flow_id,
            invoice = %invoice_id,
            status = %status,
            "invoice verified"
        );
        Ok(())
    }

    /// Re-read payer native and token balances and the configured merchant's
    /// token balance.
    ///
    /// Failures are recorded in the store's `last_error` and returned; they
    /// never touch the invoice.
    pub async fn refresh_balances(&self) -> Result<BalanceBook, BasePayError> {
        let config = self.config();
        self.refresh_for(config.merchant, &config.token).await
    }

    async fn refresh_for(
        &self,
        merchant: Address,
        token: &TokenConfig,
    ) -> Result<BalanceBook, BasePayError> {
        let Some(payer) = self.session.address() else {
            let error = BasePayError::NoProvider.at(FlowStep::Refresh);
            self.store.set_error(error.clone());
            return Err(error);
        };

        let (native, payer_token, merchant_token) = tokio::join!(
            self.reader.native_snapshot(payer),
            self.reader.token_snapshot(token, payer),
            self.reader.token_snapshot(token, merchant),
        );

        let mut first_error = None;
        for result in [native, payer_token, merchant_token] {
            match result {
                Ok(snapshot) => self.store.record_balance(snapshot),
                Err(e) => {
                    tracing::warn!(error = %e, "balance refresh failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(error) => {
                let error = error.at(FlowStep::Refresh);
                self.store.set_error(error.clone());
                Err(error)
            }
            None => Ok(self.store.balances()),
        }
    }

    /// Read any invoice's record from the tracker.
    pub async fn lookup_invoice(&self, id: InvoiceId) -> Result<OnchainInvoice, BasePayError> {
        let tracker = self.config().invoice_tracker;
        self.reader.invoice_record(tracker, id).await
    }

    /// Look up receipts for the current invoice's still-pending transactions
    /// (e.g. after a confirmation timeout) and record what is found.
    ///
    /// Only transaction references and balances change; the invoice status is
    /// left as the flow settled it.
    pub async fn reconcile_pending(&self) -> Result<Option<Invoice>, BasePayError> {
        let _busy = self.acquire()?;
        let Some(mut invoice) = self.store.invoice() else {
            return Ok(None);
        };
        let context = self
            .session
            .signing_context()
            .ok_or(BasePayError::NoProvider)?;
        let config = self.config();

        let mut changed = false;
        if let Some(tx) = invoice.create_tx.as_mut() {
            if let Some(receipt) = observe(context.as_ref(), tx).await? {
                changed = true;
                if receipt.success && invoice.invoice_id.is_none() {
                    invoice.invoice_id = invoice_id_from_receipt(config.invoice_tracker, &receipt).ok();
                }
            }
        }
        if let Some(grant) = invoice.allowance.as_mut() {
            changed |= observe(context.as_ref(), &mut grant.tx).await?.is_some();
        }
        if let Some(tx) = invoice.pay_tx.as_mut() {
            changed |= observe(context.as_ref(), tx).await?.is_some();
        }

        if changed {
            for tx in invoice.tx_refs() {
                tracing::info!(flow = invoice.flow_id, tx = %tx.hash, state = ?tx.state, "reconciled transaction");
            }
            self.store
                .update_invoice(invoice.flow_id, |current| *current = invoice.clone());
            self.store.mark_balances_stale();
            let _ = self.refresh_for(invoice.merchant, &invoice.token).await;
        }
        Ok(Some(invoice))
    }

    /// Move the session to another chain. Rejected while a payment is in
    /// flight; the new config is live before `ChainChanged` is broadcast.
    pub async fn switch_chain(&self, config: ChainConfig) -> Result<(), BasePayError> {
        let _busy = self.acquire()?;
        self.session.switch_chain(&config).await?;
        Ok(())
    }

    /// React to a session transition: disconnect discards the invoice and
    /// balances; connect and chain changes trigger a balance refresh.
    pub async fn handle_session_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Disconnected => {
                self.store.reset_session();
                tracing::info!("session ended; invoice and balances discarded");
            }
            SessionEvent::Connected { address, .. } => {
                tracing::info!(address = %address, "session started; refreshing balances");
                let _ = self.refresh_balances().await;
            }
            SessionEvent::ChainChanged { chain_id, .. } => {
                tracing::info!(chain_id, "chain changed; refreshing balances");
                self.store.clear_balances();
                let _ = self.refresh_balances().await;
            }
        }
    }

    /// Spawn a task applying [`handle_session_event`](Self::handle_session_event)
    /// to every session event until the session is dropped.
    pub fn spawn_session_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()>
    where
        W: 'static,
    {
        let orchestrator = Arc::clone(self);
        let mut events = self.session.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => orchestrator.handle_session_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "session listener lagged; resyncing");
                        if orchestrator.session.is_connected() {
                            let _ = orchestrator.refresh_balances().await;
                        } else {
                            orchestrator.store.reset_session();
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Pull the invoice hash out of the tracker's `InvoiceCreated` event.
pub fn invoice_id_from_receipt(
    tracker: Address,
    receipt: &TxReceipt,
) -> Result<InvoiceId, BasePayError> {
    receipt
        .logs
        .iter()
        .filter(|log| log.address == tracker)
        .find_map(|log| InvoiceTracker::InvoiceCreated::decode_log_data(&log.data).ok())
        .map(|event| event.invoiceHash)
        .ok_or_else(|| {
            BasePayError::UnexpectedReceipt(format!(
                "no InvoiceCreated event from {tracker} in tx {}",
                receipt.tx_hash
            ))
        })
}

fn confirmed(tx: TxHash, receipt: &TxReceipt) -> TxRef {
    TxRef {
        hash: tx,
        state: TxState::Confirmed {
            block: receipt.block_number,
        },
    }
}

/// The payer address, if `context` signs on `config`'s chain.
fn same_chain<C: SigningContext>(
    context: &C,
    config: &ChainConfig,
) -> Result<Address, BasePayError> {
    match context.chain_id() {
        actual if actual == config.chain_id => Ok(context.address()),
        actual => Err(BasePayError::ChainMismatch {
            expected: config.chain_id,
            actual,
        }),
    }
}

fn record_revert(tx: Option<&mut TxRef>, error: &BasePayError) {
    if let (Some(tx), BasePayError::ContractReverted(_)) = (tx, error) {
        tx.state = TxState::Reverted { block: None };
    }
}

/// Update a pending reference from its receipt, if one exists yet.
async fn observe<C: SigningContext>(
    context: &C,
    tx: &mut TxRef,
) -> Result<Option<TxReceipt>, BasePayError> {
    if !tx.is_pending() {
        return Ok(None);
    }
    let Some(receipt) = context.transaction_receipt(tx.hash).await? else {
        return Ok(None);
    };
    tx.state = if receipt.success {
        TxState::Confirmed {
            block: receipt.block_number,
        }
    } else {
        TxState::Reverted {
            block: receipt.block_number,
        }
    };
    Ok(Some(receipt))
}
