//! In-memory state the presentation layer renders.
//!
//! Backed by a `tokio::sync::watch` channel: every write is visible to the
//! next [`InvoiceStateStore::snapshot`] and wakes subscribers.

use alloy::primitives::Address;
use serde::Serialize;
use tokio::sync::watch;

use crate::invoice::{BalanceAsset, BalanceSnapshot, Invoice};
use crate::BasePayError;

/// Latest balance reads, one per (address, asset).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BalanceBook {
    entries: Vec<BalanceSnapshot>,
}

impl BalanceBook {
    pub fn get(&self, address: Address, asset: BalanceAsset) -> Option<&BalanceSnapshot> {
        self.entries
            .iter()
            .find(|entry| entry.address == address && entry.asset == asset)
    }

    pub fn upsert(&mut self, snapshot: BalanceSnapshot) {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.address == snapshot.address && entry.asset == snapshot.asset)
        {
            Some(entry) => *entry = snapshot,
            None => self.entries.push(snapshot),
        }
    }

    pub fn mark_stale(&mut self) {
        for entry in &mut self.entries {
            entry.stale = true;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BalanceSnapshot> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything a UI needs to render the payment screen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub invoice: Option<Invoice>,
    pub balances: BalanceBook,
    pub last_error: Option<BasePayError>,
    /// A payment flow is in flight.
    pub busy: bool,
}

/// Single source of truth for what has been rendered.
pub struct InvoiceStateStore {
    state: watch::Sender<StoreSnapshot>,
}

impl Default for InvoiceStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InvoiceStateStore {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(StoreSnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.borrow().clone()
    }

    pub fn invoice(&self) -> Option<Invoice> {
        self.state.borrow().invoice.clone()
    }

    pub fn balances(&self) -> BalanceBook {
        self.state.borrow().balances.clone()
    }

    pub fn balance(&self, address: Address, asset: BalanceAsset) -> Option<BalanceSnapshot> {
        self.state.borrow().balances.get(address, asset).cloned()
    }

    pub fn last_error(&self) -> Option<BasePayError> {
        self.state.borrow().last_error.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state.borrow().busy
    }

    /// Receive every subsequent change.
    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.state.subscribe()
    }

    /// Start tracking a new attempt, discarding whatever invoice was there.
    pub fn begin_invoice(&self, invoice: Invoice) {
        self.state.send_modify(|state| {
            state.invoice = Some(invoice);
            state.last_error = None;
        });
    }

    /// Apply `f` to the current invoice if it belongs to attempt `flow_id`.
    /// Returns `false` (and changes nothing) when that attempt was discarded.
    pub fn update_invoice(&self, flow_id: u64, f: impl FnOnce(&mut Invoice)) -> bool {
        self.state.send_if_modified(|state| match state.invoice.as_mut() {
            Some(invoice) if invoice.flow_id == flow_id => {
                f(invoice);
                true
            }
            _ => false,
        })
    }

    pub fn record_balance(&self, snapshot: BalanceSnapshot) {
        self.state.send_modify(|state| state.balances.upsert(snapshot));
    }

    /// Flag every cached balance as outdated after a state-mutating transaction.
    pub fn mark_balances_stale(&self) {
        self.state.send_modify(|state| state.balances.mark_stale());
    }

    pub fn clear_balances(&self) {
        self.state
            .send_modify(|state| state.balances = BalanceBook::default());
    }

    pub fn set_error(&self, error: BasePayError) {
        self.state.send_modify(|state| state.last_error = Some(error));
    }

    pub fn set_busy(&self, busy: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.busy != busy;
            state.busy = busy;
            changed
        });
    }

    /// Forget everything tied to the session: invoice, balances and error.
    pub fn reset_session(&self) {
        self.state.send_modify(|state| {
            state.invoice = None;
            state.balances = BalanceBook::default();
            state.last_error = None;
        });
    }
}
