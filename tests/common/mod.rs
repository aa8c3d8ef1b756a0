#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use chrono::Utc;
use coin_ledger::engine::CoinEngine;
use coin_ledger::error::StorageError;
use coin_ledger::models::{LedgerEntry, Mutation, Reason};
use coin_ledger::operator_queue::OperatorQueue;
use coin_ledger::persistence::{Journal, JournalRecord, MemoryJournal};
use coin_ledger::reconciler::{Reconciler, WebhookVerifier};

pub const SECRET: &str = "whsec_test_secret";

/// Helper to build a credit/debit request with an optional idempotency key
pub fn mutation(user: &str, amount: i64, reason: Reason, external_ref: Option<&str>) -> Mutation {
    let mutation = Mutation::new(user, amount, reason);
    match external_ref {
        Some(external_ref) => mutation.with_external_ref(external_ref),
        None => mutation,
    }
}

/// Credit `amount` coins and return the entry, panicking on failure
pub async fn fund(engine: &CoinEngine, user: &str, amount: i64) -> LedgerEntry {
    engine
        .credit(mutation(user, amount, Reason::Purchase, None))
        .await
        .unwrap()
}

pub fn reconciler(engine: CoinEngine) -> Reconciler {
    Reconciler::new(
        engine,
        WebhookVerifier::new(SECRET, 300),
        OperatorQueue::in_memory(),
    )
}

/// Signature header for `body`, signed now with the test secret
pub fn sign(body: &[u8]) -> String {
    WebhookVerifier::new(SECRET, 300).sign(Utc::now().timestamp(), body)
}

/// Raw webhook body for a checkout session event
pub fn session_event(
    event_type: &str,
    event_id: &str,
    session_id: &str,
    user: &str,
    coins: i64,
    payment_status: &str,
) -> Vec<u8> {
    serde_json::json!({
        "id": event_id,
        "type": event_type,
        "data": { "object": {
            "id": session_id,
            "payment_status": payment_status,
            "amount_total": coins * 199,
            "currency": "thb",
            "metadata": { "user_id": user, "coins": coins.to_string() }
        }}
    })
    .to_string()
    .into_bytes()
}

pub fn paid_checkout(event_id: &str, user: &str, coins: i64) -> Vec<u8> {
    session_event(
        "checkout.session.completed",
        event_id,
        &format!("cs_{}", event_id),
        user,
        coins,
        "paid",
    )
}

/// Journal whose appends can be made to fail on demand
#[derive(Clone, Default)]
pub struct FaultSwitch(Arc<AtomicBool>);

impl FaultSwitch {
    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct FaultyJournal {
    inner: MemoryJournal,
    switch: FaultSwitch,
}

impl FaultyJournal {
    pub fn new(switch: FaultSwitch) -> Self {
        Self {
            inner: MemoryJournal::new(),
            switch,
        }
    }
}

impl Journal for FaultyJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<(), StorageError> {
        if self.switch.tripped() {
            return Err(StorageError::Unavailable("injected fault".to_string()));
        }
        self.inner.append(record)
    }

    fn replay(&self) -> Result<Vec<JournalRecord>, StorageError> {
        self.inner.replay()
    }
}

/// Assert the ledger and balance of `user` agree
pub fn assert_consistent(engine: &CoinEngine, user: &str) {
    let report = engine
        .check_consistency(user)
        .unwrap_or_else(|| panic!("no account for {}", user));
    assert!(
        report.is_consistent(),
        "ledger and balance disagree for {}: {:?}",
        user,
        report
    );
}

/// Journal whose writes wait until the gate is opened, recording the size
/// of every batch it is handed
#[derive(Clone, Default)]
pub struct Gate(Arc<(Mutex<GateState>, Condvar)>);

#[derive(Default)]
struct GateState {
    closed: bool,
    waiting: bool,
    batches: Vec<usize>,
}

impl Gate {
    pub fn close(&self) {
        self.0 .0.lock().unwrap().closed = true;
    }

    pub fn open(&self) {
        let (state, opened) = &*self.0;
        state.lock().unwrap().closed = false;
        opened.notify_all();
    }

    /// True while a write is parked behind the closed gate
    pub fn is_holding_write(&self) -> bool {
        self.0 .0.lock().unwrap().waiting
    }

    pub fn batches(&self) -> Vec<usize> {
        self.0 .0.lock().unwrap().batches.clone()
    }
}

pub struct GatedJournal {
    inner: MemoryJournal,
    gate: Gate,
}

impl GatedJournal {
    pub fn new(gate: Gate) -> Self {
        Self {
            inner: MemoryJournal::new(),
            gate,
        }
    }
}

impl Journal for GatedJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<(), StorageError> {
        self.append_batch(std::slice::from_ref(record))
    }

    fn append_batch(&mut self, records: &[JournalRecord]) -> Result<(), StorageError> {
        let (state, opened) = &*self.gate.0;
        let mut state = state.lock().unwrap();
        state.waiting = true;
        while state.closed {
            state = opened.wait(state).unwrap();
        }
        state.waiting = false;
        state.batches.push(records.len());
        drop(state);
        self.inner.append_batch(records)
    }

    fn replay(&self) -> Result<Vec<JournalRecord>, StorageError> {
        self.inner.replay()
    }
}
