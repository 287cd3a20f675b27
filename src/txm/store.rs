//! In-memory transaction store
//!
//! Keeps one book per sending address:
//! - Unstarted queue (FIFO, bounded)
//! - Unconfirmed transactions indexed by nonce
//! - A short history of confirmed transactions

use super::types::{Attempt, Transaction, TxRequest, TxState};
use crate::error::{TxmError, TxmResult};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::Address;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Oldest unstarted transactions are dropped beyond this
pub const MAX_QUEUED_TRANSACTIONS: usize = 250;

/// Confirmed transactions retained per address
pub const MAX_CONFIRMED_HISTORY: usize = 100;

#[derive(Default)]
struct AddressBook {
    unstarted: VecDeque<Transaction>,
    unconfirmed: BTreeMap<u64, Transaction>,
    confirmed: VecDeque<Transaction>,
}

/// Transaction store that lives for the lifetime of the process
pub struct InMemoryStore {
    chain_id: u64,
    next_id: AtomicU64,
    books: DashMap<Address, AddressBook>,
}

impl InMemoryStore {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            next_id: AtomicU64::new(1),
            books: DashMap::new(),
        }
    }

    /// Start tracking an address
    pub fn add(&self, address: Address) -> TxmResult<()> {
        if self.books.contains_key(&address) {
            return Err(TxmError::Store(format!(
                "Address {:?} is already tracked",
                address
            )));
        }
        self.books.insert(address, AddressBook::default());
        debug!("Tracking address {:?} on chain {}", address, self.chain_id);
        Ok(())
    }

    /// All tracked addresses
    pub fn addresses(&self) -> Vec<Address> {
        self.books.iter().map(|e| *e.key()).collect()
    }

    /// Queue a new transaction
    pub fn create_transaction(&self, request: TxRequest) -> TxmResult<Transaction> {
        let address = request.from_address;
        let mut book = self
            .books
            .get_mut(&address)
            .ok_or(TxmError::AddressNotFound(address))?;

        if book.unstarted.len() >= MAX_QUEUED_TRANSACTIONS {
            if let Some(dropped) = book.unstarted.pop_front() {
                warn!(
                    "Unstarted queue for {:?} is full, dropping oldest transaction {}",
                    address, dropped.id
                );
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tx = Transaction::from_request(id, request);
        book.unstarted.push_back(tx.clone());
        Ok(tx)
    }

    pub fn count_unstarted_transactions(&self, address: Address) -> TxmResult<usize> {
        let book = self
            .books
            .get(&address)
            .ok_or(TxmError::AddressNotFound(address))?;
        Ok(book.unstarted.len())
    }

    /// The unconfirmed transaction at `nonce`, if any, and the number of
    /// unconfirmed transactions for the address
    pub fn fetch_unconfirmed_transaction_at_nonce_with_count(
        &self,
        nonce: u64,
        address: Address,
    ) -> TxmResult<(Option<Transaction>, usize)> {
        let book = self
            .books
            .get(&address)
            .ok_or(TxmError::AddressNotFound(address))?;
        Ok((book.unconfirmed.get(&nonce).cloned(), book.unconfirmed.len()))
    }

    /// Move the oldest unstarted transaction to unconfirmed under `nonce`
    pub fn update_unstarted_to_unconfirmed(
        &self,
        address: Address,
        nonce: u64,
    ) -> TxmResult<Option<Transaction>> {
        let mut book = self
            .books
            .get_mut(&address)
            .ok_or(TxmError::AddressNotFound(address))?;

        if book.unconfirmed.contains_key(&nonce) {
            return Err(TxmError::Store(format!(
                "Nonce {} for {:?} is already in use",
                nonce, address
            )));
        }

        let Some(mut tx) = book.unstarted.pop_front() else {
            return Ok(None);
        };
        tx.nonce = Some(nonce);
        tx.state = TxState::Unconfirmed;
        book.unconfirmed.insert(nonce, tx.clone());
        Ok(Some(tx))
    }

    pub fn append_attempt(&self, address: Address, nonce: u64, attempt: Attempt) -> TxmResult<()> {
        self.with_unconfirmed(address, nonce, attempt.tx_id, |tx| tx.attempts.push(attempt))
    }

    /// Record a successful broadcast of the latest attempt
    pub fn mark_broadcast(
        &self,
        address: Address,
        nonce: u64,
        tx_id: u64,
        at: DateTime<Utc>,
    ) -> TxmResult<()> {
        self.with_unconfirmed(address, nonce, tx_id, |tx| {
            tx.initial_broadcast_at.get_or_insert(at);
            tx.last_broadcast_at = Some(at);
        })
    }

    pub fn mark_purgeable(&self, address: Address, nonce: u64, tx_id: u64) -> TxmResult<()> {
        self.with_unconfirmed(address, nonce, tx_id, |tx| tx.is_purgeable = true)
    }

    /// Confirm every unconfirmed transaction whose nonce is below the
    /// latest mined nonce. Returns the confirmed transaction ids.
    pub fn mark_confirmed(&self, address: Address, latest_nonce: u64) -> TxmResult<Vec<u64>> {
        let mut book = self
            .books
            .get_mut(&address)
            .ok_or(TxmError::AddressNotFound(address))?;

        let still_pending = book.unconfirmed.split_off(&latest_nonce);
        let mined = std::mem::replace(&mut book.unconfirmed, still_pending);

        let mut ids = Vec::with_capacity(mined.len());
        for (_, mut tx) in mined {
            tx.state = TxState::Confirmed;
            ids.push(tx.id);
            book.confirmed.push_back(tx);
        }
        while book.confirmed.len() > MAX_CONFIRMED_HISTORY {
            book.confirmed.pop_front();
        }

        Ok(ids)
    }

    pub fn count_confirmed_transactions(&self, address: Address) -> TxmResult<usize> {
        let book = self
            .books
            .get(&address)
            .ok_or(TxmError::AddressNotFound(address))?;
        Ok(book.confirmed.len())
    }

    fn with_unconfirmed(
        &self,
        address: Address,
        nonce: u64,
        tx_id: u64,
        update: impl FnOnce(&mut Transaction),
    ) -> TxmResult<()> {
        let mut book = self
            .books
            .get_mut(&address)
            .ok_or(TxmError::AddressNotFound(address))?;

        match book.unconfirmed.get_mut(&nonce) {
            Some(tx) if tx.id == tx_id => {
                update(tx);
                Ok(())
            }
            _ => Err(TxmError::Store(format!(
                "Unconfirmed transaction {} with nonce {} not found for {:?}",
                tx_id, nonce, address
            ))),
        }
    }
}
