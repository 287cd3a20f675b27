//! Transaction and attempt records kept by the store

use crate::gas::FeeEstimate;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};

/// A request to send a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub chain_id: u64,
    pub from_address: Address,
    pub to_address: Address,
    pub value: U256,
    pub data: Bytes,
    /// Zero means the estimator's default limit
    pub specified_gas_limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Queued, no nonce assigned yet
    Unstarted,
    /// Nonce assigned, at least one attempt built
    Unconfirmed,
    /// Mined: the on-chain nonce has moved past this transaction
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: u64,
    pub chain_id: u64,
    pub from_address: Address,
    pub to_address: Address,
    pub value: U256,
    pub data: Bytes,
    pub specified_gas_limit: u64,
    pub nonce: Option<u64>,
    pub state: TxState,
    /// Set once the transaction has been replaced by an empty self-transfer
    pub is_purgeable: bool,
    pub attempts: Vec<Attempt>,
    pub created_at: DateTime<Utc>,
    pub initial_broadcast_at: Option<DateTime<Utc>>,
    pub last_broadcast_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub(crate) fn from_request(id: u64, request: TxRequest) -> Self {
        Self {
            id,
            chain_id: request.chain_id,
            from_address: request.from_address,
            to_address: request.to_address,
            value: request.value,
            data: request.data,
            specified_gas_limit: request.specified_gas_limit,
            nonce: None,
            state: TxState::Unstarted,
            is_purgeable: false,
            attempts: Vec::new(),
            created_at: Utc::now(),
            initial_broadcast_at: None,
            last_broadcast_at: None,
        }
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }
}

/// A signed version of a transaction, ready to broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub tx_id: u64,
    pub hash: H256,
    pub fee: FeeEstimate,
    pub gas_limit: u64,
    pub signed_transaction: Bytes,
    pub created_at: DateTime<Utc>,
}
