use serde::{Deserialize, Serialize};

use super::{Address, Bytes, Chain, TxHash, B256, U256};

/// A contract call ready to be handed to a wallet for signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallData {
    pub chain: Chain,
    pub to: Address,
    pub data: Bytes,
    /// Native value attached to the call, in wei.
    pub value: U256,
}

impl CallData {
    pub fn new(chain: Chain, to: Address, data: impl Into<Bytes>) -> Self {
        Self { chain, to, data: data.into(), value: U256::ZERO }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub tx_hash: TxHash,
    pub status: ReceiptStatus,
    pub block_number: u64,
    pub logs: Vec<ReceiptLog>,
}

impl TransactionReceipt {
    pub fn is_success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}
