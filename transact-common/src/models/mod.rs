pub mod registry;
pub mod token;
pub mod transaction;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

pub use alloy_primitives::{Address, Bytes, B256, U256};

/// Transaction hash literal type to uniquely identify a transaction on a chain.
pub type TxHash = B256;

/// Vault id literal type, unique across all chains.
pub type VaultId = String;

/// Provider id literal type. Used to route an option back to the provider that created it.
pub type ProviderId = String;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Chain {
    #[default]
    Ethereum,
    Optimism,
    Bsc,
    Polygon,
    Fantom,
    Base,
    Arbitrum,
    Avax,
    Linea,
}

impl Chain {
    /// The EIP-155 chain id.
    pub fn chain_id(&self) -> u64 {
        match self {
            Chain::Ethereum => 1,
            Chain::Optimism => 10,
            Chain::Bsc => 56,
            Chain::Polygon => 137,
            Chain::Fantom => 250,
            Chain::Base => 8453,
            Chain::Arbitrum => 42161,
            Chain::Avax => 43114,
            Chain::Linea => 59144,
        }
    }
}
