//! Static configuration records.
//!
//! These describe the vaults, AMMs, aggregators, bridges and migrators the engine may route
//! through. They are loaded once per session and never change afterwards.
use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{token::Token, Address, Chain, VaultId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultKind {
    /// Auto-compounding vault minting share tokens for a single deposit token.
    Standard,
    /// Governance/staking pool: deposits are staked 1:1 and accrue external rewards.
    Gov,
    /// Dual-asset concentrated liquidity manager.
    Clm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    pub id: VaultId,
    pub chain: Chain,
    pub kind: VaultKind,
    /// The vault (or pool) contract.
    pub address: Address,
    /// Deposit token addresses. One for standard and gov vaults, two for CLM vaults.
    pub deposit_tokens: Vec<Address>,
    /// Reward token of a gov vault.
    #[serde(default)]
    pub reward_token: Option<Address>,
    #[serde(default = "default_share_decimals")]
    pub share_decimals: u32,
    #[serde(default)]
    pub deposit_fee: Decimal,
    #[serde(default)]
    pub withdraw_fee: Decimal,
    /// Id of the AMM whose LP token this vault accepts, if any.
    #[serde(default)]
    pub amm: Option<String>,
}

fn default_share_decimals() -> u32 {
    18
}

impl VaultConfig {
    /// Symbol used for the vault's share token.
    pub fn share_symbol(&self) -> String {
        format!("moo-{}", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub address: Address,
    pub symbol: String,
    pub decimals: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeEntry {
    pub symbol: String,
    #[serde(default = "default_native_decimals")]
    pub decimals: u32,
}

fn default_native_decimals() -> u32 {
    18
}

/// Per chain token metadata plus the chain wide contracts every provider shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBook {
    pub chain: Chain,
    pub native: NativeEntry,
    pub wrapped_native: Address,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
    /// Router executing multi-leg orders in a single transaction.
    #[serde(default)]
    pub zap_router: Option<Address>,
    /// Contract pulling tokens on behalf of the zap router. Approvals go here.
    #[serde(default)]
    pub zap_token_manager: Option<Address>,
}

impl AddressBook {
    pub fn native_token(&self) -> Token {
        Token::native(self.chain, &self.native.symbol, self.native.decimals)
    }

    pub fn wrapped_native_token(&self) -> Option<Token> {
        self.token(&self.wrapped_native)
    }

    /// Looks up an ERC20 token by address. The zero address resolves to the native token.
    pub fn token(&self, address: &Address) -> Option<Token> {
        if address.is_zero() {
            return Some(self.native_token());
        }
        self.tokens
            .iter()
            .find(|entry| &entry.address == address)
            .map(|entry| Token::new(self.chain, entry.address, &entry.symbol, entry.decimals))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmmConfig {
    pub id: String,
    pub chain: Chain,
    pub name: String,
    pub router: Address,
    /// Swap fee as a fraction, e.g. `0.003` for 0.3%.
    pub swap_fee: Decimal,
    /// Zap contract performing single-sided LP entry and exit for this AMM.
    pub zap: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapAggregatorConfig {
    pub id: String,
    pub chain: Chain,
    pub name: String,
    /// Contract the aggregator's calldata is sent to.
    pub router: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRoute {
    pub from: Chain,
    pub to: Chain,
    /// Bridge-and-deposit entry point on the source chain.
    pub contract: Address,
    pub token_in: Address,
    pub token_out: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub id: String,
    pub name: String,
    /// Proportional fee taken from the bridged amount.
    #[serde(default)]
    pub fee: Decimal,
    /// Messaging fee in native units of the source chain.
    #[serde(default)]
    pub native_fee: Decimal,
    pub routes: Vec<BridgeRoute>,
}

/// A competitor staking pool whose positions can be moved into one of our vaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratorConfig {
    pub id: String,
    pub name: String,
    pub chain: Chain,
    pub pool: Address,
    pub vault_id: VaultId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Fee charged on aggregator routed zaps, as a fraction of the input.
    #[serde(default)]
    pub zap_fee: Decimal,
    /// Per chain override of `zap_fee`.
    #[serde(default)]
    pub overrides: HashMap<Chain, Decimal>,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self { zap_fee: Decimal::ZERO, overrides: HashMap::new() }
    }
}

impl FeeSchedule {
    pub fn zap_fee_for(&self, chain: Chain) -> Decimal {
        self.overrides
            .get(&chain)
            .copied()
            .unwrap_or(self.zap_fee)
    }
}
