//! Seams to the collaborators the transact core consumes but does not own.
//!
//! Caches are populated through their `fetch_*` methods and read through the `*_of` accessors.
//! The core only ever calls `fetch_*` from its own refresh actions; it never writes to a cache
//! directly.
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::{
    errors::{CollaboratorError, WalletError},
    models::{
        registry::{
            AddressBook, AmmConfig, BridgeConfig, FeeSchedule, MigratorConfig,
            SwapAggregatorConfig, VaultConfig,
        },
        token::{Token, TokenAmount},
        transaction::{CallData, TransactionReceipt},
        Address, Bytes, Chain, TxHash, U256,
    },
};

#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Usd price of one whole unit of `token`.
    async fn price_of(&self, token: &Token) -> Result<Decimal, CollaboratorError>;
}

#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait BalanceCache: Send + Sync {
    /// Populates the cache with `wallet`'s balances of `tokens`.
    async fn fetch_balances(
        &self,
        chain: Chain,
        tokens: &[Token],
        wallet: &Address,
    ) -> Result<(), CollaboratorError>;

    async fn balance_of(
        &self,
        chain: Chain,
        token: &Token,
        wallet: &Address,
    ) -> Result<Decimal, CollaboratorError>;

    /// Refreshes the cached reserves (tvl) of a vault. Caches that do not track reserves can
    /// ignore this.
    async fn fetch_vault_reserves(
        &self,
        _chain: Chain,
        _vault: &Address,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait AllowanceCache: Send + Sync {
    async fn fetch_allowances(
        &self,
        chain: Chain,
        spender: &Address,
        tokens: &[Token],
        wallet: &Address,
    ) -> Result<(), CollaboratorError>;

    async fn allowance_of(
        &self,
        chain: Chain,
        token: &Token,
        spender: &Address,
        wallet: &Address,
    ) -> Result<Decimal, CollaboratorError>;
}

/// Wallet connectivity and signing transport.
///
/// Timeouts are owned by the implementation: `wait_for_receipt` either resolves with a receipt,
/// fails, or stays pending.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait WalletTransport: Send + Sync {
    fn connected_account(&self) -> Option<Address>;

    async fn send_transaction(&self, call: CallData) -> Result<TxHash, WalletError>;

    async fn wait_for_receipt(
        &self,
        chain: Chain,
        tx_hash: TxHash,
    ) -> Result<TransactionReceipt, WalletError>;
}

/// Static per chain registries. Each resource is loaded once per session.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load_vaults(&self) -> Result<Vec<VaultConfig>, CollaboratorError>;

    async fn load_address_books(&self) -> Result<Vec<AddressBook>, CollaboratorError>;

    async fn load_amms(&self) -> Result<Vec<AmmConfig>, CollaboratorError>;

    async fn load_swap_aggregators(&self) -> Result<Vec<SwapAggregatorConfig>, CollaboratorError>;

    async fn load_bridges(&self) -> Result<Vec<BridgeConfig>, CollaboratorError>;

    async fn load_migrators(&self) -> Result<Vec<MigratorConfig>, CollaboratorError>;

    async fn load_fee_schedule(&self) -> Result<FeeSchedule, CollaboratorError>;
}

/// Reserves and supply of a UniswapV2 style pair, in raw on-chain units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairReserves {
    pub token0: Address,
    pub token1: Address,
    pub reserve0: U256,
    pub reserve1: U256,
    pub total_supply: U256,
}

/// Result of a CLM `previewDeposit` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClmDepositPreview {
    pub shares: U256,
    pub used0: U256,
    pub used1: U256,
}

/// Result of a CLM `previewWithdraw` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClmWithdrawPreview {
    pub amount0: U256,
    pub amount1: U256,
}

/// Read only contract calls the vault drivers and providers depend on.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Price of one vault share in deposit token wei, scaled by 1e18.
    async fn price_per_full_share(
        &self,
        chain: Chain,
        vault: &Address,
    ) -> Result<U256, CollaboratorError>;

    async fn pending_rewards(
        &self,
        chain: Chain,
        pool: &Address,
        account: &Address,
    ) -> Result<U256, CollaboratorError>;

    async fn pair_reserves(
        &self,
        chain: Chain,
        pair: &Address,
    ) -> Result<PairReserves, CollaboratorError>;

    async fn clm_preview_deposit(
        &self,
        chain: Chain,
        vault: &Address,
        amount0: U256,
        amount1: U256,
    ) -> Result<ClmDepositPreview, CollaboratorError>;

    async fn clm_preview_withdraw(
        &self,
        chain: Chain,
        vault: &Address,
        shares: U256,
    ) -> Result<ClmWithdrawPreview, CollaboratorError>;

    /// Amount `account` has staked in an external pool.
    async fn staked_balance(
        &self,
        chain: Chain,
        pool: &Address,
        account: &Address,
    ) -> Result<U256, CollaboratorError>;
}

/// An aggregator's indicative price for a swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapQuote {
    pub aggregator_id: String,
    pub from: TokenAmount,
    pub to: TokenAmount,
}

/// Aggregator calldata for a swap, slippage bounded by `min_out`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapTransaction {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub min_out: Decimal,
}

/// Off-chain swap aggregator api.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait SwapAggregatorApi: Send + Sync {
    async fn quote(
        &self,
        aggregator: &SwapAggregatorConfig,
        from: &TokenAmount,
        to: &Token,
    ) -> Result<SwapQuote, CollaboratorError>;

    async fn build_swap(
        &self,
        aggregator: &SwapAggregatorConfig,
        from: &TokenAmount,
        to: &Token,
        slippage: Decimal,
        from_address: &Address,
    ) -> Result<SwapTransaction, CollaboratorError>;
}
