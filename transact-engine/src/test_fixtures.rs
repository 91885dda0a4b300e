//! In-memory collaborators and a fixture registry shared by the unit tests.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use alloy_primitives::address;
use async_trait::async_trait;
use rust_decimal::Decimal;
use transact_common::{
    errors::{CollaboratorError, WalletError},
    models::{
        registry::SwapAggregatorConfig,
        token::{to_wei, Token, TokenAmount},
        transaction::{CallData, ReceiptStatus, TransactionReceipt},
        Address, Bytes, Chain, TxHash, B256, U256,
    },
    traits::{
        AllowanceCache, BalanceCache, ChainReader, ClmDepositPreview, ClmWithdrawPreview,
        PairReserves, PriceOracle, SwapAggregatorApi, SwapQuote, SwapTransaction, WalletTransport,
    },
};

use crate::{
    config::{RegistryStore, SettingsHandle, YamlConfigSource},
    drivers::VaultDriverRegistry,
    engine::QuoteEngine,
    providers::{ProviderContext, ProviderRegistry},
    steps::ExecutionContext,
    transact::{Transact, TransactDeps},
};

pub const STANDARD_VAULT_ID: &str = "morpho-usdc";
pub const GOV_VAULT_ID: &str = "bifi-earnings";
pub const CLM_VAULT_ID: &str = "cow-uni-weth-usdc";
pub const LP_VAULT_ID: &str = "uniswap-weth-usdc";
pub const BASE_VAULT_ID: &str = "base-morpho-usdc";
pub const MIGRATION_VAULT_ID: &str = "morpho-dai";

pub const USDC: Address = address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
pub const WETH: Address = address!("c02aaa39b223fe8d0a0e5c4f27ead9083c756cc2");

const STANDARD_VAULT: Address = address!("0000000000000000000000000000000000001001");
const BASE_VAULT: Address = address!("0000000000000000000000000000000000001005");
const AMM_ZAP: Address = address!("0000000000000000000000000000000000002001");
const ZAP_ROUTER: Address = address!("0000000000000000000000000000000000003001");
const ZAP_TOKEN_MANAGER: Address = address!("0000000000000000000000000000000000003002");
const MIGRATOR_POOL: Address = address!("0000000000000000000000000000000000005001");

/// Account of a connected [`FakeWallet`].
pub const ACCOUNT: Address = address!("eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee");

const FIXTURE: &str = r#"
settings:
  slippage_tolerance: "0.01"
  reconfirm_drift_share: "0.1"
vaults:
  - id: morpho-usdc
    chain: ethereum
    kind: standard
    address: "0x0000000000000000000000000000000000001001"
    deposit_tokens: ["0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"]
  - id: bifi-earnings
    chain: ethereum
    kind: gov
    address: "0x0000000000000000000000000000000000001002"
    deposit_tokens: ["0x5870700f1272a1adbb87c3140bd770880a95e55d"]
    reward_token: "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"
  - id: cow-uni-weth-usdc
    chain: ethereum
    kind: clm
    address: "0x0000000000000000000000000000000000001003"
    deposit_tokens:
      - "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"
      - "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
  - id: uniswap-weth-usdc
    chain: ethereum
    kind: standard
    address: "0x0000000000000000000000000000000000001004"
    deposit_tokens: ["0xb4e16d0168e52d35cacd2c6185b44281ec28c9dc"]
    amm: uniswap
  - id: base-morpho-usdc
    chain: base
    kind: standard
    address: "0x0000000000000000000000000000000000001005"
    deposit_tokens: ["0x833589fcd6edb6e08f4c7c32d4f71b54bda02913"]
    share_decimals: 18
  - id: morpho-dai
    chain: ethereum
    kind: standard
    address: "0x0000000000000000000000000000000000001006"
    deposit_tokens: ["0x6b175474e89094c44da98b954eedeac495271d0f"]
address_books:
  - chain: ethereum
    native: { symbol: ETH }
    wrapped_native: "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"
    tokens:
      - { address: "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", symbol: WETH, decimals: 18 }
      - { address: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", symbol: USDC, decimals: 6 }
      - { address: "0x6b175474e89094c44da98b954eedeac495271d0f", symbol: DAI, decimals: 18 }
      - { address: "0x5870700f1272a1adbb87c3140bd770880a95e55d", symbol: BIFI, decimals: 18 }
      - { address: "0xb4e16d0168e52d35cacd2c6185b44281ec28c9dc", symbol: UNI-V2, decimals: 18 }
  - chain: base
    native: { symbol: ETH }
    wrapped_native: "0x4200000000000000000000000000000000000006"
    tokens:
      - { address: "0x4200000000000000000000000000000000000006", symbol: WETH, decimals: 18 }
      - { address: "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913", symbol: USDC, decimals: 6 }
    zap_router: "0x0000000000000000000000000000000000003001"
    zap_token_manager: "0x0000000000000000000000000000000000003002"
  - chain: arbitrum
    native: { symbol: ETH }
    wrapped_native: "0x82af49447d8a07e3bd95bd0d56f35241523fbab1"
    tokens:
      - { address: "0x82af49447d8a07e3bd95bd0d56f35241523fbab1", symbol: WETH, decimals: 18 }
      - { address: "0xaf88d065e77c8cc2239327c5edb3a432268e5831", symbol: USDC, decimals: 6 }
amms:
  - id: uniswap
    chain: ethereum
    name: Uniswap V2
    router: "0x7a250d5630b4cf539739df2c5dacb4c659f2488d"
    swap_fee: "0.003"
    zap: "0x0000000000000000000000000000000000002001"
swap_aggregators:
  - id: kyber
    chain: base
    name: KyberSwap
    router: "0x0000000000000000000000000000000000004001"
  - id: odos
    chain: base
    name: Odos
    router: "0x0000000000000000000000000000000000004002"
  - id: paraswap
    chain: base
    name: ParaSwap
    router: "0x0000000000000000000000000000000000004003"
bridges:
  - id: stargate
    name: Stargate
    fee: "0.0006"
    native_fee: "0.0002"
    routes:
      - from: arbitrum
        to: base
        contract: "0x0000000000000000000000000000000000006001"
        token_in: "0xaf88d065e77c8cc2239327c5edb3a432268e5831"
        token_out: "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913"
migrators:
  - id: aave
    name: Aave
    chain: ethereum
    pool: "0x0000000000000000000000000000000000005001"
    vault_id: morpho-dai
fees:
  zap_fee: "0.0005"
  overrides:
    base: "0.001"
"#;

pub fn fixture_source() -> YamlConfigSource {
    YamlConfigSource::from_str(FIXTURE).expect("fixture parses")
}

/// The fixture registry, already loaded.
pub async fn fixture_registry() -> Arc<RegistryStore> {
    let registry = Arc::new(RegistryStore::new(Arc::new(fixture_source())));
    registry
        .ensure_loaded()
        .await
        .expect("fixture loads");
    registry
}

/// Chain state served from memory. Share prices are served in order, the last one repeating.
pub struct FakeChainReader {
    ppfs: Mutex<VecDeque<Decimal>>,
    ppfs_reads: AtomicUsize,
    pending_rewards: Mutex<Decimal>,
    staked: Mutex<Decimal>,
    clm_deposit: Mutex<Option<ClmDepositPreview>>,
    clm_withdraw: Mutex<Option<ClmWithdrawPreview>>,
}

impl Default for FakeChainReader {
    fn default() -> Self {
        Self {
            ppfs: Mutex::new(VecDeque::from([Decimal::ONE])),
            ppfs_reads: AtomicUsize::new(0),
            pending_rewards: Mutex::new(Decimal::ZERO),
            staked: Mutex::new(Decimal::ZERO),
            clm_deposit: Mutex::new(None),
            clm_withdraw: Mutex::new(None),
        }
    }
}

impl FakeChainReader {
    pub fn set_ppfs(&self, ppfs: Decimal) {
        *self.ppfs.lock().unwrap() = VecDeque::from([ppfs]);
    }

    /// Queues a share price served after the current ones.
    pub fn push_ppfs(&self, ppfs: Decimal) {
        self.ppfs.lock().unwrap().push_back(ppfs);
    }

    pub fn ppfs_reads(&self) -> usize {
        self.ppfs_reads.load(Ordering::SeqCst)
    }

    pub fn set_pending_rewards(&self, rewards: Decimal) {
        *self.pending_rewards.lock().unwrap() = rewards;
    }

    pub fn set_staked(&self, staked: Decimal) {
        *self.staked.lock().unwrap() = staked;
    }

    pub fn set_clm_deposit(&self, shares: TokenAmount, used0: TokenAmount, used1: TokenAmount) {
        *self.clm_deposit.lock().unwrap() = Some(ClmDepositPreview {
            shares: shares.to_wei().unwrap(),
            used0: used0.to_wei().unwrap(),
            used1: used1.to_wei().unwrap(),
        });
    }

    pub fn set_clm_withdraw(&self, amount0: TokenAmount, amount1: TokenAmount) {
        *self.clm_withdraw.lock().unwrap() = Some(ClmWithdrawPreview {
            amount0: amount0.to_wei().unwrap(),
            amount1: amount1.to_wei().unwrap(),
        });
    }
}

#[async_trait]
impl ChainReader for FakeChainReader {
    async fn price_per_full_share(
        &self,
        _chain: Chain,
        _vault: &Address,
    ) -> Result<U256, CollaboratorError> {
        self.ppfs_reads.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.ppfs.lock().unwrap();
        let ppfs = if queue.len() > 1 { queue.pop_front() } else { queue.front().copied() };
        Ok(to_wei(ppfs.unwrap_or(Decimal::ONE), 18)?)
    }

    async fn pending_rewards(
        &self,
        _chain: Chain,
        _pool: &Address,
        _account: &Address,
    ) -> Result<U256, CollaboratorError> {
        Ok(to_wei(*self.pending_rewards.lock().unwrap(), 18)?)
    }

    /// 1000 WETH against 2,000,000 USDC, 1000 LP tokens minted.
    async fn pair_reserves(
        &self,
        _chain: Chain,
        _pair: &Address,
    ) -> Result<PairReserves, CollaboratorError> {
        Ok(PairReserves {
            token0: WETH,
            token1: USDC,
            reserve0: to_wei(Decimal::from(1_000), 18)?,
            reserve1: to_wei(Decimal::from(2_000_000), 6)?,
            total_supply: to_wei(Decimal::from(1_000), 18)?,
        })
    }

    async fn clm_preview_deposit(
        &self,
        _chain: Chain,
        _vault: &Address,
        amount0: U256,
        amount1: U256,
    ) -> Result<ClmDepositPreview, CollaboratorError> {
        Ok(self
            .clm_deposit
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(ClmDepositPreview { shares: amount0, used0: amount0, used1: amount1 }))
    }

    async fn clm_preview_withdraw(
        &self,
        _chain: Chain,
        _vault: &Address,
        shares: U256,
    ) -> Result<ClmWithdrawPreview, CollaboratorError> {
        Ok(self
            .clm_withdraw
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(ClmWithdrawPreview { amount0: shares, amount1: U256::ZERO }))
    }

    async fn staked_balance(
        &self,
        _chain: Chain,
        _pool: &Address,
        _account: &Address,
    ) -> Result<U256, CollaboratorError> {
        Ok(to_wei(*self.staked.lock().unwrap(), 18)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Success,
    Revert,
    Reject,
}

/// Records sent calls and answers them with scripted outcomes, success by default.
pub struct FakeWallet {
    account: Option<Address>,
    outcomes: Mutex<VecDeque<TxOutcome>>,
    sent: Mutex<Vec<CallData>>,
    reverted: Mutex<HashSet<TxHash>>,
}

impl FakeWallet {
    pub fn connected() -> Self {
        Self::with_account(Some(ACCOUNT))
    }

    pub fn disconnected() -> Self {
        Self::with_account(None)
    }

    fn with_account(account: Option<Address>) -> Self {
        Self {
            account,
            outcomes: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            reverted: Mutex::new(HashSet::new()),
        }
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = TxOutcome>) {
        self.outcomes
            .lock()
            .unwrap()
            .extend(outcomes);
    }

    pub fn sent(&self) -> Vec<CallData> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl WalletTransport for FakeWallet {
    fn connected_account(&self) -> Option<Address> {
        self.account
    }

    async fn send_transaction(&self, call: CallData) -> Result<TxHash, WalletError> {
        if self.account.is_none() {
            return Err(WalletError::NotConnected);
        }
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TxOutcome::Success);
        if outcome == TxOutcome::Reject {
            return Err(WalletError::Rejected("user denied transaction signature".to_string()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(call);
        let tx_hash = B256::left_padding_from(&(sent.len() as u64).to_be_bytes());
        if outcome == TxOutcome::Revert {
            self.reverted
                .lock()
                .unwrap()
                .insert(tx_hash);
        }
        Ok(tx_hash)
    }

    async fn wait_for_receipt(
        &self,
        _chain: Chain,
        tx_hash: TxHash,
    ) -> Result<TransactionReceipt, WalletError> {
        let status = if self.reverted.lock().unwrap().contains(&tx_hash) {
            ReceiptStatus::Reverted
        } else {
            ReceiptStatus::Success
        };
        Ok(TransactionReceipt { tx_hash, status, block_number: 1, logs: Vec::new() })
    }
}

/// Prices every token at 1 unless told otherwise.
#[derive(Default)]
pub struct FakePriceOracle {
    prices: Mutex<HashMap<Token, Decimal>>,
    unpriced: Mutex<HashSet<Token>>,
}

impl FakePriceOracle {
    pub fn set_price(&self, token: &Token, price: Decimal) {
        self.prices
            .lock()
            .unwrap()
            .insert(token.clone(), price);
    }

    pub fn remove_price(&self, token: &Token) {
        self.unpriced
            .lock()
            .unwrap()
            .insert(token.clone());
    }
}

#[async_trait]
impl PriceOracle for FakePriceOracle {
    async fn price_of(&self, token: &Token) -> Result<Decimal, CollaboratorError> {
        if self.unpriced.lock().unwrap().contains(token) {
            return Err(CollaboratorError::NotFound(format!("price of {token}")));
        }
        Ok(self
            .prices
            .lock()
            .unwrap()
            .get(token)
            .copied()
            .unwrap_or(Decimal::ONE))
    }
}

/// Records every fetch; balances are zero unless set.
#[derive(Default)]
pub struct FakeBalanceCache {
    balances: Mutex<HashMap<Token, Decimal>>,
    fetched: Mutex<Vec<(Chain, Vec<Token>, Address)>>,
    reserves_fetched: Mutex<Vec<(Chain, Address)>>,
}

impl FakeBalanceCache {
    pub fn fetched(&self) -> Vec<(Chain, Vec<Token>, Address)> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn reserves_fetched(&self) -> Vec<(Chain, Address)> {
        self.reserves_fetched
            .lock()
            .unwrap()
            .clone()
    }
}

#[async_trait]
impl BalanceCache for FakeBalanceCache {
    async fn fetch_balances(
        &self,
        chain: Chain,
        tokens: &[Token],
        wallet: &Address,
    ) -> Result<(), CollaboratorError> {
        self.fetched
            .lock()
            .unwrap()
            .push((chain, tokens.to_vec(), *wallet));
        Ok(())
    }

    async fn balance_of(
        &self,
        _chain: Chain,
        token: &Token,
        _wallet: &Address,
    ) -> Result<Decimal, CollaboratorError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(token)
            .copied()
            .unwrap_or_default())
    }

    async fn fetch_vault_reserves(
        &self,
        chain: Chain,
        vault: &Address,
    ) -> Result<(), CollaboratorError> {
        self.reserves_fetched
            .lock()
            .unwrap()
            .push((chain, *vault));
        Ok(())
    }
}

/// Records every fetch; allowances are zero unless set.
#[derive(Default)]
pub struct FakeAllowanceCache {
    allowances: Mutex<HashMap<(Token, Address), Decimal>>,
    fetched: Mutex<Vec<(Chain, Address, Vec<Token>)>>,
}

impl FakeAllowanceCache {
    pub fn set_allowance(&self, token: &Token, spender: Address, amount: Decimal) {
        self.allowances
            .lock()
            .unwrap()
            .insert((token.clone(), spender), amount);
    }

    pub fn fetched(&self) -> Vec<(Chain, Address, Vec<Token>)> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl AllowanceCache for FakeAllowanceCache {
    async fn fetch_allowances(
        &self,
        chain: Chain,
        spender: &Address,
        tokens: &[Token],
        _wallet: &Address,
    ) -> Result<(), CollaboratorError> {
        self.fetched
            .lock()
            .unwrap()
            .push((chain, *spender, tokens.to_vec()));
        Ok(())
    }

    async fn allowance_of(
        &self,
        _chain: Chain,
        token: &Token,
        spender: &Address,
        _wallet: &Address,
    ) -> Result<Decimal, CollaboratorError> {
        Ok(self
            .allowances
            .lock()
            .unwrap()
            .get(&(token.clone(), *spender))
            .copied()
            .unwrap_or_default())
    }
}

/// Swaps at a per aggregator rate, 1 by default.
#[derive(Default)]
pub struct FakeAggregatorApi {
    rates: Mutex<HashMap<String, Decimal>>,
    failing: Mutex<HashSet<String>>,
    built: AtomicUsize,
}

impl FakeAggregatorApi {
    pub fn set_rate(&self, aggregator_id: &str, rate: Decimal) {
        self.rates
            .lock()
            .unwrap()
            .insert(aggregator_id.to_string(), rate);
    }

    pub fn fail(&self, aggregator_id: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(aggregator_id.to_string());
    }

    pub fn built_swaps(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    fn swapped(
        &self,
        aggregator: &SwapAggregatorConfig,
        from: &TokenAmount,
        to: &Token,
    ) -> Result<TokenAmount, CollaboratorError> {
        if self.failing.lock().unwrap().contains(&aggregator.id) {
            return Err(CollaboratorError::Transport(format!("{} unavailable", aggregator.id)));
        }
        let rate = self
            .rates
            .lock()
            .unwrap()
            .get(&aggregator.id)
            .copied()
            .unwrap_or(Decimal::ONE);
        Ok(TokenAmount::new(to.clone(), from.amount * rate))
    }
}

#[async_trait]
impl SwapAggregatorApi for FakeAggregatorApi {
    async fn quote(
        &self,
        aggregator: &SwapAggregatorConfig,
        from: &TokenAmount,
        to: &Token,
    ) -> Result<SwapQuote, CollaboratorError> {
        let out = self.swapped(aggregator, from, to)?;
        Ok(SwapQuote { aggregator_id: aggregator.id.clone(), from: from.clone(), to: out })
    }

    async fn build_swap(
        &self,
        aggregator: &SwapAggregatorConfig,
        from: &TokenAmount,
        to: &Token,
        slippage: Decimal,
        _from_address: &Address,
    ) -> Result<SwapTransaction, CollaboratorError> {
        let out = self.swapped(aggregator, from, to)?;
        self.built.fetch_add(1, Ordering::SeqCst);
        let value = if from.token.is_native() { from.to_wei()? } else { U256::ZERO };
        Ok(SwapTransaction {
            to: aggregator.router,
            data: Bytes::from(vec![0x12, 0x34, 0x56, 0x78]),
            value,
            min_out: out.amount * (Decimal::ONE - slippage),
        })
    }
}

/// A full set of fakes on top of the fixture registry.
pub struct TestEnv {
    pub reader: Arc<FakeChainReader>,
    pub oracle: Arc<FakePriceOracle>,
    pub balances: Arc<FakeBalanceCache>,
    pub allowances: Arc<FakeAllowanceCache>,
    pub wallet: Arc<FakeWallet>,
    pub aggregators: Arc<FakeAggregatorApi>,
    pub registry: Arc<RegistryStore>,
    pub settings: SettingsHandle,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_wallet(FakeWallet::connected()).await
    }

    pub async fn with_wallet(wallet: FakeWallet) -> Self {
        Self {
            reader: Arc::new(FakeChainReader::default()),
            oracle: Arc::new(FakePriceOracle::default()),
            balances: Arc::new(FakeBalanceCache::default()),
            allowances: Arc::new(FakeAllowanceCache::default()),
            wallet: Arc::new(wallet),
            aggregators: Arc::new(FakeAggregatorApi::default()),
            registry: fixture_registry().await,
            settings: SettingsHandle::new(fixture_source().settings()).expect("valid settings"),
        }
    }

    /// Context of a step dispatched with the current settings.
    pub async fn execution_context(&self) -> ExecutionContext {
        let settings = self.settings.get().await;
        ExecutionContext {
            wallet: ACCOUNT,
            slippage: settings.slippage_tolerance,
            drift_share: settings.reconfirm_drift_share,
        }
    }

    pub async fn quote_engine(&self, providers: ProviderRegistry) -> QuoteEngine {
        QuoteEngine::new(
            self.registry.clone(),
            Arc::new(providers),
            self.oracle.clone(),
            self.balances.clone(),
            self.allowances.clone(),
            self.wallet.clone(),
        )
    }

    pub async fn default_quote_engine(&self) -> QuoteEngine {
        let ctx = provider_context(self).await;
        self.quote_engine(ProviderRegistry::with_defaults(&ctx))
            .await
    }

    /// A facade over the fixture source and this environment's fakes.
    pub fn transact(&self) -> Transact {
        let deps = TransactDeps {
            oracle: self.oracle.clone(),
            balances: self.balances.clone(),
            allowances: self.allowances.clone(),
            wallet: self.wallet.clone(),
            reader: self.reader.clone(),
            aggregator_api: self.aggregators.clone(),
        };
        Transact::new(Arc::new(fixture_source()), self.settings.clone(), deps)
    }

    pub fn standard_vault_address(&self) -> Address {
        STANDARD_VAULT
    }

    pub fn base_vault_address(&self) -> Address {
        BASE_VAULT
    }

    pub fn amm_zap(&self) -> Address {
        AMM_ZAP
    }

    pub fn zap_router(&self) -> Address {
        ZAP_ROUTER
    }

    pub fn zap_token_manager(&self) -> Address {
        ZAP_TOKEN_MANAGER
    }

    pub fn migrator_pool(&self) -> Address {
        MIGRATOR_POOL
    }
}

pub async fn provider_context(env: &TestEnv) -> ProviderContext {
    let drivers = VaultDriverRegistry::new(
        env.registry.clone(),
        env.reader.clone(),
        env.wallet.clone(),
    );
    ProviderContext {
        registry: env.registry.clone(),
        drivers: Arc::new(drivers),
        reader: env.reader.clone(),
        wallet: env.wallet.clone(),
        aggregator_api: env.aggregators.clone(),
        settings: env.settings.clone(),
    }
}
