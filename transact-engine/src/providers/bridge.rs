//! Cross chain deposits: a single source chain transaction bridges the deposit token and a
//! relayer deposits it into the vault on arrival.
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};
use transact_common::models::{
    registry::{BridgeConfig, BridgeRoute},
    token::{to_wei, Token, TokenAmount},
    transaction::CallData,
    Address, Chain, U256,
};

use super::{ensure_owned, OptionCache, ProviderContext, TransactProvider};
use crate::{
    contracts::encode_bridge_and_deposit,
    drivers::{resolve_token, single_input},
    errors::{TransactError, TransactResult},
    models::{allowances_for, QuoteFee, QuoteLeg, TransactMode, TransactOption, TransactQuote},
    steps::{
        ExecutionContext, PreparedTransaction, RefreshInstructions, Step, StepAction, StepKind,
    },
};

pub const BRIDGE_PROVIDER_ID: &str = "bridge";

#[derive(Debug, Clone)]
struct BridgeDetail {
    bridge: BridgeConfig,
    route: BridgeRoute,
    source_token: Token,
    /// Native token of the source chain, paying the messaging fee.
    source_native: Token,
    vault_token: Token,
    vault: Address,
}

pub struct BridgeProvider {
    ctx: ProviderContext,
    options: OptionCache<BridgeDetail>,
}

impl BridgeProvider {
    pub fn new(ctx: ProviderContext) -> Self {
        Self { ctx, options: OptionCache::default() }
    }

    async fn build_options(
        &self,
        vault_id: &str,
    ) -> TransactResult<Option<Vec<(TransactOption, BridgeDetail)>>> {
        let vault = self.ctx.vault(vault_id).await?;
        let driver = self.ctx.driver(vault_id).await?;
        let [vault_token] = driver.deposit_tokens() else {
            return Ok(None);
        };
        let share_token = driver.share_token().clone();

        let mut options = Vec::new();
        for bridge in self.ctx.registry.bridges().await? {
            let routes = bridge
                .routes
                .iter()
                .filter(|r| {
                    r.to == vault.chain &&
                        r.from != vault.chain &&
                        r.token_out == vault_token.address
                });
            for route in routes {
                let Ok(book) = self
                    .ctx
                    .registry
                    .address_book(route.from)
                    .await
                else {
                    debug!(bridge = %bridge.id, chain = %route.from, "No address book for source");
                    continue;
                };
                let source_token = resolve_token(&book, &route.token_in)?;
                let option = TransactOption::new(
                    BRIDGE_PROVIDER_ID,
                    vault_id,
                    vault.chain,
                    TransactMode::Deposit,
                    vec![source_token.clone()],
                    vec![share_token.clone()],
                );
                options.push((
                    option,
                    BridgeDetail {
                        bridge: bridge.clone(),
                        route: route.clone(),
                        source_token,
                        source_native: book.native_token(),
                        vault_token: vault_token.clone(),
                        vault: vault.address,
                    },
                ));
            }
        }
        Ok((!options.is_empty()).then_some(options))
    }
}

#[async_trait]
impl TransactProvider for BridgeProvider {
    fn id(&self) -> &str {
        BRIDGE_PROVIDER_ID
    }

    #[instrument(skip(self))]
    async fn fetch_options(
        &self,
        vault_id: &str,
        mode: TransactMode,
    ) -> TransactResult<Option<Vec<TransactOption>>> {
        if mode == TransactMode::Withdraw {
            return Ok(None);
        }
        if let Some(cached) = self.options.options(vault_id, mode).await {
            return Ok(cached);
        }
        let entry = self.build_options(vault_id).await?;
        Ok(self
            .options
            .insert(vault_id, mode, entry)
            .await)
    }

    #[instrument(skip_all, fields(option_id = %option.id))]
    async fn fetch_quote(
        &self,
        option: &TransactOption,
        inputs: &[TokenAmount],
    ) -> TransactResult<TransactQuote> {
        ensure_owned(option, BRIDGE_PROVIDER_ID)?;
        let detail = self.options.detail(option).await?;
        let input = single_input(inputs, &detail.source_token)?;
        let fee = TokenAmount::new(input.token.clone(), input.amount * detail.bridge.fee);
        let received = TokenAmount::new(detail.vault_token.clone(), input.amount - fee.amount);
        let driver = self.ctx.driver(&option.vault_id).await?;
        let estimate = driver
            .estimate_deposit(std::slice::from_ref(&received))
            .await?;

        Ok(TransactQuote::new(option, inputs.to_vec(), vec![estimate.shares.clone()])
            .with_allowances(allowances_for(inputs, detail.route.contract))
            .with_fee(QuoteFee { rate: detail.bridge.fee, amount: fee })
            .with_legs(vec![
                QuoteLeg::Bridge {
                    bridge: detail.bridge.name.clone(),
                    from: input.clone(),
                    to: received.clone(),
                },
                QuoteLeg::Deposit { inputs: vec![received], shares: estimate.shares },
            ]))
    }

    async fn fetch_step(&self, quote: &TransactQuote) -> TransactResult<Step> {
        ensure_owned(&quote.option, BRIDGE_PROVIDER_ID)?;
        let detail = self.options.detail(&quote.option).await?;
        let input = single_input(&quote.inputs, &detail.source_token)?.clone();
        let shares = quote
            .outputs
            .first()
            .cloned()
            .ok_or_else(|| TransactError::InvalidInput("quote has no output".to_string()))?;
        let message = format!(
            "Bridge {input} from {} to {} and deposit",
            detail.route.from, detail.route.to
        );
        let refresh = RefreshInstructions::for_quote(quote, detail.vault);
        Ok(Step::new(
            StepKind::Bridge,
            message,
            detail.route.from,
            Arc::new(BridgeAction { detail, input, shares, refresh }),
        ))
    }
}

struct BridgeAction {
    detail: BridgeDetail,
    input: TokenAmount,
    shares: TokenAmount,
    refresh: RefreshInstructions,
}

impl BridgeAction {
    fn destination(&self) -> Chain {
        self.detail.route.to
    }
}

#[async_trait]
impl StepAction for BridgeAction {
    async fn prepare(&self, ctx: &ExecutionContext) -> TransactResult<PreparedTransaction> {
        let detail = &self.detail;
        let amount = self.input.to_wei()?;
        let min_shares = to_wei(ctx.min_amount(self.shares.amount), self.shares.token.decimals)?;
        let native_fee = to_wei(detail.bridge.native_fee, detail.source_native.decimals)?;
        let value = if self.input.token.is_native() { native_fee + amount } else { native_fee };
        let data = encode_bridge_and_deposit(
            detail.source_token.address,
            amount,
            self.destination().chain_id(),
            detail.vault,
            ctx.wallet,
            min_shares,
        );
        let call = CallData::new(detail.route.from, detail.route.contract, data).with_value(value);
        Ok(PreparedTransaction { call, refresh: Some(self.refresh.clone()) })
    }
}
