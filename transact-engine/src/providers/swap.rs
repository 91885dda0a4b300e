//! Zaps routed through off-chain swap aggregators and executed by the zap router.
//!
//! Any token of the vault's chain can enter a single token vault: the router swaps it into the
//! deposit token through the best quoting aggregator and then calls the vault. Withdrawals run
//! the same route backwards.
use std::sync::Arc;

use async_trait::async_trait;
use futures03::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};
use transact_common::{
    models::{
        registry::SwapAggregatorConfig,
        token::{to_wei, Token, TokenAllowance, TokenAmount},
        transaction::CallData,
        Address, Bytes, Chain, U256,
    },
    traits::{SwapAggregatorApi, SwapQuote},
};

use super::{ensure_owned, OptionCache, ProviderContext, TransactProvider};
use crate::{
    contracts::{encode_execute_order, IZapRouter, NO_INJECTION},
    drivers::{single_input, withdrawn_shares, ZapCall},
    errors::{TransactError, TransactResult},
    models::{
        allowances_for, QuoteFee, QuoteLeg, TransactMode, TransactOption, TransactQuote,
    },
    steps::{
        ExecutionContext, PreparedTransaction, RefreshInstructions, Step, StepAction, StepKind,
    },
};

pub const SWAP_PROVIDER_ID: &str = "swap";

#[derive(Debug, Clone)]
struct SwapDetail {
    router: Address,
    token_manager: Address,
    vault: Address,
    deposit_token: Token,
    share_token: Token,
    /// The token swapped from on deposit, or into on withdraw.
    other: Token,
    zap_call: ZapCall,
    aggregators: Vec<SwapAggregatorConfig>,
}

impl SwapDetail {
    fn aggregator(&self, id: &str) -> TransactResult<&SwapAggregatorConfig> {
        self.aggregators
            .iter()
            .find(|a| a.id == id)
            .ok_or_else(|| TransactError::Config(format!("unknown swap aggregator {id}")))
    }
}

pub struct SwapAggregatorProvider {
    ctx: ProviderContext,
    options: OptionCache<SwapDetail>,
}

impl SwapAggregatorProvider {
    pub fn new(ctx: ProviderContext) -> Self {
        Self { ctx, options: OptionCache::default() }
    }

    async fn build_options(
        &self,
        vault_id: &str,
        mode: TransactMode,
    ) -> TransactResult<Option<Vec<(TransactOption, SwapDetail)>>> {
        let vault = self.ctx.vault(vault_id).await?;
        let book = self
            .ctx
            .registry
            .address_book(vault.chain)
            .await?;
        let (Some(router), Some(token_manager)) = (book.zap_router, book.zap_token_manager) else {
            return Ok(None);
        };
        let aggregators = self
            .ctx
            .registry
            .swap_aggregators(vault.chain)
            .await?;
        if aggregators.is_empty() {
            return Ok(None);
        }
        let driver = self.ctx.driver(vault_id).await?;
        let [deposit_token] = driver.deposit_tokens() else {
            return Ok(None);
        };
        let zap_call = match mode {
            TransactMode::Deposit => driver.zap_deposit_call(),
            TransactMode::Withdraw => driver.zap_withdraw_call(),
        };
        let Some(zap_call) = zap_call else {
            debug!(vault_id, %mode, "Vault cannot be called by the zap router");
            return Ok(None);
        };

        let share_token = driver.share_token().clone();
        let others = std::iter::once(book.native_token()).chain(
            book.tokens
                .iter()
                .filter_map(|entry| book.token(&entry.address)),
        );
        let options = others
            .filter(|token| token != deposit_token)
            .map(|other| {
                let (inputs, outputs) = match mode {
                    TransactMode::Deposit => (vec![other.clone()], vec![share_token.clone()]),
                    TransactMode::Withdraw => (vec![deposit_token.clone()], vec![other.clone()]),
                };
                let option = TransactOption::new(
                    SWAP_PROVIDER_ID,
                    vault_id,
                    vault.chain,
                    mode,
                    inputs,
                    outputs,
                );
                let detail = SwapDetail {
                    router,
                    token_manager,
                    vault: vault.address,
                    deposit_token: deposit_token.clone(),
                    share_token: share_token.clone(),
                    other,
                    zap_call: zap_call.clone(),
                    aggregators: aggregators.clone(),
                };
                (option, detail)
            })
            .collect();
        Ok(Some(options))
    }

    /// Asks every aggregator of the chain in parallel and keeps the largest output.
    async fn best_swap(
        &self,
        detail: &SwapDetail,
        from: &TokenAmount,
        to: &Token,
    ) -> TransactResult<SwapQuote> {
        let api = self.ctx.aggregator_api.clone();
        let quotes = join_all(
            detail
                .aggregators
                .iter()
                .map(|aggregator| api.quote(aggregator, from, to)),
        )
        .await;

        let mut best: Option<SwapQuote> = None;
        for (aggregator, quote) in detail
            .aggregators
            .iter()
            .zip(quotes)
        {
            match quote {
                Ok(quote) => {
                    if best
                        .as_ref()
                        .map_or(true, |b| quote.to.amount > b.to.amount)
                    {
                        best = Some(quote);
                    }
                }
                Err(err) => {
                    warn!(aggregator = %aggregator.id, ?err, "Swap aggregator failed to quote")
                }
            }
        }
        best.ok_or_else(|| {
            TransactError::NoQuoteForSelection(format!("no aggregator quoted {from} to {to}"))
        })
    }

    async fn fee_rate(&self, chain: Chain) -> TransactResult<Decimal> {
        Ok(self
            .ctx
            .registry
            .fees()
            .await?
            .zap_fee_for(chain))
    }

    async fn quote_deposit(
        &self,
        option: &TransactOption,
        inputs: &[TokenAmount],
        detail: &SwapDetail,
    ) -> TransactResult<TransactQuote> {
        let input = single_input(inputs, &detail.other)?;
        let rate = self.fee_rate(option.chain).await?;
        let fee = TokenAmount::new(input.token.clone(), input.amount * rate);
        let swap_in = TokenAmount::new(input.token.clone(), input.amount - fee.amount);
        let swap = self
            .best_swap(detail, &swap_in, &detail.deposit_token)
            .await?;
        let driver = self.ctx.driver(&option.vault_id).await?;
        let estimate = driver
            .estimate_deposit(std::slice::from_ref(&swap.to))
            .await?;

        Ok(TransactQuote::new(option, inputs.to_vec(), vec![estimate.shares.clone()])
            .with_allowances(allowances_for(inputs, detail.token_manager))
            .with_fee(QuoteFee { rate, amount: fee })
            .with_legs(vec![
                QuoteLeg::Swap { from: swap.from, to: swap.to.clone(), via: swap.aggregator_id },
                QuoteLeg::Deposit { inputs: vec![swap.to], shares: estimate.shares },
            ]))
    }

    async fn quote_withdraw(
        &self,
        option: &TransactOption,
        inputs: &[TokenAmount],
        detail: &SwapDetail,
    ) -> TransactResult<TransactQuote> {
        let input = single_input(inputs, &detail.deposit_token)?;
        let driver = self.ctx.driver(&option.vault_id).await?;
        let estimate = driver.estimate_withdraw(input).await?;
        let received = estimate
            .outputs
            .first()
            .cloned()
            .ok_or_else(|| TransactError::InvalidInput("withdraw returns nothing".to_string()))?;
        let rate = self.fee_rate(option.chain).await?;
        let fee = TokenAmount::new(received.token.clone(), received.amount * rate);
        let swap_in = TokenAmount::new(received.token.clone(), received.amount - fee.amount);
        let swap = self
            .best_swap(detail, &swap_in, &detail.other)
            .await?;
        let allowance = TokenAllowance::new(
            estimate.shares.token.clone(),
            estimate.shares.amount,
            detail.token_manager,
        );

        Ok(TransactQuote::new(option, inputs.to_vec(), vec![swap.to.clone()])
            .with_allowances(vec![allowance])
            .with_fee(QuoteFee { rate, amount: fee })
            .with_legs(vec![
                QuoteLeg::Withdraw { shares: estimate.shares, outputs: estimate.outputs },
                QuoteLeg::Swap { from: swap.from, to: swap.to, via: swap.aggregator_id },
            ]))
    }
}

#[async_trait]
impl TransactProvider for SwapAggregatorProvider {
    fn id(&self) -> &str {
        SWAP_PROVIDER_ID
    }

    #[instrument(skip(self))]
    async fn fetch_options(
        &self,
        vault_id: &str,
        mode: TransactMode,
    ) -> TransactResult<Option<Vec<TransactOption>>> {
        if let Some(cached) = self.options.options(vault_id, mode).await {
            return Ok(cached);
        }
        let entry = self.build_options(vault_id, mode).await?;
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
        ensure_owned(option, SWAP_PROVIDER_ID)?;
        let detail = self.options.detail(option).await?;
        match option.mode {
            TransactMode::Deposit => {
                self.quote_deposit(option, inputs, &detail)
                    .await
            }
            TransactMode::Withdraw => {
                self.quote_withdraw(option, inputs, &detail)
                    .await
            }
        }
    }

    async fn fetch_step(&self, quote: &TransactQuote) -> TransactResult<Step> {
        ensure_owned(&quote.option, SWAP_PROVIDER_ID)?;
        let detail = self.options.detail(&quote.option).await?;
        let (swap_from, via) = quote
            .legs
            .iter()
            .find_map(|leg| match leg {
                QuoteLeg::Swap { from, via, .. } => Some((from.clone(), via.clone())),
                _ => None,
            })
            .ok_or_else(|| {
                TransactError::InvalidInput(format!("quote {} has no swap leg", quote.id))
            })?;
        let aggregator = detail.aggregator(&via)?.clone();
        let input = quote
            .inputs
            .first()
            .cloned()
            .ok_or_else(|| TransactError::InvalidInput("quote has no input".to_string()))?;
        let output = quote
            .outputs
            .first()
            .cloned()
            .ok_or_else(|| TransactError::InvalidInput("quote has no output".to_string()))?;

        let (kind, message, order_input) = match quote.option.mode {
            TransactMode::Deposit => {
                (StepKind::ZapIn, format!("Swap {input} and deposit"), input.clone())
            }
            TransactMode::Withdraw => (
                StepKind::ZapOut,
                format!("Withdraw as {}", output.token.symbol),
                withdrawn_shares(quote)?.clone(),
            ),
        };

        let refresh = RefreshInstructions::for_quote(quote, detail.vault);
        Ok(Step::new(
            kind,
            message,
            quote.option.chain,
            Arc::new(ZapRouterAction {
                api: self.ctx.aggregator_api.clone(),
                aggregator,
                mode: quote.option.mode,
                detail,
                order_input,
                swap_from,
                output,
                refresh,
            }),
        ))
    }
}

/// Builds the aggregator swap with the live slippage and wraps it, together with the vault call,
/// in a zap router order.
struct ZapRouterAction {
    api: Arc<dyn SwapAggregatorApi>,
    aggregator: SwapAggregatorConfig,
    mode: TransactMode,
    detail: SwapDetail,
    /// What the router pulls from the user.
    order_input: TokenAmount,
    swap_from: TokenAmount,
    /// What the user expects back.
    output: TokenAmount,
    refresh: RefreshInstructions,
}

impl ZapRouterAction {
    fn route_step(
        target: Address,
        value: U256,
        data: Bytes,
        token: Address,
        index: i32,
    ) -> IZapRouter::Step {
        let tokens = vec![IZapRouter::StepToken { token, index }];
        IZapRouter::Step { target, value, data, tokens }
    }
}

#[async_trait]
impl StepAction for ZapRouterAction {
    async fn prepare(&self, ctx: &ExecutionContext) -> TransactResult<PreparedTransaction> {
        let detail = &self.detail;
        let swap_to = match self.mode {
            TransactMode::Deposit => &detail.deposit_token,
            TransactMode::Withdraw => &detail.other,
        };
        let swap = self
            .api
            .build_swap(&self.aggregator, &self.swap_from, swap_to, ctx.slippage, &detail.router)
            .await?;
        debug!(aggregator = %self.aggregator.id, min_out = %swap.min_out, "Built aggregator swap");

        let swap_step = Self::route_step(
            swap.to,
            swap.value,
            swap.data,
            self.swap_from.token.address,
            NO_INJECTION,
        );
        let vault_step = Self::route_step(
            detail.zap_call.target,
            U256::ZERO,
            detail.zap_call.data.clone(),
            match self.mode {
                TransactMode::Deposit => detail.deposit_token.address,
                TransactMode::Withdraw => detail.share_token.address,
            },
            detail.zap_call.inject_index,
        );
        let (route, min_output) = match self.mode {
            TransactMode::Deposit => {
                (vec![swap_step, vault_step], ctx.min_amount(self.output.amount))
            }
            TransactMode::Withdraw => (vec![vault_step, swap_step], swap.min_out),
        };

        let order = IZapRouter::Order {
            inputs: vec![IZapRouter::Input {
                token: self.order_input.token.address,
                amount: self.order_input.to_wei()?,
            }],
            outputs: vec![
                IZapRouter::Output {
                    token: self.output.token.address,
                    minOutputAmount: to_wei(min_output, self.output.token.decimals)?,
                },
                // dust of the deposit token goes back to the user
                IZapRouter::Output {
                    token: detail.deposit_token.address,
                    minOutputAmount: U256::ZERO,
                },
            ],
            relay: IZapRouter::Relay {
                target: Address::ZERO,
                value: U256::ZERO,
                data: Bytes::new(),
            },
            user: ctx.wallet,
            recipient: ctx.wallet,
        };

        let value = if self.order_input.token.is_native() {
            self.order_input.to_wei()?
        } else {
            U256::ZERO
        };
        let call = CallData::new(
            detail.deposit_token.chain,
            detail.router,
            encode_execute_order(order, route),
        )
        .with_value(value);
        Ok(PreparedTransaction { call, refresh: Some(self.refresh.clone()) })
    }
}
