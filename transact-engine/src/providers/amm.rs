//! Single sided entry into and exit out of UniswapV2 style LP vaults.
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::{Decimal, MathematicalOps};
use tracing::{debug, instrument};
use transact_common::models::{
    registry::{AmmConfig, VaultKind},
    token::{amount_from_wei, to_wei, Token, TokenAllowance, TokenAmount},
    transaction::CallData,
    Address, Chain,
};

use super::{ensure_owned, OptionCache, ProviderContext, TransactProvider};
use crate::{
    contracts::{encode_zap_in, encode_zap_in_native, encode_zap_out, encode_zap_out_and_swap},
    drivers::{checked_div, resolve_token, single_input, withdrawn_shares},
    errors::{TransactError, TransactResult},
    models::{allowances_for, QuoteLeg, TransactMode, TransactOption, TransactQuote},
    steps::{
        ExecutionContext, PreparedTransaction, RefreshInstructions, Step, StepAction, StepKind,
    },
};

pub const AMM_PROVIDER_ID: &str = "amm";

fn overflow(what: &str) -> TransactError {
    TransactError::Encoding(format!("overflow computing {what}"))
}

/// Portion of `amount` to swap so that the remainder and the swap output are in the pool ratio
/// after the swap.
///
/// Solves `s^2 (1-f) + s r (2-f) - a r = 0` for a constant product pool with fee `f`.
pub fn optimal_swap_amount(
    amount: Decimal,
    reserve_in: Decimal,
    fee: Decimal,
) -> TransactResult<Decimal> {
    let two_minus_fee = Decimal::TWO - fee;
    let one_minus_fee = Decimal::ONE - fee;
    let b = two_minus_fee
        .checked_mul(reserve_in)
        .ok_or_else(|| overflow("swap amount"))?;
    let discriminant = b
        .checked_mul(b)
        .and_then(|b2| {
            Decimal::from(4)
                .checked_mul(one_minus_fee)?
                .checked_mul(amount)?
                .checked_mul(reserve_in)
                .and_then(|four_ac| b2.checked_add(four_ac))
        })
        .ok_or_else(|| overflow("swap amount"))?;
    let root = discriminant
        .sqrt()
        .ok_or_else(|| overflow("swap amount"))?;
    checked_div(root - b, Decimal::TWO * one_minus_fee)
}

/// Constant product output for swapping `amount` in.
pub fn amount_out(
    amount: Decimal,
    reserve_in: Decimal,
    reserve_out: Decimal,
    fee: Decimal,
) -> TransactResult<Decimal> {
    let amount_with_fee = amount * (Decimal::ONE - fee);
    let numerator = amount_with_fee
        .checked_mul(reserve_out)
        .ok_or_else(|| overflow("amount out"))?;
    checked_div(numerator, reserve_in + amount_with_fee)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AmmRoute {
    /// Swap part of `input` into the other pair token and add liquidity. `swap_in` is the pair
    /// token `input` is worth, the wrapped token for native inputs.
    ZapIn { input: Token, swap_in: Token },
    /// Remove liquidity and keep both tokens.
    BreakLp,
    /// Remove liquidity and swap everything into `desired`.
    ZapOutAndSwap { desired: Token },
}

#[derive(Debug, Clone)]
struct AmmDetail {
    amm: AmmConfig,
    vault: Address,
    lp: Token,
    token0: Token,
    token1: Token,
    route: AmmRoute,
}

/// Pool state in whole token units.
struct Pool {
    reserve0: Decimal,
    reserve1: Decimal,
    supply: Decimal,
}

impl AmmDetail {
    fn reserves_for(&self, pool: &Pool, token_in: &Token) -> (Decimal, Decimal) {
        if token_in == &self.token0 {
            (pool.reserve0, pool.reserve1)
        } else {
            (pool.reserve1, pool.reserve0)
        }
    }

    fn other(&self, token: &Token) -> &Token {
        if token == &self.token0 {
            &self.token1
        } else {
            &self.token0
        }
    }
}

pub struct AmmZapProvider {
    ctx: ProviderContext,
    options: OptionCache<AmmDetail>,
}

impl AmmZapProvider {
    pub fn new(ctx: ProviderContext) -> Self {
        Self { ctx, options: OptionCache::default() }
    }

    async fn pool(&self, chain: Chain, detail: &AmmDetail) -> TransactResult<Pool> {
        let reserves = self
            .ctx
            .reader
            .pair_reserves(chain, &detail.lp.address)
            .await?;
        Ok(Pool {
            reserve0: amount_from_wei(reserves.reserve0, detail.token0.decimals)?,
            reserve1: amount_from_wei(reserves.reserve1, detail.token1.decimals)?,
            supply: amount_from_wei(reserves.total_supply, detail.lp.decimals)?,
        })
    }

    /// Builds the option set of an LP vault, or `None` if the vault is not an LP vault of a
    /// known AMM.
    async fn build_options(
        &self,
        vault_id: &str,
        mode: TransactMode,
    ) -> TransactResult<Option<Vec<(TransactOption, AmmDetail)>>> {
        let vault = self.ctx.vault(vault_id).await?;
        let Some(amm_id) = vault.amm.as_ref() else {
            return Ok(None);
        };
        if vault.kind != VaultKind::Standard {
            return Ok(None);
        }
        let amm = self.ctx.registry.amm(amm_id).await?;
        let book = self
            .ctx
            .registry
            .address_book(vault.chain)
            .await?;
        let driver = self.ctx.driver(vault_id).await?;
        let lp = driver.deposit_tokens()[0].clone();
        let reserves = self
            .ctx
            .reader
            .pair_reserves(vault.chain, &lp.address)
            .await?;
        let (Ok(token0), Ok(token1)) =
            (resolve_token(&book, &reserves.token0), resolve_token(&book, &reserves.token1))
        else {
            debug!(vault_id, "Pair tokens missing from address book");
            return Ok(None);
        };

        let detail = |route| AmmDetail {
            amm: amm.clone(),
            vault: vault.address,
            lp: lp.clone(),
            token0: token0.clone(),
            token1: token1.clone(),
            route,
        };
        let share = driver.share_token().clone();
        let option = |inputs: Vec<Token>, outputs: Vec<Token>| {
            TransactOption::new(AMM_PROVIDER_ID, vault_id, vault.chain, mode, inputs, outputs)
        };

        let mut options = Vec::new();
        match mode {
            TransactMode::Deposit => {
                for token in [&token0, &token1] {
                    options.push((
                        option(vec![token.clone()], vec![share.clone()]),
                        detail(AmmRoute::ZapIn { input: token.clone(), swap_in: token.clone() }),
                    ));
                    if token.address == book.wrapped_native {
                        let native = book.native_token();
                        options.push((
                            option(vec![native.clone()], vec![share.clone()]),
                            detail(AmmRoute::ZapIn { input: native, swap_in: token.clone() }),
                        ));
                    }
                }
            }
            TransactMode::Withdraw => {
                options.push((
                    option(vec![lp.clone()], vec![token0.clone(), token1.clone()]),
                    detail(AmmRoute::BreakLp),
                ));
                for token in [&token0, &token1] {
                    options.push((
                        option(vec![lp.clone()], vec![token.clone()]),
                        detail(AmmRoute::ZapOutAndSwap { desired: token.clone() }),
                    ));
                }
            }
        }
        Ok(Some(options))
    }

    async fn quote_zap_in(
        &self,
        option: &TransactOption,
        inputs: &[TokenAmount],
        detail: &AmmDetail,
        input_token: &Token,
        swap_in: &Token,
    ) -> TransactResult<TransactQuote> {
        let input = single_input(inputs, input_token)?;
        let pool = self.pool(option.chain, detail).await?;
        let (reserve_in, reserve_out) = detail.reserves_for(&pool, swap_in);
        let fee = detail.amm.swap_fee;

        let swap_amount = optimal_swap_amount(input.amount, reserve_in, fee)?;
        let swap_out = amount_out(swap_amount, reserve_in, reserve_out, fee)?;
        let kept = input.amount - swap_amount;
        let lp_amount = checked_div(kept * pool.supply, reserve_in + swap_amount)?
            .min(checked_div(swap_out * pool.supply, reserve_out - swap_out)?);
        let spot = checked_div(reserve_out, reserve_in)?;
        let price_impact = Decimal::ONE - checked_div(checked_div(swap_out, swap_amount)?, spot)?;

        let lp = TokenAmount::new(detail.lp.clone(), lp_amount);
        let driver = self.ctx.driver(&option.vault_id).await?;
        let estimate = driver
            .estimate_deposit(std::slice::from_ref(&lp))
            .await?;
        let other = detail.other(swap_in).clone();
        let swapped = TokenAmount::new(input.token.clone(), swap_amount);
        let received = TokenAmount::new(other, swap_out);

        Ok(TransactQuote::new(option, inputs.to_vec(), vec![estimate.shares.clone()])
            .with_allowances(allowances_for(inputs, detail.amm.zap))
            .with_price_impact(price_impact)
            .with_legs(vec![
                QuoteLeg::Swap {
                    from: swapped,
                    to: received.clone(),
                    via: detail.amm.name.clone(),
                },
                QuoteLeg::BuildLp {
                    inputs: vec![TokenAmount::new(input.token.clone(), kept), received],
                    lp: lp.clone(),
                },
                QuoteLeg::Deposit { inputs: vec![lp], shares: estimate.shares },
            ]))
    }

    async fn quote_zap_out(
        &self,
        option: &TransactOption,
        inputs: &[TokenAmount],
        detail: &AmmDetail,
    ) -> TransactResult<TransactQuote> {
        let input = single_input(inputs, &detail.lp)?;
        let driver = self.ctx.driver(&option.vault_id).await?;
        let estimate = driver.estimate_withdraw(input).await?;
        let lp_amount = estimate
            .outputs
            .first()
            .map(|out| out.amount)
            .unwrap_or_default();
        let pool = self.pool(option.chain, detail).await?;
        let amount0 = checked_div(lp_amount * pool.reserve0, pool.supply)?;
        let amount1 = checked_div(lp_amount * pool.reserve1, pool.supply)?;
        let split = vec![
            TokenAmount::new(detail.token0.clone(), amount0),
            TokenAmount::new(detail.token1.clone(), amount1),
        ];
        let lp = TokenAmount::new(detail.lp.clone(), lp_amount);
        let allowance = vec![TokenAllowance::new(
            estimate.shares.token.clone(),
            estimate.shares.amount,
            detail.amm.zap,
        )];
        let mut legs = vec![
            QuoteLeg::Withdraw { shares: estimate.shares, outputs: vec![lp.clone()] },
            QuoteLeg::SplitLp { lp, outputs: split.clone() },
        ];

        let outputs = match &detail.route {
            AmmRoute::ZapOutAndSwap { desired } => {
                let (kept, sold) = if desired == &detail.token0 {
                    (&split[0], &split[1])
                } else {
                    (&split[1], &split[0])
                };
                let (reserve_sold, reserve_desired) = if desired == &detail.token0 {
                    (pool.reserve1 - amount1, pool.reserve0 - amount0)
                } else {
                    (pool.reserve0 - amount0, pool.reserve1 - amount1)
                };
                let swap_out =
                    amount_out(sold.amount, reserve_sold, reserve_desired, detail.amm.swap_fee)?;
                legs.push(QuoteLeg::Swap {
                    from: sold.clone(),
                    to: TokenAmount::new(desired.clone(), swap_out),
                    via: detail.amm.name.clone(),
                });
                vec![TokenAmount::new(desired.clone(), kept.amount + swap_out)]
            }
            _ => split,
        };

        Ok(TransactQuote::new(option, inputs.to_vec(), outputs)
            .with_allowances(allowance)
            .with_legs(legs))
    }
}

#[async_trait]
impl TransactProvider for AmmZapProvider {
    fn id(&self) -> &str {
        AMM_PROVIDER_ID
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
        ensure_owned(option, AMM_PROVIDER_ID)?;
        let detail = self.options.detail(option).await?;
        match &detail.route {
            AmmRoute::ZapIn { input, swap_in } => {
                self.quote_zap_in(option, inputs, &detail, input, swap_in)
                    .await
            }
            AmmRoute::BreakLp | AmmRoute::ZapOutAndSwap { .. } => {
                self.quote_zap_out(option, inputs, &detail)
                    .await
            }
        }
    }

    async fn fetch_step(&self, quote: &TransactQuote) -> TransactResult<Step> {
        ensure_owned(&quote.option, AMM_PROVIDER_ID)?;
        let detail = self.options.detail(&quote.option).await?;
        let refresh = RefreshInstructions::for_quote(quote, detail.vault);
        let chain = quote.option.chain;
        let swap_out = quote.legs.iter().find_map(|leg| match leg {
            QuoteLeg::Swap { to, .. } => Some(to.clone()),
            _ => None,
        });

        let (kind, message, action) = match &detail.route {
            AmmRoute::ZapIn { .. } => {
                let input = quote
                    .inputs
                    .first()
                    .cloned()
                    .ok_or_else(|| TransactError::InvalidInput("quote has no input".to_string()))?;
                let swap_out = swap_out.ok_or_else(|| {
                    TransactError::InvalidInput(format!("quote {} has no swap leg", quote.id))
                })?;
                (
                    StepKind::ZapIn,
                    format!("Zap {input} into {}", detail.lp.symbol),
                    ZapAction::In { input, swap_out },
                )
            }
            AmmRoute::BreakLp => {
                let shares = withdrawn_shares(quote)?.clone();
                (
                    StepKind::ZapOut,
                    format!("Withdraw and break {}", detail.lp.symbol),
                    ZapAction::Out { shares },
                )
            }
            AmmRoute::ZapOutAndSwap { desired } => {
                let shares = withdrawn_shares(quote)?.clone();
                let swap_out = swap_out.ok_or_else(|| {
                    TransactError::InvalidInput(format!("quote {} has no swap leg", quote.id))
                })?;
                (
                    StepKind::ZapOut,
                    format!("Withdraw {} as {}", detail.lp.symbol, desired.symbol),
                    ZapAction::OutAndSwap { shares, desired: desired.clone(), swap_out },
                )
            }
        };

        Ok(Step::new(
            kind,
            message,
            chain,
            Arc::new(AmmZapAction {
                chain,
                zap: detail.amm.zap,
                vault: detail.vault,
                action,
                refresh,
            }),
        ))
    }
}

enum ZapAction {
    In { input: TokenAmount, swap_out: TokenAmount },
    Out { shares: TokenAmount },
    OutAndSwap { shares: TokenAmount, desired: Token, swap_out: TokenAmount },
}

struct AmmZapAction {
    chain: Chain,
    zap: Address,
    vault: Address,
    action: ZapAction,
    refresh: RefreshInstructions,
}

#[async_trait]
impl StepAction for AmmZapAction {
    async fn prepare(&self, ctx: &ExecutionContext) -> TransactResult<PreparedTransaction> {
        let call = match &self.action {
            ZapAction::In { input, swap_out } => {
                let min_out = to_wei(ctx.min_amount(swap_out.amount), swap_out.token.decimals)?;
                let amount = input.to_wei()?;
                if input.token.is_native() {
                    CallData::new(self.chain, self.zap, encode_zap_in_native(self.vault, min_out))
                        .with_value(amount)
                } else {
                    CallData::new(
                        self.chain,
                        self.zap,
                        encode_zap_in(self.vault, min_out, input.token.address, amount),
                    )
                }
            }
            ZapAction::Out { shares } => {
                CallData::new(self.chain, self.zap, encode_zap_out(self.vault, shares.to_wei()?))
            }
            ZapAction::OutAndSwap { shares, desired, swap_out } => {
                let min_out = to_wei(ctx.min_amount(swap_out.amount), swap_out.token.decimals)?;
                CallData::new(
                    self.chain,
                    self.zap,
                    encode_zap_out_and_swap(self.vault, shares.to_wei()?, desired.address, min_out),
                )
            }
        };
        Ok(PreparedTransaction { call, refresh: Some(self.refresh.clone()) })
    }
}

#[cfg(test)]
mod test {
    use alloy_sol_types::SolCall;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use rust_decimal_macros::dec;
    use transact_common::models::U256;

    use super::*;
    use crate::{
        contracts::{selector, IUniV2Zap},
        test_fixtures::{provider_context, TestEnv, LP_VAULT_ID, STANDARD_VAULT_ID},
    };

    #[rstest]
    #[case::no_fee(dec!(100), dec!(1000), dec!(0))]
    #[case::uni_fee(dec!(100), dec!(1000), dec!(0.003))]
    #[case::large_input(dec!(5000), dec!(1000), dec!(0.003))]
    fn test_optimal_swap_balances_pool(
        #[case] amount: Decimal,
        #[case] reserve_in: Decimal,
        #[case] fee: Decimal,
    ) {
        let reserve_out = dec!(2000);
        let swap = optimal_swap_amount(amount, reserve_in, fee).unwrap();
        let out = amount_out(swap, reserve_in, reserve_out, fee).unwrap();

        // what is left of the input must match the post swap pool ratio
        let kept_ratio = (amount - swap) / out;
        let pool_ratio = (reserve_in + swap) / (reserve_out - out);
        assert!((kept_ratio - pool_ratio).abs() < dec!(0.000001), "{kept_ratio} vs {pool_ratio}");
        assert!(swap > Decimal::ZERO && swap < amount);
    }

    #[test]
    fn test_amount_out() {
        let out = amount_out(dec!(10), dec!(100), dec!(100), dec!(0)).unwrap();

        assert_eq!(out.round_dp(6), dec!(9.090909));
    }

    #[test_log::test(tokio::test)]
    async fn test_only_lp_vaults_are_eligible() {
        let env = TestEnv::new().await;
        let provider = AmmZapProvider::new(provider_context(&env).await);

        let plain = provider
            .fetch_options(STANDARD_VAULT_ID, TransactMode::Deposit)
            .await
            .unwrap();
        let lp = provider
            .fetch_options(LP_VAULT_ID, TransactMode::Deposit)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(plain, None);
        // token0, token1 and native through the wrapped token
        assert_eq!(lp.len(), 3);
        assert!(lp.iter().any(|o| o.inputs[0].is_native()));
    }

    #[test_log::test(tokio::test)]
    async fn test_zap_in_quote_and_step() {
        let env = TestEnv::new().await;
        let provider = AmmZapProvider::new(provider_context(&env).await);
        let options = provider
            .fetch_options(LP_VAULT_ID, TransactMode::Deposit)
            .await
            .unwrap()
            .unwrap();
        let option = options
            .iter()
            .find(|o| !o.inputs[0].is_native())
            .unwrap();
        let input = TokenAmount::new(option.inputs[0].clone(), dec!(10));

        let quote = provider
            .fetch_quote(option, &[input])
            .await
            .unwrap();
        let step = provider.fetch_step(&quote).await.unwrap();
        let prepared = step
            .action
            .prepare(&env.execution_context().await)
            .await
            .unwrap();

        assert_eq!(quote.outputs.len(), 1);
        assert!(quote.outputs[0].is_positive());
        assert!(quote.price_impact.unwrap() > Decimal::ZERO);
        assert_eq!(quote.legs.len(), 3);
        assert_eq!(quote.required_allowances[0].spender, env.amm_zap());
        assert_eq!(selector(&prepared.call.data), Some(IUniV2Zap::beefInCall::SELECTOR));
        assert_eq!(prepared.call.value, U256::ZERO);
    }

    #[test_log::test(tokio::test)]
    async fn test_native_zap_in_sends_value() {
        let env = TestEnv::new().await;
        let provider = AmmZapProvider::new(provider_context(&env).await);
        let options = provider
            .fetch_options(LP_VAULT_ID, TransactMode::Deposit)
            .await
            .unwrap()
            .unwrap();
        let option = options
            .iter()
            .find(|o| o.inputs[0].is_native())
            .unwrap();
        let input = TokenAmount::new(option.inputs[0].clone(), dec!(1));

        let quote = provider
            .fetch_quote(option, &[input])
            .await
            .unwrap();
        let step = provider.fetch_step(&quote).await.unwrap();
        let prepared = step
            .action
            .prepare(&env.execution_context().await)
            .await
            .unwrap();

        assert!(quote.required_allowances.is_empty());
        assert_eq!(selector(&prepared.call.data), Some(IUniV2Zap::beefInETHCall::SELECTOR));
        assert_eq!(prepared.call.value, U256::from(1_000_000_000_000_000_000u128));
    }

    #[test_log::test(tokio::test)]
    async fn test_withdraw_and_swap_into_one_token() {
        let env = TestEnv::new().await;
        let provider = AmmZapProvider::new(provider_context(&env).await);
        let options = provider
            .fetch_options(LP_VAULT_ID, TransactMode::Withdraw)
            .await
            .unwrap()
            .unwrap();
        let single = options
            .iter()
            .find(|o| o.wanted_outputs.len() == 1)
            .unwrap();
        let both = options
            .iter()
            .find(|o| o.wanted_outputs.len() == 2)
            .unwrap();
        let input = TokenAmount::new(single.inputs[0].clone(), dec!(1));

        let swapped = provider
            .fetch_quote(single, &[input.clone()])
            .await
            .unwrap();
        let split = provider
            .fetch_quote(both, &[input])
            .await
            .unwrap();
        let step = provider.fetch_step(&swapped).await.unwrap();
        let prepared = step
            .action
            .prepare(&env.execution_context().await)
            .await
            .unwrap();

        assert_eq!(swapped.outputs.len(), 1);
        assert_eq!(split.outputs.len(), 2);
        let kept = split
            .outputs
            .iter()
            .find(|o| o.token == swapped.outputs[0].token)
            .unwrap();
        assert!(swapped.outputs[0].amount > kept.amount);
        assert_eq!(selector(&prepared.call.data), Some(IUniV2Zap::beefOutAndSwapCall::SELECTOR));
    }
}
