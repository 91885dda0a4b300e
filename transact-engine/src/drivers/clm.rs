use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::instrument;
use transact_common::{
    models::{
        registry::{AddressBook, VaultConfig},
        token::{to_wei, Token, TokenAmount},
        transaction::CallData,
        Address, Chain, U256,
    },
    traits::ChainReader,
};

use super::{
    resolve_token, single_input, withdrawn_shares, DepositEstimate, VaultDriver,
    WithdrawEstimate, VAULT_PROVIDER_ID,
};
use crate::{
    contracts::{encode_clm_deposit, encode_clm_withdraw, encode_clm_withdraw_all},
    errors::{TransactError, TransactResult},
    models::{allowances_for, QuoteLeg, TransactMode, TransactOption, TransactQuote},
    steps::{
        ExecutionContext, PreparedTransaction, RefreshInstructions, Step, StepAction, StepKind,
    },
};

/// Dual-asset concentrated liquidity vault.
///
/// Deposits take both tokens; whatever the vault cannot use at the current range ratio is
/// returned to the user. Minimum shares and minimum withdrawn amounts are bounded with the
/// slippage configured when the step runs.
pub struct ClmVaultDriver {
    vault: VaultConfig,
    deposit_tokens: Vec<Token>,
    share_token: Token,
    reader: Arc<dyn ChainReader>,
}

impl ClmVaultDriver {
    pub fn new(
        vault: VaultConfig,
        book: &AddressBook,
        reader: Arc<dyn ChainReader>,
    ) -> TransactResult<Self> {
        if vault.deposit_tokens.len() != 2 {
            return Err(TransactError::Config(format!(
                "clm vault {} needs exactly two deposit tokens",
                vault.id
            )));
        }
        let deposit_tokens = vault
            .deposit_tokens
            .iter()
            .map(|address| resolve_token(book, address))
            .collect::<TransactResult<Vec<_>>>()?;
        let share_token =
            Token::new(vault.chain, vault.address, &vault.share_symbol(), vault.share_decimals);
        Ok(Self { vault, deposit_tokens, share_token, reader })
    }

    /// Validates a pair of deposit amounts, in vault token order.
    fn pair_inputs<'a>(
        &self,
        inputs: &'a [TokenAmount],
    ) -> TransactResult<(&'a TokenAmount, &'a TokenAmount)> {
        let [first, second] = inputs else {
            return Err(TransactError::InvalidInput(format!(
                "clm deposits take two inputs, got {}",
                inputs.len()
            )));
        };
        if first.token != self.deposit_tokens[0] || second.token != self.deposit_tokens[1] {
            return Err(TransactError::InvalidInput(format!(
                "inputs {} and {} do not match the vault tokens",
                first.token, second.token
            )));
        }
        if first.amount.is_sign_negative() || second.amount.is_sign_negative() {
            return Err(TransactError::InvalidInput("negative input amount".to_string()));
        }
        if !first.is_positive() && !second.is_positive() {
            return Err(TransactError::InvalidInput("both input amounts are zero".to_string()));
        }
        Ok((first, second))
    }
}

#[async_trait]
impl VaultDriver for ClmVaultDriver {
    fn vault(&self) -> &VaultConfig {
        &self.vault
    }

    fn deposit_tokens(&self) -> &[Token] {
        &self.deposit_tokens
    }

    fn share_token(&self) -> &Token {
        &self.share_token
    }

    async fn fetch_deposit_option(&self) -> TransactResult<TransactOption> {
        Ok(TransactOption::new(
            VAULT_PROVIDER_ID,
            &self.vault.id,
            self.vault.chain,
            TransactMode::Deposit,
            self.deposit_tokens.clone(),
            vec![self.share_token.clone()],
        ))
    }

    #[instrument(skip_all, fields(vault_id = %self.vault.id))]
    async fn fetch_deposit_quote(
        &self,
        option: &TransactOption,
        inputs: &[TokenAmount],
    ) -> TransactResult<TransactQuote> {
        let estimate = self.estimate_deposit(inputs).await?;
        let used: Vec<TokenAmount> = inputs
            .iter()
            .map(|input| {
                let returned = estimate
                    .returned
                    .iter()
                    .find(|r| r.token == input.token)
                    .map(|r| r.amount)
                    .unwrap_or_default();
                TokenAmount::new(input.token.clone(), input.amount - returned)
            })
            .collect();

        Ok(TransactQuote::new(option, inputs.to_vec(), vec![estimate.shares.clone()])
            .with_returned(estimate.returned)
            .with_allowances(allowances_for(inputs, self.vault.address))
            .with_legs(vec![QuoteLeg::Deposit { inputs: used, shares: estimate.shares }]))
    }

    async fn fetch_deposit_step(&self, quote: &TransactQuote) -> TransactResult<Step> {
        let (first, second) = self.pair_inputs(&quote.inputs)?;
        let shares = quote
            .output_of(&self.share_token)
            .ok_or_else(|| {
                TransactError::InvalidInput(format!("quote {} mints no shares", quote.id))
            })?;
        let action = ClmDepositAction {
            chain: self.vault.chain,
            vault: self.vault.address,
            amount0: first.to_wei()?,
            amount1: second.to_wei()?,
            shares: shares.clone(),
            refresh: RefreshInstructions::for_quote(quote, self.vault.address),
        };
        Ok(Step::new(
            StepKind::Deposit,
            format!("Deposit {first} and {second}"),
            self.vault.chain,
            Arc::new(action),
        ))
    }

    async fn fetch_withdraw_option(&self) -> TransactResult<TransactOption> {
        Ok(TransactOption::new(
            VAULT_PROVIDER_ID,
            &self.vault.id,
            self.vault.chain,
            TransactMode::Withdraw,
            vec![self.share_token.clone()],
            self.deposit_tokens.clone(),
        ))
    }

    #[instrument(skip_all, fields(vault_id = %self.vault.id))]
    async fn fetch_withdraw_quote(
        &self,
        option: &TransactOption,
        inputs: &[TokenAmount],
    ) -> TransactResult<TransactQuote> {
        let input = single_input(inputs, &self.share_token)?;
        let estimate = self.estimate_withdraw(input).await?;
        let leg = QuoteLeg::Withdraw { shares: estimate.shares, outputs: estimate.outputs.clone() };
        Ok(TransactQuote::new(option, inputs.to_vec(), estimate.outputs).with_legs(vec![leg]))
    }

    async fn fetch_withdraw_step(&self, quote: &TransactQuote) -> TransactResult<Step> {
        let shares = withdrawn_shares(quote)?;
        let action = ClmWithdrawAction {
            chain: self.vault.chain,
            vault: self.vault.address,
            shares: shares.clone(),
            outputs: quote.outputs.clone(),
            refresh: RefreshInstructions::for_quote(quote, self.vault.address),
        };
        Ok(Step::new(
            StepKind::Withdraw,
            format!("Withdraw {shares}"),
            self.vault.chain,
            Arc::new(action),
        ))
    }

    async fn estimate_deposit(&self, inputs: &[TokenAmount]) -> TransactResult<DepositEstimate> {
        let (first, second) = self.pair_inputs(inputs)?;
        let preview = self
            .reader
            .clm_preview_deposit(
                self.vault.chain,
                &self.vault.address,
                first.to_wei()?,
                second.to_wei()?,
            )
            .await?;

        let shares = TokenAmount::from_wei(self.share_token.clone(), preview.shares)?;
        let mut returned = Vec::new();
        for (input, used) in [(first, preview.used0), (second, preview.used1)] {
            let used = TokenAmount::from_wei(input.token.clone(), used)?;
            let dust = input.amount - used.amount;
            if dust > Decimal::ZERO {
                returned.push(TokenAmount::new(input.token.clone(), dust));
            }
        }
        Ok(DepositEstimate { shares, returned })
    }

    async fn estimate_withdraw(&self, input: &TokenAmount) -> TransactResult<WithdrawEstimate> {
        let preview = self
            .reader
            .clm_preview_withdraw(self.vault.chain, &self.vault.address, input.to_wei()?)
            .await?;
        Ok(WithdrawEstimate {
            shares: input.clone(),
            outputs: vec![
                TokenAmount::from_wei(self.deposit_tokens[0].clone(), preview.amount0)?,
                TokenAmount::from_wei(self.deposit_tokens[1].clone(), preview.amount1)?,
            ],
        })
    }
}

struct ClmDepositAction {
    chain: Chain,
    vault: Address,
    amount0: U256,
    amount1: U256,
    shares: TokenAmount,
    refresh: RefreshInstructions,
}

#[async_trait]
impl StepAction for ClmDepositAction {
    async fn prepare(&self, ctx: &ExecutionContext) -> TransactResult<PreparedTransaction> {
        let min_shares = to_wei(ctx.min_amount(self.shares.amount), self.shares.token.decimals)?;
        Ok(PreparedTransaction {
            call: CallData::new(
                self.chain,
                self.vault,
                encode_clm_deposit(self.amount0, self.amount1, min_shares),
            ),
            refresh: Some(self.refresh.clone()),
        })
    }
}

struct ClmWithdrawAction {
    chain: Chain,
    vault: Address,
    shares: TokenAmount,
    outputs: Vec<TokenAmount>,
    refresh: RefreshInstructions,
}

#[async_trait]
impl StepAction for ClmWithdrawAction {
    async fn prepare(&self, ctx: &ExecutionContext) -> TransactResult<PreparedTransaction> {
        let mins = self
            .outputs
            .iter()
            .map(|output| to_wei(ctx.min_amount(output.amount), output.token.decimals))
            .collect::<Result<Vec<_>, _>>()?;
        let [min0, min1] = mins.as_slice() else {
            return Err(TransactError::InvalidInput(format!(
                "clm withdrawals have two outputs, got {}",
                mins.len()
            )));
        };
        let data = if self.shares.max {
            encode_clm_withdraw_all(*min0, *min1)
        } else {
            encode_clm_withdraw(self.shares.to_wei()?, *min0, *min1)
        };
        Ok(PreparedTransaction {
            call: CallData::new(self.chain, self.vault, data),
            refresh: Some(self.refresh.clone()),
        })
    }
}
