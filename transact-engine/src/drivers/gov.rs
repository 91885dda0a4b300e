use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};
use transact_common::{
    models::{
        registry::{AddressBook, VaultConfig},
        token::{Token, TokenAmount},
        transaction::CallData,
        U256,
    },
    traits::{ChainReader, WalletTransport},
};

use super::{
    resolve_token, single_input, DepositEstimate, VaultDriver, WithdrawEstimate, ZapCall,
    VAULT_PROVIDER_ID,
};
use crate::{
    contracts::{
        encode_gov_exit, encode_gov_stake, encode_gov_withdraw, FIRST_ARG_OFFSET,
    },
    errors::{TransactError, TransactResult},
    models::{allowances_for, QuoteLeg, TransactMode, TransactOption, TransactQuote},
    steps::{FixedCallAction, RefreshInstructions, Step, StepKind},
};

/// Governance pool: the deposit token is staked 1:1 and earns a separate reward token.
///
/// A withdrawal of the whole stake always goes through `exit()`, which also claims the pending
/// rewards. A plain `withdraw` of the full stake followed by a claim would revert once the
/// stake is zero.
pub struct GovVaultDriver {
    vault: VaultConfig,
    deposit_tokens: Vec<Token>,
    share_token: Token,
    reward_token: Option<Token>,
    reader: Arc<dyn ChainReader>,
    wallet: Arc<dyn WalletTransport>,
}

impl GovVaultDriver {
    pub fn new(
        vault: VaultConfig,
        book: &AddressBook,
        reader: Arc<dyn ChainReader>,
        wallet: Arc<dyn WalletTransport>,
    ) -> TransactResult<Self> {
        let [deposit_token] = vault.deposit_tokens.as_slice() else {
            return Err(TransactError::Config(format!(
                "gov vault {} needs exactly one deposit token",
                vault.id
            )));
        };
        let deposit_token = resolve_token(book, deposit_token)?;
        let share_token = Token::new(
            vault.chain,
            vault.address,
            &vault.share_symbol(),
            deposit_token.decimals,
        );
        let reward_token = vault
            .reward_token
            .as_ref()
            .map(|address| resolve_token(book, address))
            .transpose()?;
        Ok(Self {
            deposit_tokens: vec![deposit_token],
            share_token,
            reward_token,
            vault,
            reader,
            wallet,
        })
    }

    fn deposit_token(&self) -> &Token {
        &self.deposit_tokens[0]
    }

    /// Rewards the connected wallet would claim on exit. Zero without a wallet.
    async fn pending_rewards(&self) -> TransactResult<Option<TokenAmount>> {
        let (Some(reward_token), Some(account)) =
            (self.reward_token.as_ref(), self.wallet.connected_account())
        else {
            return Ok(None);
        };
        let raw = self
            .reader
            .pending_rewards(self.vault.chain, &self.vault.address, &account)
            .await?;
        let rewards = TokenAmount::from_wei(reward_token.clone(), raw)?;
        debug!(vault_id = %self.vault.id, %rewards, "Pending rewards");
        Ok(rewards.is_positive().then_some(rewards))
    }
}

#[async_trait]
impl VaultDriver for GovVaultDriver {
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
        let leg = QuoteLeg::Deposit { inputs: inputs.to_vec(), shares: estimate.shares.clone() };
        Ok(TransactQuote::new(option, inputs.to_vec(), vec![estimate.shares])
            .with_allowances(allowances_for(inputs, self.vault.address))
            .with_legs(vec![leg]))
    }

    async fn fetch_deposit_step(&self, quote: &TransactQuote) -> TransactResult<Step> {
        let input = single_input(&quote.inputs, self.deposit_token())?;
        let call =
            CallData::new(self.vault.chain, self.vault.address, encode_gov_stake(input.to_wei()?));
        Ok(Step::new(
            StepKind::Deposit,
            format!("Stake {input}"),
            self.vault.chain,
            Arc::new(FixedCallAction::new(
                call,
                Some(RefreshInstructions::for_quote(quote, self.vault.address)),
            )),
        ))
    }

    async fn fetch_withdraw_option(&self) -> TransactResult<TransactOption> {
        Ok(TransactOption::new(
            VAULT_PROVIDER_ID,
            &self.vault.id,
            self.vault.chain,
            TransactMode::Withdraw,
            self.deposit_tokens.clone(),
            self.deposit_tokens.clone(),
        ))
    }

    #[instrument(skip_all, fields(vault_id = %self.vault.id))]
    async fn fetch_withdraw_quote(
        &self,
        option: &TransactOption,
        inputs: &[TokenAmount],
    ) -> TransactResult<TransactQuote> {
        let input = single_input(inputs, self.deposit_token())?;
        let estimate = self.estimate_withdraw(input).await?;
        let mut outputs = estimate.outputs.clone();
        let mut legs =
            vec![QuoteLeg::Withdraw { shares: estimate.shares, outputs: estimate.outputs }];

        if input.max {
            if let Some(reward) = self.pending_rewards().await? {
                outputs.push(reward.clone());
                legs.push(QuoteLeg::Claim { reward });
            }
        }

        Ok(TransactQuote::new(option, inputs.to_vec(), outputs).with_legs(legs))
    }

    async fn fetch_withdraw_step(&self, quote: &TransactQuote) -> TransactResult<Step> {
        let input = single_input(&quote.inputs, self.deposit_token())?;
        let (data, message) = if input.max {
            (encode_gov_exit(), format!("Withdraw all {} and claim", input.token.symbol))
        } else {
            (encode_gov_withdraw(input.to_wei()?), format!("Withdraw {input}"))
        };
        let call = CallData::new(self.vault.chain, self.vault.address, data);
        Ok(Step::new(
            StepKind::Withdraw,
            message,
            self.vault.chain,
            Arc::new(FixedCallAction::new(
                call,
                Some(RefreshInstructions::for_quote(quote, self.vault.address)),
            )),
        ))
    }

    async fn estimate_deposit(&self, inputs: &[TokenAmount]) -> TransactResult<DepositEstimate> {
        let input = single_input(inputs, self.deposit_token())?;
        Ok(DepositEstimate {
            shares: TokenAmount::new(self.share_token.clone(), input.amount),
            returned: Vec::new(),
        })
    }

    async fn estimate_withdraw(&self, input: &TokenAmount) -> TransactResult<WithdrawEstimate> {
        Ok(WithdrawEstimate {
            shares: TokenAmount {
                token: self.share_token.clone(),
                amount: input.amount,
                max: input.max,
            },
            outputs: vec![TokenAmount::new(self.deposit_token().clone(), input.amount)],
        })
    }

    fn zap_deposit_call(&self) -> Option<ZapCall> {
        Some(ZapCall {
            target: self.vault.address,
            data: encode_gov_stake(U256::ZERO),
            inject_index: FIRST_ARG_OFFSET,
        })
    }
}
