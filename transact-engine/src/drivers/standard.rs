use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::instrument;
use transact_common::{
    models::{
        registry::{AddressBook, VaultConfig},
        token::{Token, TokenAmount},
        transaction::CallData,
        U256,
    },
    traits::ChainReader,
};

use super::{
    checked_div, ratio_from_wei, resolve_token, single_input, withdrawn_shares, DepositEstimate,
    VaultDriver, WithdrawEstimate, ZapCall, VAULT_PROVIDER_ID,
};
use crate::{
    contracts::{
        encode_vault_deposit, encode_vault_deposit_all, encode_vault_withdraw,
        encode_vault_withdraw_all, FIRST_ARG_OFFSET, NO_INJECTION,
    },
    errors::{TransactError, TransactResult},
    models::{allowances_for, QuoteFee, QuoteLeg, TransactMode, TransactOption, TransactQuote},
    steps::{FixedCallAction, RefreshInstructions, Step, StepKind},
};

/// Auto-compounding vault. Shares are priced by `getPricePerFullShare`.
pub struct StandardVaultDriver {
    vault: VaultConfig,
    deposit_tokens: Vec<Token>,
    share_token: Token,
    reader: Arc<dyn ChainReader>,
}

impl StandardVaultDriver {
    pub fn new(
        vault: VaultConfig,
        book: &AddressBook,
        reader: Arc<dyn ChainReader>,
    ) -> TransactResult<Self> {
        let [deposit_token] = vault.deposit_tokens.as_slice() else {
            return Err(TransactError::Config(format!(
                "standard vault {} needs exactly one deposit token",
                vault.id
            )));
        };
        let deposit_token = resolve_token(book, deposit_token)?;
        let share_token =
            Token::new(vault.chain, vault.address, &vault.share_symbol(), vault.share_decimals);
        Ok(Self { deposit_tokens: vec![deposit_token], share_token, vault, reader })
    }

    fn deposit_token(&self) -> &Token {
        &self.deposit_tokens[0]
    }

    async fn price_per_share(&self) -> TransactResult<Decimal> {
        let raw = self
            .reader
            .price_per_full_share(self.vault.chain, &self.vault.address)
            .await?;
        let ppfs = ratio_from_wei(raw)?;
        if ppfs.is_zero() {
            return Err(TransactError::InvalidInput(format!(
                "vault {} reports a zero share price",
                self.vault.id
            )));
        }
        Ok(ppfs)
    }

    fn fee_of(&self, input: &TokenAmount, rate: Decimal) -> Option<QuoteFee> {
        (rate > Decimal::ZERO).then(|| QuoteFee {
            rate,
            amount: TokenAmount::new(input.token.clone(), input.amount * rate),
        })
    }
}

#[async_trait]
impl VaultDriver for StandardVaultDriver {
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
        let input = single_input(inputs, self.deposit_token())?;
        let estimate = self
            .estimate_deposit(inputs)
            .await?;

        let leg = QuoteLeg::Deposit { inputs: inputs.to_vec(), shares: estimate.shares.clone() };
        let mut quote = TransactQuote::new(option, inputs.to_vec(), vec![estimate.shares])
            .with_allowances(allowances_for(inputs, self.vault.address))
            .with_legs(vec![leg]);
        if let Some(fee) = self.fee_of(input, self.vault.deposit_fee) {
            quote = quote.with_fee(fee);
        }
        Ok(quote)
    }

    async fn fetch_deposit_step(&self, quote: &TransactQuote) -> TransactResult<Step> {
        let input = single_input(&quote.inputs, self.deposit_token())?;
        let data = if input.max {
            encode_vault_deposit_all()
        } else {
            encode_vault_deposit(input.to_wei()?)
        };
        let call = CallData::new(self.vault.chain, self.vault.address, data);
        let refresh = RefreshInstructions::for_quote(quote, self.vault.address);
        Ok(Step::new(
            StepKind::Deposit,
            format!("Deposit {input}"),
            self.vault.chain,
            Arc::new(FixedCallAction::new(call, Some(refresh))),
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

        let leg = QuoteLeg::Withdraw { shares: estimate.shares, outputs: estimate.outputs.clone() };
        let mut quote =
            TransactQuote::new(option, inputs.to_vec(), estimate.outputs).with_legs(vec![leg]);
        if let Some(fee) = self.fee_of(input, self.vault.withdraw_fee) {
            quote = quote.with_fee(fee);
        }
        Ok(quote)
    }

    async fn fetch_withdraw_step(&self, quote: &TransactQuote) -> TransactResult<Step> {
        let input = single_input(&quote.inputs, self.deposit_token())?;
        let data = if input.max {
            encode_vault_withdraw_all()
        } else {
            encode_vault_withdraw(withdrawn_shares(quote)?.to_wei()?)
        };
        let call = CallData::new(self.vault.chain, self.vault.address, data);
        let refresh = RefreshInstructions::for_quote(quote, self.vault.address);
        Ok(Step::new(
            StepKind::Withdraw,
            format!("Withdraw {input}"),
            self.vault.chain,
            Arc::new(FixedCallAction::new(call, Some(refresh))),
        ))
    }

    async fn estimate_deposit(&self, inputs: &[TokenAmount]) -> TransactResult<DepositEstimate> {
        let input = single_input(inputs, self.deposit_token())?;
        let ppfs = self.price_per_share().await?;
        let net = input.amount * (Decimal::ONE - self.vault.deposit_fee);
        let shares = checked_div(net, ppfs)?;
        Ok(DepositEstimate {
            shares: TokenAmount::new(self.share_token.clone(), shares),
            returned: Vec::new(),
        })
    }

    async fn estimate_withdraw(&self, input: &TokenAmount) -> TransactResult<WithdrawEstimate> {
        let ppfs = self.price_per_share().await?;
        let shares = checked_div(input.amount, ppfs)?;
        let received = input.amount * (Decimal::ONE - self.vault.withdraw_fee);
        Ok(WithdrawEstimate {
            shares: TokenAmount {
                token: self.share_token.clone(),
                amount: shares,
                max: input.max,
            },
            outputs: vec![TokenAmount::new(self.deposit_token().clone(), received)],
        })
    }

    fn zap_deposit_call(&self) -> Option<ZapCall> {
        Some(ZapCall {
            target: self.vault.address,
            data: encode_vault_deposit_all(),
            inject_index: NO_INJECTION,
        })
    }

    fn zap_withdraw_call(&self) -> Option<ZapCall> {
        Some(ZapCall {
            target: self.vault.address,
            data: encode_vault_withdraw(U256::ZERO),
            inject_index: FIRST_ARG_OFFSET,
        })
    }
}
