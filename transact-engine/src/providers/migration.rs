//! Moves positions staked in third party pools into one of our vaults.
//!
//! The staked position is offered as its own input token, addressed by the pool. Running a
//! migration unstakes from the pool first and then deposits through the vault's own driver.
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};
use transact_common::models::{
    registry::MigratorConfig,
    token::{Token, TokenAmount},
    transaction::CallData,
};

use super::{ensure_owned, OptionCache, ProviderContext, TransactProvider};
use crate::{
    contracts::encode_unstake,
    drivers::single_input,
    errors::{TransactError, TransactResult},
    models::{QuoteLeg, TransactMode, TransactOption, TransactQuote},
    steps::{FixedCallAction, RefreshInstructions, Step, StepKind},
};

pub const MIGRATION_PROVIDER_ID: &str = "migration";

#[derive(Debug, Clone)]
struct MigrationDetail {
    migrator: MigratorConfig,
    /// The position in the third party pool.
    position: Token,
    deposit_token: Token,
}

impl MigrationDetail {
    fn unstaked(&self, position: &TokenAmount) -> TokenAmount {
        TokenAmount::new(self.deposit_token.clone(), position.amount)
    }
}

pub struct MigrationProvider {
    ctx: ProviderContext,
    options: OptionCache<MigrationDetail>,
}

impl MigrationProvider {
    pub fn new(ctx: ProviderContext) -> Self {
        Self { ctx, options: OptionCache::default() }
    }

    async fn build_options(
        &self,
        vault_id: &str,
    ) -> TransactResult<Option<Vec<(TransactOption, MigrationDetail)>>> {
        let migrators = self
            .ctx
            .registry
            .migrators_for(vault_id)
            .await?;
        if migrators.is_empty() {
            return Ok(None);
        }
        let vault = self.ctx.vault(vault_id).await?;
        let driver = self.ctx.driver(vault_id).await?;
        let [deposit_token] = driver.deposit_tokens() else {
            debug!(vault_id, "Migrations need a single deposit token");
            return Ok(None);
        };
        let share_token = driver.share_token().clone();

        let options = migrators
            .into_iter()
            .filter(|migrator| migrator.chain == vault.chain)
            .map(|migrator| {
                let position = Token::new(
                    migrator.chain,
                    migrator.pool,
                    &format!("{} {}", migrator.name, deposit_token.symbol),
                    deposit_token.decimals,
                );
                let option = TransactOption::new(
                    MIGRATION_PROVIDER_ID,
                    vault_id,
                    vault.chain,
                    TransactMode::Deposit,
                    vec![position.clone()],
                    vec![share_token.clone()],
                );
                let detail =
                    MigrationDetail { migrator, position, deposit_token: deposit_token.clone() };
                (option, detail)
            })
            .collect::<Vec<_>>();
        Ok((!options.is_empty()).then_some(options))
    }

    /// The connected wallet's position in the migrator's pool.
    pub async fn staked_balance(&self, option: &TransactOption) -> TransactResult<TokenAmount> {
        ensure_owned(option, MIGRATION_PROVIDER_ID)?;
        let detail = self.options.detail(option).await?;
        let account = self
            .ctx
            .wallet
            .connected_account()
            .ok_or(TransactError::WalletNotConnected)?;
        let raw = self
            .ctx
            .reader
            .staked_balance(detail.migrator.chain, &detail.migrator.pool, &account)
            .await?;
        Ok(TokenAmount::from_wei(detail.position, raw)?)
    }

    /// The deposit quote of the vault's driver for the unstaked amount.
    async fn vault_quote(
        &self,
        vault_id: &str,
        deposit: TokenAmount,
    ) -> TransactResult<TransactQuote> {
        let driver = self.ctx.driver(vault_id).await?;
        let vault_option = driver.fetch_deposit_option().await?;
        driver
            .fetch_deposit_quote(&vault_option, &[deposit])
            .await
    }
}

#[async_trait]
impl TransactProvider for MigrationProvider {
    fn id(&self) -> &str {
        MIGRATION_PROVIDER_ID
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
        ensure_owned(option, MIGRATION_PROVIDER_ID)?;
        let detail = self.options.detail(option).await?;
        let input = single_input(inputs, &detail.position)?;
        let staked = self.staked_balance(option).await?;
        if input.amount > staked.amount {
            return Err(TransactError::InvalidInput(format!(
                "{input} exceeds the staked {}",
                staked.amount
            )));
        }

        let unstaked = detail.unstaked(input);
        let vault_quote = self
            .vault_quote(&option.vault_id, unstaked.clone())
            .await?;
        let mut legs = vec![QuoteLeg::Unstake { pool: detail.migrator.pool, amount: unstaked }];
        legs.extend(vault_quote.legs);

        Ok(TransactQuote::new(option, inputs.to_vec(), vault_quote.outputs)
            .with_allowances(vault_quote.required_allowances)
            .with_legs(legs))
    }

    async fn fetch_prerequisite_steps(&self, quote: &TransactQuote) -> TransactResult<Vec<Step>> {
        ensure_owned(&quote.option, MIGRATION_PROVIDER_ID)?;
        let detail = self.options.detail(&quote.option).await?;
        let input = single_input(&quote.inputs, &detail.position)?;
        let pool = detail.migrator.pool;
        let call = CallData::new(detail.migrator.chain, pool, encode_unstake(input.to_wei()?));
        let refresh = RefreshInstructions {
            balances: vec![detail.deposit_token.clone()],
            ..Default::default()
        };
        Ok(vec![Step::new(
            StepKind::Unstake,
            format!(
                "Unstake {} {} from {}",
                input.amount.normalize(),
                detail.deposit_token.symbol,
                detail.migrator.name
            ),
            detail.migrator.chain,
            Arc::new(FixedCallAction::new(call, Some(refresh))),
        )])
    }

    async fn fetch_step(&self, quote: &TransactQuote) -> TransactResult<Step> {
        ensure_owned(&quote.option, MIGRATION_PROVIDER_ID)?;
        let detail = self.options.detail(&quote.option).await?;
        let input = single_input(&quote.inputs, &detail.position)?;
        let driver = self.ctx.driver(&quote.option.vault_id).await?;
        let vault_option = driver.fetch_deposit_option().await?;
        let deposit =
            TransactQuote::new(&vault_option, vec![detail.unstaked(input)], quote.outputs.clone())
                .with_allowances(quote.required_allowances.clone());
        driver.fetch_deposit_step(&deposit).await
    }
}
