use async_trait::async_trait;
use tracing::instrument;
use transact_common::models::token::TokenAmount;

use super::{ensure_owned, OptionCache, ProviderContext, TransactProvider};
use crate::{
    drivers::VAULT_PROVIDER_ID,
    errors::TransactResult,
    models::{TransactMode, TransactOption, TransactQuote},
    steps::Step,
};

/// The direct path: deposits into and withdrawals from the vault itself, through its driver.
pub struct VaultProvider {
    ctx: ProviderContext,
    options: OptionCache<()>,
}

impl VaultProvider {
    pub fn new(ctx: ProviderContext) -> Self {
        Self { ctx, options: OptionCache::default() }
    }
}

#[async_trait]
impl TransactProvider for VaultProvider {
    fn id(&self) -> &str {
        VAULT_PROVIDER_ID
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
        let driver = self.ctx.driver(vault_id).await?;
        let option = match mode {
            TransactMode::Deposit => driver.fetch_deposit_option().await?,
            TransactMode::Withdraw => driver.fetch_withdraw_option().await?,
        };
        Ok(self
            .options
            .insert(vault_id, mode, Some(vec![(option, ())]))
            .await)
    }

    async fn fetch_quote(
        &self,
        option: &TransactOption,
        inputs: &[TokenAmount],
    ) -> TransactResult<TransactQuote> {
        ensure_owned(option, VAULT_PROVIDER_ID)?;
        let driver = self.ctx.driver(&option.vault_id).await?;
        match option.mode {
            TransactMode::Deposit => driver.fetch_deposit_quote(option, inputs).await,
            TransactMode::Withdraw => driver.fetch_withdraw_quote(option, inputs).await,
        }
    }

    async fn fetch_step(&self, quote: &TransactQuote) -> TransactResult<Step> {
        ensure_owned(&quote.option, VAULT_PROVIDER_ID)?;
        let driver = self.ctx.driver(&quote.option.vault_id).await?;
        match quote.option.mode {
            TransactMode::Deposit => driver.fetch_deposit_step(quote).await,
            TransactMode::Withdraw => driver.fetch_withdraw_step(quote).await,
        }
    }
}
