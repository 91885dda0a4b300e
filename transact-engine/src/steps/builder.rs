use std::sync::Arc;

use tracing::{debug, instrument};
use transact_common::traits::{AllowanceCache, WalletTransport};

use super::{guard::ReconfirmAction, Step};
use crate::{
    errors::{TransactError, TransactResult},
    models::TransactQuote,
    providers::ProviderRegistry,
};

/// Turns a confirmed quote into the ordered steps of a run.
///
/// Approvals come first, in the order of `required_allowances`, followed by the provider's
/// prerequisite steps and finally the single primary action wrapped in a [`ReconfirmAction`].
pub struct StepBuilder {
    providers: Arc<ProviderRegistry>,
    allowances: Arc<dyn AllowanceCache>,
    wallet: Arc<dyn WalletTransport>,
}

impl StepBuilder {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        allowances: Arc<dyn AllowanceCache>,
        wallet: Arc<dyn WalletTransport>,
    ) -> Self {
        Self { providers, allowances, wallet }
    }

    #[instrument(skip_all, fields(quote_id = %quote.id, provider = %quote.option.provider_id))]
    pub async fn build_steps(&self, quote: &TransactQuote) -> TransactResult<Vec<Step>> {
        let account = self
            .wallet
            .connected_account()
            .ok_or(TransactError::WalletNotConnected)?;
        let provider = self
            .providers
            .get(&quote.option.provider_id)?;

        let mut steps = Vec::new();
        for required in &quote.required_allowances {
            if required.token.is_native() {
                continue;
            }
            let live = self
                .allowances
                .allowance_of(required.token.chain, &required.token, &required.spender, &account)
                .await?;
            if live < required.amount {
                debug!(
                    token = %required.token,
                    %live,
                    required = %required.amount,
                    "Approval needed"
                );
                steps.push(Step::approve(required.clone()));
            }
        }

        steps.extend(
            provider
                .fetch_prerequisite_steps(quote)
                .await?,
        );

        let mut primary = provider.fetch_step(quote).await?;
        primary.action = Arc::new(ReconfirmAction::new(primary.action, provider, quote.clone()));
        steps.push(primary);

        debug!(steps = steps.len(), "Built steps");
        Ok(steps)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use transact_common::{
        models::token::TokenAmount,
        traits::{MockAllowanceCache, MockWalletTransport},
    };

    use super::*;
    use crate::{
        models::TransactMode,
        providers::{ProviderContext, TransactProvider, VaultProvider},
        steps::StepKind,
        test_fixtures::{provider_context, TestEnv, MIGRATION_VAULT_ID, STANDARD_VAULT_ID},
    };

    async fn standard_quote(ctx: &ProviderContext, amount: Decimal) -> TransactQuote {
        let provider = VaultProvider::new(ctx.clone());
        let option = provider
            .fetch_options(STANDARD_VAULT_ID, TransactMode::Deposit)
            .await
            .unwrap()
            .unwrap()
            .remove(0);
        provider
            .fetch_quote(&option, &[TokenAmount::new(option.inputs[0].clone(), amount)])
            .await
            .unwrap()
    }

    fn allowance_cache(live: Decimal) -> Arc<MockAllowanceCache> {
        let mut allowances = MockAllowanceCache::new();
        allowances
            .expect_allowance_of()
            .returning(move |_, _, _, _| Ok(live));
        Arc::new(allowances)
    }

    #[rstest]
    #[case::no_allowance(dec!(0), 2)]
    #[case::insufficient(dec!(49.99), 2)]
    #[case::exact(dec!(50), 1)]
    #[case::more_than_enough(dec!(1000), 1)]
    #[tokio::test]
    async fn test_approval_only_when_insufficient(#[case] live: Decimal, #[case] expected: usize) {
        let env = TestEnv::new().await;
        let ctx = provider_context(&env).await;
        let quote = standard_quote(&ctx, dec!(50)).await;
        let builder = StepBuilder::new(
            Arc::new(ProviderRegistry::with_defaults(&ctx)),
            allowance_cache(live),
            env.wallet.clone(),
        );

        let steps = builder.build_steps(&quote).await.unwrap();

        assert_eq!(steps.len(), expected);
        if expected == 2 {
            assert_eq!(steps[0].kind, StepKind::Approve);
            assert_eq!(steps[0].message, "Approve 50 USDC");
        }
        assert_eq!(steps.last().unwrap().kind, StepKind::Deposit);
        assert!(steps.iter().all(|step| !step.pending));
    }

    #[test_log::test(tokio::test)]
    async fn test_prerequisites_run_before_primary() {
        let env = TestEnv::new().await;
        env.reader.set_staked(dec!(100));
        let ctx = provider_context(&env).await;
        let registry = Arc::new(ProviderRegistry::with_defaults(&ctx));
        let migration = registry.get("migration").unwrap();
        let option = migration
            .fetch_options(MIGRATION_VAULT_ID, TransactMode::Deposit)
            .await
            .unwrap()
            .unwrap()
            .remove(0);
        let quote = migration
            .fetch_quote(&option, &[TokenAmount::new(option.inputs[0].clone(), dec!(10))])
            .await
            .unwrap();
        let builder = StepBuilder::new(registry, allowance_cache(dec!(0)), env.wallet.clone());

        let steps = builder.build_steps(&quote).await.unwrap();

        let kinds: Vec<_> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StepKind::Approve, StepKind::Unstake, StepKind::Deposit]);
    }

    #[test_log::test(tokio::test)]
    async fn test_requires_connected_wallet() {
        let env = TestEnv::new().await;
        let ctx = provider_context(&env).await;
        let quote = standard_quote(&ctx, dec!(50)).await;
        let mut wallet = MockWalletTransport::new();
        wallet
            .expect_connected_account()
            .return_const(None);
        let builder = StepBuilder::new(
            Arc::new(ProviderRegistry::with_defaults(&ctx)),
            allowance_cache(dec!(0)),
            Arc::new(wallet),
        );

        let res = builder.build_steps(&quote).await;

        assert!(matches!(res, Err(TransactError::WalletNotConnected)));
    }
}
