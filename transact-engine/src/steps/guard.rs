//! Quote reconfirmation right before the primary action is signed.
//!
//! Time passes between reviewing a quote and signing its transaction, most notably while
//! approvals confirm. The guard re-quotes the same option and inputs first and only lets the
//! primary action through if no output drifted by more than a share of the slippage
//! tolerance; the remaining tolerance is left for the swap itself.
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use super::{ExecutionContext, PreparedTransaction, StepAction};
use crate::{
    errors::{ConfirmationRequest, OutputChange, TransactError, TransactResult},
    models::TransactQuote,
    providers::TransactProvider,
};

/// Smallest tolerated `new / old` output ratio.
pub fn min_allowed_ratio(slippage: Decimal, drift_share: Decimal) -> Decimal {
    Decimal::ONE - slippage * drift_share
}

/// Outputs of `original` that are missing from `requote` or fell below `old * ratio`.
pub fn check_drift(
    original: &TransactQuote,
    requote: &TransactQuote,
    ratio: Decimal,
) -> Vec<OutputChange> {
    original
        .outputs
        .iter()
        .filter_map(|old| {
            let new = requote
                .output_of(&old.token)
                .map(|out| out.amount);
            match new {
                Some(new) if new >= old.amount * ratio => None,
                _ => {
                    let new = new.unwrap_or(Decimal::ZERO);
                    Some(OutputChange {
                        token: old.token.clone(),
                        old: old.amount,
                        new,
                        delta: new - old.amount,
                    })
                }
            }
        })
        .collect()
}

/// Wraps the primary action of a run with a reconfirmation of its quote.
pub struct ReconfirmAction {
    inner: Arc<dyn StepAction>,
    provider: Arc<dyn TransactProvider>,
    quote: TransactQuote,
}

impl ReconfirmAction {
    pub fn new(
        inner: Arc<dyn StepAction>,
        provider: Arc<dyn TransactProvider>,
        quote: TransactQuote,
    ) -> Self {
        Self { inner, provider, quote }
    }
}

#[async_trait]
impl StepAction for ReconfirmAction {
    #[instrument(skip_all, fields(quote_id = %self.quote.id))]
    async fn prepare(&self, ctx: &ExecutionContext) -> TransactResult<PreparedTransaction> {
        let requote = self
            .provider
            .fetch_quote(&self.quote.option, &self.quote.inputs)
            .await
            .map_err(|err| TransactError::ConfirmationFailed(err.to_string()))?;

        let ratio = min_allowed_ratio(ctx.slippage, ctx.drift_share);
        let changes = check_drift(&self.quote, &requote, ratio);
        if !changes.is_empty() {
            warn!(%ratio, changed = changes.len(), "Quote drifted beyond tolerance");
            return Err(TransactError::ConfirmationNeeded(Box::new(ConfirmationRequest {
                original: self.quote.clone(),
                requote,
                changes,
            })));
        }

        debug!(%ratio, "Quote reconfirmed");
        self.inner.prepare(ctx).await
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use rust_decimal_macros::dec;
    use transact_common::models::{
        token::{Token, TokenAmount},
        transaction::CallData,
        Address, Chain,
    };

    use super::*;
    use crate::{
        models::{TransactMode, TransactOption},
        steps::{FixedCallAction, Step},
    };

    fn token(byte: u8, symbol: &str) -> Token {
        Token::new(Chain::Ethereum, Address::repeat_byte(byte), symbol, 18)
    }

    fn option() -> TransactOption {
        TransactOption::new(
            "vault",
            "usdc-vault",
            Chain::Ethereum,
            TransactMode::Deposit,
            vec![token(1, "USDC")],
            vec![token(2, "mooUSDC")],
        )
    }

    fn quote(outputs: Vec<TokenAmount>) -> TransactQuote {
        TransactQuote::new(&option(), vec![TokenAmount::new(token(1, "USDC"), dec!(100))], outputs)
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            wallet: Address::repeat_byte(0xee),
            slippage: dec!(0.01),
            drift_share: dec!(0.1),
        }
    }

    /// Answers every quote with fixed outputs, or fails.
    struct RequoteProvider {
        outputs: Option<Vec<TokenAmount>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TransactProvider for RequoteProvider {
        fn id(&self) -> &str {
            "vault"
        }

        async fn fetch_options(
            &self,
            _vault_id: &str,
            _mode: TransactMode,
        ) -> TransactResult<Option<Vec<TransactOption>>> {
            Ok(Some(vec![option()]))
        }

        async fn fetch_quote(
            &self,
            _option: &TransactOption,
            _inputs: &[TokenAmount],
        ) -> TransactResult<TransactQuote> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outputs
                .clone()
                .map(quote)
                .ok_or_else(|| TransactError::NoQuoteForSelection("rpc down".to_string()))
        }

        async fn fetch_step(&self, _quote: &TransactQuote) -> TransactResult<Step> {
            unimplemented!()
        }
    }

    fn guarded(requoted: Option<Vec<TokenAmount>>) -> (ReconfirmAction, Arc<RequoteProvider>) {
        let provider = Arc::new(RequoteProvider { outputs: requoted, calls: AtomicUsize::new(0) });
        let call = CallData::new(Chain::Ethereum, Address::repeat_byte(2), vec![0xab]);
        let action = ReconfirmAction::new(
            Arc::new(FixedCallAction::new(call, None)),
            provider.clone(),
            quote(vec![TokenAmount::new(token(2, "mooUSDC"), dec!(100))]),
        );
        (action, provider)
    }

    #[test]
    fn test_min_allowed_ratio() {
        assert_eq!(min_allowed_ratio(dec!(0.01), dec!(0.1)), dec!(0.999));
    }

    #[rstest]
    #[case::unchanged(dec!(100), true)]
    #[case::small_drift(dec!(99.95), true)]
    #[case::at_threshold(dec!(99.9), true)]
    #[case::large_drift(dec!(99.80), false)]
    #[case::price_move(dec!(99), false)]
    #[case::improved(dec!(101), true)]
    fn test_check_drift(#[case] requoted: Decimal, #[case] proceeds: bool) {
        let original = quote(vec![TokenAmount::new(token(2, "mooUSDC"), dec!(100))]);
        let requote = quote(vec![TokenAmount::new(token(2, "mooUSDC"), requoted)]);

        let changes = check_drift(&original, &requote, dec!(0.999));

        assert_eq!(changes.is_empty(), proceeds);
    }

    #[test]
    fn test_missing_output_is_a_change() {
        let original = quote(vec![
            TokenAmount::new(token(2, "mooUSDC"), dec!(100)),
            TokenAmount::new(token(3, "BIFI"), dec!(5)),
        ]);
        let requote = quote(vec![TokenAmount::new(token(2, "mooUSDC"), dec!(100))]);

        let changes = check_drift(&original, &requote, dec!(0.999));

        assert_eq!(
            changes,
            vec![OutputChange {
                token: token(3, "BIFI"),
                old: dec!(5),
                new: dec!(0),
                delta: dec!(-5),
            }]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_proceeds_within_tolerance() {
        let (action, provider) =
            guarded(Some(vec![TokenAmount::new(token(2, "mooUSDC"), dec!(99.95))]));

        let prepared = action.prepare(&ctx()).await.unwrap();

        assert_eq!(prepared.call.to, Address::repeat_byte(2));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_drift_needs_confirmation() {
        let (action, _) = guarded(Some(vec![TokenAmount::new(token(2, "mooUSDC"), dec!(99))]));

        let err = action.prepare(&ctx()).await.unwrap_err();

        let TransactError::ConfirmationNeeded(request) = err else {
            panic!("expected ConfirmationNeeded, got {err:?}");
        };
        assert_eq!(request.changes.len(), 1);
        assert_eq!(request.changes[0].old, dec!(100));
        assert_eq!(request.changes[0].new, dec!(99));
        assert_eq!(request.changes[0].delta, dec!(-1));
        assert_eq!(request.requote.outputs[0].amount, dec!(99));
    }

    #[test_log::test(tokio::test)]
    async fn test_requote_failure() {
        let (action, _) = guarded(None);

        let err = action.prepare(&ctx()).await.unwrap_err();

        assert!(matches!(err, TransactError::ConfirmationFailed(_)));
        assert!(err.is_reconfirmation());
    }
}
