//! The caller facing surface of the engine.
//!
//! [`Transact`] wires the quote engine, step builder, stepper and transaction binder together
//! and drives a run from the active quote to a finished, failed or cancelled stepper.
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex};
use tracing::{info, instrument, warn};
use transact_common::{
    models::token::TokenAmount,
    traits::{
        AllowanceCache, BalanceCache, ChainReader, ConfigSource, PriceOracle, SwapAggregatorApi,
        WalletTransport,
    },
};

use crate::{
    binder::TransactionBinder,
    config::{RegistryStore, SettingsHandle},
    drivers::VaultDriverRegistry,
    engine::{QuoteEngine, QuoteFetchOutcome},
    errors::{ConfirmationRequest, TransactError, TransactResult},
    models::{TransactMode, TransactOption, TransactQuote},
    providers::{ProviderContext, ProviderRegistry},
    stepper::{EventBus, EventListener, Stepper, StepperState, TransactEvent},
    steps::{builder::StepBuilder, ExecutionContext},
};

/// External collaborators of a [`Transact`] instance.
#[derive(Clone)]
pub struct TransactDeps {
    pub oracle: Arc<dyn PriceOracle>,
    pub balances: Arc<dyn BalanceCache>,
    pub allowances: Arc<dyn AllowanceCache>,
    pub wallet: Arc<dyn WalletTransport>,
    pub reader: Arc<dyn ChainReader>,
    pub aggregator_api: Arc<dyn SwapAggregatorApi>,
}

pub struct Transact {
    engine: QuoteEngine,
    builder: StepBuilder,
    binder: TransactionBinder,
    stepper: Arc<Stepper>,
    events: Arc<EventBus>,
    settings: SettingsHandle,
    wallet: Arc<dyn WalletTransport>,
    /// Held for the whole of a run; only one run may be active at a time.
    run_lock: Mutex<()>,
    /// Drift of the last aborted run, until the user accepts the fresh quote.
    awaiting_confirmation: Mutex<Option<Box<ConfirmationRequest>>>,
}

impl Transact {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        settings: SettingsHandle,
        deps: TransactDeps,
    ) -> Self {
        let registry = Arc::new(RegistryStore::new(source));
        let drivers = Arc::new(VaultDriverRegistry::new(
            registry.clone(),
            deps.reader.clone(),
            deps.wallet.clone(),
        ));
        let ctx = ProviderContext {
            registry: registry.clone(),
            drivers,
            reader: deps.reader,
            wallet: deps.wallet.clone(),
            aggregator_api: deps.aggregator_api,
            settings: settings.clone(),
        };
        let providers = Arc::new(ProviderRegistry::with_defaults(&ctx));

        let engine = QuoteEngine::new(
            registry,
            providers.clone(),
            deps.oracle,
            deps.balances.clone(),
            deps.allowances.clone(),
            deps.wallet.clone(),
        );
        let events = Arc::new(EventBus::default());
        let stepper = Arc::new(Stepper::new(events.clone()));
        let builder = StepBuilder::new(providers, deps.allowances.clone(), deps.wallet.clone());
        let binder = TransactionBinder::new(
            deps.wallet.clone(),
            deps.balances,
            deps.allowances,
            stepper.clone(),
        );

        Self {
            engine,
            builder,
            binder,
            stepper,
            events,
            settings,
            wallet: deps.wallet,
            run_lock: Mutex::new(()),
            awaiting_confirmation: Mutex::new(None),
        }
    }

    pub async fn init(&self, vault_id: &str) -> TransactResult<()> {
        self.engine.init(vault_id).await
    }

    pub async fn fetch_options(
        &self,
        vault_id: &str,
        mode: TransactMode,
    ) -> TransactResult<Vec<TransactOption>> {
        self.engine
            .fetch_options(vault_id, mode)
            .await
    }

    pub async fn options(&self) -> Vec<TransactOption> {
        self.engine.options().await
    }

    pub async fn selection_id(&self) -> Option<String> {
        self.engine.selection_id().await
    }

    pub async fn select_selection(&self, selection_id: &str) -> TransactResult<()> {
        self.engine
            .select_selection(selection_id)
            .await
    }

    pub async fn select_option(&self, option_id: &str) -> TransactResult<()> {
        self.engine.select_option(option_id).await
    }

    pub async fn set_input_amount(&self, amount: Decimal, max: bool) -> TransactResult<()> {
        self.engine
            .set_input_amount(amount, max)
            .await
    }

    pub async fn set_input_amounts(&self, amounts: Vec<TokenAmount>) -> TransactResult<()> {
        self.engine
            .set_input_amounts(amounts)
            .await
    }

    pub async fn fetch_quotes(&self, selection_id: &str) -> TransactResult<QuoteFetchOutcome> {
        self.engine
            .fetch_quotes(selection_id)
            .await
    }

    pub async fn fetch_quotes_if_needed(&self) -> TransactResult<QuoteFetchOutcome> {
        self.engine.fetch_quotes_if_needed().await
    }

    pub async fn quotes(&self) -> Vec<TransactQuote> {
        self.engine.quotes().await
    }

    pub async fn active_quote(&self) -> Option<TransactQuote> {
        self.engine.active_quote().await
    }

    pub fn stepper_state(&self) -> StepperState {
        self.stepper.state()
    }

    pub fn subscribe_stepper(&self) -> watch::Receiver<StepperState> {
        self.stepper.subscribe()
    }

    pub fn on_event(&self, listener: EventListener) {
        self.events.subscribe(listener);
    }

    /// Called with the drift details whenever a run is aborted because its quote moved.
    pub fn on_confirmation_needed<F>(&self, callback: F)
    where
        F: Fn(&ConfirmationRequest) + Send + Sync + 'static,
    {
        self.events
            .subscribe(Arc::new(move |event| {
                if let TransactEvent::ConfirmationNeeded(request) = event {
                    callback(request);
                }
            }));
    }

    pub async fn set_slippage(&self, slippage: Decimal) -> TransactResult<()> {
        self.settings
            .set_slippage_tolerance(slippage)
            .await
    }

    /// Discards the current run, whatever its state. A run in flight returns
    /// [`TransactError::Cancelled`].
    pub async fn cancel(&self) {
        self.stepper.reset().await;
    }

    /// The drift awaiting the user's approval, if the last run was aborted by it.
    pub async fn pending_confirmation(&self) -> Option<Box<ConfirmationRequest>> {
        self.awaiting_confirmation.lock().await.clone()
    }

    /// Accepts the fresh quote of an aborted run so it may be executed.
    pub async fn confirm_quote(&self, quote_id: &str) -> TransactResult<()> {
        let mut pending = self.awaiting_confirmation.lock().await;
        match pending.as_ref() {
            Some(request) if request.requote.id == quote_id => {
                info!(quote_id, "Fresh quote confirmed");
                *pending = None;
                Ok(())
            }
            _ => Err(TransactError::InvalidInput(format!(
                "quote {quote_id} is not awaiting confirmation"
            ))),
        }
    }

    /// Builds the steps of the active quote and runs them one after the other.
    ///
    /// Returns once the stepper finished, or with the error that halted it. A failed step
    /// leaves the stepper on that step until [`Transact::cancel`] or the next run; a quote
    /// that moved beyond tolerance resets it and replaces the active quote with the fresh one,
    /// which only runs after [`Transact::confirm_quote`].
    #[instrument(skip(self))]
    pub async fn start_execution(&self) -> TransactResult<()> {
        let _run = self
            .run_lock
            .try_lock()
            .map_err(|_| TransactError::StepperBusy)?;
        let quote = self
            .engine
            .active_quote()
            .await
            .ok_or_else(|| TransactError::NoQuoteForSelection("no active quote".to_string()))?;
        if let Some(request) = self
            .awaiting_confirmation
            .lock()
            .await
            .as_ref()
            .filter(|request| request.requote.id == quote.id)
        {
            return Err(TransactError::ConfirmationNeeded(request.clone()));
        }
        let account = self
            .wallet
            .connected_account()
            .ok_or(TransactError::WalletNotConnected)?;

        let steps = self.builder.build_steps(&quote).await?;
        self.stepper.reset().await;
        self.stepper
            .start(steps, quote.execution_chain())
            .await?;
        info!(quote_id = %quote.id, provider = %quote.option.provider_id, "Executing quote");

        while let Some((index, action)) = self.stepper.next_action().await {
            let settings = self.settings.get().await;
            let ctx = ExecutionContext {
                wallet: account,
                slippage: settings.slippage_tolerance,
                drift_share: settings.reconfirm_drift_share,
            };
            match self.binder.execute(index, action, &ctx).await {
                Ok(_) => {}
                Err(err) if err.is_reconfirmation() => return Err(self.abort(err).await),
                Err(err) => return Err(err),
            }
        }

        if !self.stepper.state().is_finished {
            warn!(quote_id = %quote.id, "Run cancelled");
            return Err(TransactError::Cancelled);
        }
        Ok(())
    }

    async fn abort(&self, err: TransactError) -> TransactError {
        warn!(%err, "Aborting run");
        self.stepper.reset().await;
        if let TransactError::ConfirmationNeeded(request) = &err {
            self.engine
                .replace_quote(request.requote.clone())
                .await;
            *self.awaiting_confirmation.lock().await = Some(request.clone());
            self.events
                .emit(TransactEvent::ConfirmationNeeded(request.clone()));
        }
        err
    }
}
