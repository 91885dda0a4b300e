//! The option and quote engine.
//!
//! Holds the user's current vault, mode, selection and input amounts, asks every provider for
//! options, quotes the options of the active selection in parallel and ranks the results by
//! the value of their outputs.
use std::{collections::HashMap, sync::Arc};

use futures03::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use transact_common::{
    models::{
        token::{Token, TokenAmount},
        Address, Chain, VaultId,
    },
    traits::{AllowanceCache, BalanceCache, PriceOracle, WalletTransport},
};

use crate::{
    config::RegistryStore,
    errors::{TransactError, TransactResult},
    models::{TransactMode, TransactOption, TransactQuote},
    providers::ProviderRegistry,
};

/// Everything a set of quotes was fetched for. Quotes are stale once it differs from the
/// engine's current origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteOrigin {
    pub vault_id: VaultId,
    pub mode: TransactMode,
    pub selection_id: String,
    pub option_id: Option<String>,
    pub inputs: Vec<TokenAmount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteFetchOutcome {
    /// Ranked quotes, best first.
    Applied(Vec<TransactQuote>),
    /// The cached quotes already match the current origin.
    Unchanged,
    /// The user changed the origin while the quotes were in flight; they were dropped.
    Superseded,
}

#[derive(Default)]
struct EngineState {
    vault_id: Option<VaultId>,
    mode: Option<TransactMode>,
    options: Vec<TransactOption>,
    selection_id: Option<String>,
    option_id: Option<String>,
    inputs: Vec<TokenAmount>,
    quotes: Vec<TransactQuote>,
    quotes_origin: Option<QuoteOrigin>,
}

impl EngineState {
    fn origin(&self) -> Option<QuoteOrigin> {
        Some(QuoteOrigin {
            vault_id: self.vault_id.clone()?,
            mode: self.mode?,
            selection_id: self.selection_id.clone()?,
            option_id: self.option_id.clone(),
            inputs: self.inputs.clone(),
        })
    }

    fn selection_options(&self, selection_id: &str) -> Vec<TransactOption> {
        self.options
            .iter()
            .filter(|option| option.selection_id == selection_id)
            .cloned()
            .collect()
    }

    /// Points the selection at `selection_id` and zeroes the inputs if it changed.
    fn select(&mut self, selection_id: &str) -> TransactResult<()> {
        if self.selection_id.as_deref() == Some(selection_id) {
            return Ok(());
        }
        let option = self
            .options
            .iter()
            .find(|option| option.selection_id == selection_id)
            .ok_or_else(|| TransactError::UnknownOption(format!("selection {selection_id}")))?;
        self.inputs = option
            .inputs
            .iter()
            .cloned()
            .map(TokenAmount::zero)
            .collect();
        self.selection_id = Some(selection_id.to_string());
        self.option_id = None;
        Ok(())
    }
}

pub struct QuoteEngine {
    registry: Arc<RegistryStore>,
    providers: Arc<ProviderRegistry>,
    oracle: Arc<dyn PriceOracle>,
    balances: Arc<dyn BalanceCache>,
    allowances: Arc<dyn AllowanceCache>,
    wallet: Arc<dyn WalletTransport>,
    state: RwLock<EngineState>,
}

impl QuoteEngine {
    pub fn new(
        registry: Arc<RegistryStore>,
        providers: Arc<ProviderRegistry>,
        oracle: Arc<dyn PriceOracle>,
        balances: Arc<dyn BalanceCache>,
        allowances: Arc<dyn AllowanceCache>,
        wallet: Arc<dyn WalletTransport>,
    ) -> Self {
        Self {
            registry,
            providers,
            oracle,
            balances,
            allowances,
            wallet,
            state: RwLock::new(EngineState::default()),
        }
    }

    /// Loads the static registries every provider needs and checks the vault exists.
    ///
    /// Each registry is loaded at most once per session, whichever vault asks first.
    pub async fn init(&self, vault_id: &str) -> TransactResult<()> {
        self.registry.ensure_loaded().await?;
        self.registry.vault(vault_id).await?;
        Ok(())
    }

    /// Collects the options of every eligible provider and makes the first option's selection
    /// the active one.
    #[instrument(skip(self))]
    pub async fn fetch_options(
        &self,
        vault_id: &str,
        mode: TransactMode,
    ) -> TransactResult<Vec<TransactOption>> {
        self.init(vault_id).await?;
        let providers: Vec<_> = self.providers.iter().cloned().collect();
        let results = join_all(
            providers
                .iter()
                .map(|provider| provider.fetch_options(vault_id, mode)),
        )
        .await;

        let mut options = Vec::new();
        for (provider, result) in providers.iter().zip(results) {
            match result {
                Ok(Some(found)) if !found.is_empty() => {
                    debug!(provider = provider.id(), count = found.len(), "Provider options");
                    options.extend(found);
                }
                Ok(_) => debug!(provider = provider.id(), "Provider not eligible"),
                Err(err) => warn!(provider = provider.id(), %err, "Failed to list options"),
            }
        }
        if options.is_empty() {
            return Err(TransactError::NoOptionsAvailable(vault_id.to_string()));
        }
        info!(count = options.len(), "Fetched options");

        {
            let mut state = self.state.write().await;
            *state = EngineState {
                vault_id: Some(vault_id.to_string()),
                mode: Some(mode),
                options: options.clone(),
                ..Default::default()
            };
            state.select(&options[0].selection_id)?;
        }

        self.fetch_balances(&options).await;
        Ok(options)
    }

    /// Populates the balance cache for every token the options reference.
    async fn fetch_balances(&self, options: &[TransactOption]) {
        let Some(account) = self.wallet.connected_account() else {
            return;
        };
        let mut by_chain: Vec<(Chain, Vec<Token>)> = Vec::new();
        let tokens = options
            .iter()
            .flat_map(|option| option.inputs.iter().chain(option.wanted_outputs.iter()));
        for token in tokens {
            match by_chain
                .iter_mut()
                .find(|(chain, _)| *chain == token.chain)
            {
                Some((_, known)) if known.contains(token) => {}
                Some((_, known)) => known.push(token.clone()),
                None => by_chain.push((token.chain, vec![token.clone()])),
            }
        }
        for (chain, tokens) in by_chain {
            if let Err(err) = self
                .balances
                .fetch_balances(chain, &tokens, &account)
                .await
            {
                warn!(%chain, ?err, "Failed to fetch balances");
            }
        }
    }

    pub async fn options(&self) -> Vec<TransactOption> {
        self.state.read().await.options.clone()
    }

    pub async fn selection_id(&self) -> Option<String> {
        self.state
            .read()
            .await
            .selection_id
            .clone()
    }

    /// Distinct selections of the fetched options, in option order.
    pub async fn selections(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut selections: Vec<String> = Vec::new();
        for option in &state.options {
            if !selections.contains(&option.selection_id) {
                selections.push(option.selection_id.clone());
            }
        }
        selections
    }

    pub async fn select_selection(&self, selection_id: &str) -> TransactResult<()> {
        self.state.write().await.select(selection_id)
    }

    /// Pins the active quote to one option. Switches the selection if the option belongs to
    /// another one.
    pub async fn select_option(&self, option_id: &str) -> TransactResult<()> {
        let mut state = self.state.write().await;
        let selection_id = state
            .options
            .iter()
            .find(|option| option.id == option_id)
            .map(|option| option.selection_id.clone())
            .ok_or_else(|| TransactError::UnknownOption(option_id.to_string()))?;
        state.select(&selection_id)?;
        state.option_id = Some(option_id.to_string());
        Ok(())
    }

    /// Sets the amount of a single input selection.
    pub async fn set_input_amount(&self, amount: Decimal, max: bool) -> TransactResult<()> {
        let mut state = self.state.write().await;
        let [input] = state.inputs.as_mut_slice() else {
            return Err(TransactError::InvalidInput(format!(
                "selection takes {} inputs",
                state.inputs.len()
            )));
        };
        input.amount = amount;
        input.max = max;
        Ok(())
    }

    /// Sets every input amount of the selection, in the selection's token order.
    pub async fn set_input_amounts(&self, amounts: Vec<TokenAmount>) -> TransactResult<()> {
        let mut state = self.state.write().await;
        let matches = amounts.len() == state.inputs.len() &&
            amounts
                .iter()
                .zip(state.inputs.iter())
                .all(|(new, current)| new.token == current.token);
        if !matches {
            return Err(TransactError::InvalidInput(
                "amounts do not match the selection's tokens".to_string(),
            ));
        }
        state.inputs = amounts;
        Ok(())
    }

    pub async fn inputs(&self) -> Vec<TokenAmount> {
        self.state.read().await.inputs.clone()
    }

    /// Quotes every option of the active selection and ranks the results.
    ///
    /// Inputs are validated before any provider is called. Providers that fail are left out;
    /// the call only fails if none succeeded. Results arriving after the user changed the
    /// selection or amounts are dropped.
    #[instrument(skip(self))]
    pub async fn fetch_quotes(&self, selection_id: &str) -> TransactResult<QuoteFetchOutcome> {
        let (origin, options) = {
            let state = self.state.read().await;
            let origin = state
                .origin()
                .ok_or_else(|| TransactError::NoOptionsAvailable("no vault selected".to_string()))?;
            if origin.selection_id != selection_id {
                return Err(TransactError::InvalidInput(format!(
                    "selection {selection_id} is not active"
                )));
            }
            (origin, state.selection_options(selection_id))
        };
        validate_inputs(&origin.inputs)?;

        let quotes = self
            .quote_options(&options, &origin.inputs)
            .await;
        if quotes.is_empty() {
            return Err(TransactError::NoQuoteForSelection(selection_id.to_string()));
        }
        let ranked = self.rank(quotes).await;

        {
            let mut state = self.state.write().await;
            if state.origin().as_ref() != Some(&origin) {
                debug!("Dropping quotes of a superseded selection");
                return Ok(QuoteFetchOutcome::Superseded);
            }
            info!(count = ranked.len(), best = %ranked[0].option.provider_id, "Quotes ranked");
            state.quotes = ranked.clone();
            state.quotes_origin = Some(origin);
        }
        self.fetch_allowances(&ranked).await;
        Ok(QuoteFetchOutcome::Applied(ranked))
    }

    /// Re-fetches only if the cached quotes were fetched for something else than the current
    /// vault, mode, selection, option and amounts.
    pub async fn fetch_quotes_if_needed(&self) -> TransactResult<QuoteFetchOutcome> {
        let origin = {
            let state = self.state.read().await;
            let Some(origin) = state.origin() else {
                return Err(TransactError::NoOptionsAvailable("no vault selected".to_string()));
            };
            if state.quotes_origin.as_ref() == Some(&origin) {
                return Ok(QuoteFetchOutcome::Unchanged);
            }
            origin
        };
        self.fetch_quotes(&origin.selection_id)
            .await
    }

    async fn quote_options(
        &self,
        options: &[TransactOption],
        inputs: &[TokenAmount],
    ) -> Vec<TransactQuote> {
        let results = join_all(options.iter().map(|option| async move {
            let provider = self.providers.get(&option.provider_id)?;
            provider.fetch_quote(option, inputs).await
        }))
        .await;

        options
            .iter()
            .zip(results)
            .filter_map(|(option, result)| match result {
                Ok(quote) => Some(quote),
                Err(err) => {
                    warn!(
                        option_id = %option.id,
                        provider = %option.provider_id,
                        %err,
                        "Quote failed"
                    );
                    None
                }
            })
            .collect()
    }

    /// Sorts quotes by output value, best first. Ties keep provider registration order. A quote
    /// with any unpriced output has no value and ranks after every priced quote.
    async fn rank(&self, quotes: Vec<TransactQuote>) -> Vec<TransactQuote> {
        let mut tokens: Vec<Token> = Vec::new();
        for output in quotes.iter().flat_map(|q| q.outputs.iter()) {
            if !tokens.contains(&output.token) {
                tokens.push(output.token.clone());
            }
        }
        let prices = join_all(
            tokens
                .iter()
                .map(|token| self.oracle.price_of(token)),
        )
        .await;
        let prices: HashMap<Token, Decimal> = tokens
            .into_iter()
            .zip(prices)
            .filter_map(|(token, price)| match price {
                Ok(price) => Some((token, price)),
                Err(err) => {
                    warn!(%token, ?err, "No price, ranking its quotes last");
                    None
                }
            })
            .collect();

        let mut valued: Vec<(Option<Decimal>, usize, TransactQuote)> = quotes
            .into_iter()
            .map(|quote| {
                let value = quote
                    .outputs
                    .iter()
                    .map(|out| {
                        prices
                            .get(&out.token)
                            .map(|price| out.amount * price)
                    })
                    .sum::<Option<Decimal>>();
                (value, self.providers.rank_of(&quote.option.provider_id), quote)
            })
            .collect();
        valued.sort_by(|(a_value, a_rank, _), (b_value, b_rank, _)| {
            b_value
                .cmp(a_value)
                .then(a_rank.cmp(b_rank))
        });
        valued
            .into_iter()
            .map(|(_, _, quote)| quote)
            .collect()
    }

    /// Populates the allowance cache for every spender the quotes need, once per chain, spender
    /// and token.
    async fn fetch_allowances(&self, quotes: &[TransactQuote]) {
        let Some(account) = self.wallet.connected_account() else {
            return;
        };
        let mut by_spender: Vec<((Chain, Address), Vec<Token>)> = Vec::new();
        for allowance in quotes
            .iter()
            .flat_map(|q| q.required_allowances.iter())
        {
            let key = (allowance.token.chain, allowance.spender);
            match by_spender.iter_mut().find(|(k, _)| *k == key) {
                Some((_, tokens)) if tokens.contains(&allowance.token) => {}
                Some((_, tokens)) => tokens.push(allowance.token.clone()),
                None => by_spender.push((key, vec![allowance.token.clone()])),
            }
        }
        for ((chain, spender), tokens) in by_spender {
            if let Err(err) = self
                .allowances
                .fetch_allowances(chain, &spender, &tokens, &account)
                .await
            {
                warn!(%chain, %spender, ?err, "Failed to fetch allowances");
            }
        }
    }

    /// Ranked quotes of the current origin. Empty while stale.
    pub async fn quotes(&self) -> Vec<TransactQuote> {
        let state = self.state.read().await;
        if state.quotes_origin.is_none() || state.quotes_origin != state.origin() {
            return Vec::new();
        }
        state.quotes.clone()
    }

    /// The quote of the selected option, or the best ranked one if no option is pinned.
    pub async fn active_quote(&self) -> Option<TransactQuote> {
        let option_id = self
            .state
            .read()
            .await
            .option_id
            .clone();
        let quotes = self.quotes().await;
        match option_id {
            Some(option_id) => quotes
                .into_iter()
                .find(|quote| quote.option.id == option_id),
            None => quotes.into_iter().next(),
        }
    }

    /// Replaces the cached quote of the same option, e.g. with the fresh quote of a failed
    /// reconfirmation.
    pub async fn replace_quote(&self, quote: TransactQuote) {
        let mut state = self.state.write().await;
        match state
            .quotes
            .iter_mut()
            .find(|cached| cached.option.id == quote.option.id)
        {
            Some(cached) => *cached = quote,
            None => state.quotes.insert(0, quote),
        }
    }
}

/// No negative amounts and at least one positive one.
fn validate_inputs(inputs: &[TokenAmount]) -> TransactResult<()> {
    if let Some(negative) = inputs
        .iter()
        .find(|input| input.amount.is_sign_negative() && !input.amount.is_zero())
    {
        return Err(TransactError::InvalidInput(format!("negative amount {negative}")));
    }
    if !inputs.iter().any(TokenAmount::is_positive) {
        return Err(TransactError::InvalidInput("input amount must be positive".to_string()));
    }
    Ok(())
}
