//! Option, quote and step providers.
//!
//! Every execution path (direct vault, AMM zap, swap aggregator, bridge, migration) implements
//! [`TransactProvider`]. Providers are kept in registration order; that order breaks ranking
//! ties.
use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;
use transact_common::{
    models::{registry::VaultConfig, token::TokenAmount, VaultId},
    traits::{ChainReader, SwapAggregatorApi, WalletTransport},
};

use crate::{
    config::{RegistryStore, SettingsHandle},
    drivers::{VaultDriver, VaultDriverRegistry},
    errors::{TransactError, TransactResult},
    models::{TransactMode, TransactOption, TransactQuote},
    steps::Step,
};

pub mod amm;
pub mod bridge;
pub mod migration;
pub mod swap;
pub mod vault;

pub use amm::AmmZapProvider;
pub use bridge::BridgeProvider;
pub use migration::MigrationProvider;
pub use swap::SwapAggregatorProvider;
pub use vault::VaultProvider;

#[async_trait]
pub trait TransactProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Options this provider offers for the vault and mode, or `None` if it is not eligible.
    ///
    /// Eligibility only depends on static configuration, so implementations cache it per vault
    /// for the whole session.
    async fn fetch_options(
        &self,
        vault_id: &str,
        mode: TransactMode,
    ) -> TransactResult<Option<Vec<TransactOption>>>;

    async fn fetch_quote(
        &self,
        option: &TransactOption,
        inputs: &[TokenAmount],
    ) -> TransactResult<TransactQuote>;

    /// The primary step of a quote.
    async fn fetch_step(&self, quote: &TransactQuote) -> TransactResult<Step>;

    /// Steps that must run before any approval or the primary step can succeed.
    async fn fetch_prerequisite_steps(&self, _quote: &TransactQuote) -> TransactResult<Vec<Step>> {
        Ok(Vec::new())
    }
}

/// Collaborators shared by every provider.
#[derive(Clone)]
pub struct ProviderContext {
    pub registry: Arc<RegistryStore>,
    pub drivers: Arc<VaultDriverRegistry>,
    pub reader: Arc<dyn ChainReader>,
    pub wallet: Arc<dyn WalletTransport>,
    pub aggregator_api: Arc<dyn SwapAggregatorApi>,
    pub settings: SettingsHandle,
}

impl ProviderContext {
    pub async fn vault(&self, vault_id: &str) -> TransactResult<VaultConfig> {
        self.registry.vault(vault_id).await
    }

    pub async fn driver(&self, vault_id: &str) -> TransactResult<Arc<dyn VaultDriver>> {
        self.drivers.driver(vault_id).await
    }
}

/// Ordered set of providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn TransactProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The direct vault path first, then zaps, aggregators, bridges and migrations.
    pub fn with_defaults(ctx: &ProviderContext) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(VaultProvider::new(ctx.clone())));
        registry.register(Arc::new(AmmZapProvider::new(ctx.clone())));
        registry.register(Arc::new(SwapAggregatorProvider::new(ctx.clone())));
        registry.register(Arc::new(BridgeProvider::new(ctx.clone())));
        registry.register(Arc::new(MigrationProvider::new(ctx.clone())));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn TransactProvider>) {
        self.providers.push(provider);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TransactProvider>> {
        self.providers.iter()
    }

    /// Position of a provider in registration order.
    pub fn rank_of(&self, provider_id: &str) -> usize {
        self.providers
            .iter()
            .position(|p| p.id() == provider_id)
            .unwrap_or(usize::MAX)
    }

    /// Resolves the provider that created an option.
    pub fn get(&self, provider_id: &str) -> TransactResult<Arc<dyn TransactProvider>> {
        self.providers
            .iter()
            .find(|p| p.id() == provider_id)
            .cloned()
            .ok_or_else(|| TransactError::UnknownProvider(provider_id.to_string()))
    }
}

/// Rejects options that were not created by `provider_id`.
pub(crate) fn ensure_owned(option: &TransactOption, provider_id: &str) -> TransactResult<()> {
    if option.provider_id != provider_id {
        return Err(TransactError::UnknownOption(format!(
            "option {} belongs to {}, not {provider_id}",
            option.id, option.provider_id
        )));
    }
    Ok(())
}

/// Options of one provider, keyed by vault and mode, along with provider specific details.
///
/// Entries are never invalidated: they derive from static configuration only.
pub(crate) struct OptionCache<D> {
    entries: RwLock<HashMap<(VaultId, TransactMode), Option<Vec<(TransactOption, D)>>>>,
}

impl<D> Default for OptionCache<D> {
    fn default() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }
}

impl<D: Clone> OptionCache<D> {
    /// `None` if the vault and mode were never evaluated, `Some(None)` if they were and the
    /// provider is not eligible.
    pub(crate) async fn options(
        &self,
        vault_id: &str,
        mode: TransactMode,
    ) -> Option<Option<Vec<TransactOption>>> {
        self.entries
            .read()
            .await
            .get(&(vault_id.to_string(), mode))
            .map(|entry| {
                entry.as_ref().map(|options| {
                    options
                        .iter()
                        .map(|(option, _)| option.clone())
                        .collect()
                })
            })
    }

    pub(crate) async fn insert(
        &self,
        vault_id: &str,
        mode: TransactMode,
        entry: Option<Vec<(TransactOption, D)>>,
    ) -> Option<Vec<TransactOption>> {
        let options = entry.as_ref().map(|options| {
            options
                .iter()
                .map(|(option, _)| option.clone())
                .collect()
        });
        self.entries
            .write()
            .await
            .insert((vault_id.to_string(), mode), entry);
        options
    }

    /// Details recorded for an option when it was created.
    pub(crate) async fn detail(&self, option: &TransactOption) -> TransactResult<D> {
        self.entries
            .read()
            .await
            .get(&(option.vault_id.clone(), option.mode))
            .and_then(|entry| entry.as_ref())
            .and_then(|options| {
                options
                    .iter()
                    .find(|(candidate, _)| candidate.id == option.id)
            })
            .map(|(_, detail)| detail.clone())
            .ok_or_else(|| TransactError::UnknownOption(option.id.clone()))
    }
}
