use std::{collections::HashMap, fs, path::Path, sync::Arc};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use transact_common::{
    errors::CollaboratorError,
    models::{
        registry::{
            AddressBook, AmmConfig, BridgeConfig, FeeSchedule, MigratorConfig,
            SwapAggregatorConfig, VaultConfig,
        },
        Chain, VaultId,
    },
    traits::ConfigSource,
};

use crate::errors::{TransactError, TransactResult};

/// Largest slippage tolerance a user may configure.
const MAX_SLIPPAGE: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

fn default_slippage() -> Decimal {
    Decimal::new(1, 2)
}

fn default_drift_share() -> Decimal {
    Decimal::new(1, 1)
}

/// Runtime settings read by step actions at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactSettings {
    /// Fraction of an output the user accepts to lose to price movement, e.g. `0.01` for 1%.
    #[serde(default = "default_slippage")]
    pub slippage_tolerance: Decimal,
    /// Share of the slippage budget tolerated as drift between the reviewed quote and the
    /// re-quote taken right before signing. The remainder is left for execution.
    #[serde(default = "default_drift_share")]
    pub reconfirm_drift_share: Decimal,
}

impl Default for TransactSettings {
    fn default() -> Self {
        Self {
            slippage_tolerance: default_slippage(),
            reconfirm_drift_share: default_drift_share(),
        }
    }
}

impl TransactSettings {
    pub fn validate(&self) -> TransactResult<()> {
        if self.slippage_tolerance <= Decimal::ZERO || self.slippage_tolerance > MAX_SLIPPAGE {
            return Err(TransactError::Config(format!(
                "slippage tolerance {} outside (0, {MAX_SLIPPAGE}]",
                self.slippage_tolerance
            )));
        }
        if self.reconfirm_drift_share < Decimal::ZERO || self.reconfirm_drift_share > Decimal::ONE
        {
            return Err(TransactError::Config(format!(
                "reconfirm drift share {} outside [0, 1]",
                self.reconfirm_drift_share
            )));
        }
        Ok(())
    }

    /// Lowest ratio of re-quoted to originally quoted output that proceeds without asking the
    /// user again.
    pub fn min_allowed_ratio(&self) -> Decimal {
        Decimal::ONE - self.slippage_tolerance * self.reconfirm_drift_share
    }
}

/// Shared, mutable handle on the settings.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle(Arc<RwLock<TransactSettings>>);

impl SettingsHandle {
    pub fn new(settings: TransactSettings) -> TransactResult<Self> {
        settings.validate()?;
        Ok(Self(Arc::new(RwLock::new(settings))))
    }

    pub async fn get(&self) -> TransactSettings {
        *self.0.read().await
    }

    pub async fn set_slippage_tolerance(&self, slippage: Decimal) -> TransactResult<()> {
        let mut guard = self.0.write().await;
        let updated = TransactSettings { slippage_tolerance: slippage, ..*guard };
        updated.validate()?;
        *guard = updated;
        Ok(())
    }
}

/// The document behind [`YamlConfigSource`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub settings: TransactSettings,
    #[serde(default)]
    pub vaults: Vec<VaultConfig>,
    #[serde(default)]
    pub address_books: Vec<AddressBook>,
    #[serde(default)]
    pub amms: Vec<AmmConfig>,
    #[serde(default)]
    pub swap_aggregators: Vec<SwapAggregatorConfig>,
    #[serde(default)]
    pub bridges: Vec<BridgeConfig>,
    #[serde(default)]
    pub migrators: Vec<MigratorConfig>,
    #[serde(default)]
    pub fees: FeeSchedule,
}

/// A configuration source backed by a static yaml document.
#[derive(Debug, Clone)]
pub struct YamlConfigSource {
    file: RegistryFile,
}

impl YamlConfigSource {
    pub fn from_yaml(path: impl AsRef<Path>) -> TransactResult<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            TransactError::Config(format!("reading {}: {e}", path.as_ref().display()))
        })?;
        Self::from_str(&contents)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> TransactResult<Self> {
        let file: RegistryFile =
            serde_yaml::from_str(contents).map_err(|e| TransactError::Config(e.to_string()))?;
        file.settings.validate()?;
        Ok(Self { file })
    }

    pub fn settings(&self) -> TransactSettings {
        self.file.settings
    }
}

#[async_trait]
impl ConfigSource for YamlConfigSource {
    async fn load_vaults(&self) -> Result<Vec<VaultConfig>, CollaboratorError> {
        Ok(self.file.vaults.clone())
    }

    async fn load_address_books(&self) -> Result<Vec<AddressBook>, CollaboratorError> {
        Ok(self.file.address_books.clone())
    }

    async fn load_amms(&self) -> Result<Vec<AmmConfig>, CollaboratorError> {
        Ok(self.file.amms.clone())
    }

    async fn load_swap_aggregators(&self) -> Result<Vec<SwapAggregatorConfig>, CollaboratorError> {
        Ok(self.file.swap_aggregators.clone())
    }

    async fn load_bridges(&self) -> Result<Vec<BridgeConfig>, CollaboratorError> {
        Ok(self.file.bridges.clone())
    }

    async fn load_migrators(&self) -> Result<Vec<MigratorConfig>, CollaboratorError> {
        Ok(self.file.migrators.clone())
    }

    async fn load_fee_schedule(&self) -> Result<FeeSchedule, CollaboratorError> {
        Ok(self.file.fees.clone())
    }
}

#[derive(Default)]
struct Registry {
    vaults: Option<HashMap<VaultId, VaultConfig>>,
    address_books: Option<HashMap<Chain, AddressBook>>,
    amms: Option<HashMap<String, AmmConfig>>,
    swap_aggregators: Option<Vec<SwapAggregatorConfig>>,
    bridges: Option<Vec<BridgeConfig>>,
    migrators: Option<Vec<MigratorConfig>>,
    fees: Option<FeeSchedule>,
}

/// In-memory registry of the static configuration every driver reads.
///
/// Each resource is loaded at most once. The `None` state of a resource is its "not loaded yet"
/// flag, so repeated `ensure_loaded` calls never go back to the source.
pub struct RegistryStore {
    source: Arc<dyn ConfigSource>,
    inner: RwLock<Registry>,
}

fn not_loaded(resource: &str) -> TransactError {
    TransactError::Config(format!("{resource} not loaded"))
}

impl RegistryStore {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self { source, inner: RwLock::new(Registry::default()) }
    }

    /// Loads every resource that has not been loaded yet.
    pub async fn ensure_loaded(&self) -> TransactResult<()> {
        let mut registry = self.inner.write().await;
        if registry.vaults.is_none() {
            let vaults = self.source.load_vaults().await?;
            info!(count = vaults.len(), "Loaded vaults");
            registry.vaults = Some(
                vaults
                    .into_iter()
                    .map(|v| (v.id.clone(), v))
                    .collect(),
            );
        }
        if registry.address_books.is_none() {
            let books = self.source.load_address_books().await?;
            debug!(count = books.len(), "Loaded address books");
            registry.address_books = Some(
                books
                    .into_iter()
                    .map(|b| (b.chain, b))
                    .collect(),
            );
        }
        if registry.amms.is_none() {
            let amms = self.source.load_amms().await?;
            debug!(count = amms.len(), "Loaded amms");
            registry.amms = Some(
                amms.into_iter()
                    .map(|a| (a.id.clone(), a))
                    .collect(),
            );
        }
        if registry.swap_aggregators.is_none() {
            registry.swap_aggregators = Some(self.source.load_swap_aggregators().await?);
        }
        if registry.bridges.is_none() {
            registry.bridges = Some(self.source.load_bridges().await?);
        }
        if registry.migrators.is_none() {
            registry.migrators = Some(self.source.load_migrators().await?);
        }
        if registry.fees.is_none() {
            registry.fees = Some(self.source.load_fee_schedule().await?);
        }
        Ok(())
    }

    pub async fn vault(&self, vault_id: &str) -> TransactResult<VaultConfig> {
        self.inner
            .read()
            .await
            .vaults
            .as_ref()
            .ok_or_else(|| not_loaded("vaults"))?
            .get(vault_id)
            .cloned()
            .ok_or_else(|| TransactError::UnknownVault(vault_id.to_string()))
    }

    pub async fn address_book(&self, chain: Chain) -> TransactResult<AddressBook> {
        self.inner
            .read()
            .await
            .address_books
            .as_ref()
            .ok_or_else(|| not_loaded("address books"))?
            .get(&chain)
            .cloned()
            .ok_or_else(|| TransactError::Config(format!("no address book for {chain}")))
    }

    pub async fn amm(&self, amm_id: &str) -> TransactResult<AmmConfig> {
        self.inner
            .read()
            .await
            .amms
            .as_ref()
            .ok_or_else(|| not_loaded("amms"))?
            .get(amm_id)
            .cloned()
            .ok_or_else(|| TransactError::Config(format!("unknown amm {amm_id}")))
    }

    pub async fn swap_aggregators(
        &self,
        chain: Chain,
    ) -> TransactResult<Vec<SwapAggregatorConfig>> {
        Ok(self
            .inner
            .read()
            .await
            .swap_aggregators
            .as_ref()
            .ok_or_else(|| not_loaded("swap aggregators"))?
            .iter()
            .filter(|a| a.chain == chain)
            .cloned()
            .collect())
    }

    pub async fn bridges(&self) -> TransactResult<Vec<BridgeConfig>> {
        self.inner
            .read()
            .await
            .bridges
            .clone()
            .ok_or_else(|| not_loaded("bridges"))
    }

    pub async fn migrators_for(&self, vault_id: &str) -> TransactResult<Vec<MigratorConfig>> {
        Ok(self
            .inner
            .read()
            .await
            .migrators
            .as_ref()
            .ok_or_else(|| not_loaded("migrators"))?
            .iter()
            .filter(|m| m.vault_id == vault_id)
            .cloned()
            .collect())
    }

    pub async fn fees(&self) -> TransactResult<FeeSchedule> {
        self.inner
            .read()
            .await
            .fees
            .clone()
            .ok_or_else(|| not_loaded("fee schedule"))
    }
}
