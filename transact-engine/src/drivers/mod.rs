//! Vault strategy drivers: the direct, non-zapped deposit and withdraw path of each vault kind.
//!
//! Exactly one driver is bound to one vault. It resolves the vault's tokens once on
//! construction and keeps them for its lifetime.
use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::debug;
use transact_common::{
    models::{
        registry::{AddressBook, VaultConfig, VaultKind},
        token::{amount_from_wei, Token, TokenAmount},
        Address, Bytes, VaultId, U256,
    },
    traits::{ChainReader, WalletTransport},
};

use crate::{
    config::RegistryStore,
    errors::{TransactError, TransactResult},
    models::{QuoteLeg, TransactOption, TransactQuote},
    steps::Step,
};

pub mod clm;
pub mod gov;
pub mod standard;

pub use clm::ClmVaultDriver;
pub use gov::GovVaultDriver;
pub use standard::StandardVaultDriver;

/// Provider id under which the direct vault path is registered.
pub const VAULT_PROVIDER_ID: &str = "vault";

/// Shares minted for a deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositEstimate {
    pub shares: TokenAmount,
    /// Inputs the vault did not take.
    pub returned: Vec<TokenAmount>,
}

/// Shares burned and tokens received for a withdrawal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawEstimate {
    pub shares: TokenAmount,
    pub outputs: Vec<TokenAmount>,
}

/// A vault call embedded in a zap router route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapCall {
    pub target: Address,
    pub data: Bytes,
    /// Calldata offset the router writes its token balance to, or a negative value for none.
    pub inject_index: i32,
}

#[async_trait]
pub trait VaultDriver: Send + Sync {
    fn vault(&self) -> &VaultConfig;

    fn deposit_tokens(&self) -> &[Token];

    fn share_token(&self) -> &Token;

    async fn fetch_deposit_option(&self) -> TransactResult<TransactOption>;

    async fn fetch_deposit_quote(
        &self,
        option: &TransactOption,
        inputs: &[TokenAmount],
    ) -> TransactResult<TransactQuote>;

    async fn fetch_deposit_step(&self, quote: &TransactQuote) -> TransactResult<Step>;

    async fn fetch_withdraw_option(&self) -> TransactResult<TransactOption>;

    async fn fetch_withdraw_quote(
        &self,
        option: &TransactOption,
        inputs: &[TokenAmount],
    ) -> TransactResult<TransactQuote>;

    async fn fetch_withdraw_step(&self, quote: &TransactQuote) -> TransactResult<Step>;

    /// Shares minted for depositing `inputs`, net of fees. Used by providers that end in a
    /// deposit.
    async fn estimate_deposit(&self, inputs: &[TokenAmount]) -> TransactResult<DepositEstimate>;

    /// Shares burned and deposit tokens received when withdrawing `input`, expressed in deposit
    /// token units.
    async fn estimate_withdraw(&self, input: &TokenAmount) -> TransactResult<WithdrawEstimate>;

    /// Deposit call for the zap router, if the vault can be entered through it.
    fn zap_deposit_call(&self) -> Option<ZapCall> {
        None
    }

    /// Withdraw call for the zap router, if the vault can be exited through it.
    fn zap_withdraw_call(&self) -> Option<ZapCall> {
        None
    }
}

/// Checks that `inputs` is exactly one positive amount of `expected`.
pub(crate) fn single_input<'a>(
    inputs: &'a [TokenAmount],
    expected: &Token,
) -> TransactResult<&'a TokenAmount> {
    let [input] = inputs else {
        return Err(TransactError::InvalidInput(format!(
            "expected a single input, got {}",
            inputs.len()
        )));
    };
    if &input.token != expected {
        return Err(TransactError::InvalidInput(format!(
            "input token {} does not match {}",
            input.token, expected
        )));
    }
    if !input.is_positive() {
        return Err(TransactError::InvalidInput(format!("input amount {}", input.amount)));
    }
    Ok(input)
}

/// Converts a 1e18 scaled on-chain ratio into a decimal.
pub(crate) fn ratio_from_wei(raw: U256) -> TransactResult<Decimal> {
    Ok(amount_from_wei(raw, 18)?)
}

pub(crate) fn checked_div(a: Decimal, b: Decimal) -> TransactResult<Decimal> {
    a.checked_div(b)
        .ok_or_else(|| TransactError::Encoding(format!("{a} / {b}")))
}

pub(crate) fn resolve_token(book: &AddressBook, address: &Address) -> TransactResult<Token> {
    book.token(address).ok_or_else(|| {
        TransactError::Config(format!("token {address} missing from {} address book", book.chain))
    })
}

/// Finds the shares burned by a quote's withdraw leg.
pub(crate) fn withdrawn_shares(quote: &TransactQuote) -> TransactResult<&TokenAmount> {
    quote
        .legs
        .iter()
        .find_map(|leg| match leg {
            QuoteLeg::Withdraw { shares, .. } => Some(shares),
            _ => None,
        })
        .ok_or_else(|| {
            TransactError::InvalidInput(format!("quote {} has no withdraw leg", quote.id))
        })
}

/// Creates drivers on first use and keeps one per vault for the session.
pub struct VaultDriverRegistry {
    registry: Arc<RegistryStore>,
    reader: Arc<dyn ChainReader>,
    wallet: Arc<dyn WalletTransport>,
    drivers: RwLock<HashMap<VaultId, Arc<dyn VaultDriver>>>,
}

impl VaultDriverRegistry {
    pub fn new(
        registry: Arc<RegistryStore>,
        reader: Arc<dyn ChainReader>,
        wallet: Arc<dyn WalletTransport>,
    ) -> Self {
        Self { registry, reader, wallet, drivers: RwLock::new(HashMap::new()) }
    }

    pub async fn driver(&self, vault_id: &str) -> TransactResult<Arc<dyn VaultDriver>> {
        if let Some(driver) = self.drivers.read().await.get(vault_id) {
            return Ok(driver.clone());
        }

        let vault = self.registry.vault(vault_id).await?;
        let book = self
            .registry
            .address_book(vault.chain)
            .await?;
        debug!(vault_id, kind = ?vault.kind, "Creating vault driver");
        let driver: Arc<dyn VaultDriver> = match vault.kind {
            VaultKind::Standard => {
                Arc::new(StandardVaultDriver::new(vault, &book, self.reader.clone())?)
            }
            VaultKind::Gov => Arc::new(GovVaultDriver::new(
                vault,
                &book,
                self.reader.clone(),
                self.wallet.clone(),
            )?),
            VaultKind::Clm => Arc::new(ClmVaultDriver::new(vault, &book, self.reader.clone())?),
        };

        let mut drivers = self.drivers.write().await;
        Ok(drivers
            .entry(vault_id.to_string())
            .or_insert(driver)
            .clone())
    }
}

#[cfg(test)]
mod test {
    use rust_decimal_macros::dec;
    use transact_common::models::Chain;

    use super::*;

    fn token(byte: u8) -> Token {
        Token::new(Chain::Ethereum, Address::repeat_byte(byte), "TKN", 18)
    }

    #[test]
    fn test_single_input_rejects_bad_inputs() {
        let expected = token(1);

        assert!(single_input(&[], &expected).is_err());
        assert!(single_input(&[TokenAmount::new(token(2), dec!(1))], &expected).is_err());
        assert!(single_input(&[TokenAmount::new(token(1), dec!(0))], &expected).is_err());
        assert!(single_input(
            &[TokenAmount::new(token(1), dec!(1)), TokenAmount::new(token(1), dec!(1))],
            &expected
        )
        .is_err());
        assert!(single_input(&[TokenAmount::new(token(1), dec!(1))], &expected).is_ok());
    }

    #[test]
    fn test_ratio_from_wei() {
        let raw = U256::from(1_500_000_000_000_000_000u128);

        assert_eq!(ratio_from_wei(raw).unwrap(), dec!(1.5));
    }
}
