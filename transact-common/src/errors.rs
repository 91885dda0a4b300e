use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised while converting between decimal token amounts and on-chain integers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Amount overflows the on-chain representation: {0}")]
    Overflow(String),
    #[error("Negative amount: {0}")]
    Negative(Decimal),
    #[error("Unsupported token decimals: {0}")]
    UnsupportedDecimals(u32),
}

/// Errors reported by the external collaborators (caches, oracles, chain reads, config).
///
/// Variants:
/// - `NotFound`: The requested entity is unknown to the collaborator.
/// - `Transport`: The collaborator could not be reached or its response was malformed.
/// - `Config`: Static configuration could not be loaded or is inconsistent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error(transparent)]
    Amount(#[from] AmountError),
}

/// Errors reported by the wallet / signing transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// The user declined to sign.
    #[error("Rejected by wallet: {0}")]
    Rejected(String),
    /// The transaction could not be broadcast.
    #[error("Failed to submit: {0}")]
    Submit(String),
    /// The transaction was broadcast but waiting for its receipt failed.
    #[error("Failed to fetch receipt: {0}")]
    Receipt(String),
    #[error("No wallet connected")]
    NotConnected,
}
