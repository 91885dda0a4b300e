use rust_decimal::Decimal;
use thiserror::Error;
use transact_common::{
    errors::{AmountError, CollaboratorError, WalletError},
    models::{token::Token, TxHash},
};

use crate::models::TransactQuote;

/// Errors surfaced by the transact engine to its caller.
///
/// Only a single provider failing during a quote batch is recovered from locally (the provider is
/// left out of the ranking). Everything else bubbles up, nothing is retried automatically.
#[derive(Error, Debug, Clone)]
pub enum TransactError {
    /// No provider produced an option for the vault and mode.
    #[error("No options available for vault {0}")]
    NoOptionsAvailable(String),
    /// Zero, negative or mismatched input amounts.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Every provider failed to quote the selection.
    #[error("No quote for selection {0}")]
    NoQuoteForSelection(String),
    /// The re-quote drifted beyond tolerance; the user must re-authorize.
    #[error("Confirmation needed: {} output(s) changed", .0.changes.len())]
    ConfirmationNeeded(Box<ConfirmationRequest>),
    /// The re-quote itself failed.
    #[error("Failed to re-confirm quote: {0}")]
    ConfirmationFailed(String),
    #[error("Transaction rejected by wallet: {0}")]
    TransactionRejectedByWallet(String),
    #[error("Transaction {0} reverted")]
    TransactionReverted(TxHash),
    #[error("Failed to submit transaction: {0}")]
    TransactionFailedToSubmit(String),
    #[error("Unknown vault: {0}")]
    UnknownVault(String),
    #[error("Unknown option: {0}")]
    UnknownOption(String),
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    /// A run is already in flight.
    #[error("Stepper is busy")]
    StepperBusy,
    /// The run was reset before its last step confirmed.
    #[error("Run cancelled before it finished")]
    Cancelled,
    #[error("No wallet connected")]
    WalletNotConnected,
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

pub type TransactResult<T> = Result<T, TransactError>;

impl From<AmountError> for TransactError {
    fn from(err: AmountError) -> Self {
        TransactError::Encoding(err.to_string())
    }
}

impl From<WalletError> for TransactError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::Rejected(msg) => TransactError::TransactionRejectedByWallet(msg),
            WalletError::NotConnected => TransactError::WalletNotConnected,
            other => TransactError::TransactionFailedToSubmit(other.to_string()),
        }
    }
}

impl TransactError {
    /// Errors raised by the quote reconfirmation guard. These abort the run and clear the
    /// stepper instead of halting it on the failed step.
    pub fn is_reconfirmation(&self) -> bool {
        matches!(self, TransactError::ConfirmationNeeded(_) | TransactError::ConfirmationFailed(_))
    }
}

/// An output whose re-quoted amount fell below tolerance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChange {
    pub token: Token,
    pub old: Decimal,
    /// Zero when the token is missing from the re-quote.
    pub new: Decimal,
    pub delta: Decimal,
}

/// Payload of a `ConfirmationNeeded` signal.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationRequest {
    pub original: TransactQuote,
    pub requote: TransactQuote,
    pub changes: Vec<OutputChange>,
}
