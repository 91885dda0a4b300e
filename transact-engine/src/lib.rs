//! Vault transact engine.
//!
//! Lists the ways a user can deposit into or withdraw from a vault, quotes them, turns the
//! chosen quote into an ordered list of on-chain steps and executes those steps one by one
//! against a wallet. See [`Transact`] for the caller facing entry point.
pub mod binder;
pub mod config;
pub mod contracts;
pub mod drivers;
pub mod engine;
pub mod errors;
pub mod models;
pub mod providers;
pub mod stepper;
pub mod steps;
pub mod transact;

#[cfg(test)]
pub mod test_fixtures;

pub use config::{SettingsHandle, TransactSettings, YamlConfigSource};
pub use engine::{QuoteEngine, QuoteFetchOutcome};
pub use errors::{TransactError, TransactResult};
pub use models::{TransactMode, TransactOption, TransactQuote};
pub use stepper::{StepperPhase, StepperState, TransactEvent};
pub use transact::{Transact, TransactDeps};
