pub mod errors;
pub mod models;
pub mod traits;

pub use alloy_primitives::{Address, Bytes, U256};
pub use rust_decimal::Decimal;
