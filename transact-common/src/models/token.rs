use std::{
    fmt,
    hash::{Hash, Hasher},
};

use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Serialize};

use super::{Address, Chain, U256};
use crate::errors::AmountError;

/// The largest number of decimals a `Decimal` can represent without losing its scale.
const MAX_DECIMALS: u32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// The gas token of a chain, addressed by the zero address marker.
    Native,
    #[default]
    Erc20,
}

/// A chain scoped token.
///
/// Two tokens are equal if they live on the same chain, at the same address and are of the same
/// kind. The symbol and decimals are informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub chain: Chain,
    pub address: Address,
    pub symbol: String,
    pub decimals: u32,
    #[serde(default)]
    pub kind: TokenKind,
}

impl Token {
    pub fn new(chain: Chain, address: Address, symbol: &str, decimals: u32) -> Self {
        Self { chain, address, symbol: symbol.to_string(), decimals, kind: TokenKind::Erc20 }
    }

    /// The native gas token of `chain`.
    pub fn native(chain: Chain, symbol: &str, decimals: u32) -> Self {
        Self {
            chain,
            address: Address::ZERO,
            symbol: symbol.to_string(),
            decimals,
            kind: TokenKind::Native,
        }
    }

    pub fn is_native(&self) -> bool {
        self.kind == TokenKind::Native
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.chain == other.chain && self.address == other.address && self.kind == other.kind
    }
}

impl Eq for Token {}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.chain.hash(state);
        self.address.hash(state);
        self.kind.hash(state);
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.chain)
    }
}

/// An amount of a token in whole token units (not wei).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAmount {
    pub token: Token,
    pub amount: Decimal,
    /// Set when the amount stands for the holder's entire balance. Steps may then prefer a
    /// balance draining call over a fixed amount so that balance drift between quote and
    /// execution cannot make the transaction revert or leave dust behind.
    #[serde(default)]
    pub max: bool,
}

impl TokenAmount {
    pub fn new(token: Token, amount: Decimal) -> Self {
        Self { token, amount, max: false }
    }

    pub fn max(token: Token, amount: Decimal) -> Self {
        Self { token, amount, max: true }
    }

    pub fn zero(token: Token) -> Self {
        Self::new(token, Decimal::ZERO)
    }

    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    /// Converts the amount to its on-chain integer representation, truncating any precision
    /// beyond the token's decimals.
    pub fn to_wei(&self) -> Result<U256, AmountError> {
        to_wei(self.amount, self.token.decimals)
    }

    /// Builds an amount from an on-chain integer.
    pub fn from_wei(token: Token, raw: U256) -> Result<Self, AmountError> {
        let amount = amount_from_wei(raw, token.decimals)?;
        Ok(Self::new(token, amount))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount.normalize(), self.token.symbol)?;
        if self.max {
            write!(f, " (max)")?;
        }
        Ok(())
    }
}

/// An allowance that must be in place before a transaction can pull `amount` of `token`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAllowance {
    pub token: Token,
    pub amount: Decimal,
    pub spender: Address,
}

impl TokenAllowance {
    pub fn new(token: Token, amount: Decimal, spender: Address) -> Self {
        Self { token, amount, spender }
    }
}

fn pow10(decimals: u32) -> Result<Decimal, AmountError> {
    if decimals > MAX_DECIMALS {
        return Err(AmountError::UnsupportedDecimals(decimals));
    }
    Decimal::try_from_i128_with_scale(10i128.pow(decimals), 0)
        .map_err(|e| AmountError::Overflow(e.to_string()))
}

/// Converts a decimal amount of a token with `decimals` into wei.
pub fn to_wei(amount: Decimal, decimals: u32) -> Result<U256, AmountError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(AmountError::Negative(amount));
    }
    let scaled = amount
        .checked_mul(pow10(decimals)?)
        .ok_or_else(|| AmountError::Overflow(format!("{amount} * 10^{decimals}")))?;
    let raw = scaled
        .trunc()
        .to_u128()
        .ok_or_else(|| AmountError::Overflow(scaled.to_string()))?;
    Ok(U256::from(raw))
}

/// Converts a wei amount of a token with `decimals` into a decimal amount.
pub fn amount_from_wei(raw: U256, decimals: u32) -> Result<Decimal, AmountError> {
    if decimals > MAX_DECIMALS {
        return Err(AmountError::UnsupportedDecimals(decimals));
    }
    let raw: u128 = raw
        .try_into()
        .map_err(|_| AmountError::Overflow(raw.to_string()))?;
    let raw = i128::try_from(raw).map_err(|_| AmountError::Overflow(raw.to_string()))?;
    Decimal::try_from_i128_with_scale(raw, decimals)
        .map(|d| d.normalize())
        .map_err(|e| AmountError::Overflow(e.to_string()))
}
