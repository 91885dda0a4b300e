use std::fmt;

use alloy_primitives::keccak256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use transact_common::models::{
    token::{Token, TokenAllowance, TokenAmount},
    Address, Chain, ProviderId, VaultId,
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactMode {
    Deposit,
    Withdraw,
}

impl fmt::Display for TransactMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactMode::Deposit => f.write_str("deposit"),
            TransactMode::Withdraw => f.write_str("withdraw"),
        }
    }
}

/// Derives the selection id of a token set: the chain plus the sorted token addresses.
///
/// Two options share a selection when the user picked the same tokens, which is how a quote is
/// detected to be stale after the user changed inputs.
pub fn selection_id(tokens: &[Token]) -> String {
    let chain = tokens
        .first()
        .map(|t| t.chain.to_string())
        .unwrap_or_default();
    let mut addresses: Vec<String> = tokens
        .iter()
        .map(|t| format!("{}", t.address).to_lowercase())
        .collect();
    addresses.sort();
    format!("{chain}:{}", addresses.join("-"))
}

/// A way of executing a deposit into or a withdrawal from a vault.
///
/// Options are structural: the id is a hash over the provider, vault, mode and selection, so the
/// same provider always yields the same id for the same token choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactOption {
    pub id: String,
    pub provider_id: ProviderId,
    pub vault_id: VaultId,
    /// The vault's chain.
    pub chain: Chain,
    pub mode: TransactMode,
    pub selection_id: String,
    pub inputs: Vec<Token>,
    pub wanted_outputs: Vec<Token>,
}

impl TransactOption {
    pub fn new(
        provider_id: &str,
        vault_id: &str,
        chain: Chain,
        mode: TransactMode,
        inputs: Vec<Token>,
        wanted_outputs: Vec<Token>,
    ) -> Self {
        let selection_id = match mode {
            TransactMode::Deposit => selection_id(&inputs),
            TransactMode::Withdraw => selection_id(&wanted_outputs),
        };
        let preimage = format!("{provider_id}|{vault_id}|{mode}|{selection_id}");
        let id = hex::encode(&keccak256(preimage.as_bytes())[..16]);
        Self {
            id,
            provider_id: provider_id.to_string(),
            vault_id: vault_id.to_string(),
            chain,
            mode,
            selection_id,
            inputs,
            wanted_outputs,
        }
    }
}

/// Informational route segments of a quote, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuoteLeg {
    Swap { from: TokenAmount, to: TokenAmount, via: String },
    BuildLp { inputs: Vec<TokenAmount>, lp: TokenAmount },
    SplitLp { lp: TokenAmount, outputs: Vec<TokenAmount> },
    Deposit { inputs: Vec<TokenAmount>, shares: TokenAmount },
    Withdraw { shares: TokenAmount, outputs: Vec<TokenAmount> },
    Unstake { pool: Address, amount: TokenAmount },
    Bridge { bridge: String, from: TokenAmount, to: TokenAmount },
    Claim { reward: TokenAmount },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteFee {
    /// Fraction of the input taken as fee.
    pub rate: Decimal,
    pub amount: TokenAmount,
}

/// A priced answer of one provider for one option and input amounts.
///
/// Quotes are immutable; a later fetch supersedes but never mutates an earlier quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactQuote {
    pub id: String,
    pub option: TransactOption,
    pub inputs: Vec<TokenAmount>,
    pub outputs: Vec<TokenAmount>,
    /// Input dust handed back to the user.
    pub returned: Vec<TokenAmount>,
    pub required_allowances: Vec<TokenAllowance>,
    pub price_impact: Option<Decimal>,
    pub fee: Option<QuoteFee>,
    pub legs: Vec<QuoteLeg>,
}

impl TransactQuote {
    pub fn new(
        option: &TransactOption,
        inputs: Vec<TokenAmount>,
        outputs: Vec<TokenAmount>,
    ) -> Self {
        Self {
            id: format!("{}-{}", option.id, Uuid::new_v4()),
            option: option.clone(),
            inputs,
            outputs,
            returned: Vec::new(),
            required_allowances: Vec::new(),
            price_impact: None,
            fee: None,
            legs: Vec::new(),
        }
    }

    pub fn with_allowances(mut self, allowances: Vec<TokenAllowance>) -> Self {
        self.required_allowances = allowances;
        self
    }

    pub fn with_returned(mut self, returned: Vec<TokenAmount>) -> Self {
        self.returned = returned;
        self
    }

    pub fn with_legs(mut self, legs: Vec<QuoteLeg>) -> Self {
        self.legs = legs;
        self
    }

    pub fn with_price_impact(mut self, price_impact: Decimal) -> Self {
        self.price_impact = Some(price_impact);
        self
    }

    pub fn with_fee(mut self, fee: QuoteFee) -> Self {
        self.fee = Some(fee);
        self
    }

    pub fn option_id(&self) -> &str {
        &self.option.id
    }

    /// The chain the transactions are sent on. Differs from the vault's chain for bridged
    /// deposits.
    pub fn execution_chain(&self) -> Chain {
        self.inputs
            .first()
            .map(|input| input.token.chain)
            .unwrap_or(self.option.chain)
    }

    /// Whether the user asked to move the entire balance.
    pub fn is_max(&self) -> bool {
        self.inputs.iter().any(|input| input.max)
    }

    pub fn output_of(&self, token: &Token) -> Option<&TokenAmount> {
        self.outputs
            .iter()
            .find(|output| &output.token == token)
    }
}

/// Allowances for native tokens are never required; positive ERC20 inputs need one.
pub fn allowances_for(inputs: &[TokenAmount], spender: Address) -> Vec<TokenAllowance> {
    inputs
        .iter()
        .filter(|input| !input.token.is_native() && input.is_positive())
        .map(|input| TokenAllowance::new(input.token.clone(), input.amount, spender))
        .collect()
}
