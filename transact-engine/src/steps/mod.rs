//! Steps: single on-chain operations the stepper executes in order.
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use transact_common::models::{
    token::{to_wei, Token, TokenAllowance},
    transaction::CallData,
    Address, Chain,
};

use crate::{
    contracts::encode_approve,
    errors::TransactResult,
    models::TransactQuote,
};

pub mod builder;
pub mod guard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Approve,
    Unstake,
    Deposit,
    Withdraw,
    ZapIn,
    ZapOut,
    Bridge,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepKind::Approve => "approve",
            StepKind::Unstake => "unstake",
            StepKind::Deposit => "deposit",
            StepKind::Withdraw => "withdraw",
            StepKind::ZapIn => "zap_in",
            StepKind::ZapOut => "zap_out",
            StepKind::Bridge => "bridge",
        };
        f.write_str(name)
    }
}

/// Values only known when a step is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub wallet: Address,
    pub slippage: Decimal,
    pub drift_share: Decimal,
}

impl ExecutionContext {
    /// Lowers `amount` by the slippage tolerance.
    pub fn min_amount(&self, amount: Decimal) -> Decimal {
        amount * (Decimal::ONE - self.slippage)
    }
}

/// What to refresh once a transaction is mined successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshInstructions {
    /// Tokens whose wallet balance changed. May span chains for bridged deposits.
    pub balances: Vec<Token>,
    pub allowances: Vec<TokenAllowance>,
    /// Vaults whose reserves changed.
    pub vaults: Vec<(Chain, Address)>,
}

impl RefreshInstructions {
    /// Everything a quote touched: its inputs, outputs and dust, the spenders it approved and
    /// the vault it moved funds in or out of.
    pub fn for_quote(quote: &TransactQuote, vault: Address) -> Self {
        let mut balances: Vec<Token> = Vec::new();
        for amount in quote
            .inputs
            .iter()
            .chain(quote.outputs.iter())
            .chain(quote.returned.iter())
        {
            if !balances.contains(&amount.token) {
                balances.push(amount.token.clone());
            }
        }
        Self {
            balances,
            allowances: quote.required_allowances.clone(),
            vaults: vec![(quote.option.chain, vault)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTransaction {
    pub call: CallData,
    pub refresh: Option<RefreshInstructions>,
}

/// The unit of work behind a step: produces the transaction to sign.
///
/// Actions run at execution time, so anything slippage bounded is computed here and not when
/// the quote was taken.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn prepare(&self, ctx: &ExecutionContext) -> TransactResult<PreparedTransaction>;
}

/// An action whose transaction is fully known upfront.
pub struct FixedCallAction {
    call: CallData,
    refresh: Option<RefreshInstructions>,
}

impl FixedCallAction {
    pub fn new(call: CallData, refresh: Option<RefreshInstructions>) -> Self {
        Self { call, refresh }
    }
}

#[async_trait]
impl StepAction for FixedCallAction {
    async fn prepare(&self, _ctx: &ExecutionContext) -> TransactResult<PreparedTransaction> {
        Ok(PreparedTransaction { call: self.call.clone(), refresh: self.refresh.clone() })
    }
}

/// Approves exactly the required amount. Once mined, only the approved allowance is refreshed.
pub struct ApproveAction {
    allowance: TokenAllowance,
}

impl ApproveAction {
    pub fn new(allowance: TokenAllowance) -> Self {
        Self { allowance }
    }
}

#[async_trait]
impl StepAction for ApproveAction {
    async fn prepare(&self, _ctx: &ExecutionContext) -> TransactResult<PreparedTransaction> {
        let token = &self.allowance.token;
        let amount = to_wei(self.allowance.amount, token.decimals)?;
        let data = encode_approve(self.allowance.spender, amount);
        let call = CallData::new(token.chain, token.address, data);
        let refresh = RefreshInstructions {
            allowances: vec![self.allowance.clone()],
            ..Default::default()
        };
        Ok(PreparedTransaction { call, refresh: Some(refresh) })
    }
}

/// One entry of a stepper run.
#[derive(Clone)]
pub struct Step {
    pub kind: StepKind,
    /// Message shown to the user while the step is active.
    pub message: String,
    pub chain: Chain,
    pub action: Arc<dyn StepAction>,
    /// Set once when the action is dispatched, never cleared.
    pub pending: bool,
}

impl Step {
    pub fn new(
        kind: StepKind,
        message: impl Into<String>,
        chain: Chain,
        action: Arc<dyn StepAction>,
    ) -> Self {
        Self { kind, message: message.into(), chain, action, pending: false }
    }

    pub fn approve(allowance: TokenAllowance) -> Self {
        let message =
            format!("Approve {} {}", allowance.amount.normalize(), allowance.token.symbol);
        let chain = allowance.token.chain;
        Self::new(StepKind::Approve, message, chain, Arc::new(ApproveAction::new(allowance)))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("chain", &self.chain)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use alloy_sol_types::SolCall;
    use rust_decimal_macros::dec;
    use test_log::test;
    use transact_common::models::U256;

    use super::*;
    use crate::contracts::{selector, IERC20};

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            wallet: Address::repeat_byte(0xee),
            slippage: dec!(0.01),
            drift_share: dec!(0.1),
        }
    }

    #[test(tokio::test)]
    async fn test_approve_action_encodes_exact_amount() {
        let usdc = Token::new(Chain::Ethereum, Address::repeat_byte(1), "USDC", 6);
        let allowance = TokenAllowance::new(usdc, dec!(50), Address::repeat_byte(2));
        let step = Step::approve(allowance.clone());

        let prepared = step.action.prepare(&ctx()).await.unwrap();

        assert_eq!(step.kind, StepKind::Approve);
        assert_eq!(step.message, "Approve 50 USDC");
        assert_eq!(prepared.call.to, Address::repeat_byte(1));
        assert_eq!(selector(&prepared.call.data), Some(IERC20::approveCall::SELECTOR));
        assert_eq!(U256::from_be_slice(&prepared.call.data[36..68]), U256::from(50_000_000u64));
        let refresh = prepared.refresh.unwrap();
        assert_eq!(refresh.allowances, vec![allowance]);
        assert!(refresh.balances.is_empty());
        assert!(refresh.vaults.is_empty());
    }

    #[test]
    fn test_min_amount() {
        assert_eq!(ctx().min_amount(dec!(200)), dec!(198));
    }
}
