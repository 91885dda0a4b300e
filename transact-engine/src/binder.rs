//! Submits the transaction of a step, waits for it to be mined and reports each phase to the
//! stepper.
use std::sync::Arc;

use tracing::{error, info, instrument, warn};
use transact_common::{
    models::{
        token::Token,
        transaction::{CallData, TransactionReceipt},
        Address, Chain,
    },
    traits::{AllowanceCache, BalanceCache, WalletTransport},
};

use crate::{
    errors::{TransactError, TransactResult},
    stepper::{Stepper, WalletUpdate},
    steps::{ExecutionContext, RefreshInstructions, StepAction},
};

pub struct TransactionBinder {
    wallet: Arc<dyn WalletTransport>,
    balances: Arc<dyn BalanceCache>,
    allowances: Arc<dyn AllowanceCache>,
    stepper: Arc<Stepper>,
}

impl TransactionBinder {
    pub fn new(
        wallet: Arc<dyn WalletTransport>,
        balances: Arc<dyn BalanceCache>,
        allowances: Arc<dyn AllowanceCache>,
        stepper: Arc<Stepper>,
    ) -> Self {
        Self { wallet, balances, allowances, stepper }
    }

    /// Runs one dispatched step to completion.
    ///
    /// Refreshes run before the stepper sees the confirmation, so observers never see a
    /// confirmed step next to stale balances. Reconfirmation errors are returned without
    /// touching the wallet state: the caller resets the run instead.
    #[instrument(skip(self, action, ctx))]
    pub async fn execute(
        &self,
        step: usize,
        action: Arc<dyn StepAction>,
        ctx: &ExecutionContext,
    ) -> TransactResult<TransactionReceipt> {
        let prepared = match action.prepare(ctx).await {
            Ok(prepared) => prepared,
            Err(err) if err.is_reconfirmation() => return Err(err),
            Err(err) => return Err(self.fail(err).await),
        };

        self.stepper
            .update_wallet(WalletUpdate::AwaitingSignature { context: prepared.refresh.clone() })
            .await;
        let receipt = match self.submit(prepared.call).await {
            Ok(receipt) => receipt,
            Err(err) => return Err(self.fail(err).await),
        };

        if let Some(refresh) = prepared.refresh.as_ref() {
            self.refresh(refresh, &ctx.wallet).await;
        }
        self.stepper
            .update_wallet(WalletUpdate::Confirmed(receipt.clone()))
            .await;
        Ok(receipt)
    }

    async fn submit(&self, call: CallData) -> TransactResult<TransactionReceipt> {
        let chain = call.chain;
        let tx_hash = self.wallet.send_transaction(call).await?;
        info!(%tx_hash, %chain, "Transaction submitted");
        self.stepper
            .update_wallet(WalletUpdate::Submitted(tx_hash))
            .await;

        let receipt = self
            .wallet
            .wait_for_receipt(chain, tx_hash)
            .await
            .map_err(|err| TransactError::TransactionFailedToSubmit(err.to_string()))?;
        if !receipt.is_success() {
            return Err(TransactError::TransactionReverted(tx_hash));
        }
        info!(%tx_hash, block = receipt.block_number, "Transaction mined");
        Ok(receipt)
    }

    async fn fail(&self, err: TransactError) -> TransactError {
        error!(%err, "Step failed");
        self.stepper
            .update_wallet(WalletUpdate::Failed(err.clone()))
            .await;
        err
    }

    /// Refreshes balances per chain, allowances per chain and spender, then vault reserves.
    /// Failures are logged only; the transaction itself succeeded.
    async fn refresh(&self, refresh: &RefreshInstructions, wallet: &Address) {
        let mut balances: Vec<(Chain, Vec<Token>)> = Vec::new();
        for token in &refresh.balances {
            match balances
                .iter_mut()
                .find(|(chain, _)| *chain == token.chain)
            {
                Some((_, tokens)) => tokens.push(token.clone()),
                None => balances.push((token.chain, vec![token.clone()])),
            }
        }
        for (chain, tokens) in balances {
            if let Err(err) = self
                .balances
                .fetch_balances(chain, &tokens, wallet)
                .await
            {
                warn!(%chain, ?err, "Failed to refresh balances");
            }
        }

        let mut allowances: Vec<((Chain, Address), Vec<Token>)> = Vec::new();
        for allowance in &refresh.allowances {
            let key = (allowance.token.chain, allowance.spender);
            match allowances.iter_mut().find(|(k, _)| *k == key) {
                Some((_, tokens)) => tokens.push(allowance.token.clone()),
                None => allowances.push((key, vec![allowance.token.clone()])),
            }
        }
        for ((chain, spender), tokens) in allowances {
            if let Err(err) = self
                .allowances
                .fetch_allowances(chain, &spender, &tokens, wallet)
                .await
            {
                warn!(%chain, %spender, ?err, "Failed to refresh allowances");
            }
        }

        for (chain, vault) in &refresh.vaults {
            if let Err(err) = self
                .balances
                .fetch_vault_reserves(*chain, vault)
                .await
            {
                warn!(%chain, %vault, ?err, "Failed to refresh vault reserves");
            }
        }
    }
}
