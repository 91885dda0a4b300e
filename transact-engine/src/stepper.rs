//! Sequential executor state for one run of steps.
//!
//! The stepper only holds state; it never dispatches work on its own. The caller pulls the
//! next action with [`Stepper::next_action`] and the transaction binder reports wallet phase
//! changes back through [`Stepper::update_wallet`]. A confirmed phase advances the run, a
//! failed one halts it until the next [`Stepper::reset`].
use std::sync::{Arc, RwLock as StdRwLock};

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use transact_common::models::{transaction::TransactionReceipt, Chain, TxHash};

use crate::{
    errors::{ConfirmationRequest, TransactError, TransactResult},
    steps::{RefreshInstructions, Step, StepAction, StepKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletPhase {
    #[default]
    Idle,
    AwaitingSignature,
    Submitted,
    Confirmed,
    Failed,
}

impl WalletPhase {
    fn order(self) -> u8 {
        match self {
            WalletPhase::Idle => 0,
            WalletPhase::AwaitingSignature => 1,
            WalletPhase::Submitted => 2,
            WalletPhase::Confirmed | WalletPhase::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.order() == 3
    }
}

/// A failed wallet interaction.
#[derive(Debug, Clone)]
pub struct WalletActionError {
    /// Human readable summary.
    pub message: String,
    pub error: TransactError,
}

impl From<TransactError> for WalletActionError {
    fn from(error: TransactError) -> Self {
        Self { message: error.to_string(), error }
    }
}

/// Wallet side progress of the active step's transaction.
#[derive(Debug, Clone, Default)]
pub struct WalletActionState {
    pub phase: WalletPhase,
    pub tx_hash: Option<TxHash>,
    pub receipt: Option<TransactionReceipt>,
    pub error: Option<WalletActionError>,
    /// What to refresh once this transaction is mined.
    pub context: Option<RefreshInstructions>,
}

#[derive(Debug, Clone)]
pub enum WalletUpdate {
    AwaitingSignature { context: Option<RefreshInstructions> },
    Submitted(TxHash),
    Confirmed(TransactionReceipt),
    Failed(TransactError),
}

impl WalletUpdate {
    fn phase(&self) -> WalletPhase {
        match self {
            WalletUpdate::AwaitingSignature { .. } => WalletPhase::AwaitingSignature,
            WalletUpdate::Submitted(_) => WalletPhase::Submitted,
            WalletUpdate::Confirmed(_) => WalletPhase::Confirmed,
            WalletUpdate::Failed(_) => WalletPhase::Failed,
        }
    }
}

impl WalletActionState {
    /// Applies an update if it moves the phase forward. Returns whether it was applied.
    pub fn apply(&mut self, update: WalletUpdate) -> bool {
        if update.phase().order() <= self.phase.order() {
            return false;
        }
        self.phase = update.phase();
        match update {
            WalletUpdate::AwaitingSignature { context } => self.context = context,
            WalletUpdate::Submitted(tx_hash) => self.tx_hash = Some(tx_hash),
            WalletUpdate::Confirmed(receipt) => self.receipt = Some(receipt),
            WalletUpdate::Failed(error) => self.error = Some(error.into()),
        }
        true
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What observers see of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub kind: StepKind,
    pub message: String,
    pub pending: bool,
}

impl From<&Step> for StepSummary {
    fn from(step: &Step) -> Self {
        Self { kind: step.kind, message: step.message.clone(), pending: step.pending }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepperPhase {
    Idle,
    Running(usize),
    Finished,
}

/// Snapshot of the stepper.
#[derive(Debug, Clone)]
pub struct StepperState {
    pub is_open: bool,
    /// `-1` when idle, `steps.len()` once finished.
    pub current_index: isize,
    pub steps: Vec<StepSummary>,
    pub is_finished: bool,
    pub chain: Option<Chain>,
    pub wallet: WalletActionState,
}

impl StepperState {
    fn idle() -> Self {
        Self {
            is_open: false,
            current_index: -1,
            steps: Vec::new(),
            is_finished: false,
            chain: None,
            wallet: WalletActionState::default(),
        }
    }

    pub fn phase(&self) -> StepperPhase {
        match usize::try_from(self.current_index) {
            Err(_) => StepperPhase::Idle,
            Ok(index) if index < self.steps.len() => StepperPhase::Running(index),
            Ok(_) => StepperPhase::Finished,
        }
    }
}

/// Notifications for the caller of a run.
#[derive(Debug, Clone)]
pub enum TransactEvent {
    StepStarted { index: usize, kind: StepKind },
    WalletPhaseChanged { index: usize, phase: WalletPhase },
    StepConfirmed { index: usize, tx_hash: Option<TxHash> },
    Finished,
    Failed { index: usize, message: String },
    ConfirmationNeeded(Box<ConfirmationRequest>),
    Reset,
}

pub type EventListener = Arc<dyn Fn(&TransactEvent) + Send + Sync>;

/// Fan out of [`TransactEvent`]s to registered callbacks.
#[derive(Default)]
pub struct EventBus {
    listeners: StdRwLock<Vec<EventListener>>,
}

impl EventBus {
    pub fn subscribe(&self, listener: EventListener) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    pub fn emit(&self, event: TransactEvent) {
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => {
                warn!("Event listeners poisoned, dropping {event:?}");
                return;
            }
        };
        for listener in listeners {
            listener(&event);
        }
    }
}

struct Run {
    steps: Vec<Step>,
    current: isize,
    chain: Option<Chain>,
    wallet: WalletActionState,
    is_open: bool,
}

impl Run {
    fn idle() -> Self {
        Self {
            steps: Vec::new(),
            current: -1,
            chain: None,
            wallet: WalletActionState::default(),
            is_open: false,
        }
    }

    fn running_index(&self) -> Option<usize> {
        usize::try_from(self.current)
            .ok()
            .filter(|index| *index < self.steps.len())
    }

    fn snapshot(&self) -> StepperState {
        StepperState {
            is_open: self.is_open,
            current_index: self.current,
            steps: self.steps.iter().map(StepSummary::from).collect(),
            is_finished: !self.steps.is_empty() && self.current == self.steps.len() as isize,
            chain: self.chain,
            wallet: self.wallet.clone(),
        }
    }
}

pub struct Stepper {
    run: Mutex<Run>,
    state_tx: watch::Sender<StepperState>,
    events: Arc<EventBus>,
}

impl Stepper {
    pub fn new(events: Arc<EventBus>) -> Self {
        let (state_tx, _) = watch::channel(StepperState::idle());
        Self { run: Mutex::new(Run::idle()), state_tx, events }
    }

    pub fn state(&self) -> StepperState {
        self.state_tx.borrow().clone()
    }

    /// Receives a snapshot after every transition.
    pub fn subscribe(&self) -> watch::Receiver<StepperState> {
        self.state_tx.subscribe()
    }

    fn publish(&self, run: &Run) {
        self.state_tx.send_replace(run.snapshot());
    }

    /// Starts a run. Only valid while idle.
    pub async fn start(&self, steps: Vec<Step>, chain: Chain) -> TransactResult<()> {
        let mut run = self.run.lock().await;
        if run.current != -1 {
            return Err(TransactError::StepperBusy);
        }
        let Some(first) = steps.first().map(|step| step.kind) else {
            return Err(TransactError::InvalidInput("no steps to run".to_string()));
        };
        info!(steps = steps.len(), %chain, "Starting stepper run");
        run.steps = steps;
        run.current = 0;
        run.chain = Some(chain);
        run.is_open = true;
        run.wallet.reset();
        self.publish(&run);
        drop(run);
        self.events
            .emit(TransactEvent::StepStarted { index: 0, kind: first });
        Ok(())
    }

    /// Hands out the action of the current step and marks the step pending.
    ///
    /// Returns `None` unless a step is active and has not been dispatched yet, so a step is
    /// never dispatched twice and never before its predecessor confirmed.
    pub async fn next_action(&self) -> Option<(usize, Arc<dyn StepAction>)> {
        let mut run = self.run.lock().await;
        let index = run.running_index()?;
        if run.wallet.phase != WalletPhase::Idle || run.steps[index].pending {
            return None;
        }
        let step = &mut run.steps[index];
        step.pending = true;
        let action = step.action.clone();
        debug!(index, kind = %step.kind, "Dispatching step");
        self.publish(&run);
        Some((index, action))
    }

    /// Records a wallet phase change of the active step. A confirmation advances the run.
    pub async fn update_wallet(&self, update: WalletUpdate) {
        let mut run = self.run.lock().await;
        let Some(index) = run.running_index() else {
            debug!(?update, "Ignoring wallet update outside of a run");
            return;
        };
        if !run.wallet.apply(update) {
            warn!(index, phase = ?run.wallet.phase, "Ignoring out of order wallet update");
            return;
        }
        let phase = run.wallet.phase;
        self.publish(&run);

        let mut events = vec![TransactEvent::WalletPhaseChanged { index, phase }];
        match phase {
            WalletPhase::Confirmed => {
                events.push(TransactEvent::StepConfirmed { index, tx_hash: run.wallet.tx_hash });
                events.extend(self.advance_locked(&mut run));
            }
            WalletPhase::Failed => {
                let message = run
                    .wallet
                    .error
                    .as_ref()
                    .map(|err| err.message.clone())
                    .unwrap_or_default();
                warn!(index, %message, "Step failed, halting run");
                events.push(TransactEvent::Failed { index, message });
            }
            _ => {}
        }
        drop(run);
        for event in events {
            self.events.emit(event);
        }
    }

    fn advance_locked(&self, run: &mut Run) -> Option<TransactEvent> {
        let index = run.running_index()?;
        run.current += 1;
        run.wallet.reset();
        self.publish(run);
        match run.steps.get(index + 1) {
            Some(next) => Some(TransactEvent::StepStarted { index: index + 1, kind: next.kind }),
            None => {
                info!(steps = run.steps.len(), "Stepper run finished");
                Some(TransactEvent::Finished)
            }
        }
    }

    /// Moves to the next step, or to finished after the last one.
    pub async fn advance(&self) {
        let mut run = self.run.lock().await;
        let event = self.advance_locked(&mut run);
        drop(run);
        if let Some(event) = event {
            self.events.emit(event);
        }
    }

    /// Returns to idle from any state, discarding all steps.
    pub async fn reset(&self) {
        let mut run = self.run.lock().await;
        let was_idle = run.current == -1;
        *run = Run::idle();
        self.publish(&run);
        drop(run);
        if !was_idle {
            debug!("Stepper reset");
            self.events.emit(TransactEvent::Reset);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex as StdMutex;

    use pretty_assertions::assert_eq;
    use test_log::test;
    use transact_common::models::{
        transaction::{CallData, ReceiptStatus},
        Address, B256,
    };

    use super::*;
    use crate::steps::FixedCallAction;

    fn step(kind: StepKind) -> Step {
        let call = CallData::new(Chain::Ethereum, Address::repeat_byte(1), vec![0x01]);
        let action = Arc::new(FixedCallAction::new(call, None));
        Step::new(kind, kind.to_string(), Chain::Ethereum, action)
    }

    fn receipt(byte: u8) -> TransactionReceipt {
        TransactionReceipt {
            tx_hash: B256::repeat_byte(byte),
            status: ReceiptStatus::Success,
            block_number: 1,
            logs: Vec::new(),
        }
    }

    fn recording_stepper() -> (Stepper, Arc<StdMutex<Vec<String>>>) {
        let events = Arc::new(EventBus::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        events.subscribe(Arc::new(move |event| {
            let name = match event {
                TransactEvent::StepStarted { index, .. } => format!("started {index}"),
                TransactEvent::WalletPhaseChanged { .. } => return,
                TransactEvent::StepConfirmed { index, .. } => format!("confirmed {index}"),
                TransactEvent::Finished => "finished".to_string(),
                TransactEvent::Failed { index, .. } => format!("failed {index}"),
                TransactEvent::ConfirmationNeeded(_) => "confirmation".to_string(),
                TransactEvent::Reset => "reset".to_string(),
            };
            sink.lock().unwrap().push(name);
        }));
        (Stepper::new(events), seen)
    }

    async fn confirm(stepper: &Stepper, byte: u8) {
        stepper
            .update_wallet(WalletUpdate::AwaitingSignature { context: None })
            .await;
        stepper
            .update_wallet(WalletUpdate::Submitted(B256::repeat_byte(byte)))
            .await;
        stepper
            .update_wallet(WalletUpdate::Confirmed(receipt(byte)))
            .await;
    }

    #[test(tokio::test)]
    async fn test_runs_steps_in_order() {
        let (stepper, events) = recording_stepper();
        stepper
            .start(vec![step(StepKind::Approve), step(StepKind::Deposit)], Chain::Ethereum)
            .await
            .unwrap();

        let (first, _) = stepper.next_action().await.unwrap();
        assert!(stepper.next_action().await.is_none());
        confirm(&stepper, 1).await;
        let (second, _) = stepper.next_action().await.unwrap();
        confirm(&stepper, 2).await;

        let state = stepper.state();
        assert_eq!((first, second), (0, 1));
        assert_eq!(state.phase(), StepperPhase::Finished);
        assert_eq!(state.current_index, 2);
        assert!(state.is_finished);
        assert!(state.steps.iter().all(|s| s.pending));
        assert!(stepper.next_action().await.is_none());
        assert_eq!(
            *events.lock().unwrap(),
            vec!["started 0", "confirmed 0", "started 1", "confirmed 1", "finished"]
        );
    }

    #[test(tokio::test)]
    async fn test_advance_stops_at_step_count() {
        let (stepper, events) = recording_stepper();
        stepper
            .start(vec![step(StepKind::Approve), step(StepKind::Deposit)], Chain::Ethereum)
            .await
            .unwrap();
        stepper.advance().await;
        stepper.advance().await;
        assert!(stepper.state().is_finished);

        stepper.advance().await;
        stepper.advance().await;

        let state = stepper.state();
        assert_eq!(state.current_index, state.steps.len() as isize);
        assert_eq!(state.phase(), StepperPhase::Finished);
        assert!(state.is_finished);
        assert_eq!(*events.lock().unwrap(), vec!["started 0", "started 1", "finished"]);
    }

    #[test(tokio::test)]
    async fn test_start_requires_idle() {
        let (stepper, _) = recording_stepper();
        stepper
            .start(vec![step(StepKind::Deposit)], Chain::Ethereum)
            .await
            .unwrap();

        let res = stepper
            .start(vec![step(StepKind::Deposit)], Chain::Ethereum)
            .await;

        assert!(matches!(res, Err(TransactError::StepperBusy)));
    }

    #[test(tokio::test)]
    async fn test_failure_halts_without_advancing() {
        let (stepper, events) = recording_stepper();
        stepper
            .start(vec![step(StepKind::Approve), step(StepKind::Deposit)], Chain::Ethereum)
            .await
            .unwrap();
        stepper.next_action().await.unwrap();

        stepper
            .update_wallet(WalletUpdate::Failed(TransactError::TransactionRejectedByWallet(
                "user denied".to_string(),
            )))
            .await;
        // late updates of the failed transaction are ignored
        stepper
            .update_wallet(WalletUpdate::Confirmed(receipt(1)))
            .await;

        let state = stepper.state();
        assert_eq!(state.phase(), StepperPhase::Running(0));
        assert_eq!(state.wallet.phase, WalletPhase::Failed);
        assert_eq!(
            state.wallet.error.unwrap().message,
            "Transaction rejected by wallet: user denied"
        );
        assert!(stepper.next_action().await.is_none());
        assert_eq!(*events.lock().unwrap(), vec!["started 0", "failed 0"]);
    }

    #[test(tokio::test)]
    async fn test_reset_returns_to_idle() {
        let (stepper, _) = recording_stepper();
        let mut updates = stepper.subscribe();
        stepper
            .start(vec![step(StepKind::Approve), step(StepKind::Deposit)], Chain::Ethereum)
            .await
            .unwrap();
        stepper.next_action().await.unwrap();

        stepper.reset().await;

        let state = updates.borrow_and_update().clone();
        assert_eq!(state.current_index, -1);
        assert!(state.steps.is_empty());
        assert!(!state.is_open);
        assert_eq!(state.phase(), StepperPhase::Idle);
        stepper
            .start(vec![step(StepKind::Deposit)], Chain::Base)
            .await
            .unwrap();
        assert_eq!(stepper.state().chain, Some(Chain::Base));
    }

    #[test]
    fn test_wallet_phase_is_monotonic() {
        let mut wallet = WalletActionState::default();

        assert!(wallet.apply(WalletUpdate::Submitted(B256::repeat_byte(1))));
        assert!(!wallet.apply(WalletUpdate::AwaitingSignature { context: None }));
        assert!(wallet.apply(WalletUpdate::Confirmed(receipt(1))));
        assert!(!wallet.apply(WalletUpdate::Failed(TransactError::StepperBusy)));
        assert_eq!(wallet.phase, WalletPhase::Confirmed);

        wallet.reset();
        assert_eq!(wallet.phase, WalletPhase::Idle);
        assert_eq!(wallet.tx_hash, None);
    }
}
