//! Show element state machine.
//!
//! A [`ShowElement`] turns a stream of [`ShowCommand`]s into exclusive,
//! preemptible execution of one behavior routine at a time:
//!
//! ```text
//! Uninitialized --init--> Idling --GO--> Running --(sequence done)--> Idling
//!        {Idling, Running} --GO/IDLE--> preempt current, start new
//!        any --SHUTDOWN--> ShuttingDown --> Terminated
//! ```
//!
//! Deliveries only enqueue. A single conductor task owns the active-routine
//! slot, so the cancel-then-start step never interleaves with another
//! delivery. A command whose start time has passed runs as soon as it is
//! read. While a command waits for its start time, any newer command replaces
//! it; the stale one is dropped without ever running.

use crate::clock;
use crate::config::{ElementConfig, Identity};
use crate::protocol::{Instruction, ProtocolError, ShowCommand};
use crate::transport::{Subscriber, TransportError};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_PHASE_HISTORY: usize = 16;
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Capabilities a concrete actuator provides to the state machine.
///
/// Routines cancel cooperatively: they should poll
/// [`RoutineContext::checkpoint`] or use [`RoutineContext::pause`] at every
/// natural step and return [`RoutineError::Cancelled`] promptly once asked.
#[async_trait]
pub trait ShowBehavior: Send + Sync + 'static {
    /// The scripted show sequence, run once per `GO`.
    async fn run_sequence(&self, ctx: &RoutineContext) -> Result<(), RoutineError>;

    /// One pass of the idle loop. Called repeatedly until cancelled.
    async fn run_idle(&self, ctx: &RoutineContext) -> Result<(), RoutineError>;

    /// Release actuator resources. Called exactly once, after the last routine stopped.
    async fn on_shutdown(&self);
}

#[async_trait]
impl<B: ShowBehavior + ?Sized> ShowBehavior for Arc<B> {
    async fn run_sequence(&self, ctx: &RoutineContext) -> Result<(), RoutineError> {
        (**self).run_sequence(ctx).await
    }

    async fn run_idle(&self, ctx: &RoutineContext) -> Result<(), RoutineError> {
        (**self).run_idle(ctx).await
    }

    async fn on_shutdown(&self) {
        (**self).on_shutdown().await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutineError {
    /// A newer command took the slot. The routine must not finish its work.
    #[error("Routine cancelled by a newer command")]
    Cancelled,
    #[error("Behavior routine fault: {0}")]
    Fault(String),
}

impl RoutineError {
    pub fn fault(reason: impl core::fmt::Display) -> Self {
        RoutineError::Fault(reason.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ElementError {
    #[error("Element inbox is full")]
    InboxFull,
    #[error("Element has terminated")]
    Terminated,
    #[error(transparent)]
    Malformed(#[from] ProtocolError),
}

/// Handed to every routine invocation.
#[derive(Debug, Clone)]
pub struct RoutineContext {
    element: Arc<Identity>,
    instruction: Instruction,
    cancel: CancellationToken,
}

impl RoutineContext {
    pub fn new(element: Arc<Identity>, instruction: Instruction, cancel: CancellationToken) -> Self {
        Self {
            element,
            instruction,
            cancel,
        }
    }

    pub fn element(&self) -> &Identity {
        &self.element
    }

    /// Instruction that started this routine.
    pub fn instruction(&self) -> Instruction {
        self.instruction
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn checkpoint(&self) -> Result<(), RoutineError> {
        if self.is_cancelled() {
            Err(RoutineError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Sleep for `duration`, returning early with `Cancelled` if preempted.
    pub async fn pause(&self, duration: Duration) -> Result<(), RoutineError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(RoutineError::Cancelled),
            () = time::sleep(duration) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ElementPhase {
    Uninitialized,
    Idling,
    Running,
    ShuttingDown,
    Terminated,
}

impl ElementPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ElementPhase::Terminated)
    }

    /// Past the point where new commands are accepted.
    pub fn is_stopping(self) -> bool {
        matches!(self, ElementPhase::ShuttingDown | ElementPhase::Terminated)
    }

    fn for_instruction(instruction: Instruction) -> Self {
        match instruction {
            Instruction::Go => ElementPhase::Running,
            Instruction::Idle => ElementPhase::Idling,
            Instruction::Shutdown => ElementPhase::ShuttingDown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseTransition {
    pub from: ElementPhase,
    pub to: ElementPhase,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ElementStats {
    pub commands_received: u64,
    pub commands_rejected: u64,
    pub commands_abandoned: u64,
    pub commands_executed: u64,
    pub malformed_messages: u64,
    pub preemptions: u64,
    pub forced_aborts: u64,
    pub sequences_completed: u64,
    pub idle_iterations: u64,
    pub routine_faults: u64,
}

/// Observable snapshot of one element.
#[derive(Debug, Clone, Serialize)]
pub struct ElementState {
    pub phase: ElementPhase,
    /// Instruction the routine slot is performing, if any. A finished `GO`
    /// reports `Idle` once it falls through to the idle loop.
    pub active: Option<Instruction>,
    pub stats: ElementStats,
    pub history: heapless::Vec<PhaseTransition, MAX_PHASE_HISTORY>,
}

impl ElementState {
    fn transition(&mut self, to: ElementPhase) {
        if self.phase == to {
            return;
        }

        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(PhaseTransition {
            from: self.phase,
            to,
            at_ms: clock::epoch_millis(),
        });
        self.phase = to;
    }
}

impl Default for ElementState {
    fn default() -> Self {
        Self {
            phase: ElementPhase::Uninitialized,
            active: None,
            stats: ElementStats::default(),
            history: heapless::Vec::new(),
        }
    }
}

/// Handle to a running show element. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShowElement {
    identity: Arc<Identity>,
    inbox: mpsc::Sender<ShowCommand>,
    state: Arc<watch::Sender<ElementState>>,
    terminated: CancellationToken,
}

impl ShowElement {
    /// Initialise the element and start its conductor on the current runtime.
    pub fn spawn<B: ShowBehavior>(identity: Identity, behavior: B, config: ElementConfig) -> Self {
        let identity = Arc::new(identity);
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let (state, _) = watch::channel(ElementState::default());
        let state = Arc::new(state);
        let terminated = CancellationToken::new();

        let conductor = Conductor {
            identity: Arc::clone(&identity),
            behavior: Arc::new(behavior),
            config,
            inbox: inbox_rx,
            state: Arc::clone(&state),
            terminated: terminated.clone(),
            active: None,
        };
        tokio::spawn(conductor.run());

        Self {
            identity,
            inbox: inbox_tx,
            state,
            terminated,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Accept one delivered command. Never blocks and is safe to call concurrently.
    pub fn on_message_received(&self, command: ShowCommand) -> Result<(), ElementError> {
        self.state.send_modify(|s| s.stats.commands_received += 1);

        if self.state.borrow().phase.is_stopping() {
            debug!(element = %self.identity, %command, "Ignoring command after shutdown");
            self.state.send_modify(|s| s.stats.commands_rejected += 1);
            return Err(ElementError::Terminated);
        }

        match self.inbox.try_send(command) {
            Ok(()) => {
                debug!(element = %self.identity, %command, "Command received");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!(element = %self.identity, %command, "Inbox full, dropping command");
                self.state.send_modify(|s| s.stats.commands_rejected += 1);
                Err(ElementError::InboxFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.state.send_modify(|s| s.stats.commands_rejected += 1);
                Err(ElementError::Terminated)
            }
        }
    }

    /// Decode a raw payload and accept it. Malformed payloads are logged and dropped.
    pub fn deliver(&self, payload: &[u8]) -> Result<(), ElementError> {
        match ShowCommand::decode(payload) {
            Ok(command) => self.on_message_received(command),
            Err(e) => {
                warn!(element = %self.identity, error = %e, size = payload.len(), "Dropping malformed message");
                self.state.send_modify(|s| s.stats.malformed_messages += 1);
                Err(e.into())
            }
        }
    }

    /// Feed every payload from `subscriber` into this element until it terminates.
    pub fn attach<S: Subscriber + 'static>(&self, subscriber: S) -> JoinHandle<()> {
        tokio::spawn(pump(self.clone(), subscriber))
    }

    pub fn state(&self) -> ElementState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> ElementPhase {
        self.state.borrow().phase
    }

    pub fn stats(&self) -> ElementStats {
        self.state.borrow().stats
    }

    pub fn watch(&self) -> watch::Receiver<ElementState> {
        self.state.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Resolves once the element reached `Terminated`. The embedding process
    /// decides what to do next.
    pub async fn stopped(&self) {
        self.terminated.cancelled().await;
    }
}

async fn pump<S: Subscriber>(element: ShowElement, mut subscriber: S) {
    loop {
        let frame = tokio::select! {
            biased;
            () = element.stopped() => break,
            frame = subscriber.recv() => frame,
        };

        match frame {
            Some(Ok(payload)) => match element.deliver(&payload) {
                Err(ElementError::Terminated) => break,
                Ok(()) | Err(_) => {}
            },
            Some(Err(TransportError::Lagged { skipped })) => {
                warn!(element = %element.identity, skipped, "Subscription lagged, commands lost");
            }
            Some(Err(e)) => {
                error!(element = %element.identity, error = %e, "Receive failed");
                time::sleep(RECEIVE_RETRY_DELAY).await;
            }
            None => {
                info!(element = %element.identity, "Subscription closed");
                break;
            }
        }
    }
}

struct ActiveRoutine {
    instruction: Instruction,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct PendingCommand {
    command: ShowCommand,
    deadline: Instant,
}

enum Event {
    Received(Option<ShowCommand>),
    DeadlineReached,
}

enum Flow {
    Continue,
    Stop,
}

/// Owns the routine slot. Runs until `SHUTDOWN` or until every handle is gone.
struct Conductor<B> {
    identity: Arc<Identity>,
    behavior: Arc<B>,
    config: ElementConfig,
    inbox: mpsc::Receiver<ShowCommand>,
    state: Arc<watch::Sender<ElementState>>,
    terminated: CancellationToken,
    active: Option<ActiveRoutine>,
}

impl<B: ShowBehavior> Conductor<B> {
    async fn run(mut self) {
        self.init();
        let mut pending: Option<PendingCommand> = None;

        loop {
            // A command whose start time has come runs before anything newer is read.
            if let Some(ready) = take_due(&mut pending) {
                if let Flow::Stop = self.execute(ready.command).await {
                    break;
                }
                continue;
            }

            let deadline = pending.as_ref().map(|p| p.deadline);
            let event = tokio::select! {
                biased;
                received = self.inbox.recv() => Event::Received(received),
                () = wait_until(deadline) => Event::DeadlineReached,
            };

            match event {
                Event::Received(Some(command)) => {
                    if let Some(ready) = take_due(&mut pending) {
                        if let Flow::Stop = self.execute(ready.command).await {
                            self.update(|s| s.stats.commands_rejected += 1);
                            break;
                        }
                    }

                    let deadline = clock::deadline_instant(command.start_time());
                    let now = Instant::now();
                    if let Some(stale) = pending.take() {
                        info!(
                            element = %self.identity,
                            stale = %stale.command,
                            newer = %command,
                            "Command superseded before its start time, abandoning"
                        );
                        self.update(|s| s.stats.commands_abandoned += 1);
                    }

                    if deadline <= now {
                        if let Flow::Stop = self.execute(command).await {
                            break;
                        }
                    } else {
                        let wait_ms = deadline.duration_since(now).as_millis() as u64;
                        debug!(element = %self.identity, %command, wait_ms, "Waiting for start time");
                        pending = Some(PendingCommand { command, deadline });
                    }
                }
                Event::Received(None) => {
                    warn!(element = %self.identity, "All element handles dropped, shutting down");
                    self.shutdown().await;
                    break;
                }
                Event::DeadlineReached => {
                    if let Some(ready) = pending.take() {
                        if let Flow::Stop = self.execute(ready.command).await {
                            break;
                        }
                    }
                }
            }
        }

        self.inbox.close();
        let mut discarded = 0;
        while self.inbox.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(element = %self.identity, discarded, "Discarded commands queued behind shutdown");
            self.update(|s| s.stats.commands_rejected += discarded);
        }
        self.terminated.cancel();
    }

    fn init(&mut self) {
        self.update(|s| s.transition(ElementPhase::Idling));
        info!(element = %self.identity, "Show element initialised");

        if self.config.idle_on_start {
            self.launch(Instruction::Idle);
        }
    }

    async fn execute(&mut self, command: ShowCommand) -> Flow {
        let kind = command.instruction();
        let late_ms = clock::epoch_millis().saturating_sub(command.start_time());
        info!(element = %self.identity, instruction = %kind, start_time = command.start_time(), late_ms, "Executing command");
        self.update(|s| s.stats.commands_executed += 1);

        match kind {
            Instruction::Go | Instruction::Idle => {
                self.preempt().await;
                self.launch(kind);
                Flow::Continue
            }
            Instruction::Shutdown => {
                self.shutdown().await;
                Flow::Stop
            }
        }
    }

    fn launch(&mut self, instruction: Instruction) {
        debug_assert!(self.active.is_none(), "launching over a live routine");

        let cancel = CancellationToken::new();
        let routine = Routine {
            behavior: Arc::clone(&self.behavior),
            state: Arc::clone(&self.state),
            ctx: RoutineContext::new(Arc::clone(&self.identity), instruction, cancel.clone()),
            idle_fault_backoff: self.config.idle_fault_backoff,
        };

        self.update(|s| {
            s.active = Some(instruction);
            s.transition(ElementPhase::for_instruction(instruction));
        });
        let handle = tokio::spawn(routine.perform());
        self.active = Some(ActiveRoutine {
            instruction,
            cancel,
            handle,
        });
    }

    /// Signal the active routine and wait for it to return before the slot is reused.
    async fn preempt(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        active.cancel.cancel();
        self.update(|s| s.stats.preemptions += 1);

        match time::timeout(self.config.preempt_grace, &mut active.handle).await {
            Ok(Ok(())) => {
                debug!(element = %self.identity, instruction = %active.instruction, "Routine stopped");
            }
            Ok(Err(e)) => {
                warn!(element = %self.identity, instruction = %active.instruction, error = %e, "Routine task ended abnormally");
            }
            Err(_) => {
                warn!(
                    element = %self.identity,
                    instruction = %active.instruction,
                    grace_ms = self.config.preempt_grace.as_millis() as u64,
                    "Routine ignored cancellation, aborting"
                );
                active.handle.abort();
                let _ = active.handle.await;
                self.update(|s| s.stats.forced_aborts += 1);
            }
        }

        self.update(|s| s.active = None);
    }

    async fn shutdown(&mut self) {
        self.update(|s| s.transition(ElementPhase::ShuttingDown));
        info!(element = %self.identity, "Shutting down");

        self.preempt().await;

        if let Err(panic) = AssertUnwindSafe(self.behavior.on_shutdown()).catch_unwind().await {
            error!(element = %self.identity, reason = %panic_message(&*panic), "Shutdown procedure panicked");
            self.update(|s| s.stats.routine_faults += 1);
        }

        self.update(|s| s.transition(ElementPhase::Terminated));
        info!(element = %self.identity, "Show element terminated");
    }

    fn update(&self, f: impl FnOnce(&mut ElementState)) {
        self.state.send_modify(f);
    }
}

fn take_due(pending: &mut Option<PendingCommand>) -> Option<PendingCommand> {
    if pending.as_ref().map_or(false, |p| p.deadline <= Instant::now()) {
        pending.take()
    } else {
        None
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// One occupant of the routine slot.
struct Routine<B> {
    behavior: Arc<B>,
    state: Arc<watch::Sender<ElementState>>,
    ctx: RoutineContext,
    idle_fault_backoff: Duration,
}

impl<B: ShowBehavior> Routine<B> {
    async fn perform(self) {
        if self.ctx.instruction() == Instruction::Go {
            match guarded(self.behavior.run_sequence(&self.ctx)).await {
                Ok(()) if !self.ctx.is_cancelled() => {
                    info!(element = %self.ctx.element(), "Show sequence complete");
                    self.state.send_modify(|s| s.stats.sequences_completed += 1);
                }
                Ok(()) | Err(RoutineError::Cancelled) => {
                    debug!(element = %self.ctx.element(), "Show sequence preempted");
                    return;
                }
                Err(RoutineError::Fault(reason)) => {
                    warn!(element = %self.ctx.element(), %reason, "Show sequence faulted, falling back to idle");
                    self.state.send_modify(|s| s.stats.routine_faults += 1);
                }
            }

            if self.ctx.is_cancelled() {
                return;
            }
            // Only a running show falls through; a shutdown in progress keeps its phase.
            self.state.send_if_modified(|s| {
                if s.phase == ElementPhase::Running {
                    s.active = Some(Instruction::Idle);
                    s.transition(ElementPhase::Idling);
                    true
                } else {
                    false
                }
            });
        }

        self.idle().await;
    }

    async fn idle(&self) {
        loop {
            if self.ctx.is_cancelled() {
                return;
            }

            match guarded(self.behavior.run_idle(&self.ctx)).await {
                Ok(()) => self.state.send_modify(|s| s.stats.idle_iterations += 1),
                Err(RoutineError::Cancelled) => return,
                Err(RoutineError::Fault(reason)) => {
                    warn!(element = %self.ctx.element(), %reason, "Idle routine faulted");
                    self.state.send_modify(|s| s.stats.routine_faults += 1);
                    if self.ctx.pause(self.idle_fault_backoff).await.is_err() {
                        return;
                    }
                }
            }

            // An idle pass that never awaits must not starve the conductor.
            tokio::task::yield_now().await;
        }
    }
}

/// Run a routine, turning a panic into a fault.
async fn guarded<F>(routine: F) -> Result<(), RoutineError>
where
    F: Future<Output = Result<(), RoutineError>>,
{
    match AssertUnwindSafe(routine).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(RoutineError::Fault(panic_message(&*panic))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
