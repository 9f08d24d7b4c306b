//! Digital output actuation.
//!
//! [`OutputPin`] is the hardware seam. [`MemoryPin`] keeps the level in memory
//! and logs every change, which is all the demo node and the tests need.

use crate::element::{RoutineContext, RoutineError, ShowBehavior};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

const DEFAULT_IDLE_PERIOD_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinState {
    Low,
    High,
}

impl PinState {
    pub fn inverted(self) -> Self {
        match self {
            PinState::Low => PinState::High,
            PinState::High => PinState::Low,
        }
    }
}

impl core::fmt::Display for PinState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PinState::Low => write!(f, "off"),
            PinState::High => write!(f, "on"),
        }
    }
}

pub trait OutputPin: Send + 'static {
    fn set_high(&mut self);
    fn set_low(&mut self);
    fn is_high(&self) -> bool;

    /// Name used in log lines.
    fn label(&self) -> &str {
        "pin"
    }

    fn set(&mut self, state: PinState) {
        match state {
            PinState::High => self.set_high(),
            PinState::Low => self.set_low(),
        }
    }

    fn state(&self) -> PinState {
        if self.is_high() {
            PinState::High
        } else {
            PinState::Low
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryPin {
    label: String,
    state: PinState,
    changes: u64,
}

impl MemoryPin {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: PinState::Low,
            changes: 0,
        }
    }

    /// Number of level changes since creation.
    pub fn changes(&self) -> u64 {
        self.changes
    }

    fn drive(&mut self, state: PinState) {
        if self.state != state {
            self.state = state;
            self.changes += 1;
            debug!(pin = %self.label, %state, "Pin level changed");
        }
    }
}

impl OutputPin for MemoryPin {
    fn set_high(&mut self) {
        self.drive(PinState::High);
    }

    fn set_low(&mut self) {
        self.drive(PinState::Low);
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_high(&self) -> bool {
        self.state == PinState::High
    }
}

/// Shared handle to one output pin.
#[derive(Debug)]
pub struct PinActuator<P> {
    pin: Mutex<P>,
}

impl<P: OutputPin> PinActuator<P> {
    pub fn new(pin: P) -> Self {
        Self { pin: Mutex::new(pin) }
    }

    pub async fn turn_on(&self) {
        self.pin.lock().await.set_high();
    }

    pub async fn turn_off(&self) {
        self.pin.lock().await.set_low();
    }

    pub async fn set(&self, state: PinState) {
        self.pin.lock().await.set(state);
    }

    /// Flip the level and return the new one.
    pub async fn toggle(&self) -> PinState {
        let mut pin = self.pin.lock().await;
        let next = pin.state().inverted();
        pin.set(next);
        next
    }

    pub async fn state(&self) -> PinState {
        self.pin.lock().await.state()
    }

    /// Drive high for `duration`, then low. The pin is left low on cancellation too.
    pub async fn pulse(&self, ctx: &RoutineContext, duration: Duration) -> Result<(), RoutineError> {
        self.turn_on().await;
        let held = ctx.pause(duration).await;
        self.turn_off().await;
        held
    }

    pub async fn label(&self) -> String {
        self.pin.lock().await.label().to_string()
    }

    pub async fn with_pin<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&*self.pin.lock().await)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PinError {
    #[error("Invalid blink pattern step '{0}'")]
    InvalidPattern(String),
    #[error("Blink pattern is empty")]
    EmptyPattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlinkStep {
    pub state: PinState,
    pub hold_ms: u64,
}

impl BlinkStep {
    pub fn new(state: PinState, hold_ms: u64) -> Self {
        Self { state, hold_ms }
    }
}

/// Parse `on:200,off:100,on:400` into steps.
pub fn parse_pattern(pattern: &str) -> Result<Vec<BlinkStep>, PinError> {
    let mut steps = Vec::new();

    for raw in pattern.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let invalid = || PinError::InvalidPattern(raw.to_string());
        let (level, hold) = raw.split_once(':').ok_or_else(invalid)?;
        let state = match level.trim().to_ascii_lowercase().as_str() {
            "on" | "high" => PinState::High,
            "off" | "low" => PinState::Low,
            _ => return Err(invalid()),
        };
        let hold_ms = hold.trim().parse::<u64>().map_err(|_| invalid())?;
        steps.push(BlinkStep::new(state, hold_ms));
    }

    if steps.is_empty() {
        return Err(PinError::EmptyPattern);
    }
    Ok(steps)
}

/// Plays a step pattern on `GO` and slowly toggles while idle.
#[derive(Debug)]
pub struct BlinkBehavior<P> {
    actuator: PinActuator<P>,
    pattern: Vec<BlinkStep>,
    idle_period: Duration,
}

impl<P: OutputPin> BlinkBehavior<P> {
    pub fn new(pin: P, pattern: Vec<BlinkStep>) -> Self {
        Self {
            actuator: PinActuator::new(pin),
            pattern,
            idle_period: Duration::from_millis(DEFAULT_IDLE_PERIOD_MS),
        }
    }

    pub fn with_idle_period(mut self, idle_period: Duration) -> Self {
        self.idle_period = idle_period;
        self
    }

    pub fn actuator(&self) -> &PinActuator<P> {
        &self.actuator
    }
}

#[async_trait]
impl<P: OutputPin> ShowBehavior for BlinkBehavior<P> {
    async fn run_sequence(&self, ctx: &RoutineContext) -> Result<(), RoutineError> {
        info!(element = %ctx.element(), steps = self.pattern.len(), "Playing blink pattern");

        for step in &self.pattern {
            ctx.checkpoint()?;
            self.actuator.set(step.state).await;
            if let Err(e) = ctx.pause(Duration::from_millis(step.hold_ms)).await {
                self.actuator.turn_off().await;
                return Err(e);
            }
        }

        self.actuator.turn_off().await;
        Ok(())
    }

    async fn run_idle(&self, ctx: &RoutineContext) -> Result<(), RoutineError> {
        self.actuator.toggle().await;
        ctx.pause(self.idle_period).await
    }

    async fn on_shutdown(&self) {
        self.actuator.turn_off().await;
        let pin = self.actuator.label().await;
        info!(%pin, "Pin driven low for shutdown");
    }
}
