//! Operator-side command emitter.

use crate::config::{Identity, TriggerConfig};
use crate::protocol::{build_command, Instruction, ProtocolError, ShowCommand};
use crate::transport::{Publisher, TransportError};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Operator input failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds commands and publishes them to every bound element.
#[derive(Debug)]
pub struct ShowTrigger<P> {
    identity: Identity,
    sync_offset_ms: Option<u64>,
    publisher: P,
}

impl<P: Publisher> ShowTrigger<P> {
    pub fn new(identity: Identity, publisher: P, config: &TriggerConfig) -> Self {
        Self {
            identity,
            sync_offset_ms: config.sync_offset_ms,
            publisher,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn sync_offset_ms(&self) -> Option<u64> {
        self.sync_offset_ms
    }

    /// Build a command with an explicit offset and publish it.
    pub async fn emit(&self, kind: Instruction, sync_offset_ms: Option<u64>) -> Result<ShowCommand, TriggerError> {
        let command = build_command(kind, sync_offset_ms);
        let payload = command.encode()?;
        self.publisher.publish(payload).await?;
        info!(
            trigger = %self.identity,
            instruction = %kind,
            start_time = command.start_time(),
            "Command sent"
        );
        Ok(command)
    }

    /// Publish `kind` using the configured synchronization offset.
    pub async fn send(&self, kind: Instruction) -> Result<ShowCommand, TriggerError> {
        self.emit(kind, self.sync_offset_ms).await
    }

    pub async fn send_go(&self) -> Result<ShowCommand, TriggerError> {
        self.send(Instruction::Go).await
    }

    pub async fn send_idle(&self) -> Result<ShowCommand, TriggerError> {
        self.send(Instruction::Idle).await
    }

    pub async fn send_shutdown(&self) -> Result<ShowCommand, TriggerError> {
        self.send(Instruction::Shutdown).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorAction {
    Send(Instruction),
    Exit,
}

/// Maps typed tokens to operator actions. Matching ignores case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMap {
    go_token: String,
}

impl KeyMap {
    pub fn new(go_token: impl Into<String>) -> Self {
        Self {
            go_token: go_token.into(),
        }
    }

    pub fn from_config(config: &TriggerConfig) -> Self {
        Self::new(config.go_token.clone())
    }

    pub fn go_token(&self) -> &str {
        &self.go_token
    }

    pub fn resolve(&self, token: &str) -> Option<OperatorAction> {
        if token.eq_ignore_ascii_case(&self.go_token) {
            return Some(OperatorAction::Send(Instruction::Go));
        }

        match token.to_ascii_uppercase().as_str() {
            "IDLE" => Some(OperatorAction::Send(Instruction::Idle)),
            "SHUTDOWN" => Some(OperatorAction::Send(Instruction::Shutdown)),
            "EXIT" => Some(OperatorAction::Exit),
            _ => None,
        }
    }
}

impl Default for KeyMap {
    fn default() -> Self {
        Self::from_config(&TriggerConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    ExitRequested,
    InputClosed,
}

/// Read operator tokens from `input` until `EXIT` or end of input.
///
/// `EXIT` stops only this listener; elements keep their state. A failed
/// publish is logged and the listener keeps reading.
pub async fn listen<P, R>(trigger: &ShowTrigger<P>, keymap: &KeyMap, input: R) -> Result<ListenerExit, TriggerError>
where
    P: Publisher,
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    info!(trigger = %trigger.identity(), go_token = keymap.go_token(), "Keyboard listener started");

    while let Some(line) = lines.next_line().await? {
        for token in line.split_whitespace() {
            match keymap.resolve(token) {
                Some(OperatorAction::Send(kind)) => {
                    if let Err(e) = trigger.send(kind).await {
                        error!(trigger = %trigger.identity(), instruction = %kind, error = %e, "Failed to send command");
                    }
                }
                Some(OperatorAction::Exit) => {
                    info!(trigger = %trigger.identity(), "Keyboard listener exiting");
                    return Ok(ListenerExit::ExitRequested);
                }
                None => {
                    warn!(token, "Unknown operator token");
                }
            }
        }
    }

    debug!(trigger = %trigger.identity(), "Operator input closed");
    Ok(ListenerExit::InputClosed)
}
