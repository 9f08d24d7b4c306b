use crate::clock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_MESSAGE_SIZE: usize = 512;

/// Command kinds understood by every show element.
///
/// The set is closed: receivers never infer an instruction from free-form
/// text, so a new kind must be added here before anyone can send it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Instruction {
    /// Start the show sequence, then fall back to idling.
    Go,
    /// Run the idle loop until superseded.
    Idle,
    /// Cancel everything, run the shutdown procedure and stop the element.
    Shutdown,
}

impl Instruction {
    pub const ALL: [Instruction; 3] = [Instruction::Go, Instruction::Idle, Instruction::Shutdown];

    pub fn as_str(self) -> &'static str {
        match self {
            Instruction::Go => "GO",
            Instruction::Idle => "IDLE",
            Instruction::Shutdown => "SHUTDOWN",
        }
    }

    /// Whether a synchronization offset is honoured for this kind.
    pub fn accepts_sync_offset(self) -> bool {
        !matches!(self, Instruction::Shutdown)
    }
}

impl core::fmt::Display for Instruction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single message broadcast to every element.
///
/// `start_time` is an absolute epoch-millisecond deadline. Receivers wait for
/// that instant instead of reacting to arrival time, which is what lets
/// elements behind different network paths start together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ShowCommand {
    instruction: Instruction,
    start_time: u64,
}

impl ShowCommand {
    pub fn new(instruction: Instruction, start_time: u64) -> Self {
        Self { instruction, start_time }
    }

    /// `GO` starting `sync_offset_ms` from now.
    pub fn go(sync_offset_ms: Option<u64>) -> Self {
        build_command(Instruction::Go, sync_offset_ms)
    }

    /// `IDLE` starting `sync_offset_ms` from now.
    pub fn idle(sync_offset_ms: Option<u64>) -> Self {
        build_command(Instruction::Idle, sync_offset_ms)
    }

    /// `SHUTDOWN`, always immediate.
    pub fn shutdown() -> Self {
        build_command(Instruction::Shutdown, None)
    }

    pub fn instruction(&self) -> Instruction {
        self.instruction
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }
}

impl core::fmt::Display for ShowCommand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.instruction, self.start_time)
    }
}

/// Build a command whose deadline is `now + sync_offset_ms`.
///
/// `SHUTDOWN` ignores the offset: a synchronized stop is not modelled.
pub fn build_command(kind: Instruction, sync_offset_ms: Option<u64>) -> ShowCommand {
    build_command_at(kind, sync_offset_ms, clock::epoch_millis())
}

pub fn build_command_at(kind: Instruction, sync_offset_ms: Option<u64>, now_ms: u64) -> ShowCommand {
    let offset = if kind.accepts_sync_offset() {
        sync_offset_ms.unwrap_or(0)
    } else {
        0
    };

    ShowCommand::new(kind, now_ms.saturating_add(offset))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for kind in Instruction::ALL {
            let command = ShowCommand::new(kind, 1_234_567_891_234);
            let bytes = command.encode().unwrap();
            assert_eq!(ShowCommand::decode(&bytes).unwrap(), command);
        }
    }

    #[test]
    fn test_wire_shape() {
        let command = ShowCommand::new(Instruction::Go, 1_234_567_891_234);
        let json = String::from_utf8(command.encode().unwrap()).unwrap();
        assert_eq!(json, r#"{"instruction":"GO","startTime":1234567891234}"#);
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        assert!(matches!(
            ShowCommand::decode(br#"{"instruction":"GO"}"#),
            Err(ProtocolError::MalformedMessage(_))
        ));
        assert!(matches!(
            ShowCommand::decode(br#"{"startTime":100}"#),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_instruction() {
        // STOP is not an alias for SHUTDOWN
        assert!(matches!(
            ShowCommand::decode(br#"{"instruction":"STOP","startTime":100}"#),
            Err(ProtocolError::MalformedMessage(_))
        ));
        assert!(matches!(
            ShowCommand::decode(br#"{"instruction":"go","startTime":100}"#),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ShowCommand::decode(b"").is_err());
        assert!(ShowCommand::decode(b"\xff\xfe\x00").is_err());
        assert!(ShowCommand::decode(br#"{"instruction":"GO","startTime":-5}"#).is_err());
        assert!(ShowCommand::decode(br#"{"instruction":"GO","startTime":5,"seq":1}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_payload() {
        let bytes = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert_eq!(
            ShowCommand::decode(&bytes),
            Err(ProtocolError::MessageTooLarge { size: MAX_MESSAGE_SIZE + 1, max: MAX_MESSAGE_SIZE })
        );
    }

    #[test]
    fn test_build_command_applies_offset() {
        let command = build_command_at(Instruction::Go, Some(10_000), 5_000);
        assert_eq!(command.instruction(), Instruction::Go);
        assert_eq!(command.start_time(), 15_000);

        let command = build_command_at(Instruction::Idle, None, 5_000);
        assert_eq!(command.start_time(), 5_000);
    }

    #[test]
    fn test_shutdown_ignores_offset() {
        let command = build_command_at(Instruction::Shutdown, Some(10_000), 5_000);
        assert_eq!(command.start_time(), 5_000);
    }

    #[test]
    fn test_factory_uses_wall_clock() {
        let before = clock::epoch_millis();
        let command = ShowCommand::go(Some(10_000));
        let after = clock::epoch_millis();
        assert!(command.start_time() >= before + 10_000);
        assert!(command.start_time() <= after + 10_000 + 100);

        let command = ShowCommand::shutdown();
        assert!(command.start_time() >= before);
        assert!(command.start_time() <= after + 100);
    }
}
