//! # showbus
//!
//! Synchronized show-control over a fan-out message bus. One operator trigger
//! broadcasts `GO`, `IDLE` and `SHUTDOWN` instructions; every show element
//! subscribed to the exchange waits for the command's absolute start time and
//! then runs exactly one behavior routine at a time.
//!
//! ## Features
//!
//! - **Synchronized start**: commands carry an epoch-millisecond deadline, not an arrival time
//! - **Exclusive preemptible routines**: a newer command cancels the running one before starting
//! - **Automatic fallback**: a finished or faulted show sequence returns to the idle loop
//! - **Pluggable transport**: in-process exchange for one host, line-framed TCP hub for many
//! - **Operator tools**: one-shot commands, keyboard listener and cue list playback
//!
//! ## Quick Start
//!
//! ```no_run
//! use showbus::{BlinkBehavior, ElementConfig, Identity, LocalExchange, MemoryPin, ShowElement};
//! use showbus::{parse_pattern, ShowTrigger, TriggerConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let exchange = LocalExchange::new("show");
//!
//! let behavior = BlinkBehavior::new(MemoryPin::new("lamp"), parse_pattern("on:500,off:500")?);
//! let element = ShowElement::spawn(Identity::new("Lamp", 1), behavior, ElementConfig::default());
//! element.attach(exchange.subscribe());
//!
//! let trigger = ShowTrigger::new(Identity::new("Desk", 1), exchange.publisher(), &TriggerConfig::default());
//! trigger.send_go().await?;
//! trigger.send_shutdown().await?;
//! element.stopped().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Instruction set, command factory and JSON codec
//! - [`element`] - Element state machine and behavior capability trait
//! - [`trigger`] - Command emitter and operator keyboard listener
//! - [`scheduler`] - Time-tagged cue list playback
//! - [`pin`] - Digital output actuation and a blink behavior
//! - [`transport`] - Publish/subscribe seams, local and TCP fan-out
//! - [`config`] - Defaults and configuration structs

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod clock;
pub mod config;
pub mod element;
pub mod pin;
pub mod protocol;
pub mod scheduler;
pub mod transport;
pub mod trigger;

// Re-export main public types for convenience
pub use config::{BrokerConfig, ElementConfig, Identity, TriggerConfig};
pub use element::{
    ElementError, ElementPhase, ElementState, ElementStats, RoutineContext, RoutineError, ShowBehavior, ShowElement,
};
pub use pin::{parse_pattern, BlinkBehavior, MemoryPin, OutputPin, PinActuator, PinState};
pub use protocol::{build_command, Instruction, ProtocolError, ShowCommand};
pub use scheduler::{Cue, CueList};
pub use transport::{LocalExchange, Publisher, Subscriber, TransportError};
pub use trigger::{KeyMap, ShowTrigger, TriggerError};
