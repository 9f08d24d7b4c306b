use crate::protocol::Instruction;
use crate::transport::Publisher;
use crate::trigger::ShowTrigger;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const MAX_CUES: usize = 64;
const MAX_READY_CUES: usize = 8;

/// One instruction sent `at_ms` after playback starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Cue {
    pub at_ms: u64,
    pub instruction: Instruction,
    /// Overrides the trigger's own synchronization offset for this cue.
    #[serde(default)]
    pub sync_offset_ms: Option<u64>,
}

impl Cue {
    pub fn new(at_ms: u64, instruction: Instruction) -> Self {
        Self {
            at_ms,
            instruction,
            sync_offset_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CueStats {
    pub total_scheduled: u32,
    pub total_sent: u32,
    pub total_failed: u32,
    pub total_cancelled: u32,
}

#[derive(Debug, Error)]
pub enum CueError {
    #[error("Cue list full ({max} cues)")]
    Full { max: usize },
    #[error("Invalid cue list: {0}")]
    Parse(String),
}

/// Time-tagged instructions, kept in chronological order.
#[derive(Debug, Default)]
pub struct CueList {
    cues: Vec<Cue, MAX_CUES>,
    stats: CueStats,
}

impl CueList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of cues, e.g. `[{"atMs":0,"instruction":"GO"}]`.
    pub fn from_json(json: &str) -> Result<Self, CueError> {
        let parsed: std::vec::Vec<Cue> = serde_json::from_str(json).map_err(|e| CueError::Parse(e.to_string()))?;

        let mut list = Self::new();
        for cue in parsed {
            list.schedule(cue)?;
        }
        Ok(list)
    }

    pub fn schedule(&mut self, cue: Cue) -> Result<(), CueError> {
        if self.cues.is_full() {
            return Err(CueError::Full { max: MAX_CUES });
        }

        let _ = self.cues.push(cue);
        // Stable: cues sharing a time keep their insertion order.
        self.cues.sort_by_key(|c| c.at_ms);
        self.stats.total_scheduled += 1;
        Ok(())
    }

    pub fn cues(&self) -> &[Cue] {
        &self.cues
    }

    pub fn next_at(&self) -> Option<u64> {
        self.cues.first().map(|c| c.at_ms)
    }

    /// Remove and return the cues due at `elapsed_ms`, oldest first.
    pub fn ready(&mut self, elapsed_ms: u64) -> Vec<Cue, MAX_READY_CUES> {
        let mut ready: Vec<Cue, MAX_READY_CUES> = Vec::new();

        while let Some(cue) = self.cues.first().copied() {
            if cue.at_ms > elapsed_ms || ready.push(cue).is_err() {
                // Ready buffer full, the rest go out on the next call
                break;
            }
            self.cues.remove(0);
        }

        ready
    }

    pub fn clear(&mut self) {
        self.stats.total_cancelled += self.cues.len() as u32;
        self.cues.clear();
    }

    pub fn len(&self) -> usize {
        self.cues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    pub fn stats(&self) -> &CueStats {
        &self.stats
    }

    /// Send every cue through `trigger` relative to now. Stops early when
    /// `cancel` fires; cues not yet sent are counted as cancelled.
    pub async fn play<P: Publisher>(mut self, trigger: &ShowTrigger<P>, cancel: CancellationToken) -> CueStats {
        let started = Instant::now();
        info!(trigger = %trigger.identity(), cues = self.len(), "Cue playback started");

        while let Some(next_at) = self.next_at() {
            let due = started + Duration::from_millis(next_at);
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(trigger = %trigger.identity(), remaining = self.len(), "Cue playback cancelled");
                    self.clear();
                    break;
                }
                () = time::sleep_until(due) => {}
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            for cue in self.ready(elapsed_ms) {
                let offset = cue.sync_offset_ms.or(trigger.sync_offset_ms());
                match trigger.emit(cue.instruction, offset).await {
                    Ok(_) => self.stats.total_sent += 1,
                    Err(e) => {
                        error!(trigger = %trigger.identity(), at_ms = cue.at_ms, error = %e, "Cue failed to send");
                        self.stats.total_failed += 1;
                    }
                }
            }
        }

        info!(trigger = %trigger.identity(), sent = self.stats.total_sent, "Cue playback finished");
        self.stats
    }
}
