use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and sizing knobs for conversation sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Close the session when nothing arrives from the client for this long
    /// Default: 60 seconds
    pub heartbeat_window_ms: u64,

    /// Interval between transport-level pings sent by the gateway
    pub ping_interval_ms: u64,

    /// End the turn after this much silence (no new fragments) while listening
    pub silence_timeout_ms: u64,

    /// End the turn once this many fragments are buffered (disabled when unset)
    pub end_of_turn_after_fragments: Option<usize>,

    /// Turns with less buffered audio are not transcribed
    pub min_turn_bytes: usize,

    /// Bound of the per-connection outbound queue
    pub outbound_capacity: usize,

    /// How long a producer may wait on a full outbound queue before the
    /// client is considered stalled
    pub backpressure_grace_ms: u64,

    pub transcription_timeout_ms: u64,
    pub generation_timeout_ms: u64,

    /// Applied to every synthesis call (one per sentence when segmenting)
    pub synthesis_timeout_ms: u64,

    /// Synthesize sentence by sentence to reduce time-to-first-audio
    pub segment_sentences: bool,

    /// Consecutive protocol violations tolerated before the connection is closed
    pub max_protocol_violations: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_window_ms: 60_000,
            ping_interval_ms: 20_000,
            silence_timeout_ms: 1_500,
            end_of_turn_after_fragments: None,
            min_turn_bytes: 1,
            outbound_capacity: 64,
            backpressure_grace_ms: 5_000,
            transcription_timeout_ms: 30_000,
            generation_timeout_ms: 60_000,
            synthesis_timeout_ms: 25_000,
            segment_sentences: true,
            max_protocol_violations: 20,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_millis(self.heartbeat_window_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn backpressure_grace(&self) -> Duration {
        Duration::from_millis(self.backpressure_grace_ms)
    }

    pub fn transcription_timeout(&self) -> Duration {
        Duration::from_millis(self.transcription_timeout_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }
}
