use chrono::{DateTime, Utc};

use crate::error::SessionError;

/// One buffered audio fragment
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Session-wide, strictly increasing
    pub seq: u64,
    /// Opaque codec-encoded bytes
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Accumulates the current turn's audio in arrival order
///
/// Sequence numbers keep increasing across turns, so a fragment that lands
/// after `take()` always belongs to the next turn.
#[derive(Debug, Default)]
pub struct AudioIngestBuffer {
    chunks: Vec<AudioChunk>,
    last_seq: Option<u64>,
    buffered_bytes: usize,
}

impl AudioIngestBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Without an explicit `seq` the next number is used.
    pub fn push(&mut self, seq: Option<u64>, bytes: Vec<u8>) -> Result<u64, SessionError> {
        let seq = match (seq, self.last_seq) {
            (Some(seq), Some(last)) if seq <= last => {
                return Err(SessionError::ProtocolViolation(format!(
                    "audio fragment {} is not after {}",
                    seq, last
                )));
            }
            (Some(seq), _) => seq,
            (None, Some(last)) => last + 1,
            (None, None) => 0,
        };

        self.last_seq = Some(seq);
        self.buffered_bytes += bytes.len();
        self.chunks.push(AudioChunk {
            seq,
            bytes,
            received_at: Utc::now(),
        });

        Ok(seq)
    }

    /// Concatenate and clear the buffered fragments
    pub fn take(&mut self) -> Vec<u8> {
        let mut audio = Vec::with_capacity(self.buffered_bytes);
        for chunk in self.chunks.drain(..) {
            audio.extend_from_slice(&chunk.bytes);
        }
        self.buffered_bytes = 0;
        audio
    }

    /// Drop buffered audio without handing it off
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.buffered_bytes = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }
}
