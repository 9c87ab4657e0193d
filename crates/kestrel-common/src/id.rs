//! Row identifiers.
//!
//! Row ids are 64-bit, time-ordered and unique per node:
//!
//! ```text
//! | 42 bits: ms since 2024-01-01 | 12 bits: node | 10 bits: sequence |
//! ```
//!
//! When a node issues more than 1024 ids in one millisecond the generator
//! borrows from the next millisecond instead of sleeping, so ids stay
//! strictly increasing per generator.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, Result};
use crate::page::NodeId;

/// Custom epoch: 2024-01-01 00:00:00 UTC (milliseconds since Unix epoch).
const EPOCH_MS: u64 = 1_704_067_200_000;

const NODE_BITS: u32 = 12;
const SEQUENCE_BITS: u32 = 10;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Opaque, globally unique, totally ordered row identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RowId(pub u64);

impl RowId {
    /// Milliseconds since the id epoch at which this id was issued.
    pub fn timestamp_ms(&self) -> u64 {
        self.0 >> (NODE_BITS + SEQUENCE_BITS)
    }

    /// Low bits of the issuing node.
    pub fn node_bits(&self) -> u64 {
        (self.0 >> SEQUENCE_BITS) & NODE_MASK
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

struct GeneratorState {
    last_timestamp: u64,
    sequence: u64,
}

/// Issues row ids for one node.
pub struct RowIdGenerator {
    node: u64,
    state: Mutex<GeneratorState>,
}

impl RowIdGenerator {
    /// Creates a generator for the given node.
    pub fn new(node: NodeId) -> Self {
        Self {
            node: node.0 & NODE_MASK,
            state: Mutex::new(GeneratorState {
                last_timestamp: 0,
                sequence: 0,
            }),
        }
    }

    /// Issues the next id.
    pub fn next_id(&self) -> Result<RowId> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| KestrelError::Internal("system clock is before Unix epoch".into()))?
            .as_millis() as u64;
        let timestamp = now_ms.saturating_sub(EPOCH_MS);

        let mut state = self.state.lock();
        if timestamp > state.last_timestamp {
            state.last_timestamp = timestamp;
            state.sequence = 0;
        } else {
            // Same millisecond, or the clock stepped backwards.
            state.sequence += 1;
            if state.sequence > SEQUENCE_MASK {
                state.last_timestamp += 1;
                state.sequence = 0;
            }
        }

        Ok(RowId(
            (state.last_timestamp << (NODE_BITS + SEQUENCE_BITS))
                | (self.node << SEQUENCE_BITS)
                | state.sequence,
        ))
    }
}
