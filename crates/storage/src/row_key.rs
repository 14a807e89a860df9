//! Snowflake-style row keys.
//!
//! Layout (63 usable bits): 41-bit milliseconds since [`KEY_EPOCH_MS`],
//! 10-bit node id, 12-bit per-millisecond sequence. Keys from one generator
//! are strictly increasing; keys from generators with distinct node ids
//! never collide.

use std::sync::Mutex;

use chrono::Utc;

use crate::error::StorageError;

/// 2020-01-01T00:00:00Z.
pub const KEY_EPOCH_MS: i64 = 1_577_836_800_000;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
pub const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Default)]
struct KeyState {
    last_ms: i64,
    sequence: u16,
}

/// Issues process-unique row keys for one node.
#[derive(Debug)]
pub struct RowKeyGenerator {
    node_id: u16,
    state: Mutex<KeyState>,
}

impl RowKeyGenerator {
    pub fn new(node_id: u16) -> Result<Self, StorageError> {
        if node_id > MAX_NODE_ID {
            return Err(StorageError::Other(format!(
                "node id {node_id} out of range (max {MAX_NODE_ID})"
            )));
        }
        Ok(Self {
            node_id,
            state: Mutex::new(KeyState::default()),
        })
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    pub fn next_key(&self) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // A clock that moved backwards is held at the last issued millisecond.
        let mut now = now_ms().max(state.last_ms);
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                while now <= state.last_ms {
                    std::hint::spin_loop();
                    now = now_ms();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        ((now - KEY_EPOCH_MS) << (NODE_BITS + SEQUENCE_BITS))
            | (i64::from(self.node_id) << SEQUENCE_BITS)
            | i64::from(state.sequence)
    }

    pub fn next_keys(&self, n: usize) -> Vec<i64> {
        (0..n).map(|_| self.next_key()).collect()
    }
}

/// Split a key into (unix millis, node id, sequence).
pub fn decompose(key: i64) -> (i64, u16, u16) {
    let ms = (key >> (NODE_BITS + SEQUENCE_BITS)) + KEY_EPOCH_MS;
    let node = ((key >> SEQUENCE_BITS) & i64::from(MAX_NODE_ID)) as u16;
    let seq = (key & i64::from(MAX_SEQUENCE)) as u16;
    (ms, node, seq)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
