use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::config::StringTableConfig;


/// Adaptive per-connection string table. Strings that are read often get promoted to integer
///  IDs, which are announced to the peer (via the core `strmap` message); from then on the peer
///  may send the ID instead of the literal string.
///
/// There are two independent halves:
/// * The *read* side counts strings as they are read from the peer, promotes hot ones and
///    resolves IDs in incoming data. IDs are assigned sequentially and never reused.
/// * The *write* side holds the mappings announced by the peer. A string is only ever written
///    as an ID if the peer announced it, so correctness never depends on promotion timing -
///    literal strings are always acceptable.
///
/// Synchronization with the peer is opportunistic: there is no acknowledgement or
///  renegotiation.
pub struct StringTable {
    config: StringTableConfig,
    read: Mutex<ReadSide>,
    write: RwLock<FxHashMap<String, u32>>,
}

#[derive(Default)]
struct ReadSide {
    counting: FxHashMap<String, u32>,
    pending: FxHashSet<String>,
    promoted: FxHashMap<String, u32>,
    by_id: FxHashMap<u32, String>,
    next_id: u32,
}

impl StringTable {
    pub fn new(config: StringTableConfig) -> StringTable {
        StringTable {
            config,
            read: Default::default(),
            write: Default::default(),
        }
    }

    /// Registers a usage of a string that was read from the peer
    pub fn count_read(&self, value: &str) {
        if value.len() < self.config.min_string_len {
            return;
        }

        let mut read = self.read.lock();
        if read.promoted.contains_key(value) || read.pending.contains(value) {
            return;
        }

        let threshold = self.config.promotion_threshold;
        let count = read.counting.entry(value.to_string()).or_insert(0);
        *count += 1;
        if *count >= threshold {
            read.counting.remove(value);
            read.pending.insert(value.to_string());
        }
    }

    /// Assigns IDs to all strings that crossed the promotion threshold since the previous call,
    ///  returning the new mappings so they can be announced to the peer.
    pub fn promote_read(&self) -> Vec<(String, u32)> {
        let mut read = self.read.lock();
        if read.pending.is_empty() {
            return Vec::new();
        }

        let mut pending: Vec<String> = read.pending.drain().collect();
        pending.sort();

        let capacity = self.config.max_promoted.saturating_sub(read.promoted.len());
        if pending.len() > capacity {
            trace!("string table full - discarding {} promotion candidates", pending.len() - capacity);
            pending.truncate(capacity);
        }

        let mut result = Vec::with_capacity(pending.len());
        for value in pending {
            let id = read.next_id;
            read.next_id += 1;
            read.promoted.insert(value.clone(), id);
            read.by_id.insert(id, value.clone());
            result.push((value, id));
        }
        result
    }

    /// resolves an ID that this side assigned and announced
    pub fn get_read(&self, id: u32) -> Option<String> {
        self.read.lock().by_id.get(&id).cloned()
    }

    /// Records a mapping the peer announced for its read side, making it available for writing
    pub fn register_write(&self, value: String, id: u32) {
        self.write.write().insert(value, id);
    }

    pub fn try_map(&self, value: &str) -> Option<u32> {
        self.write.read().get(value).copied()
    }

    /// Halves all usage counters and evicts cold entries (and entries that are at or above the
    ///  promotion threshold, which belong to the pending set), bounding the memory spent on
    ///  strings that are only seen occasionally.
    pub fn cleanup(&self) {
        let floor = self.config.cleanup_floor;
        let threshold = self.config.promotion_threshold;

        let mut read = self.read.lock();
        let before = read.counting.len();
        read.counting.retain(|_, count| {
            *count /= 2;
            *count >= floor && *count < threshold
        });
        trace!("string table cleanup: {} -> {} counted strings", before, read.counting.len());
    }

    pub fn num_counting(&self) -> usize {
        self.read.lock().counting.len()
    }

    pub fn num_promoted(&self) -> usize {
        self.read.lock().promoted.len()
    }
}
