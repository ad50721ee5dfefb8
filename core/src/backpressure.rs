use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

const INTERACTIVE_LOW_WATER_MARK: usize = 128 * 1024; // 128 KiB
const INTERACTIVE_TARGET_AFTER_DROP: usize = 384 * 1024; // 384 KiB
const INTERACTIVE_MAX_QUEUE_BYTES: usize = 512 * 1024; // 512 KiB
const INTERACTIVE_MAX_WRITE_CHUNK: usize = 64 * 1024; // 64 KiB

const AGENT_LOW_WATER_MARK: usize = 2 * 1024 * 1024; // 2 MiB
const AGENT_TARGET_AFTER_DROP: usize = 6 * 1024 * 1024; // 6 MiB
const AGENT_MAX_QUEUE_BYTES: usize = 8 * 1024 * 1024; // 8 MiB
const AGENT_MAX_WRITE_CHUNK: usize = 1024 * 1024; // 1 MiB

/// Watermarks for one output queue. Invariant:
/// `low_water_mark < target_after_drop <= max_queue_bytes`.
///
/// `target_after_drop` sits below `max_queue_bytes` so an overflow does
/// not re-trigger on the very next small chunk; `low_water_mark` sits
/// below both so the overflow latch cannot oscillate around a single
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub low_water_mark: usize,
    pub max_queue_bytes: usize,
    pub target_after_drop: usize,
    /// Largest single chunk the producer-side writer may push without
    /// splitting it first. Enforced by the writer, not this queue.
    pub max_write_chunk: usize,
}

impl QueueConfig {
    /// Profile for interactive shells: bursts are small, so tight bounds
    /// keep memory low.
    pub const fn interactive() -> Self {
        Self {
            low_water_mark: INTERACTIVE_LOW_WATER_MARK,
            max_queue_bytes: INTERACTIVE_MAX_QUEUE_BYTES,
            target_after_drop: INTERACTIVE_TARGET_AFTER_DROP,
            max_write_chunk: INTERACTIVE_MAX_WRITE_CHUNK,
        }
    }

    /// Profile for agent-driven terminals. Agents emit large structured
    /// bursts (full file contents, diffs) that must land atomically, so
    /// both the bounds and the largest allowed write chunk are materially
    /// bigger than the interactive profile.
    pub const fn agent() -> Self {
        Self {
            low_water_mark: AGENT_LOW_WATER_MARK,
            max_queue_bytes: AGENT_MAX_QUEUE_BYTES,
            target_after_drop: AGENT_TARGET_AFTER_DROP,
            max_write_chunk: AGENT_MAX_WRITE_CHUNK,
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.low_water_mark < self.target_after_drop
            && self.target_after_drop <= self.max_queue_bytes
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Bounded queue between a process-output producer and a rendering
/// consumer, shedding the oldest buffered chunks when the consumer falls
/// behind.
///
/// Pure data structure: the caller owns the transport and is responsible
/// for discarding the bytes backing any dropped chunks. Overflow is a
/// state transition (`overflow_active`, non-zero `dropped_bytes`), never
/// an error, and never stalls either side.
#[derive(Debug, Default)]
pub struct OutputQueue {
    chunks: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    dropped_bytes: u64,
    overflow_active: bool,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and apply the watermark policy.
    ///
    /// Dropping starts at the head (oldest first): a user watching a live
    /// terminal cares about recent output, not lines already scrolled
    /// past. The overflow latch set here survives until `queued_bytes`
    /// falls back to `low_water_mark`, at which point the latch clears
    /// and `dropped_bytes` resets for the next recovery cycle.
    pub fn enqueue(&mut self, chunk: Vec<u8>, config: &QueueConfig) {
        debug_assert!(config.is_valid());
        self.queued_bytes += chunk.len();
        self.chunks.push_back(chunk);

        if self.queued_bytes <= config.max_queue_bytes {
            if self.overflow_active && self.queued_bytes <= config.low_water_mark {
                self.overflow_active = false;
                self.dropped_bytes = 0;
            }
            return;
        }

        self.overflow_active = true;
        while self.queued_bytes > config.target_after_drop {
            let Some(dropped) = self.chunks.pop_front() else {
                break;
            };
            self.queued_bytes -= dropped.len();
            self.dropped_bytes += dropped.len() as u64;
        }
    }

    /// Consumer side: take the oldest queued chunk.
    pub fn dequeue(&mut self) -> Option<Vec<u8>> {
        let chunk = self.chunks.pop_front()?;
        self.queued_bytes -= chunk.len();
        Some(chunk)
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Bytes shed since the current overflow cycle began.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    pub fn overflow_active(&self) -> bool {
        self.overflow_active
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
