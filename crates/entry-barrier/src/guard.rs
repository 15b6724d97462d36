//! Guard Word Values
//!
//! The guard word is a 32-bit integer compared against a per-thread expected
//! value on every method entry.
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────┐
//! │    31    │                  30 - 0                   │
//! │  sticky  │            phase / generation             │
//! └──────────┴──────────────────────────────────────────┘
//!
//! 0x0000_0000            armed: everyone takes the slow path
//! 0x0000_0001..0x7fff_fffe   disarmed for that phase
//! bit 31 set             not entrant, permanent trap
//! ```

/// Guard value that makes every thread take the slow path
pub const ARMED: u32 = 0;

/// Sticky bit marking a method that must never run again
pub const NOT_ENTRANT: u32 = 1 << 31;

/// Mask selecting the whole guard word
pub const ALL_BITS: u32 = u32::MAX;

/// First phase handed out after process start, and the wrap-around target
pub const INITIAL_PHASE: u32 = 1;

/// Phases wrap before reaching this value so they never touch the sticky bit
pub const PHASE_LIMIT: u32 = i32::MAX as u32;

/// Decoded view of a guard word relative to a disarmed phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Every entry traps
    Armed,
    /// Entries from threads that know this phase pass
    Disarmed(u32),
    /// Permanent trap
    NotEntrant,
}

impl GuardState {
    /// Classify a raw guard word
    ///
    /// A value that is neither the armed sentinel nor sticky is reported as
    /// `Disarmed` with whatever phase it carries, even if that phase is stale.
    pub fn decode(raw: u32) -> Self {
        if raw & NOT_ENTRANT != 0 {
            GuardState::NotEntrant
        } else if raw == ARMED {
            GuardState::Armed
        } else {
            GuardState::Disarmed(raw)
        }
    }

    /// Raw guard word for this state
    pub fn encode(self) -> u32 {
        match self {
            GuardState::Armed => ARMED,
            GuardState::Disarmed(phase) => phase & !NOT_ENTRANT,
            GuardState::NotEntrant => NOT_ENTRANT,
        }
    }
}

/// Check if a raw guard word carries the sticky bit
#[inline(always)]
pub fn is_sticky(raw: u32) -> bool {
    raw & NOT_ENTRANT != 0
}

/// Merge `value` into `old` under `mask`, never clearing the sticky bit
#[inline]
pub fn merge_masked(old: u32, value: u32, mask: u32) -> u32 {
    (value & mask) | (old & !mask) | (old & NOT_ENTRANT)
}

/// Next phase after `phase`, skipping `ARMED` and the sticky range
#[inline]
pub fn next_phase(phase: u32) -> u32 {
    let next = phase.wrapping_add(1);
    if next >= PHASE_LIMIT || next == ARMED {
        INITIAL_PHASE
    } else {
        next
    }
}
