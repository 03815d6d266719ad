use serde::{Deserialize, Serialize};

use crate::{
    DEFAULT_BLOCK_SIZE, DEFAULT_MAX_FRAMES, DEFAULT_MAX_RANGES, DEFAULT_STATUS_MASK,
    DEFAULT_TAIL_MARGIN, DEFAULT_WARNING_LIMIT,
};

/// Smallest window worth disassembling: a handful of ARM instructions.
const MIN_BLOCK_SIZE: u32 = 0x10;

/// Tunables for the unwinder and the backtrace driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnwindConfig {
    pub block_size: u32,
    /// Decoded instructions discarded at the tail of each window; the end of
    /// an arbitrary byte range may be decoded from the middle of an
    /// instruction.
    pub tail_margin: usize,
    pub max_ranges: usize,
    pub warning_limit: usize,
    pub status_mask: u32,
    pub max_frames: usize,
}

impl Default for UnwindConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            tail_margin: DEFAULT_TAIL_MARGIN,
            max_ranges: DEFAULT_MAX_RANGES,
            warning_limit: DEFAULT_WARNING_LIMIT,
            status_mask: DEFAULT_STATUS_MASK,
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }
}

impl UnwindConfig {
    pub fn normalized(self) -> Self {
        Self {
            block_size: (self.block_size.max(MIN_BLOCK_SIZE) + 3) & !3,
            tail_margin: self.tail_margin,
            max_ranges: self.max_ranges.max(1),
            warning_limit: self.warning_limit,
            status_mask: self.status_mask,
            max_frames: self.max_frames.max(1),
        }
    }
}
