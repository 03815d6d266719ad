use std::collections::VecDeque;

use tracebt_listing::{Instruction, InstructionSource, Mode};
use tracing::debug;

use crate::config::UnwindConfig;
use crate::{CoreError, Result};

/// Bytes requested past the start of an already cached range so the
/// instruction right before it decodes cleanly.
const BOUNDARY_SLACK: u32 = 8;

/// Contiguous run of decoded instructions covering `[start, end)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstructionRange {
    pub start: u32,
    pub end: u32,
    pub mode: Mode,
    pub instructions: Vec<Instruction>,
}

impl InstructionRange {
    pub fn contains(&self, address: u32, mode: Mode) -> bool {
        self.mode == mode && self.start <= address && address < self.end
    }

    /// Index of the instruction covering `address`: the last one starting at
    /// or before it.
    fn index_of(&self, address: u32) -> Option<usize> {
        self.instructions
            .partition_point(|inst| inst.address <= address)
            .checked_sub(1)
    }
}

#[derive(Clone, Copy, Debug)]
struct Cursor {
    range: usize,
    /// Next instruction to hand out.
    index: usize,
}

/// Decoded-instruction cache with a pull-based cursor.
///
/// Ranges of the same mode never overlap. Once more than `max_ranges` are
/// held, the range inserted first is dropped, regardless of how recently it
/// was read.
pub struct AssemblyCache<S> {
    source: S,
    block_size: u32,
    tail_margin: usize,
    max_ranges: usize,
    ranges: VecDeque<InstructionRange>,
    cursor: Option<Cursor>,
}

impl<S: InstructionSource> AssemblyCache<S> {
    pub fn new(source: S, config: &UnwindConfig) -> Self {
        let config = config.normalized();
        Self {
            source,
            block_size: config.block_size,
            tail_margin: config.tail_margin,
            max_ranges: config.max_ranges,
            ranges: VecDeque::with_capacity(config.max_ranges + 1),
            cursor: None,
        }
    }

    pub fn ranges(&self) -> impl Iterator<Item = &InstructionRange> {
        self.ranges.iter()
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Position the cursor on the instruction covering `address`, loading a
    /// new range on a miss.
    pub fn jump(&mut self, address: u32, mode: Mode) -> Result<()> {
        let address = mode.code_address(address);
        let range = match self.find(address, mode) {
            Some(idx) => idx,
            None => self.load(address, mode)?,
        };
        let index = self.ranges[range]
            .index_of(address)
            .ok_or(CoreError::NotInRange { address })?;
        let landed = self.ranges[range].instructions[index].address;
        if landed != address {
            debug!("jump to {address:#x} lands inside instruction at {landed:#x}");
        }
        self.cursor = Some(Cursor { range, index });
        Ok(())
    }

    /// Next instruction in address order, crossing into the following range
    /// when the current one is exhausted.
    pub fn next_instruction(&mut self) -> Result<(Instruction, Mode)> {
        let cursor = self.cursor.as_mut().ok_or(CoreError::Unpositioned)?;
        let range = &self.ranges[cursor.range];
        if let Some(inst) = range.instructions.get(cursor.index) {
            cursor.index += 1;
            return Ok((inst.clone(), range.mode));
        }
        let (end, mode) = (range.end, range.mode);
        self.jump(end, mode)?;
        self.next_instruction()
    }

    fn find(&self, address: u32, mode: Mode) -> Option<usize> {
        self.ranges
            .iter()
            .position(|range| range.contains(address, mode))
    }

    fn load(&mut self, address: u32, mode: Mode) -> Result<usize> {
        let window_end = address.saturating_add(self.block_size);
        let next_cached = self
            .ranges
            .iter()
            .filter(|range| range.mode == mode && range.start > address && range.start < window_end)
            .map(|range| range.start)
            .min();
        let request_end = match next_cached {
            Some(start) => start.saturating_add(BOUNDARY_SLACK),
            None => window_end,
        };
        debug!("load range {address:#x}..{request_end:#x} ({mode})");

        let mut insts: Vec<Instruction> = self
            .source
            .fetch(address, request_end, mode)?
            .into_iter()
            .map(|mut inst| {
                inst.address = mode.code_address(inst.address);
                inst
            })
            .filter(|inst| inst.address >= address)
            .collect();
        insts.sort_by_key(|inst| inst.address);
        insts.dedup_by_key(|inst| inst.address);

        let end = match next_cached {
            Some(limit) => {
                insts.retain(|inst| inst.address < limit);
                limit
            }
            None => {
                // The tail of the window may have been decoded out of phase.
                let keep = insts.len().saturating_sub(self.tail_margin);
                let end = insts.get(keep).map(|inst| inst.address).unwrap_or(window_end);
                insts.truncate(keep);
                end
            }
        };
        let Some(first) = insts.first() else {
            return Err(CoreError::NoInstructions { address, mode });
        };
        if first.address > address {
            return Err(CoreError::NotInRange { address });
        }

        self.ranges.push_back(InstructionRange {
            start: address,
            end,
            mode,
            instructions: insts,
        });
        if self.ranges.len() > self.max_ranges {
            self.ranges.pop_front();
        }
        Ok(self.ranges.len() - 1)
    }
}
