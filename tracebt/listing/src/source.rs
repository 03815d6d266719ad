use std::collections::BTreeMap;

use crate::instruction::{parse_listing, Instruction, Mode};
use crate::Result;

/// Supplies decoded instructions for an address window.
pub trait InstructionSource {
    /// Instructions with `start <= address < end` in ascending address order.
    /// `start` is already aligned for `mode`.
    fn fetch(&mut self, start: u32, end: u32, mode: Mode) -> Result<Vec<Instruction>>;
}

impl<S: InstructionSource + ?Sized> InstructionSource for &mut S {
    fn fetch(&mut self, start: u32, end: u32, mode: Mode) -> Result<Vec<Instruction>> {
        (**self).fetch(start, end, mode)
    }
}

impl<S: InstructionSource + ?Sized> InstructionSource for Box<S> {
    fn fetch(&mut self, start: u32, end: u32, mode: Mode) -> Result<Vec<Instruction>> {
        (**self).fetch(start, end, mode)
    }
}

/// A debugger-side disassembler returning listing text for `[start, end)`.
/// In Thumb mode `start` carries bit 0, the usual way of asking a debugger
/// to decode Thumb.
pub trait Disassembler {
    fn disassemble(&mut self, start: u32, end: u32) -> Result<String>;
}

/// Adapts a text [`Disassembler`] into an [`InstructionSource`].
pub struct TextSource<D> {
    disassembler: D,
}

impl<D: Disassembler> TextSource<D> {
    pub fn new(disassembler: D) -> Self {
        Self { disassembler }
    }

    pub fn into_inner(self) -> D {
        self.disassembler
    }
}

impl<D: Disassembler> InstructionSource for TextSource<D> {
    fn fetch(&mut self, start: u32, end: u32, mode: Mode) -> Result<Vec<Instruction>> {
        let text = self
            .disassembler
            .disassemble(mode.tagged_address(start), end)?;
        Ok(parse_listing(&text)
            .into_iter()
            .map(|mut inst| {
                inst.address = mode.code_address(inst.address);
                inst
            })
            .filter(|inst| inst.address >= start && inst.address < end)
            .collect())
    }
}

/// Fully decoded code held in memory, one table per mode.
#[derive(Clone, Debug, Default)]
pub struct StaticListing {
    arm: BTreeMap<u32, Instruction>,
    thumb: BTreeMap<u32, Instruction>,
}

impl StaticListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_instructions(mode: Mode, insts: impl IntoIterator<Item = Instruction>) -> Self {
        let mut listing = Self::new();
        listing.extend(mode, insts);
        listing
    }

    /// Parse listing text into the table for `mode`; returns how many
    /// instructions were added.
    pub fn add_text(&mut self, mode: Mode, text: &str) -> usize {
        let insts = parse_listing(text);
        let count = insts.len();
        self.extend(mode, insts);
        count
    }

    pub fn insert(&mut self, mode: Mode, mut inst: Instruction) {
        inst.address = mode.code_address(inst.address);
        self.table_mut(mode).insert(inst.address, inst);
    }

    pub fn extend(&mut self, mode: Mode, insts: impl IntoIterator<Item = Instruction>) {
        for inst in insts {
            self.insert(mode, inst);
        }
    }

    pub fn len(&self) -> usize {
        self.arm.len() + self.thumb.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arm.is_empty() && self.thumb.is_empty()
    }

    fn table(&self, mode: Mode) -> &BTreeMap<u32, Instruction> {
        match mode {
            Mode::Arm => &self.arm,
            Mode::Thumb => &self.thumb,
        }
    }

    fn table_mut(&mut self, mode: Mode) -> &mut BTreeMap<u32, Instruction> {
        match mode {
            Mode::Arm => &mut self.arm,
            Mode::Thumb => &mut self.thumb,
        }
    }
}

impl InstructionSource for StaticListing {
    fn fetch(&mut self, start: u32, end: u32, mode: Mode) -> Result<Vec<Instruction>> {
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(self
            .table(mode)
            .range(start..end)
            .map(|(_, inst)| inst.clone())
            .collect())
    }
}
