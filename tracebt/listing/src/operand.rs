use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{ListingError, Result};

/// Core integer registers. Declaration order follows the register number,
/// which is also the order registers occupy memory in a multi-register
/// transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Register {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp,
    Lr,
    Pc,
}

impl Register {
    pub const ALL: [Register; 16] = [
        Register::R0,
        Register::R1,
        Register::R2,
        Register::R3,
        Register::R4,
        Register::R5,
        Register::R6,
        Register::R7,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::Sp,
        Register::Lr,
        Register::Pc,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.get(number as usize).copied()
    }

    /// General-purpose registers, i.e. everything but SP, LR and PC.
    pub fn is_general(self) -> bool {
        self.number() < Register::Sp.number()
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::Sp => write!(f, "sp"),
            Register::Lr => write!(f, "lr"),
            Register::Pc => write!(f, "pc"),
            other => write!(f, "r{}", other.number()),
        }
    }
}

impl FromStr for Register {
    type Err = ListingError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        let reg = match name.as_str() {
            "sp" => Register::Sp,
            "lr" => Register::Lr,
            "pc" => Register::Pc,
            "sb" => Register::R9,
            "sl" => Register::R10,
            "fp" => Register::R11,
            "ip" => Register::R12,
            other => other
                .strip_prefix('r')
                .and_then(|rest| rest.parse::<u8>().ok())
                .and_then(Register::from_number)
                .ok_or_else(|| ListingError::UnknownRegister(s.trim().to_string()))?,
        };
        Ok(reg)
    }
}

pub fn parse_register(text: &str) -> Result<Register> {
    text.parse()
}

/// One entry of a `{...}` register list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListedRegister {
    Core(Register),
    /// Single-precision VFP register `s<n>`.
    Single(u8),
    /// Double-precision VFP register `d<n>`.
    Double(u8),
}

impl ListedRegister {
    /// Bytes the register occupies on the stack.
    pub fn width(self) -> u32 {
        match self {
            ListedRegister::Core(_) | ListedRegister::Single(_) => 4,
            ListedRegister::Double(_) => 8,
        }
    }

    fn parse(text: &str) -> Result<Self> {
        let name = text.trim();
        if let Some(index) = vfp_index(name, 's') {
            return Ok(ListedRegister::Single(index));
        }
        if let Some(index) = vfp_index(name, 'd') {
            return Ok(ListedRegister::Double(index));
        }
        name.parse().map(ListedRegister::Core)
    }
}

fn vfp_index(name: &str, bank: char) -> Option<u8> {
    let index: u8 = name.strip_prefix(bank)?.parse().ok()?;
    (index < 32).then_some(index)
}

/// Register list operand such as `{r4, r5-r7, lr}` or `{d8-d15}`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterList {
    entries: Vec<ListedRegister>,
}

impl RegisterList {
    /// Parse the first `{...}` group found in `text`; anything before the
    /// brace (e.g. `sp!, `) is ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let malformed = || ListingError::MalformedRegisterList(text.trim().to_string());
        let open = text.find('{').ok_or_else(malformed)?;
        let close = text[open..].find('}').map(|idx| open + idx).ok_or_else(malformed)?;
        let inner = &text[open + 1..close];
        let mut entries = Vec::new();
        for item in inner.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            match item.split_once('-') {
                Some((first, last)) => {
                    let first = ListedRegister::parse(first)?;
                    let last = ListedRegister::parse(last)?;
                    entries.extend(expand_range(first, last).ok_or_else(malformed)?);
                }
                None => entries.push(ListedRegister::parse(item)?),
            }
        }
        if entries.is_empty() {
            return Err(malformed());
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ListedRegister] {
        &self.entries
    }

    /// Total bytes transferred to or from the stack.
    pub fn byte_size(&self) -> u32 {
        self.entries.iter().map(|entry| entry.width()).sum()
    }

    pub fn contains(&self, reg: Register) -> bool {
        self.entries.contains(&ListedRegister::Core(reg))
    }

    /// Core registers in transfer order (ascending register number).
    pub fn core_registers(&self) -> Vec<Register> {
        let mut regs: Vec<Register> = self
            .entries
            .iter()
            .filter_map(|entry| match entry {
                ListedRegister::Core(reg) => Some(*reg),
                _ => None,
            })
            .collect();
        regs.sort_unstable();
        regs.dedup();
        regs
    }

    /// Stack slot of every core register when the block starts at `base`:
    /// the lowest-numbered register goes to the lowest address.
    pub fn slots(&self, base: u32) -> Vec<(Register, u32)> {
        self.core_registers()
            .into_iter()
            .enumerate()
            .map(|(idx, reg)| (reg, base.wrapping_add(4 * idx as u32)))
            .collect()
    }
}

fn expand_range(first: ListedRegister, last: ListedRegister) -> Option<Vec<ListedRegister>> {
    match (first, last) {
        (ListedRegister::Core(a), ListedRegister::Core(b)) if a <= b => Some(
            (a.number()..=b.number())
                .filter_map(Register::from_number)
                .map(ListedRegister::Core)
                .collect(),
        ),
        (ListedRegister::Single(a), ListedRegister::Single(b)) if a <= b => {
            Some((a..=b).map(ListedRegister::Single).collect())
        }
        (ListedRegister::Double(a), ListedRegister::Double(b)) if a <= b => {
            Some((a..=b).map(ListedRegister::Double).collect())
        }
        _ => None,
    }
}

/// Parse an immediate operand (`#8`, `#0x10`, `#-4`, or the same without `#`).
pub fn parse_immediate(text: &str) -> Result<i64> {
    let raw = text.trim();
    let body = raw.strip_prefix('#').unwrap_or(raw).trim();
    let (negative, digits) = match body.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, body.strip_prefix('+').unwrap_or(body)),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .map_err(|_| ListingError::InvalidImmediate(raw.to_string()))?;
    Ok(if negative { -value } else { value })
}

/// Parse an absolute code address such as a branch target (`0x1f2c`).
pub fn parse_address(text: &str) -> Result<u32> {
    let raw = text.trim();
    match raw.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse::<u32>(),
    }
    .map_err(|_| ListingError::InvalidAddress(raw.to_string()))
}

/// Split operand text on top-level commas, keeping `{...}` and `[...]`
/// groups intact.
pub fn split_operands(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (idx, ch) in text.char_indices() {
        match ch {
            '{' | '[' => depth += 1,
            '}' | ']' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(text[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() || !parts.is_empty() {
        parts.push(tail);
    }
    parts
}
