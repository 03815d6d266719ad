use serde::{Deserialize, Serialize};
use std::fmt;

use crate::operand::split_operands;

/// Thumb execution state bit in CPSR.
pub const THUMB_STATE_BIT: u32 = 0x20;

/// Instruction-set state the code is decoded in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Fixed 32-bit encoding.
    Arm,
    /// Compact 16/32-bit encoding.
    Thumb,
}

impl Mode {
    /// Interworking rule: bit 0 of a branch/return target selects Thumb.
    pub fn from_return_address(address: u32) -> Self {
        if address & 1 != 0 {
            Mode::Thumb
        } else {
            Mode::Arm
        }
    }

    pub fn from_status(cpsr: u32) -> Self {
        if cpsr & THUMB_STATE_BIT != 0 {
            Mode::Thumb
        } else {
            Mode::Arm
        }
    }

    pub fn is_thumb(self) -> bool {
        matches!(self, Mode::Thumb)
    }

    pub fn toggled(self) -> Self {
        match self {
            Mode::Arm => Mode::Thumb,
            Mode::Thumb => Mode::Arm,
        }
    }

    /// Align `address` to an instruction boundary for this mode.
    pub fn code_address(self, address: u32) -> u32 {
        match self {
            Mode::Arm => address & !3,
            Mode::Thumb => address & !1,
        }
    }

    /// Address form a debugger expects when asked to disassemble in this mode.
    pub fn tagged_address(self, address: u32) -> u32 {
        match self {
            Mode::Arm => address & !3,
            Mode::Thumb => address | 1,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Arm => write!(f, "arm"),
            Mode::Thumb => write!(f, "thumb"),
        }
    }
}

/// One decoded instruction.
///
/// `mnemonic` is lowercase with any `.n`/`.w` width qualifier removed and
/// `operands` carries the raw operand text without trailing comments or
/// resolved `<symbol>` annotations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub address: u32,
    pub mnemonic: String,
    #[serde(default)]
    pub operands: String,
}

impl Instruction {
    pub fn new(address: u32, mnemonic: &str, operands: &str) -> Self {
        Self {
            address,
            mnemonic: normalize_mnemonic(&mnemonic.to_ascii_lowercase()).to_string(),
            operands: operands.trim().to_ascii_lowercase(),
        }
    }

    /// Top-level operands, split on commas outside of `{}`/`[]`.
    pub fn operand_list(&self) -> Vec<&str> {
        split_operands(&self.operands)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operands.is_empty() {
            write!(f, "{:#x}: {}", self.address, self.mnemonic)
        } else {
            write!(f, "{:#x}: {} {}", self.address, self.mnemonic, self.operands)
        }
    }
}

fn normalize_mnemonic(mnemonic: &str) -> &str {
    mnemonic
        .strip_suffix(".n")
        .or_else(|| mnemonic.strip_suffix(".w"))
        .unwrap_or(mnemonic)
}

/// Parse one line of `disassemble` output, e.g.
/// `=> 0x0000a1b4 <foo+12>:\tldr.w\tr3, [pc, #16]\t; 0xa1c8 <foo+32>`.
///
/// Headers, footers and anything else without an address/mnemonic pair
/// yield `None`.
pub fn parse_line(line: &str) -> Option<Instruction> {
    let line = line.to_ascii_lowercase();
    let sep = find_separator(&line)?;
    let (head, body) = (&line[..sep], &line[sep + 1..]);

    let hex = &head[head.find("0x")? + 2..];
    let digits_len = hex
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(hex.len());
    if digits_len == 0 {
        return None;
    }
    let address = u32::from_str_radix(&hex[..digits_len], 16).ok()?;

    let body = body.trim_start();
    let mnemonic_len = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(body.len());
    if mnemonic_len == 0 {
        return None;
    }
    let mnemonic = normalize_mnemonic(&body[..mnemonic_len]);
    let rest = &body[mnemonic_len..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) && !rest.starts_with(';') {
        return None;
    }
    let rest = rest.split(';').next().unwrap_or_default();
    let operands = rest.split('<').next().unwrap_or_default().trim();

    Some(Instruction {
        address,
        mnemonic: mnemonic.to_string(),
        operands: operands.to_string(),
    })
}

/// Position of the `:` that separates the address column from the
/// instruction text. Symbol names may contain `::`, so the colon must be
/// followed by whitespace.
fn find_separator(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    bytes
        .iter()
        .enumerate()
        .position(|(idx, &b)| {
            b == b':' && bytes.get(idx + 1).is_some_and(|next| next.is_ascii_whitespace())
        })
}

/// Parse a full listing, skipping lines that are not instructions.
pub fn parse_listing(text: &str) -> Vec<Instruction> {
    text.lines().filter_map(parse_line).collect()
}
