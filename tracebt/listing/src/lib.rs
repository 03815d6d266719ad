//! Instruction-level view of ARM/Thumb code as produced by a disassembler.
//!
//! This crate is the leaf of the unwinder: it knows how to read a textual
//! disassembly listing, how to pick apart operand text (registers, register
//! lists, immediates) and how to hand out decoded instructions for an address
//! window through [`InstructionSource`].

pub mod instruction;
pub mod operand;
pub mod source;

pub use instruction::{parse_line, parse_listing, Instruction, Mode, THUMB_STATE_BIT};
pub use operand::{
    parse_address, parse_immediate, parse_register, split_operands, ListedRegister, Register,
    RegisterList,
};
pub use source::{Disassembler, InstructionSource, StaticListing, TextSource};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ListingError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListingError {
    #[error("unknown register '{0}'")]
    UnknownRegister(String),
    #[error("malformed register list '{0}'")]
    MalformedRegisterList(String),
    #[error("invalid immediate '{0}'")]
    InvalidImmediate(String),
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
    #[error("disassembler failed: {0}")]
    Disassembler(String),
}
