//! Instruction-tracing stack unwinder.
//!
//! Starting from a frame (PC, SP, ARM/Thumb mode) the unwinder decodes
//! instructions forward, simulating their effect on SP and the tracked
//! registers, until it reaches the function's return: either a `bx lr` or a
//! pop that loads PC. The popped/linked address plus the simulated SP form the
//! caller's frame.
//!
//! The pieces, leaves first:
//! - [`cache::AssemblyCache`]: bounded cache of decoded instruction ranges
//!   with a pull-based cursor.
//! - [`branch::BranchHistory`]: per-unwind branch decisions with
//!   backtracking when a path loops without progress.
//! - [`simulator::Simulator`]: per-instruction effects on SP/registers.
//! - [`unwinder::Unwinder`]: drives one unwind step.
//! - [`backtrace::Backtrace`]: repeats unwind steps until a fixed point.

use thiserror::Error;

pub mod backtrace;
pub mod branch;
pub mod cache;
pub mod config;
pub mod frame;
pub mod registers;
pub mod simulator;
pub mod snapshot;
pub mod target;
pub mod unwinder;

pub use backtrace::{Backtrace, FrameOverrides};
pub use branch::{Branch, BranchHistory};
pub use cache::{AssemblyCache, InstructionRange};
pub use config::UnwindConfig;
pub use frame::{Frame, FrameDescription};
pub use registers::RegisterFile;
pub use simulator::{Effect, Simulator};
pub use snapshot::{load_snapshot, Snapshot, SymbolEntry, Word, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
pub use target::{FrameSink, NoSymbols, StatusGuard, SymbolResolver, Target, TargetError};
pub use unwinder::{CancelFlag, Unwinder};

pub use tracebt_listing::{Instruction, InstructionSource, Mode, Register};

/// Bytes disassembled per cache miss.
pub const DEFAULT_BLOCK_SIZE: u32 = 0x80;
/// Instructions dropped from the end of every freshly disassembled window.
pub const DEFAULT_TAIL_MARGIN: usize = 2;
/// Cached instruction ranges kept before the oldest is evicted.
pub const DEFAULT_MAX_RANGES: usize = 10;
/// Unsupported-construct warnings tolerated in one unwind step.
pub const DEFAULT_WARNING_LIMIT: usize = 32;
/// CPSR bits kept while unwinding: mode, interrupt masks, GE bits. Condition
/// flags, IT state and the Thumb bit are cleared so they cannot skew how the
/// debugger decodes conditional code.
pub const DEFAULT_STATUS_MASK: u32 = 0x00f0_03df;
/// Upper bound on frames produced by one backtrace.
pub const DEFAULT_MAX_FRAMES: usize = 256;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("cannot load instructions at {address:#x} ({mode})")]
    NoInstructions { address: u32, mode: Mode },
    #[error("instruction at {address:#x} not in range")]
    NotInRange { address: u32 },
    #[error("instruction cursor not positioned")]
    Unpositioned,
    #[error("infinite loop at branch {address:#x}")]
    InfiniteLoop { address: u32 },
    #[error("too many warnings ({count}) while unwinding from {pc:#x}")]
    TooManyWarnings { count: usize, pc: u32 },
    #[error("interrupted")]
    Interrupted,
    #[error("target error: {0}")]
    Target(#[from] TargetError),
    #[error("listing error: {0}")]
    Listing(#[from] tracebt_listing::ListingError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("snapshot error: {0}")]
    InvalidSnapshot(String),
}
