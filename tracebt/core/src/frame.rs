use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

use tracebt_listing::{Mode, Register};

use crate::registers::RegisterFile;
use crate::target::SymbolResolver;

/// One reconstructed point of the call chain.
///
/// Equality and hashing only look at PC, SP and mode; the register snapshot is
/// carried along so the next unwind step can start from what was recovered.
#[derive(Clone, Debug)]
pub struct Frame {
    pc: u32,
    sp: u32,
    mode: Mode,
    registers: Option<RegisterFile>,
}

impl Frame {
    pub fn new(pc: u32, sp: u32, mode: Mode) -> Self {
        Self {
            pc,
            sp,
            mode,
            registers: None,
        }
    }

    /// Frame for a caller reached through `address`: bit 0 selects Thumb and
    /// is cleared from the stored PC.
    pub fn from_return_address(address: u32, sp: u32) -> Self {
        Self::new(address & !1, sp, Mode::from_return_address(address))
    }

    pub fn with_registers(mut self, registers: RegisterFile) -> Self {
        self.registers = Some(registers);
        self
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn sp(&self) -> u32 {
        self.sp
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_thumb(&self) -> bool {
        self.mode.is_thumb()
    }

    pub fn registers(&self) -> Option<&RegisterFile> {
        self.registers.as_ref()
    }

    /// PC aligned to an instruction boundary for the frame's mode.
    pub fn code_address(&self) -> u32 {
        self.mode.code_address(self.pc)
    }

    /// Register state the next unwind step starts from: the recovered
    /// registers (if any) with PC and SP forced to this frame's values.
    pub fn seed_registers(&self) -> RegisterFile {
        let mut regs = self.registers.clone().unwrap_or_default();
        regs.set(Register::Pc, self.pc);
        regs.set(Register::Sp, self.sp);
        regs
    }

    pub fn describe<R: SymbolResolver + ?Sized>(&self, resolver: &mut R) -> FrameDescription {
        let pc = self.code_address();
        let function = resolver
            .function_name(pc)
            .map(|name| short_function_name(&name))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "??".to_string());
        let library = resolver
            .library_name(pc)
            .map(|lib| {
                Path::new(&lib)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or(lib)
            })
            .unwrap_or_else(|| "??".to_string());
        FrameDescription {
            sp: self.sp,
            pc,
            function,
            library,
        }
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.pc == other.pc && self.sp == other.sp && self.mode == other.mode
    }
}

impl Eq for Frame {}

impl Hash for Frame {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pc.hash(state);
        self.sp.hash(state);
        self.mode.hash(state);
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc={:#010x} sp={:#010x} ({})", self.pc, self.sp, self.mode)
    }
}

/// Human-readable rendering of a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameDescription {
    pub sp: u32,
    pub pc: u32,
    pub function: String,
    pub library: String,
}

impl fmt::Display for FrameDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame {:#08x} in function {} ({:#08x}) from {}",
            self.sp, self.function, self.pc, self.library
        )
    }
}

/// Reduce a resolver answer such as `foo(int) + 12 in section .text` to the
/// bare function name.
fn short_function_name(name: &str) -> String {
    for sep in ["(", "+", " in section"] {
        if let Some(idx) = name.find(sep) {
            return name[..idx].trim().to_string();
        }
    }
    name.trim().to_string()
}
