//! Per-instruction effect of decoded code on SP and the tracked registers.
//!
//! Only what matters for finding the caller is modelled: stack pointer
//! movement, values pushed to and popped from the stack, simple register
//! moves and arithmetic, branches, and the two return idioms (`bx lr` and a
//! pop that loads PC). Anything else that writes a tracked register makes it
//! unknown.

use std::collections::BTreeMap;

use tracebt_listing::{
    parse_address, parse_immediate, parse_register, Instruction, Mode, Register, RegisterList,
};
use tracing::{debug, info, warn};

use crate::branch::BranchHistory;
use crate::frame::Frame;
use crate::registers::RegisterFile;
use crate::target::Target;
use crate::{CoreError, Result};

const CONDITIONS: [&str; 16] = [
    "eq", "ne", "cs", "cc", "hs", "lo", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le",
];

/// Registers a called function may leave with different values.
const CALL_CLOBBERED: [Register; 6] = [
    Register::R0,
    Register::R1,
    Register::R2,
    Register::R3,
    Register::R12,
    Register::Lr,
];

/// Mnemonic prefixes whose first operand is read, not written.
const READS_FIRST_OPERAND: [&str; 11] = [
    "cmp", "cmn", "tst", "teq", "str", "stm", "push", "vpush", "vst", "pld", "pli",
];

/// What the unwinder should do after one simulated instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Fall through to the next instruction.
    Continue,
    /// Continue at `address`, decoded in `mode`.
    Jump { address: u32, mode: Mode },
    /// The function returned; this is the caller's frame.
    Return(Frame),
}

/// Single-register stack access: the word at `sp + offset` is transferred,
/// then SP moves by `writeback`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct StackAccess {
    offset: i64,
    writeback: i64,
}

/// State of one unwind step: simulated SP, the partial register model, the
/// shadow stack of values pushed since the step started, and branch history.
#[derive(Debug)]
pub struct Simulator {
    sp: u32,
    registers: RegisterFile,
    stack: BTreeMap<u32, u32>,
    history: BranchHistory,
    warnings: usize,
    warning_limit: usize,
    origin: u32,
}

impl Simulator {
    pub fn new(frame: &Frame, warning_limit: usize) -> Self {
        let mut registers = frame.seed_registers();
        registers.forget(Register::Pc);
        registers.forget(Register::Sp);
        Self {
            sp: frame.sp(),
            registers,
            stack: BTreeMap::new(),
            history: BranchHistory::new(),
            warnings: 0,
            warning_limit,
            origin: frame.pc(),
        }
    }

    pub fn sp(&self) -> u32 {
        self.sp
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn history(&self) -> &BranchHistory {
        &self.history
    }

    pub fn warnings(&self) -> usize {
        self.warnings
    }

    /// Value recorded at `address` by a simulated store, if still live.
    pub fn stack_value(&self, address: u32) -> Option<u32> {
        self.stack.get(&address).copied()
    }

    pub fn step<T: Target + ?Sized>(
        &mut self,
        inst: &Instruction,
        mode: Mode,
        target: &mut T,
    ) -> Result<Effect> {
        let mnemonic = inst.mnemonic.as_str();
        let ops = inst.operand_list();

        if matches!(mnemonic, "b" | "bx" | "bal" | "bxal") {
            return self.unconditional_branch(inst, mode, &ops, target);
        }
        if let Some(dest) = conditional_branch_target(mnemonic, &inst.operands) {
            return self.conditional_branch(inst, mode, dest);
        }
        if is_call(mnemonic) {
            for reg in CALL_CLOBBERED {
                self.registers.forget(reg);
            }
            return Ok(Effect::Continue);
        }

        let writes_sp = ops.first().copied() == Some("sp!");
        if mnemonic == "vpush" || (mnemonic.starts_with("vstmdb") && writes_sp) {
            if let Some(list) = self.register_list(inst)? {
                self.set_sp(self.sp.wrapping_sub(list.byte_size()));
            }
            return Ok(Effect::Continue);
        }
        if mnemonic == "vpop" || (mnemonic.starts_with("vldmia") && writes_sp) {
            if let Some(list) = self.register_list(inst)? {
                self.set_sp(self.sp.wrapping_add(list.byte_size()));
            }
            return Ok(Effect::Continue);
        }
        if mnemonic == "push"
            || ((mnemonic.starts_with("stmdb") || mnemonic.starts_with("stmfd")) && writes_sp)
        {
            if let Some(list) = self.register_list(inst)? {
                self.push(inst, mode, &list);
            }
            return Ok(Effect::Continue);
        }
        let is_ldm = mnemonic == "ldm" || mnemonic.starts_with("ldmia") || mnemonic.starts_with("ldmfd");
        if mnemonic == "pop"
            || (is_ldm && writes_sp)
            || (mnemonic.starts_with("pop") && list_contains(&inst.operands, Register::Pc))
        {
            return match self.register_list(inst)? {
                Some(list) => self.pop(inst, &list, target),
                None => Ok(Effect::Continue),
            };
        }

        if matches!(mnemonic, "str" | "ldr" | "strd" | "ldrd") {
            if let Some(effect) = self.stack_transfer(inst, mode, &ops, target)? {
                return Ok(effect);
            }
        }

        let dest = ops.first().and_then(|op| parse_register(op).ok());
        if dest == Some(Register::Sp)
            && matches!(mnemonic, "add" | "sub" | "addw" | "subw" | "mov")
        {
            match self.arithmetic(inst, mode, &ops) {
                Some(value) => self.set_sp(value),
                None => self.warn(inst, "unhandled stack pointer arithmetic")?,
            }
            return Ok(Effect::Continue);
        }
        if dest == Some(Register::Pc) && mnemonic == "mov" && ops.get(1).copied() == Some("lr") {
            return self.return_through_lr(inst, target);
        }

        self.track_registers(inst, mode, &ops);
        self.check_unsupported(inst, &ops)?;
        Ok(Effect::Continue)
    }

    fn unconditional_branch<T: Target + ?Sized>(
        &mut self,
        inst: &Instruction,
        mode: Mode,
        ops: &[&str],
        target: &mut T,
    ) -> Result<Effect> {
        let operand = ops.first().copied().unwrap_or_default();
        if operand == "lr" {
            return self.return_through_lr(inst, target);
        }
        if parse_register(operand).is_ok() {
            self.warn(inst, "skipped unconditional branch through register")?;
            return Ok(Effect::Continue);
        }
        let Some(address) = branch_address(operand) else {
            self.warn(inst, "skipped branch with unparseable target")?;
            return Ok(Effect::Continue);
        };
        self.history.resolve(inst.address, false)?;
        let mode = branch_mode(&inst.mnemonic, mode);
        info!("branch {} to {address:#x} ({mode}), sp={:#x}", inst.mnemonic, self.sp);
        Ok(Effect::Jump { address, mode })
    }

    fn conditional_branch(&mut self, inst: &Instruction, mode: Mode, dest: &str) -> Result<Effect> {
        if dest == "lr" {
            self.warn(inst, "skipped conditional return")?;
            return Ok(Effect::Continue);
        }
        let Some(address) = branch_address(dest) else {
            self.warn(inst, "skipped conditional branch with unparseable target")?;
            return Ok(Effect::Continue);
        };
        let taken = self.history.resolve(inst.address, true)?;
        info!(
            "conditional {} to {address:#x} {}, sp={:#x}",
            inst.mnemonic,
            if taken { "taken" } else { "not taken" },
            self.sp
        );
        if taken {
            let mode = branch_mode(&inst.mnemonic, mode);
            Ok(Effect::Jump { address, mode })
        } else {
            Ok(Effect::Continue)
        }
    }

    fn return_through_lr<T: Target + ?Sized>(
        &mut self,
        inst: &Instruction,
        target: &mut T,
    ) -> Result<Effect> {
        let lr = match self.registers.get(Register::Lr) {
            Some(lr) => lr,
            None => {
                self.warn(inst, "link register untracked, using live value")?;
                target.read_register(Register::Lr)?
            }
        };
        info!("frame (return through lr) at {:#x}: sp={:#x}", inst.address, self.sp);
        Ok(Effect::Return(self.caller_frame(lr)))
    }

    fn push(&mut self, inst: &Instruction, mode: Mode, list: &RegisterList) {
        let base = self.sp.wrapping_sub(4 * list.len() as u32);
        let stored: Vec<(u32, Option<u32>)> = list
            .slots(base)
            .into_iter()
            .map(|(reg, slot)| (slot, self.value(inst, mode, reg)))
            .collect();
        self.set_sp(base);
        for (slot, value) in stored {
            self.store(slot, value);
        }
    }

    fn pop<T: Target + ?Sized>(
        &mut self,
        inst: &Instruction,
        list: &RegisterList,
        target: &mut T,
    ) -> Result<Effect> {
        let base = self.sp;
        let mut return_address = None;
        for (reg, slot) in list.slots(base) {
            let value = self.load(slot, target);
            match reg {
                Register::Pc => return_address = Some(value?),
                Register::Sp => debug!("ignoring sp loaded by {inst}"),
                reg => match value {
                    Ok(value) => self.registers.set(reg, value),
                    Err(err) => {
                        debug!("{reg} unknown after {inst}: {err}");
                        self.registers.forget(reg);
                    }
                },
            }
        }
        self.set_sp(base.wrapping_add(4 * list.len() as u32));
        match return_address {
            Some(address) => {
                info!("frame (pop pc) at {:#x}: sp={:#x}", inst.address, self.sp);
                Ok(Effect::Return(self.caller_frame(address)))
            }
            None => Ok(Effect::Continue),
        }
    }

    /// `str`/`ldr` of one register, or `strd`/`ldrd` of a pair, relative to
    /// SP. `None` leaves the instruction to the generic handling.
    fn stack_transfer<T: Target + ?Sized>(
        &mut self,
        inst: &Instruction,
        mode: Mode,
        ops: &[&str],
        target: &mut T,
    ) -> Result<Option<Effect>> {
        let pair = inst.mnemonic.ends_with('d');
        let count = if pair { 2 } else { 1 };
        let Some(regs) = ops.get(..count).and_then(|names| {
            names
                .iter()
                .map(|op| parse_register(op).ok())
                .collect::<Option<Vec<_>>>()
        }) else {
            return Ok(None);
        };
        let Some(access) = stack_access(&ops[count..]) else {
            return Ok(None);
        };
        if regs.contains(&Register::Sp) || (pair && regs.contains(&Register::Pc)) {
            return Ok(None);
        }
        let slot = offset(self.sp, access.offset);
        let new_sp = offset(self.sp, access.writeback);

        if inst.mnemonic.starts_with("str") {
            let values: Vec<Option<u32>> =
                regs.iter().map(|reg| self.value(inst, mode, *reg)).collect();
            self.set_sp(new_sp);
            for (idx, value) in values.into_iter().enumerate() {
                self.store(slot.wrapping_add(4 * idx as u32), value);
            }
            return Ok(Some(Effect::Continue));
        }

        if regs[0] == Register::Pc {
            if access.writeback == 0 {
                return Ok(None);
            }
            let address = self.load(slot, target)?;
            self.set_sp(new_sp);
            info!("frame (load pc) at {:#x}: sp={:#x}", inst.address, self.sp);
            return Ok(Some(Effect::Return(self.caller_frame(address))));
        }
        for (idx, reg) in regs.into_iter().enumerate() {
            match self.load(slot.wrapping_add(4 * idx as u32), target) {
                Ok(value) => self.registers.set(reg, value),
                Err(err) => {
                    debug!("{reg} unknown after {inst}: {err}");
                    self.registers.forget(reg);
                }
            }
        }
        self.set_sp(new_sp);
        Ok(Some(Effect::Continue))
    }

    /// Result of a `mov`/`add`/`sub` whose sources are all known.
    fn arithmetic(&self, inst: &Instruction, mode: Mode, ops: &[&str]) -> Option<u32> {
        let mnemonic = inst.mnemonic.trim_end_matches(&['s', 'w'][..]);
        let (base, operand) = match (mnemonic, ops) {
            ("mov", [_, src]) => return self.operand_value(inst, mode, src),
            (_, [dest, src]) => (self.operand_value(inst, mode, dest)?, *src),
            (_, [_, src, operand]) => (self.operand_value(inst, mode, src)?, *operand),
            _ => return None,
        };
        let operand = self.operand_value(inst, mode, operand)?;
        match mnemonic {
            "add" => Some(base.wrapping_add(operand)),
            "sub" => Some(base.wrapping_sub(operand)),
            _ => None,
        }
    }

    fn track_registers(&mut self, inst: &Instruction, mode: Mode, ops: &[&str]) {
        let mnemonic = inst.mnemonic.as_str();
        let dest = ops
            .first()
            .and_then(|op| parse_register(op.trim_end_matches('!')).ok())
            .filter(|reg| !matches!(reg, Register::Sp | Register::Pc));

        if matches!(
            mnemonic,
            "mov" | "movs" | "movw" | "add" | "adds" | "addw" | "sub" | "subs" | "subw"
        ) {
            if let Some(dest) = dest {
                match self.arithmetic(inst, mode, ops) {
                    Some(value) => self.registers.set(dest, value),
                    None => self.registers.forget(dest),
                }
            }
            return;
        }
        if mnemonic.starts_with("ldm") || mnemonic.starts_with("pop") {
            if let Ok(list) = RegisterList::parse(&inst.operands) {
                for reg in list.core_registers() {
                    self.registers.forget(reg);
                }
            }
            if ops.first().is_some_and(|op| op.ends_with('!')) {
                if let Some(base) = dest {
                    self.registers.forget(base);
                }
            }
            return;
        }
        if mnemonic == "ldrd" {
            for op in ops.iter().take(2) {
                if let Ok(reg) = parse_register(op) {
                    self.registers.forget(reg);
                }
            }
            return;
        }
        if READS_FIRST_OPERAND.iter().any(|prefix| mnemonic.starts_with(prefix)) {
            return;
        }
        if let Some(dest) = dest {
            if self.registers.is_known(dest) {
                debug!("{dest} unknown after {inst}");
            }
            self.registers.forget(dest);
        }
    }

    fn check_unsupported(&mut self, inst: &Instruction, ops: &[&str]) -> Result<()> {
        let first = ops
            .first()
            .and_then(|op| parse_register(op.trim_end_matches('!')).ok());
        if first == Some(Register::Pc) || list_contains(&inst.operands, Register::Pc) {
            self.warn(inst, "unknown instruction affected pc")
        } else if first == Some(Register::Sp) || list_contains(&inst.operands, Register::Sp) {
            self.warn(inst, "unknown instruction affected sp")
        } else if writes_back_sp(ops) {
            self.warn(inst, "unknown instruction wrote back sp")
        } else if inst.mnemonic.starts_with("pop") || inst.mnemonic.starts_with("push") {
            self.warn(inst, "conditional instruction affected sp")
        } else {
            Ok(())
        }
    }

    fn register_list(&mut self, inst: &Instruction) -> Result<Option<RegisterList>> {
        match RegisterList::parse(&inst.operands) {
            Ok(list) => Ok(Some(list)),
            Err(err) => {
                self.warn(inst, &format!("skipped stack transfer ({err})"))?;
                Ok(None)
            }
        }
    }

    fn warn(&mut self, inst: &Instruction, what: &str) -> Result<()> {
        self.warnings += 1;
        warn!("{what}: {inst}, sp={:#x}", self.sp);
        if self.warnings > self.warning_limit {
            return Err(CoreError::TooManyWarnings {
                count: self.warnings,
                pc: self.origin,
            });
        }
        Ok(())
    }

    fn value(&self, inst: &Instruction, mode: Mode, reg: Register) -> Option<u32> {
        match reg {
            // Reads of PC see the instruction address plus the pipeline offset.
            Register::Pc => Some(inst.address.wrapping_add(if mode.is_thumb() { 4 } else { 8 })),
            Register::Sp => Some(self.sp),
            reg => self.registers.get(reg),
        }
    }

    fn operand_value(&self, inst: &Instruction, mode: Mode, text: &str) -> Option<u32> {
        if text.starts_with('#') {
            return parse_immediate(text).ok().map(|imm| imm as u32);
        }
        let reg = parse_register(text).ok()?;
        self.value(inst, mode, reg)
    }

    fn set_sp(&mut self, sp: u32) {
        // Anything below the new top of stack is dead.
        self.stack = self.stack.split_off(&sp);
        self.sp = sp;
    }

    fn store(&mut self, slot: u32, value: Option<u32>) {
        match value {
            Some(value) => self.stack.insert(slot, value),
            None => self.stack.remove(&slot),
        };
    }

    fn load<T: Target + ?Sized>(&self, slot: u32, target: &mut T) -> Result<u32> {
        match self.stack.get(&slot) {
            Some(value) => Ok(*value),
            None => Ok(target.read_u32(slot)?),
        }
    }

    fn caller_frame(&self, return_address: u32) -> Frame {
        let mut registers = self.registers.clone();
        registers.set(Register::Sp, self.sp);
        Frame::from_return_address(return_address, self.sp).with_registers(registers)
    }
}

fn conditional_branch_target<'a>(mnemonic: &str, operands: &'a str) -> Option<&'a str> {
    if mnemonic == "cbz" || mnemonic == "cbnz" {
        let dest = operands.split_once(',').map_or(operands, |(_, dest)| dest);
        return Some(dest.trim());
    }
    let condition = mnemonic.strip_prefix('b')?.trim_start_matches(&['b', 'x'][..]);
    CONDITIONS.contains(&condition).then(|| operands.trim())
}

fn is_call(mnemonic: &str) -> bool {
    let Some(rest) = mnemonic.strip_prefix("bl") else {
        return false;
    };
    let rest = rest.strip_prefix('x').unwrap_or(rest);
    rest.is_empty() || CONDITIONS.contains(&rest)
}

fn branch_mode(mnemonic: &str, mode: Mode) -> Mode {
    if mnemonic.starts_with("bx") {
        mode.toggled()
    } else {
        mode
    }
}

fn branch_address(operand: &str) -> Option<u32> {
    parse_address(operand.trim_start_matches('#')).ok()
}

fn list_contains(operands: &str, reg: Register) -> bool {
    operands.contains('{')
        && RegisterList::parse(operands).is_ok_and(|list| list.contains(reg))
}

fn offset(base: u32, delta: i64) -> u32 {
    base.wrapping_add(delta as u32)
}

/// Recognise `[sp]`, `[sp, #n]`, `[sp, #n]!` and `[sp], #n` addressing.
/// `address` starts at the bracketed operand.
fn stack_access(address: &[&str]) -> Option<StackAccess> {
    let (base, imm, pre_writeback) = memory_operand(address.first()?)?;
    if base != Register::Sp {
        return None;
    }
    let imm = parse_immediate(imm).ok()?;
    match (address.get(1), pre_writeback) {
        (None, true) => Some(StackAccess {
            offset: imm,
            writeback: imm,
        }),
        (None, false) => Some(StackAccess {
            offset: imm,
            writeback: 0,
        }),
        (Some(post), false) if imm == 0 => Some(StackAccess {
            offset: 0,
            writeback: parse_immediate(post).ok()?,
        }),
        _ => None,
    }
}

/// Split `[base, offset]` or `[base, offset]!` into the base register, the
/// offset text (`#0` when absent) and whether it writes back.
fn memory_operand(operand: &str) -> Option<(Register, &str, bool)> {
    let (inner, writeback) = match operand.strip_suffix('!') {
        Some(inner) => (inner, true),
        None => (operand, false),
    };
    let inner = inner.strip_prefix('[')?.strip_suffix(']')?;
    let (base, imm) = match inner.split_once(',') {
        Some((base, imm)) => (base, imm.trim()),
        None => (inner, "#0"),
    };
    Some((parse_register(base.trim()).ok()?, imm, writeback))
}

/// Any SP-based memory operand that updates SP: pre-indexed with `!`, or
/// followed by a post-index operand.
fn writes_back_sp(ops: &[&str]) -> bool {
    ops.iter().enumerate().any(|(idx, op)| {
        memory_operand(op).is_some_and(|(base, _, writeback)| {
            base == Register::Sp && (writeback || idx + 1 < ops.len())
        })
    })
}
