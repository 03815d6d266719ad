use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracebt_listing::InstructionSource;
use tracing::{debug, info};

use crate::cache::AssemblyCache;
use crate::config::UnwindConfig;
use crate::frame::Frame;
use crate::simulator::{Effect, Simulator};
use crate::target::{StatusGuard, Target};
use crate::{CoreError, Result};

/// Shared interrupt request, polled once per simulated instruction.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Finds the caller of a frame by tracing forward to the function's return.
///
/// The decoded-instruction cache lives as long as the unwinder, so repeated
/// unwinds through the same code reuse it. Branch history and the shadow stack
/// are per call.
pub struct Unwinder<S> {
    cache: AssemblyCache<S>,
    config: UnwindConfig,
    cancel: CancelFlag,
}

impl<S: InstructionSource> Unwinder<S> {
    pub fn new(source: S, config: UnwindConfig) -> Self {
        let config = config.normalized();
        Self {
            cache: AssemblyCache::new(source, &config),
            config,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn config(&self) -> &UnwindConfig {
        &self.config
    }

    pub fn cache(&self) -> &AssemblyCache<S> {
        &self.cache
    }

    /// Unwind one level. The target's status register is masked for the
    /// duration of the call and restored before returning, whatever the
    /// outcome.
    pub fn unwind<T: Target + ?Sized>(&mut self, target: &mut T, frame: &Frame) -> Result<Frame> {
        let mut target = StatusGuard::mask(target, self.config.status_mask)?;
        debug!("unwinding from {frame}");
        let mut sim = Simulator::new(frame, self.config.warning_limit);
        self.cache.jump(frame.pc(), frame.mode())?;
        let mut steps = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                return Err(CoreError::Interrupted);
            }
            let (inst, mode) = self.cache.next_instruction()?;
            steps += 1;
            match sim.step(&inst, mode, &mut *target)? {
                Effect::Continue => {}
                Effect::Jump { address, mode } => self.cache.jump(address, mode)?,
                Effect::Return(caller) => {
                    info!(
                        "caller {caller} after {steps} instructions, {} warnings, branches [{}]",
                        sim.warnings(),
                        sim.history()
                    );
                    return Ok(caller);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use tracebt_listing::{Instruction, Mode, Register, StaticListing};

    fn thumb(listing: &[(u32, &str, &str)]) -> StaticListing {
        StaticListing::from_instructions(
            Mode::Thumb,
            listing
                .iter()
                .map(|(addr, mn, ops)| Instruction::new(*addr, mn, ops)),
        )
    }

    fn target(pc: u32, sp: u32, lr: u32) -> Snapshot {
        let mut snap = Snapshot::default();
        snap.set_register(Register::Pc, pc);
        snap.set_register(Register::Sp, sp);
        snap.set_register(Register::Lr, lr);
        snap.cpsr = crate::Word(0x6000_0030);
        snap
    }

    fn listing_with_padding(body: &[(u32, &str, &str)]) -> StaticListing {
        let mut listing = thumb(body);
        let end = body.last().map(|(addr, _, _)| *addr).unwrap_or(0);
        listing.extend(
            Mode::Thumb,
            (1..=8).map(|idx| Instruction::new(end + 2 * idx, "nop", "")),
        );
        listing
    }

    #[test]
    fn leaf_function_returns_through_lr() {
        let listing = listing_with_padding(&[
            (0x1000, "movs", "r0, #1"),
            (0x1002, "adds", "r0, r1"),
            (0x1004, "bx", "lr"),
        ]);
        let mut snap = target(0x1000, 0x2000, 0x8001);
        let mut unwinder = Unwinder::new(listing, UnwindConfig::default());
        let frame = Frame::new(0x1000, 0x2000, Mode::Thumb).with_registers(snap.live_registers());
        let caller = unwinder.unwind(&mut snap, &frame).unwrap();
        assert_eq!(caller, Frame::new(0x8000, 0x2000, Mode::Thumb));
        assert_eq!(snap.cpsr.0, 0x6000_0030);
    }

    #[test]
    fn cancelled_unwind_restores_status() {
        let listing = listing_with_padding(&[(0x1000, "bx", "lr")]);
        let mut snap = target(0x1000, 0x2000, 0x8001);
        let cancel = CancelFlag::new();
        let mut unwinder =
            Unwinder::new(listing, UnwindConfig::default()).with_cancel_flag(cancel.clone());
        cancel.cancel();
        let frame = Frame::new(0x1000, 0x2000, Mode::Thumb);
        assert!(matches!(
            unwinder.unwind(&mut snap, &frame),
            Err(CoreError::Interrupted)
        ));
        assert_eq!(snap.cpsr.0, 0x6000_0030);
        cancel.reset();
        assert!(unwinder.unwind(&mut snap, &frame).is_ok());
    }

    #[test]
    fn cache_survives_between_unwinds() {
        let listing = listing_with_padding(&[(0x1000, "push", "{r4, lr}"), (0x1002, "pop", "{r4, pc}")]);
        let mut snap = target(0x1000, 0x2000, 0x8001);
        let mut unwinder = Unwinder::new(listing, UnwindConfig::default());
        let frame = Frame::new(0x1000, 0x2000, Mode::Thumb).with_registers(snap.live_registers());
        let first = unwinder.unwind(&mut snap, &frame).unwrap();
        let second = unwinder.unwind(&mut snap, &frame).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Frame::new(0x8000, 0x2000, Mode::Thumb));
        assert_eq!(unwinder.cache().range_count(), 1);
    }
}
