use tracebt_listing::{InstructionSource, Mode, Register};
use tracing::{info, warn};

use crate::frame::Frame;
use crate::target::Target;
use crate::unwinder::Unwinder;
use crate::Result;

/// Caller-supplied replacements for the target's own PC, SP and Thumb state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameOverrides {
    pub pc: Option<u32>,
    pub sp: Option<u32>,
    pub thumb: Option<bool>,
}

impl FrameOverrides {
    /// Frame #0: the overrides where given, the target's registers otherwise.
    /// A PC override without an explicit mode selects Thumb from bit 0.
    pub fn initial_frame<T: Target + ?Sized>(&self, target: &mut T) -> Result<Frame> {
        let pc = match self.pc {
            Some(pc) => pc,
            None => target.read_register(Register::Pc)?,
        };
        let sp = match self.sp {
            Some(sp) => sp,
            None => target.read_register(Register::Sp)?,
        };
        let mode = match (self.thumb, self.pc) {
            (Some(true), _) => Mode::Thumb,
            (Some(false), _) => Mode::Arm,
            (None, Some(pc)) => Mode::from_return_address(pc),
            (None, None) => Mode::from_status(target.read_status()?),
        };
        let mut registers = target.live_registers();
        registers.forget(Register::Pc);
        Ok(Frame::new(mode.code_address(pc), sp, mode).with_registers(registers))
    }
}

/// Walks the call chain one frame at a time.
///
/// Frames are handed out as soon as they are found. The walk ends when an
/// unwind step returns the frame it started from, when `max_frames` is
/// reached, or at the first error.
pub struct Backtrace<'a, S, T: ?Sized> {
    unwinder: &'a mut Unwinder<S>,
    target: &'a mut T,
    pending: Option<Frame>,
    last: Option<Frame>,
    produced: usize,
    done: bool,
}

impl<'a, S: InstructionSource, T: Target + ?Sized> Backtrace<'a, S, T> {
    pub fn new(
        unwinder: &'a mut Unwinder<S>,
        target: &'a mut T,
        overrides: FrameOverrides,
    ) -> Result<Self> {
        let first = overrides.initial_frame(&mut *target)?;
        Ok(Self::from_frame(unwinder, target, first))
    }

    pub fn from_frame(unwinder: &'a mut Unwinder<S>, target: &'a mut T, first: Frame) -> Self {
        Self {
            unwinder,
            target,
            pending: Some(first),
            last: None,
            produced: 0,
            done: false,
        }
    }

    /// The target being walked, e.g. to resolve symbols for a frame between
    /// steps.
    pub fn target_mut(&mut self) -> &mut T {
        &mut *self.target
    }

    /// Number of frames handed out so far.
    pub fn depth(&self) -> usize {
        self.produced
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.done {
            return Ok(None);
        }
        if let Some(first) = self.pending.take() {
            return Ok(Some(self.emit(first)));
        }
        let Some(last) = self.last.as_ref() else {
            self.done = true;
            return Ok(None);
        };
        if self.produced >= self.unwinder.config().max_frames {
            warn!("stopping after {} frames", self.produced);
            self.done = true;
            return Ok(None);
        }
        let next = match self.unwinder.unwind(&mut *self.target, last) {
            Ok(next) => next,
            Err(err) => {
                self.done = true;
                return Err(err);
            }
        };
        if &next == last {
            info!("no more reachable frames");
            self.done = true;
            return Ok(None);
        }
        Ok(Some(self.emit(next)))
    }

    fn emit(&mut self, frame: Frame) -> Frame {
        info!("#{}: {frame}", self.produced);
        self.produced += 1;
        self.last = Some(frame.clone());
        frame
    }
}

impl<S: InstructionSource, T: Target + ?Sized> Iterator for Backtrace<'_, S, T> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnwindConfig;
    use crate::snapshot::{Snapshot, Word};

    fn snapshot() -> Snapshot {
        let mut snap = Snapshot::default();
        snap.set_register(Register::Pc, 0x1000);
        snap.set_register(Register::Sp, 0x2000);
        snap.set_register(Register::Lr, 0x3001);
        snap.cpsr = Word(0x30);
        snap
    }

    #[test]
    fn initial_frame_from_target_status() {
        let mut snap = snapshot();
        let frame = FrameOverrides::default().initial_frame(&mut snap).unwrap();
        assert_eq!(frame, Frame::new(0x1000, 0x2000, Mode::Thumb));
        assert_eq!(frame.registers().unwrap().get(Register::Lr), Some(0x3001));
    }

    #[test]
    fn pc_override_infers_mode_from_bit_zero() {
        let mut snap = snapshot();
        let overrides = FrameOverrides {
            pc: Some(0x4001),
            ..Default::default()
        };
        let frame = overrides.initial_frame(&mut snap).unwrap();
        assert_eq!(frame, Frame::new(0x4000, 0x2000, Mode::Thumb));

        let overrides = FrameOverrides {
            pc: Some(0x4000),
            sp: Some(0x5000),
            thumb: None,
        };
        let frame = overrides.initial_frame(&mut snap).unwrap();
        assert_eq!(frame, Frame::new(0x4000, 0x5000, Mode::Arm));

        let overrides = FrameOverrides {
            thumb: Some(false),
            ..Default::default()
        };
        let frame = overrides.initial_frame(&mut snap).unwrap();
        assert_eq!(frame.mode(), Mode::Arm);
    }

    #[test]
    fn unwind_error_ends_the_walk() {
        let mut snap = snapshot();
        let listing = snap.instruction_source();
        let mut unwinder = Unwinder::new(listing, UnwindConfig::default());
        let first = Frame::new(0x1000, 0x2000, Mode::Thumb);
        let mut bt = Backtrace::from_frame(&mut unwinder, &mut snap, first.clone());
        assert_eq!(bt.next_frame().unwrap(), Some(first));
        // Nothing is listed, so the next unwind fails and ends the walk.
        assert!(bt.next_frame().is_err());
        assert!(bt.next_frame().unwrap().is_none());
        assert_eq!(bt.depth(), 1);
    }
}
