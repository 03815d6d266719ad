use std::ops::{Deref, DerefMut};

use thiserror::Error;
use tracebt_listing::Register;
use tracing::{debug, warn};

use crate::frame::Frame;
use crate::registers::RegisterFile;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("cannot read memory at {0:#x}")]
    Memory(u32),
    #[error("register {0} unavailable")]
    Register(Register),
    #[error("status register unavailable")]
    Status,
    #[error("{0}")]
    Other(String),
}

/// Memory and register access to the stopped debuggee.
pub trait Target {
    fn read_u32(&mut self, address: u32) -> Result<u32, TargetError>;

    fn read_register(&mut self, reg: Register) -> Result<u32, TargetError>;

    /// Current program status register (CPSR).
    fn read_status(&mut self) -> Result<u32, TargetError>;

    fn write_status(&mut self, value: u32) -> Result<(), TargetError>;

    /// Every core register the target can report; unreadable ones are left
    /// out.
    fn live_registers(&mut self) -> RegisterFile {
        Register::ALL
            .iter()
            .filter_map(|reg| self.read_register(*reg).ok().map(|value| (*reg, value)))
            .collect()
    }
}

impl<T: Target + ?Sized> Target for &mut T {
    fn read_u32(&mut self, address: u32) -> Result<u32, TargetError> {
        (**self).read_u32(address)
    }

    fn read_register(&mut self, reg: Register) -> Result<u32, TargetError> {
        (**self).read_register(reg)
    }

    fn read_status(&mut self) -> Result<u32, TargetError> {
        (**self).read_status()
    }

    fn write_status(&mut self, value: u32) -> Result<(), TargetError> {
        (**self).write_status(value)
    }

    fn live_registers(&mut self) -> RegisterFile {
        (**self).live_registers()
    }
}

/// Maps code addresses to names for display only.
pub trait SymbolResolver {
    fn function_name(&mut self, address: u32) -> Option<String>;

    fn library_name(&mut self, address: u32) -> Option<String>;
}

pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn function_name(&mut self, _address: u32) -> Option<String> {
        None
    }

    fn library_name(&mut self, _address: u32) -> Option<String> {
        None
    }
}

/// Makes a frame the debugger's active inspection context.
pub trait FrameSink {
    fn select_frame(&mut self, frame: &Frame) -> Result<(), TargetError>;
}

/// Replaces the status register with a masked copy for as long as the guard
/// lives. The saved value is written back on drop, so early returns, errors
/// and cancellation all restore it.
pub struct StatusGuard<'a, T: Target + ?Sized> {
    target: &'a mut T,
    saved: u32,
}

impl<'a, T: Target + ?Sized> StatusGuard<'a, T> {
    pub fn mask(target: &'a mut T, mask: u32) -> Result<Self, TargetError> {
        let saved = target.read_status()?;
        target.write_status(saved & mask)?;
        debug!("status {:#010x} masked to {:#010x}", saved, saved & mask);
        Ok(Self { target, saved })
    }

    pub fn saved(&self) -> u32 {
        self.saved
    }
}

impl<T: Target + ?Sized> Deref for StatusGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.target
    }
}

impl<T: Target + ?Sized> DerefMut for StatusGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.target
    }
}

impl<T: Target + ?Sized> Drop for StatusGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(err) = self.target.write_status(self.saved) {
            warn!("failed to restore status {:#010x}: {err}", self.saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct StatusOnly {
        status: u32,
        writes: Vec<u32>,
    }

    impl Target for StatusOnly {
        fn read_u32(&mut self, address: u32) -> Result<u32, TargetError> {
            Err(TargetError::Memory(address))
        }

        fn read_register(&mut self, reg: Register) -> Result<u32, TargetError> {
            match reg {
                Register::Sp => Ok(0x2000),
                other => Err(TargetError::Register(other)),
            }
        }

        fn read_status(&mut self) -> Result<u32, TargetError> {
            Ok(self.status)
        }

        fn write_status(&mut self, value: u32) -> Result<(), TargetError> {
            self.writes.push(value);
            self.status = value;
            Ok(())
        }
    }

    #[test]
    fn guard_masks_then_restores() {
        let mut target = StatusOnly {
            status: 0xf80f_0030,
            ..Default::default()
        };
        {
            let guard = StatusGuard::mask(&mut target, 0x00f0_03df).unwrap();
            assert_eq!(guard.saved(), 0xf80f_0030);
            assert_eq!(guard.status, 0x0000_0010);
        }
        assert_eq!(target.status, 0xf80f_0030);
        assert_eq!(target.writes, vec![0x0000_0010, 0xf80f_0030]);
    }

    #[test]
    fn guard_restores_when_scope_exits_with_error() {
        fn failing(target: &mut StatusOnly) -> Result<(), TargetError> {
            let mut guard = StatusGuard::mask(target, 0)?;
            guard.read_u32(0x10)?;
            Ok(())
        }

        let mut target = StatusOnly {
            status: 0x6000_0030,
            ..Default::default()
        };
        assert_eq!(failing(&mut target), Err(TargetError::Memory(0x10)));
        assert_eq!(target.status, 0x6000_0030);
    }

    #[test]
    fn live_registers_skip_unreadable() {
        let mut target = StatusOnly::default();
        let regs = target.live_registers();
        assert_eq!(regs.len(), 1);
        assert_eq!(regs.get(Register::Sp), Some(0x2000));
    }
}
