use std::collections::BTreeMap;

use tracebt_listing::Register;

/// Partial register model: a register is either known (tracked value) or
/// absent. Absent registers must never be guessed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterFile {
    values: BTreeMap<Register, u32>,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reg: Register) -> Option<u32> {
        self.values.get(&reg).copied()
    }

    pub fn set(&mut self, reg: Register, value: u32) {
        self.values.insert(reg, value);
    }

    /// Drop a register whose value can no longer be derived.
    pub fn forget(&mut self, reg: Register) {
        self.values.remove(&reg);
    }

    pub fn is_known(&self, reg: Register) -> bool {
        self.values.contains_key(&reg)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Register, u32)> + '_ {
        self.values.iter().map(|(reg, value)| (*reg, *value))
    }
}

impl FromIterator<(Register, u32)> for RegisterFile {
    fn from_iter<I: IntoIterator<Item = (Register, u32)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl Extend<(Register, u32)> for RegisterFile {
    fn extend<I: IntoIterator<Item = (Register, u32)>>(&mut self, iter: I) {
        self.values.extend(iter);
    }
}
