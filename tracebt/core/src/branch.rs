use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

use crate::{CoreError, Result};

/// Decision recorded for one branch instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Branch {
    pub address: u32,
    pub conditional: bool,
    pub taken: bool,
    /// Flipped to taken by backtracking and not yet confirmed by reaching the
    /// branch again.
    pub tentative: bool,
}

impl Branch {
    pub fn new(address: u32, conditional: bool) -> Self {
        Self {
            address,
            conditional,
            taken: !conditional,
            tentative: false,
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}[", self.address)?;
        if self.conditional {
            write!(f, "c")?;
        }
        if self.taken {
            write!(f, "t")?;
        }
        if self.tentative {
            write!(f, "T")?;
        }
        write!(f, "]")
    }
}

/// Ordered branch decisions of a single unwind step.
///
/// Conditional branches start out not taken. When the simulated path comes
/// back to the newest recorded branch without having met anything new, the
/// newest still-untaken branch is flipped and every decision recorded after
/// it is discarded. The same happens when an older branch comes round a
/// second time while the history stayed unchanged, which catches loops that
/// never pass the newest branch. Running out of untaken branches means the
/// path cannot leave the loop.
#[derive(Clone, Debug, Default)]
pub struct BranchHistory {
    entries: Vec<Branch>,
    /// Branches revisited since the history last changed.
    revisited: BTreeSet<u32>,
}

impl BranchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether the branch at `address` is taken.
    pub fn resolve(&mut self, address: u32, conditional: bool) -> Result<bool> {
        let Some(position) = self.position(address) else {
            let branch = Branch::new(address, conditional);
            self.entries.push(branch);
            self.revisited.clear();
            return Ok(branch.taken);
        };

        let newest = self.entries.len() - 1;
        if self.entries[newest].tentative {
            self.entries[newest].tentative = false;
            self.revisited.clear();
        } else if newest == position || self.revisited.contains(&address) {
            return self.backtrack(address);
        }
        self.revisited.insert(address);
        Ok(self.entries[position].taken)
    }

    /// Flip the newest untaken branch and forget everything decided after it.
    fn backtrack(&mut self, address: u32) -> Result<bool> {
        let Some(flip) = self.entries.iter().rposition(|branch| !branch.taken) else {
            return Err(CoreError::InfiniteLoop { address });
        };
        self.entries.truncate(flip + 1);
        self.revisited.clear();
        let branch = &mut self.entries[flip];
        branch.taken = true;
        branch.tentative = true;
        debug!("backtrack at {:#x}: flipped {}", address, branch);
        Ok(true)
    }

    pub fn entries(&self) -> &[Branch] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, address: u32) -> Option<usize> {
        self.entries.iter().position(|branch| branch.address == address)
    }
}

impl fmt::Display for BranchHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, branch) in self.entries.iter().enumerate() {
            if idx > 0 {
                write!(f, " ")?;
            }
            write!(f, "{branch}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_depend_on_condition() {
        let mut history = BranchHistory::new();
        assert!(history.resolve(0x10, false).unwrap());
        assert!(!history.resolve(0x20, true).unwrap());
        assert_eq!(history.to_string(), "0x10[t] 0x20[c]");
    }

    #[test]
    fn revisiting_older_branch_repeats_decision() {
        let mut history = BranchHistory::new();
        assert!(!history.resolve(0x10, true).unwrap());
        assert!(history.resolve(0x20, false).unwrap());
        assert!(!history.resolve(0x10, true).unwrap());
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn newest_branch_revisited_flips_latest_untaken() {
        let mut history = BranchHistory::new();
        history.resolve(0x10, true).unwrap();
        history.resolve(0x20, false).unwrap();
        assert!(history.resolve(0x20, false).unwrap());
        assert_eq!(history.entries().len(), 1);
        let flipped = history.entries()[0];
        assert!(flipped.taken && flipped.tentative);
        assert_eq!(history.to_string(), "0x10[ctT]");
    }

    #[test]
    fn tentative_flip_is_confirmed_on_next_visit() {
        let mut history = BranchHistory::new();
        history.resolve(0x10, true).unwrap();
        history.resolve(0x20, false).unwrap();
        history.resolve(0x20, false).unwrap();
        assert!(history.resolve(0x10, true).unwrap());
        assert!(!history.entries()[0].tentative);
    }

    #[test]
    fn self_loop_on_conditional_flips_itself() {
        let mut history = BranchHistory::new();
        assert!(!history.resolve(0x40, true).unwrap());
        assert!(history.resolve(0x40, true).unwrap());
        assert!(history.resolve(0x40, true).unwrap());
    }

    #[test]
    fn unconditional_self_loop_is_fatal() {
        let mut history = BranchHistory::new();
        assert!(history.resolve(0x40, false).unwrap());
        assert!(matches!(
            history.resolve(0x40, false),
            Err(CoreError::InfiniteLoop { address: 0x40 })
        ));
    }

    #[test]
    fn loop_that_skips_newest_branch_still_backtracks() {
        // 0x0: b<cc> 0x0, 0x2: b<cc> 0x2, 0x4: b 0x0
        let mut history = BranchHistory::new();
        let mut decisions = Vec::new();
        for address in [0x0, 0x2, 0x4, 0x0, 0x2, 0x4, 0x0, 0x2, 0x2, 0x4, 0x0, 0x0, 0x0] {
            decisions.push(history.resolve(address, address != 0x4).unwrap());
        }
        assert_eq!(
            decisions,
            vec![false, false, true, false, false, true, false, true, false, true, true, true, true]
        );
        assert!(matches!(
            history.resolve(0x0, true),
            Err(CoreError::InfiniteLoop { address: 0x0 })
        ));
    }

    #[test]
    fn exhausted_flips_are_fatal() {
        let mut history = BranchHistory::new();
        history.resolve(0x10, true).unwrap();
        history.resolve(0x10, true).unwrap();
        history.resolve(0x10, true).unwrap();
        assert!(matches!(
            history.resolve(0x10, true),
            Err(CoreError::InfiniteLoop { address: 0x10 })
        ));
    }
}
