use std::{cell::Cell, rc::Rc};

/// Process wide flag telling whether WAL redo is underway.
///
/// The storage layer only reads it, the redo driver is the one that flips it.
#[derive(Debug, Clone, Default)]
pub struct RecoveryState(Rc<Cell<bool>>);

impl RecoveryState {
    /// Return true while replaying WAL.
    pub fn in_recovery(&self) -> bool {
        self.0.get()
    }

    pub fn set_in_recovery(&self, in_recovery: bool) {
        log::info!(
            "{} recovery mode",
            if in_recovery { "entering" } else { "leaving" }
        );
        self.0.set(in_recovery);
    }
}
