mod interrupts;
mod recovery;

use std::rc::Rc;

pub use interrupts::{Interrupts, InterruptsHeld};
pub use recovery::RecoveryState;

/// Process wide state shared by the storage manager and its backends.
///
/// Cloning is cheap and all clones observe the same state, so a storage
/// backend can be built with a clone of the context of the storage manager
/// that will dispatch to it.
#[derive(Debug, Clone, Default)]
pub struct ProcContext {
    recovery: RecoveryState,
    interrupts: Rc<Interrupts>,
}

impl ProcContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crash recovery (WAL replay) mode flag.
    pub fn recovery(&self) -> &RecoveryState {
        &self.recovery
    }

    /// Interrupt hold-off state of the process.
    pub fn interrupts(&self) -> &Rc<Interrupts> {
        &self.interrupts
    }
}
