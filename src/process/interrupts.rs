use std::cell::Cell;

/// Interrupt hold-off state of a process.
///
/// Control events such as a request to release all open files may arrive at
/// any point, but they are only acted upon at explicit interrupt check points
/// and never while interrupts are held. Most of the storage manager code is
/// not reentrant, so it holds interrupts for the duration of each operation.
#[derive(Debug, Default)]
pub struct Interrupts {
    /// Number of active hold-off guards.
    holdoff: Cell<u32>,

    /// Set when other process asked us to close all our open files.
    release_pending: Cell<bool>,
}

impl Interrupts {
    /// Prevent interrupts from being processed until the returned guard is dropped.
    ///
    /// Guards nest, interrupts can be processed again only after the last one
    /// is dropped.
    pub fn hold(&self) -> InterruptsHeld<'_> {
        self.holdoff.set(self.holdoff.get() + 1);
        InterruptsHeld { interrupts: self }
    }

    /// Return true if a pending interrupt could be serviced right now.
    pub fn can_be_processed(&self) -> bool {
        self.holdoff.get() == 0
    }

    /// Number of active hold-off guards.
    pub fn holdoff_count(&self) -> u32 {
        self.holdoff.get()
    }

    /// Ask the process to release all of its open files at the next
    /// interrupt check point.
    ///
    /// This is the only part of the interrupt machinery that may be invoked
    /// asynchronously, it just records the request.
    pub fn request_smgr_release(&self) {
        self.release_pending.set(true);
    }

    /// Return true if a release request was not processed yet.
    pub fn smgr_release_pending(&self) -> bool {
        self.release_pending.get()
    }

    /// Consume a pending release request if interrupts can be processed.
    pub(crate) fn take_smgr_release(&self) -> bool {
        if !self.can_be_processed() {
            return false;
        }
        self.release_pending.replace(false)
    }
}

/// Guard returned by [Interrupts::hold].
#[must_use = "interrupts are resumed as soon as the guard is dropped"]
#[derive(Debug)]
pub struct InterruptsHeld<'a> {
    interrupts: &'a Interrupts,
}

impl Drop for InterruptsHeld<'_> {
    fn drop(&mut self) {
        let holdoff = self.interrupts.holdoff.get();
        assert!(holdoff > 0, "interrupt hold-off count underflow");
        self.interrupts.holdoff.set(holdoff - 1);
    }
}
