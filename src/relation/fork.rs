use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of forks that a relation can have.
pub const FORK_COUNT: usize = 4;

/// Stuff for fork names.
///
/// The physical storage of a relation consists of one or more forks. The main
/// fork is always created, but in addition to that there can be additional
/// forks for storing various metadata. Each fork is sized and addressed by
/// block number independently of the others.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForkNumber {
    Main = 0,
    FreeSpaceMap = 1,
    VisibilityMap = 2,
    Init = 3,
}

/// Highest fork number.
pub const MAX_FORKNUM: ForkNumber = ForkNumber::Init;

impl ForkNumber {
    /// All forks in fork number order.
    pub const ALL: [ForkNumber; FORK_COUNT] = [
        ForkNumber::Main,
        ForkNumber::FreeSpaceMap,
        ForkNumber::VisibilityMap,
        ForkNumber::Init,
    ];

    /// Position of this fork on per fork arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Name of the fork as used on file names.
    pub fn name(self) -> &'static str {
        match self {
            ForkNumber::Main => "main",
            ForkNumber::FreeSpaceMap => "fsm",
            ForkNumber::VisibilityMap => "vm",
            ForkNumber::Init => "init",
        }
    }

    /// Suffix appended on the relation file name, the main fork has none.
    pub fn file_suffix(self) -> Option<&'static str> {
        match self {
            ForkNumber::Main => None,
            fork => Some(fork.name()),
        }
    }
}

impl fmt::Display for ForkNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
