pub mod fork;
pub mod locator;

pub use fork::{ForkNumber, FORK_COUNT, MAX_FORKNUM};
pub use locator::{RelationLocator, RelationLocatorBackend};
