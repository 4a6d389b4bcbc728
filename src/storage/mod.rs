pub mod aio;
pub mod bufmgr;
pub mod inval;
pub mod smgr;

pub use smgr::{SMgrRelation, StorageManager};

/// Each relation fork is divided into disk blocks (which may be thought of as
/// the unit of IO). Blocks are numbered sequentially, starting at 0.
///
/// The storage manager is the only piece of code that should be accessing
/// disk blocks directly.
pub type BlockNumber = u32;

/// A block number that does not exists on disk.
///
/// It is also the upper bound of the number of blocks of a relation fork, a
/// fork can not be extended up to it.
pub const INVALID_BLOCK_NUMBER: BlockNumber = BlockNumber::MAX;

/// The size of a Page on database file.
pub const PAGE_SIZE: usize = 8192;

/// A Page contains exactly one disk block.
pub type Page = [u8; PAGE_SIZE];
