use std::{os::unix::io::RawFd, path::Path};

use anyhow::Result;

use crate::{
    process::ProcContext,
    relation::{ForkNumber, RelationLocatorBackend},
    storage::{aio::AioHandle, BlockNumber, Page},
};

use super::{md::MdSmgr, SMgrRelationData};

/// Index of a storage manager implementation on the [SmgrSwitch].
pub type SmgrId = usize;

/// Switch entry of the magnetic disk storage manager.
pub const MD_SMGR_ID: SmgrId = 0;

/// API between the storage manager dispatch layer and an individual storage
/// manager implementation.
///
/// Implementations are generally expected to report problems by returning an
/// error. Unlink is the exception: it runs during post-commit/abort cleanup,
/// so its failures are only reported as warnings by the caller. Also, various
/// conditions that would normally be errors should be allowed during
/// bootstrap and WAL recovery: creating a fork that already exists and
/// unlinking one that is already gone must succeed when `is_redo` is set.
///
/// Every callback is invoked with interrupts held.
pub trait Smgr {
    /// Name of the implementation, used on log messages.
    fn name(&self) -> &'static str;

    /// Called once when the storage manager starts up.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Called once when the storage manager shuts down.
    fn shutdown(&self) {}

    /// Initialize implementation specific state of a new relation handle.
    ///
    /// This must not do any physical IO.
    fn open(&self, reln: &mut SMgrRelationData);

    /// Close the OS level resources of a fork, if any is open.
    fn close(&self, reln: &mut SMgrRelationData, fork: ForkNumber);

    /// Create the underlying storage of a fork.
    fn create(&self, reln: &mut SMgrRelationData, fork: ForkNumber, is_redo: bool) -> Result<()>;

    /// Return true if the underlying storage of a fork exists.
    fn exists(&self, reln: &mut SMgrRelationData, fork: ForkNumber) -> Result<bool>;

    /// Remove the underlying storage of a fork. A missing fork is not an error.
    fn unlink(&self, rlocator: &RelationLocatorBackend, fork: ForkNumber, is_redo: bool)
        -> Result<()>;

    /// Write a block at or after the current end of the fork.
    fn extend(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffer: &Page,
        skip_fsync: bool,
    ) -> Result<()>;

    /// Add `nblocks` zeroed blocks starting at `blocknum`.
    fn zero_extend(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: u32,
        skip_fsync: bool,
    ) -> Result<()>;

    /// Hint that the given blocks will be read soon.
    ///
    /// In recovery this returns false if the fork does not exist.
    fn prefetch(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: u32,
    ) -> Result<bool>;

    /// Maximum number of blocks, starting at `blocknum`, that can be handled
    /// by a single IO. Never less than one.
    fn max_combine(&self, reln: &SMgrRelationData, fork: ForkNumber, blocknum: BlockNumber)
        -> u32;

    /// Read consecutive blocks into the given buffers.
    fn readv(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffers: &mut [&mut Page],
    ) -> Result<()>;

    /// Start an asynchronous read of consecutive blocks on the given IO handle.
    ///
    /// The buffers are owned by the IO handle until the IO completes.
    fn start_readv(
        &self,
        ioh: &mut AioHandle,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffers: Vec<Box<Page>>,
    ) -> Result<()>;

    /// Write already existing consecutive blocks.
    fn writev(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffers: &[&Page],
        skip_fsync: bool,
    ) -> Result<()>;

    /// Hint the kernel to start writing back the given blocks.
    fn writeback(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<()>;

    /// Number of blocks of a fork.
    fn nblocks(&self, reln: &mut SMgrRelationData, fork: ForkNumber) -> Result<BlockNumber>;

    /// Truncate a fork from `old_blocks` to `nblocks`.
    fn truncate(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        old_blocks: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<()>;

    /// Synchronously force previous writes of a fork to stable storage.
    fn immed_sync(&self, reln: &mut SMgrRelationData, fork: ForkNumber) -> Result<()>;

    /// Request a fork to be synced at the next checkpoint.
    fn register_sync(&self, reln: &mut SMgrRelationData, fork: ForkNumber) -> Result<()>;

    /// Return the file descriptor holding `blocknum` and the offset of the
    /// block inside of it.
    fn fd(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
    ) -> Result<(RawFd, u64)>;
}

/// Fixed table of storage manager implementations.
///
/// The table is built once when the storage manager is created and it is
/// never changed afterwards. Each relation handle stores the index of the
/// implementation that governs it.
pub struct SmgrSwitch {
    impls: Vec<Box<dyn Smgr>>,
}

impl SmgrSwitch {
    /// Create a switch over the given implementations, indexed in order.
    pub fn new(impls: Vec<Box<dyn Smgr>>) -> Self {
        assert!(
            !impls.is_empty(),
            "storage manager switch needs at least one implementation"
        );
        Self { impls }
    }

    /// The default switch: magnetic disk at [MD_SMGR_ID].
    pub fn with_md(data_dir: &Path, ctx: &ProcContext) -> Self {
        Self::new(vec![Box::new(MdSmgr::new(data_dir, ctx))])
    }

    /// Return the implementation of the given switch entry.
    ///
    /// Panics on a tag that is not on the table, which is a programming error.
    pub fn get(&self, which: SmgrId) -> &dyn Smgr {
        self.impls[which].as_ref()
    }

    /// Number of implementations on the table.
    pub fn len(&self) -> usize {
        self.impls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.impls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Smgr> {
        self.impls.iter().map(|smgr| smgr.as_ref())
    }
}
