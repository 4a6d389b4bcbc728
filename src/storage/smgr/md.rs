//! The magnetic disk storage manager.
//!
//! Each fork of a relation is stored on a single file under the data
//! directory, named after [RelationLocatorBackend::relation_path]. Block N of a
//! fork lives at byte offset N * [PAGE_SIZE] of its file. Files are opened
//! lazily and kept open on the relation handle until it is released.
use std::{
    cell::RefCell,
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind},
    os::unix::{
        fs::FileExt,
        io::{AsRawFd, RawFd},
    },
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use log::debug;

use crate::{
    process::{ProcContext, RecoveryState},
    relation::{ForkNumber, RelationLocatorBackend},
    storage::{aio::AioHandle, BlockNumber, Page, INVALID_BLOCK_NUMBER, PAGE_SIZE},
};

use super::{aio_target::set_target_smgr, switch::Smgr, SMgrRelationData};

/// Maximum number of blocks handled by a single vectored IO.
pub const MAX_IO_COMBINE_BLOCKS: u32 = 128;

/// Represents errors that the magnetic disk storage manager can have.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    /// The file of a relation fork does not exist.
    #[error("could not open file {0:?}: relation fork does not exist")]
    NotFound(PathBuf),

    /// A read reached the end of file before filling all buffers.
    #[error("could not read blocks {first}..{last} in file {path:?}: read only {read} of {expected} bytes")]
    ShortRead {
        path: PathBuf,
        first: BlockNumber,
        last: BlockNumber,
        read: usize,
        expected: usize,
    },

    /// A fork can not grow up to [INVALID_BLOCK_NUMBER] blocks.
    #[error("cannot extend file {0:?} beyond {} blocks", INVALID_BLOCK_NUMBER)]
    TooLarge(PathBuf),

    /// Truncate requested to a size bigger than the current one.
    #[error("could not truncate file {path:?} to {nblocks} blocks: it's only {current} blocks now")]
    TruncateBeyondEof {
        path: PathBuf,
        nblocks: BlockNumber,
        current: BlockNumber,
    },
}

/// What to do when the file of a fork does not exist.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Extension {
    /// Return an error.
    Fail,

    /// Report that the file is missing.
    ReturnNull,

    /// Create a new empty file.
    Create,
}

/// Storage manager that keeps relations on the local file system.
pub struct MdSmgr {
    data_dir: PathBuf,

    recovery: RecoveryState,

    /// Forks with writes that must be fsync'd before the next checkpoint.
    pending_syncs: RefCell<HashSet<(RelationLocatorBackend, ForkNumber)>>,
}

impl MdSmgr {
    pub fn new(data_dir: &Path, ctx: &ProcContext) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            recovery: ctx.recovery().clone(),
            pending_syncs: RefCell::new(HashSet::new()),
        }
    }

    /// Forks that have writes waiting to be fsync'd by the next checkpoint.
    pub fn pending_sync_requests(&self) -> Vec<(RelationLocatorBackend, ForkNumber)> {
        self.pending_syncs.borrow().iter().cloned().collect()
    }

    /// Return the full path of a fork file.
    fn fork_path(&self, rlocator: &RelationLocatorBackend, fork: ForkNumber) -> PathBuf {
        self.data_dir.join(rlocator.relation_path(fork))
    }

    /// Open the file of a fork if it is not open yet.
    ///
    /// Returns false only when the file does not exist and `behavior` is
    /// [Extension::ReturnNull].
    fn open_fork(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        behavior: Extension,
    ) -> Result<bool> {
        if reln.file(fork).is_some() {
            return Ok(true);
        }

        let path = self.fork_path(reln.rlocator(), fork);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => match behavior {
                Extension::ReturnNull => return Ok(false),
                Extension::Fail => bail!(Error::NotFound(path)),
                Extension::Create => create_file(&path, false)?,
            },
            Err(err) => {
                return Err(err).with_context(|| format!("could not open file {:?}", path))
            }
        };

        debug!("Opened file {:?}", path);
        *reln.file_slot(fork) = Some(file);
        Ok(true)
    }

    /// Return the open file of a fork, opening it if needed.
    fn fork_file<'a>(
        &self,
        reln: &'a mut SMgrRelationData,
        fork: ForkNumber,
        behavior: Extension,
    ) -> Result<&'a File> {
        self.open_fork(reln, fork, behavior)?;

        let reln: &'a SMgrRelationData = reln;
        match reln.file(fork) {
            Some(file) => Ok(file),
            None => bail!(Error::NotFound(self.fork_path(reln.rlocator(), fork))),
        }
    }

    /// Remember that a fork must be fsync'd before the next checkpoint.
    fn register_dirty(&self, rlocator: &RelationLocatorBackend, fork: ForkNumber) {
        if self.pending_syncs.borrow_mut().insert((*rlocator, fork)) {
            debug!("Registered {} fork of {:?} for sync", fork, rlocator);
        }
    }
}

impl Smgr for MdSmgr {
    fn name(&self) -> &'static str {
        "md"
    }

    fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("could not create data directory {:?}", self.data_dir))
    }

    fn shutdown(&self) {
        let pending = self.pending_syncs.borrow().len();
        if pending > 0 {
            debug!("Shutting down with {} forks waiting for sync", pending);
        }
    }

    fn open(&self, reln: &mut SMgrRelationData) {
        // Files are opened on first use.
        debug!("md open {:?}", reln.rlocator());
    }

    fn close(&self, reln: &mut SMgrRelationData, fork: ForkNumber) {
        if reln.file_slot(fork).take().is_some() {
            debug!("Closed {} fork of {:?}", fork, reln.rlocator());
        }
    }

    fn create(&self, reln: &mut SMgrRelationData, fork: ForkNumber, is_redo: bool) -> Result<()> {
        if is_redo && reln.file(fork).is_some() {
            // Created already.
            return Ok(());
        }

        let path = self.fork_path(reln.rlocator(), fork);
        let file = create_file(&path, is_redo)?;
        debug!("Created file {:?}", path);
        *reln.file_slot(fork) = Some(file);
        Ok(())
    }

    fn exists(&self, reln: &mut SMgrRelationData, fork: ForkNumber) -> Result<bool> {
        // Close it first, so we notice if the fork has been unlinked since we
        // opened it. Not needed in recovery, since nothing else unlinks files.
        if !self.recovery.in_recovery() {
            self.close(reln, fork);
        }
        self.open_fork(reln, fork, Extension::ReturnNull)
    }

    fn unlink(
        &self,
        rlocator: &RelationLocatorBackend,
        fork: ForkNumber,
        is_redo: bool,
    ) -> Result<()> {
        self.pending_syncs.borrow_mut().remove(&(*rlocator, fork));

        let path = self.fork_path(rlocator, fork);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed file {:?} (redo: {})", path, is_redo);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("could not remove file {:?}", path)),
        }
    }

    fn extend(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffer: &Page,
        skip_fsync: bool,
    ) -> Result<()> {
        if blocknum == INVALID_BLOCK_NUMBER {
            bail!(Error::TooLarge(self.fork_path(reln.rlocator(), fork)));
        }

        let file = self.fork_file(reln, fork, Extension::Create)?;
        file.write_all_at(buffer, block_offset(blocknum))?;
        debug!("Extended {} fork of {:?} with block {}", fork, reln.rlocator(), blocknum);

        if !skip_fsync && !reln.is_temp() {
            self.register_dirty(reln.rlocator(), fork);
        }
        Ok(())
    }

    fn zero_extend(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: u32,
        skip_fsync: bool,
    ) -> Result<()> {
        if blocknum as u64 + nblocks as u64 >= INVALID_BLOCK_NUMBER as u64 {
            bail!(Error::TooLarge(self.fork_path(reln.rlocator(), fork)));
        }

        let zeroes = [0; PAGE_SIZE];
        let file = self.fork_file(reln, fork, Extension::Create)?;
        for i in 0..nblocks {
            file.write_all_at(&zeroes, block_offset(blocknum + i))?;
        }
        debug!(
            "Extended {} fork of {:?} with {} zeroed blocks at {}",
            fork,
            reln.rlocator(),
            nblocks,
            blocknum
        );

        if !skip_fsync && !reln.is_temp() {
            self.register_dirty(reln.rlocator(), fork);
        }
        Ok(())
    }

    fn prefetch(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: u32,
    ) -> Result<bool> {
        // The file may have been dropped by a later WAL record.
        let behavior = if self.recovery.in_recovery() {
            Extension::ReturnNull
        } else {
            Extension::Fail
        };
        if !self.open_fork(reln, fork, behavior)? {
            return Ok(false);
        }
        debug!("Prefetch {} blocks at {} of {:?}", nblocks, blocknum, reln.rlocator());
        Ok(true)
    }

    fn max_combine(
        &self,
        _reln: &SMgrRelationData,
        _fork: ForkNumber,
        blocknum: BlockNumber,
    ) -> u32 {
        MAX_IO_COMBINE_BLOCKS.min(INVALID_BLOCK_NUMBER - blocknum).max(1)
    }

    fn readv(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffers: &mut [&mut Page],
    ) -> Result<()> {
        let read = {
            let file = self.fork_file(reln, fork, Extension::Fail)?;
            read_blocks(file, block_offset(blocknum), buffers.iter_mut().map(|b| &mut **b))?
        };

        let expected = buffers.len() * PAGE_SIZE;
        if read < expected {
            // In recovery the blocks may be filled by later WAL records.
            if !self.recovery.in_recovery() {
                bail!(Error::ShortRead {
                    path: self.fork_path(reln.rlocator(), fork),
                    first: blocknum,
                    last: blocknum + buffers.len() as u32 - 1,
                    read,
                    expected,
                });
            }

            debug!("Zero filling blocks past end of {} fork of {:?}", fork, reln.rlocator());
            for (i, page) in buffers.iter_mut().enumerate() {
                let start = i * PAGE_SIZE;
                if start + PAGE_SIZE <= read {
                    continue;
                }
                page[read.saturating_sub(start)..].fill(0);
            }
        }
        Ok(())
    }

    fn start_readv(
        &self,
        ioh: &mut AioHandle,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffers: Vec<Box<Page>>,
    ) -> Result<()> {
        let (fd, offset) = self.fd(reln, fork, blocknum)?;
        set_target_smgr(ioh, reln, fork, blocknum, buffers.len() as u32, false);
        ioh.prepare_readv(fd, offset, buffers)
    }

    fn writev(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffers: &[&Page],
        skip_fsync: bool,
    ) -> Result<()> {
        let file = self.fork_file(reln, fork, Extension::Fail)?;
        let offset = block_offset(blocknum);
        for (i, page) in buffers.iter().enumerate() {
            file.write_all_at(&page[..], offset + (i * PAGE_SIZE) as u64)?;
        }

        if !skip_fsync && !reln.is_temp() {
            self.register_dirty(reln.rlocator(), fork);
        }
        Ok(())
    }

    fn writeback(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        // std has no range writeback hint, so the
        // data of the whole fork is flushed. This is stronger than a hint but
        // still not a checkpoint sync: the pending sync request is kept.
        // Nothing was written through a file that is not open.
        if let Some(file) = reln.file(fork) {
            debug!("Writeback of {} blocks at {} of {:?}", nblocks, blocknum, reln.rlocator());
            file.sync_data()?;
        }
        Ok(())
    }

    fn nblocks(&self, reln: &mut SMgrRelationData, fork: ForkNumber) -> Result<BlockNumber> {
        let file = self.fork_file(reln, fork, Extension::Fail)?;
        let len = file.metadata()?.len();
        Ok((len / PAGE_SIZE as u64) as BlockNumber)
    }

    fn truncate(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        old_blocks: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        if nblocks > old_blocks {
            // A bogus request can happen when replaying WAL of a relation
            // that was truncated further later on.
            if self.recovery.in_recovery() {
                return Ok(());
            }
            bail!(Error::TruncateBeyondEof {
                path: self.fork_path(reln.rlocator(), fork),
                nblocks,
                current: old_blocks,
            });
        }
        if nblocks == old_blocks {
            return Ok(());
        }

        let file = self.fork_file(reln, fork, Extension::Fail)?;
        file.set_len(block_offset(nblocks))?;
        debug!("Truncated {} fork of {:?} to {} blocks", fork, reln.rlocator(), nblocks);

        if !reln.is_temp() {
            self.register_dirty(reln.rlocator(), fork);
        }
        Ok(())
    }

    fn immed_sync(&self, reln: &mut SMgrRelationData, fork: ForkNumber) -> Result<()> {
        let file = self.fork_file(reln, fork, Extension::Fail)?;
        file.sync_all()?;
        self.pending_syncs
            .borrow_mut()
            .remove(&(*reln.rlocator(), fork));
        Ok(())
    }

    fn register_sync(&self, reln: &mut SMgrRelationData, fork: ForkNumber) -> Result<()> {
        self.open_fork(reln, fork, Extension::Fail)?;
        self.register_dirty(reln.rlocator(), fork);
        Ok(())
    }

    fn fd(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
    ) -> Result<(RawFd, u64)> {
        let file = self.fork_file(reln, fork, Extension::Fail)?;
        Ok((file.as_raw_fd(), block_offset(blocknum)))
    }
}

/// Returns the offset of a block on its fork file.
fn block_offset(blocknum: BlockNumber) -> u64 {
    blocknum as u64 * PAGE_SIZE as u64
}

/// Create a fork file and its parent directories.
///
/// An existing file is an error, unless `is_redo` is set.
fn create_file(path: &Path, is_redo: bool) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("could not create directory {:?}", parent))?;
    }

    match OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == ErrorKind::AlreadyExists && is_redo => Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?),
        Err(err) => Err(err).with_context(|| format!("could not create file {:?}", path)),
    }
}

/// Read consecutive blocks starting at `offset` until the end of file.
///
/// Returns the number of bytes read.
pub(crate) fn read_blocks<'a, I>(file: &File, offset: u64, buffers: I) -> io::Result<usize>
where
    I: IntoIterator<Item = &'a mut Page>,
{
    let mut total = 0;
    for page in buffers {
        let read = read_full_at(file, page, offset + total as u64)?;
        total += read;
        if read < PAGE_SIZE {
            break;
        }
    }
    Ok(total)
}

/// Read until `buf` is full or the end of file is reached.
fn read_full_at(file: &File, buf: &mut [u8], mut offset: u64) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], offset) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                offset += n as u64;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}
