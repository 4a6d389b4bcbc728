//! Public interface routines to the storage manager switch.
//!
//! All file system operations on relations dispatch through these routines.
//! An [SMgrRelation] represents physical on-disk relation files that are open
//! for reading and writing.
//!
//! The [StorageManager] keeps a table with all the relation handles of the
//! process. Opening the same relation locator twice returns the same handle,
//! which stays valid until the end of the transaction, so things like the
//! relation size can be cached on it. At end of transaction all handles that
//! were not pinned are destroyed. Handles can also be released at any time
//! (e.g. when another process asks us to close all open files), which closes
//! their files but keeps them valid, since there may be references to them in
//! active use.
//!
//! Interrupts are held across most of the functions here, since processing an
//! interrupt may release the very files that an operation is using.
mod aio_target;
pub mod md;
mod switch;
mod unpinned;

use std::{
    cell::RefCell,
    collections::HashMap,
    fs::File,
    os::unix::io::RawFd,
    path::PathBuf,
    rc::Rc,
};

use anyhow::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    process::{Interrupts, ProcContext, RecoveryState},
    relation::{ForkNumber, RelationLocator, RelationLocatorBackend, FORK_COUNT},
    ProcNumber, INVALID_OID,
};

use super::{
    aio::AioHandle,
    bufmgr::{NoBuffers, RelationBuffers},
    inval::{NoInvalidation, SmgrInvalidation},
    BlockNumber, Page,
};

pub use aio_target::{describe_block_range, set_target_smgr, SmgrAioTarget, SMGR_AIO_TARGET};
pub use switch::{Smgr, SmgrId, SmgrSwitch, MD_SMGR_ID};

use self::unpinned::UnpinnedList;

/// Storage manager configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Path where relation files are stored.
    pub data_dir: PathBuf,

    /// Number of the process that owns this storage manager.
    pub proc_number: ProcNumber,

    /// Initial capacity of the relation handle table.
    pub registry_capacity: usize,

    /// Switch entry assigned to new relation handles.
    pub default_smgr: SmgrId,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            proc_number: 0,
            registry_capacity: 400,
            default_smgr: MD_SMGR_ID,
        }
    }
}

/// Represents the storage manager state of a relation.
#[derive(Debug)]
pub struct SMgrRelationData {
    /// Relation physical identifier, also the key on the handle table.
    rlocator: RelationLocatorBackend,

    /// Switch entry of the storage manager implementation of this relation.
    which: SmgrId,

    /// Cached number of blocks of each fork, None when unknown.
    cached_nblocks: [Option<BlockNumber>; FORK_COUNT],

    /// Current insertion target block, not managed here.
    target_block: Option<BlockNumber>,

    /// Number of pins, zero means that the handle is on the unpinned list.
    pincount: u32,

    /// Open file of each fork, owned by the storage manager implementation.
    files: [Option<File>; FORK_COUNT],
}

/// A mutable reference counter to an SMgrRelationData.
pub type SMgrRelation = Rc<RefCell<SMgrRelationData>>;

impl SMgrRelationData {
    fn new(rlocator: RelationLocatorBackend, which: SmgrId) -> Self {
        Self {
            rlocator,
            which,
            cached_nblocks: [None; FORK_COUNT],
            target_block: None,
            pincount: 0,
            files: Default::default(),
        }
    }

    pub fn rlocator(&self) -> &RelationLocatorBackend {
        &self.rlocator
    }

    pub fn which(&self) -> SmgrId {
        self.which
    }

    /// Return true if the relation is session-private storage.
    pub fn is_temp(&self) -> bool {
        self.rlocator.is_temp()
    }

    pub fn pincount(&self) -> u32 {
        self.pincount
    }

    /// Cached number of blocks of a fork, regardless of the recovery state.
    pub fn cached_nblocks(&self, fork: ForkNumber) -> Option<BlockNumber> {
        self.cached_nblocks[fork.index()]
    }

    pub fn target_block(&self) -> Option<BlockNumber> {
        self.target_block
    }

    pub fn set_target_block(&mut self, block: Option<BlockNumber>) {
        self.target_block = block;
    }

    /// Open file of a fork, if any.
    pub fn file(&self, fork: ForkNumber) -> Option<&File> {
        self.files[fork.index()].as_ref()
    }

    /// Slot holding the open file of a fork, for storage manager
    /// implementations.
    pub fn file_slot(&mut self, fork: ForkNumber) -> &mut Option<File> {
        &mut self.files[fork.index()]
    }

    /// Update the cached size of a fork after `nblocks` were added at
    /// `blocknum`.
    ///
    /// Normally we expect the fork to grow by exactly nblocks, but if the
    /// cached value isn't as expected just invalidate it, so the next size
    /// request asks the kernel.
    fn note_extension(&mut self, fork: ForkNumber, blocknum: BlockNumber, nblocks: u32) {
        let cached = &mut self.cached_nblocks[fork.index()];
        *cached = match *cached {
            Some(current) if current == blocknum => blocknum.checked_add(nblocks),
            _ => None,
        };
    }
}

/// The storage manager of a process.
///
/// Owns the table of relation handles of the process and dispatches every
/// operation to the storage manager implementation selected by each handle.
/// It is not meant to be shared between threads: processes coordinate through
/// the invalidation channel.
pub struct StorageManager {
    config: Config,

    ctx: ProcContext,

    /// Table of storage manager implementations.
    switch: SmgrSwitch,

    /// All relation handles of the process, created on first use.
    relations: RefCell<Option<HashMap<RelationLocatorBackend, SMgrRelation>>>,

    /// Handles with pin count zero, destroyed at end of transaction.
    unpinned: RefCell<UnpinnedList<RelationLocatorBackend>>,

    buffers: Rc<dyn RelationBuffers>,

    invalidation: Rc<dyn SmgrInvalidation>,
}

impl StorageManager {
    /// Create a new storage manager using the magnetic disk implementation
    /// rooted at the configured data directory.
    pub fn new(config: Config) -> Result<Self> {
        let ctx = ProcContext::new();
        let switch = SmgrSwitch::with_md(&config.data_dir, &ctx);
        Self::with_switch(config, ctx, switch)
    }

    /// Create a new storage manager over the given switch table.
    ///
    /// The implementations on the switch must have been built with the same
    /// process context.
    pub fn with_switch(config: Config, ctx: ProcContext, switch: SmgrSwitch) -> Result<Self> {
        assert!(
            config.default_smgr < switch.len(),
            "default storage manager {} is not on the switch table",
            config.default_smgr
        );

        {
            let _held = ctx.interrupts().hold();
            for smgr in switch.iter() {
                info!("Initializing {} storage manager", smgr.name());
                smgr.init()?;
            }
        }

        Ok(Self {
            unpinned: RefCell::new(UnpinnedList::new(config.registry_capacity)),
            relations: RefCell::new(None),
            buffers: Rc::new(NoBuffers),
            invalidation: Rc::new(NoInvalidation),
            config,
            ctx,
            switch,
        })
    }

    /// Use the given buffer cache on bulk operations.
    pub fn with_buffers(mut self, buffers: Rc<dyn RelationBuffers>) -> Self {
        self.buffers = buffers;
        self
    }

    /// Use the given invalidation channel on destructive operations.
    pub fn with_invalidation(mut self, invalidation: Rc<dyn SmgrInvalidation>) -> Self {
        self.invalidation = invalidation;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn context(&self) -> &ProcContext {
        &self.ctx
    }

    pub fn interrupts(&self) -> &Rc<Interrupts> {
        self.ctx.interrupts()
    }

    pub fn recovery(&self) -> &RecoveryState {
        self.ctx.recovery()
    }

    /// Return a relation handle, creating it if need be.
    ///
    /// The handle remains valid until the end of the transaction, or until
    /// [StorageManager::destroy_all] is called when used outside of
    /// transactions. This does not attempt to actually open the underlying
    /// files.
    pub fn open(&self, locator: RelationLocator, backend: Option<ProcNumber>) -> SMgrRelation {
        assert_ne!(locator.oid, INVALID_OID);

        let _held = self.interrupts().hold();

        let rlocator = RelationLocatorBackend::new(locator, backend);
        let reln = {
            let mut relations = self.relations.borrow_mut();
            let relations = relations.get_or_insert_with(|| {
                debug!("Creating smgr relation table");
                HashMap::with_capacity(self.config.registry_capacity)
            });

            if let Some(reln) = relations.get(&rlocator) {
                return reln.clone();
            }

            let reln = Rc::new(RefCell::new(SMgrRelationData::new(
                rlocator,
                self.config.default_smgr,
            )));
            relations.insert(rlocator, reln.clone());
            reln
        };

        // It is not pinned yet.
        self.unpinned.borrow_mut().push_tail(rlocator);

        let mut data = reln.borrow_mut();
        let smgr = self.switch.get(data.which);
        debug!("Opening {:?} using {} storage manager", rlocator, smgr.name());
        smgr.open(&mut data);
        drop(data);

        reln
    }

    /// Return the handle of a relation if it is open.
    pub fn lookup(&self, rlocator: &RelationLocatorBackend) -> Option<SMgrRelation> {
        self.relations
            .borrow()
            .as_ref()
            .and_then(|relations| relations.get(rlocator).cloned())
    }

    /// Snapshot of all handles on the table.
    pub fn relations(&self) -> Vec<SMgrRelation> {
        self.relations
            .borrow()
            .as_ref()
            .map(|relations| relations.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Identities on the unpinned list, in the order they will be destroyed.
    pub fn unpinned_relations(&self) -> Vec<RelationLocatorBackend> {
        self.unpinned.borrow().iter().collect()
    }

    /// Return true if the handle is on the unpinned list.
    pub fn is_unpinned(&self, reln: &SMgrRelation) -> bool {
        self.unpinned.borrow().contains(reln.borrow().rlocator())
    }

    /// Prevent a handle from being destroyed at end of transaction.
    pub fn pin(&self, reln: &SMgrRelation) {
        let _held = self.interrupts().hold();
        let mut reln = reln.borrow_mut();
        if reln.pincount == 0 {
            self.unpinned.borrow_mut().remove(&reln.rlocator);
        }
        reln.pincount += 1;
    }

    /// Allow a handle to be destroyed at end of transaction.
    ///
    /// The handle remains valid, but if there are no other pins on it, it is
    /// moved to the unpinned list where it will be destroyed by
    /// [StorageManager::at_eoxact].
    pub fn unpin(&self, reln: &SMgrRelation) {
        let _held = self.interrupts().hold();
        let mut reln = reln.borrow_mut();
        assert!(
            reln.pincount > 0,
            "unpinning smgr relation {:?} that is not pinned",
            reln.rlocator
        );
        reln.pincount -= 1;
        if reln.pincount == 0 {
            self.unpinned.borrow_mut().push_tail(reln.rlocator);
        }
    }

    /// Close all forks of an unpinned handle and remove it from the table.
    ///
    /// It must be known that there are no other references in use to the
    /// handle.
    pub fn destroy(&self, reln: &SMgrRelation) {
        let _held = self.interrupts().hold();

        let rlocator = {
            let mut data = reln.borrow_mut();
            assert_eq!(
                data.pincount, 0,
                "destroying pinned smgr relation {:?}",
                data.rlocator
            );
            let smgr = self.switch.get(data.which);
            for fork in ForkNumber::ALL.iter() {
                smgr.close(&mut data, *fork);
            }
            data.rlocator
        };

        self.unpinned.borrow_mut().remove(&rlocator);

        let mut relations = self.relations.borrow_mut();
        match relations.as_mut().and_then(|relations| relations.remove(&rlocator)) {
            Some(removed) if Rc::ptr_eq(&removed, reln) => {
                debug!("Destroyed smgr relation {:?}", rlocator);
            }
            _ => panic!("smgr relation table corrupted"),
        }
    }

    /// Destroy all unpinned handles.
    ///
    /// It must be known that there are no references to handles other than
    /// those pinned with [StorageManager::pin].
    pub fn destroy_all(&self) {
        if self.unpinned.borrow().is_empty() {
            return;
        }

        let _held = self.interrupts().hold();
        debug!(
            "Destroying {} unpinned smgr relations",
            self.unpinned.borrow().len()
        );

        // destroy() takes each handle out of the list.
        loop {
            let front = self.unpinned.borrow().front();
            let rlocator = match front {
                Some(rlocator) => rlocator,
                None => break,
            };
            let reln = self
                .lookup(&rlocator)
                .unwrap_or_else(|| panic!("smgr relation table corrupted"));
            self.destroy(&reln);
        }
    }

    /// Release all OS resources used by a handle.
    ///
    /// The handle remains valid and on the table, its files are reopened on
    /// next use.
    pub fn release(&self, reln: &SMgrRelation) {
        let _held = self.interrupts().hold();
        let mut data = reln.borrow_mut();
        let smgr = self.switch.get(data.which);
        for fork in ForkNumber::ALL.iter() {
            smgr.close(&mut data, *fork);
            data.cached_nblocks[fork.index()] = None;
        }
        data.target_block = None;
    }

    /// Close a handle.
    ///
    /// The handle should not be used after this call, but since other
    /// references may still point to it, it can not be removed from the
    /// table yet. This is a synonym of [StorageManager::release].
    pub fn close(&self, reln: &SMgrRelation) {
        self.release(reln);
    }

    /// Release the resources used by all handles, pinned or not.
    pub fn release_all(&self) {
        let relations = self.relations();
        if relations.is_empty() {
            return;
        }

        let _held = self.interrupts().hold();
        debug!("Releasing {} smgr relations", relations.len());
        for reln in &relations {
            self.release(reln);
        }
    }

    /// Release the resources of a relation if it is open.
    ///
    /// Same as releasing the handle returned by [StorageManager::open], but
    /// avoids creating a table entry only to release it.
    pub fn release_rel_locator(&self, rlocator: &RelationLocatorBackend) {
        if let Some(reln) = self.lookup(rlocator) {
            self.release(&reln);
        }
    }

    /// Process an invalidation message sent by [SmgrInvalidation].
    pub fn invalidate(&self, rlocator: &RelationLocatorBackend) {
        debug!("Processing smgr invalidation for {:?}", rlocator);
        self.release_rel_locator(rlocator);
    }

    /// Called during transaction commit or abort. All unpinned handles are
    /// destroyed.
    pub fn at_eoxact(&self) {
        self.destroy_all();
    }

    /// Called when ordered to release all open files. Always succeeds.
    pub fn process_barrier_release(&self) -> bool {
        self.release_all();
        true
    }

    /// Service pending interrupts, unless they are being held.
    pub fn check_for_interrupts(&self) {
        if self.interrupts().take_smgr_release() {
            debug!("Processing smgr release barrier");
            self.process_barrier_release();
        }
    }

    /// Does the underlying file of a fork exist?
    pub fn exists(&self, reln: &SMgrRelation, fork: ForkNumber) -> Result<bool> {
        self.dispatch(reln, |smgr, reln| smgr.exists(reln, fork))
    }

    /// Create the underlying storage of a fork.
    ///
    /// If `is_redo` is true it is okay for the storage to exist already.
    pub fn create(&self, reln: &SMgrRelation, fork: ForkNumber, is_redo: bool) -> Result<()> {
        self.dispatch(reln, |smgr, reln| smgr.create(reln, fork, is_redo))
    }

    /// Immediately sync all forks of all given relations.
    ///
    /// Equivalent to flushing the buffers of each relation and then calling
    /// [StorageManager::immed_sync] for all of its forks, but quicker.
    pub fn do_sync_all(&self, rels: &[SMgrRelation]) -> Result<()> {
        if rels.is_empty() {
            return Ok(());
        }

        self.buffers.flush_relations_all_buffers(rels)?;

        let _held = self.interrupts().hold();
        for reln in rels {
            let mut data = reln.borrow_mut();
            let smgr = self.switch.get(data.which);
            for fork in ForkNumber::ALL.iter() {
                if smgr.exists(&mut data, *fork)? {
                    smgr.immed_sync(&mut data, *fork)?;
                }
            }
        }
        Ok(())
    }

    /// Immediately unlink all forks of all given relations.
    ///
    /// This can't be undone, so it should not be used during transactional
    /// operations. If `is_redo` is true it is okay for the files to be gone
    /// already. Failures to remove a file are reported as warnings.
    pub fn do_unlink_all(&self, rels: &[SMgrRelation], is_redo: bool) {
        if rels.is_empty() {
            return;
        }

        // Nothing may release our files between dropping the buffers and
        // unlinking them.
        let _held = self.interrupts().hold();

        // Buffers are dropped without writing their contents.
        self.buffers.drop_relations_all_buffers(rels);

        let mut rlocators = Vec::with_capacity(rels.len());
        for reln in rels {
            let mut data = reln.borrow_mut();
            let smgr = self.switch.get(data.which);
            for fork in ForkNumber::ALL.iter() {
                smgr.close(&mut data, *fork);
            }
            rlocators.push((data.rlocator, data.which));
        }

        // Other processes must close their files before they are gone, in
        // case we fail partway through the unlinking.
        for (rlocator, _) in &rlocators {
            self.invalidation.invalidate_smgr(*rlocator);
        }

        for (rlocator, which) in &rlocators {
            let smgr = self.switch.get(*which);
            for fork in ForkNumber::ALL.iter() {
                if let Err(err) = smgr.unlink(rlocator, *fork, is_redo) {
                    warn!(
                        "could not remove {} fork of relation {:?}: {:#}",
                        fork, rlocator, err
                    );
                }
            }
        }
    }

    /// Add a new block to a fork.
    ///
    /// Nearly the same as [StorageManager::write], but to be used when
    /// `blocknum` is at or beyond the current end of the fork. Intervening
    /// space is assumed to become filled with zeroes.
    pub fn extend(
        &self,
        reln: &SMgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffer: &Page,
        skip_fsync: bool,
    ) -> Result<()> {
        self.dispatch(reln, |smgr, reln| -> Result<()> {
            smgr.extend(reln, fork, blocknum, buffer, skip_fsync)?;
            reln.note_extension(fork, blocknum, 1);
            Ok(())
        })
    }

    /// Add `nblocks` zeroed blocks to a fork, starting at `blocknum`.
    pub fn zero_extend(
        &self,
        reln: &SMgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: u32,
        skip_fsync: bool,
    ) -> Result<()> {
        self.dispatch(reln, |smgr, reln| -> Result<()> {
            smgr.zero_extend(reln, fork, blocknum, nblocks, skip_fsync)?;
            reln.note_extension(fork, blocknum, nblocks);
            Ok(())
        })
    }

    /// Initiate asynchronous read of the specified blocks of a fork.
    ///
    /// In recovery only, this can return false to indicate that the file
    /// doesn't exist (presumably it has been dropped by a later WAL record).
    pub fn prefetch(
        &self,
        reln: &SMgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: u32,
    ) -> Result<bool> {
        self.dispatch(reln, |smgr, reln| {
            smgr.prefetch(reln, fork, blocknum, nblocks)
        })
    }

    /// Return the maximum number of blocks that can be combined with an IO
    /// starting at `blocknum`, including the block itself.
    pub fn max_combine(&self, reln: &SMgrRelation, fork: ForkNumber, blocknum: BlockNumber) -> u32 {
        self.dispatch(reln, |smgr, reln| {
            let max = smgr.max_combine(reln, fork, blocknum);
            debug_assert!(max >= 1, "{} storage manager can not combine IO", smgr.name());
            max
        })
    }

    /// Read a block range of a fork into the supplied buffers.
    ///
    /// When reading more than one block, callers need to use
    /// [StorageManager::max_combine] to check how many blocks can be combined
    /// into one IO.
    pub fn readv(
        &self,
        reln: &SMgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffers: &mut [&mut Page],
    ) -> Result<()> {
        self.dispatch(reln, |smgr, reln| {
            debug_assert!(buffers.len() as u64 <= smgr.max_combine(reln, fork, blocknum) as u64);
            smgr.readv(reln, fork, blocknum, buffers)
        })
    }

    /// Read a single block.
    pub fn read(
        &self,
        reln: &SMgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffer: &mut Page,
    ) -> Result<()> {
        self.readv(reln, fork, blocknum, &mut [buffer])
    }

    /// Asynchronous version of [StorageManager::readv].
    ///
    /// The read is executed by the IO subsystem that owns `ioh`. The result is
    /// reported on the handle as the number of blocks successfully read,
    /// buffers of the blocks not read may have been modified. Re-issuing the
    /// IO for the unread blocks and reporting warnings or errors to the user
    /// is up to the caller.
    pub fn start_readv(
        &self,
        ioh: &mut AioHandle,
        reln: &SMgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffers: Vec<Box<Page>>,
    ) -> Result<()> {
        self.dispatch(reln, |smgr, reln| {
            debug_assert!(buffers.len() as u64 <= smgr.max_combine(reln, fork, blocknum) as u64);
            smgr.start_readv(ioh, reln, fork, blocknum, buffers)
        })
    }

    /// Write the supplied buffers out.
    ///
    /// To be used only for updating already existing blocks of a fork, use
    /// [StorageManager::extend] to add new ones. The write is not synchronous,
    /// the blocks are only handed to the kernel; unless `skip_fsync` is set
    /// provisions are made to fsync them before the next checkpoint. Temporary
    /// relations are never fsync'd.
    pub fn writev(
        &self,
        reln: &SMgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffers: &[&Page],
        skip_fsync: bool,
    ) -> Result<()> {
        self.dispatch(reln, |smgr, reln| {
            debug_assert!(buffers.len() as u64 <= smgr.max_combine(reln, fork, blocknum) as u64);
            smgr.writev(reln, fork, blocknum, buffers, skip_fsync)
        })
    }

    /// Write a single block.
    pub fn write(
        &self,
        reln: &SMgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffer: &Page,
        skip_fsync: bool,
    ) -> Result<()> {
        self.writev(reln, fork, blocknum, &[buffer], skip_fsync)
    }

    /// Trigger kernel writeback for the supplied range of blocks.
    pub fn writeback(
        &self,
        reln: &SMgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        self.dispatch(reln, |smgr, reln| {
            smgr.writeback(reln, fork, blocknum, nblocks)
        })
    }

    /// Calculate the number of blocks of a fork.
    pub fn nblocks(&self, reln: &SMgrRelation, fork: ForkNumber) -> Result<BlockNumber> {
        if let Some(nblocks) = self.nblocks_cached(reln, fork) {
            return Ok(nblocks);
        }

        self.dispatch(reln, |smgr, reln| -> Result<BlockNumber> {
            let nblocks = smgr.nblocks(reln, fork)?;
            reln.cached_nblocks[fork.index()] = Some(nblocks);
            Ok(nblocks)
        })
    }

    /// Get the cached number of blocks of a fork.
    ///
    /// Cached values are only trusted in recovery, since there is no shared
    /// invalidation mechanism for changes in file size. Returns None when not
    /// in recovery or when the size is not cached.
    pub fn nblocks_cached(&self, reln: &SMgrRelation, fork: ForkNumber) -> Option<BlockNumber> {
        if !self.recovery().in_recovery() {
            return None;
        }
        reln.borrow().cached_nblocks(fork)
    }

    /// Truncate the given forks of a relation to each specified number of
    /// blocks.
    ///
    /// The truncation is done immediately, so this can't be rolled back. The
    /// caller must hold an exclusive lock on the relation, to ensure that other
    /// processes receive the invalidation sent here before they access any
    /// fork of the relation again. `old_nblocks` must hold the current size of
    /// each fork.
    pub fn truncate(
        &self,
        reln: &SMgrRelation,
        forks: &[ForkNumber],
        old_nblocks: &[BlockNumber],
        nblocks: &[BlockNumber],
    ) -> Result<()> {
        assert_eq!(forks.len(), old_nblocks.len());
        assert_eq!(forks.len(), nblocks.len());

        // Buffers past the new end are dropped without writing them.
        self.buffers.drop_relation_buffers(reln, forks, nblocks);

        // Other processes may have files open on removed parts of the forks
        // or cached sizes past the new end. The message must go out before
        // changing things on disk.
        let rlocator = *reln.borrow().rlocator();
        self.invalidation.invalidate_smgr(rlocator);

        self.dispatch(reln, |smgr, reln| -> Result<()> {
            for ((fork, old), new) in forks.iter().zip(old_nblocks).zip(nblocks) {
                // Leave the cached size unknown if the truncation fails.
                reln.cached_nblocks[fork.index()] = None;
                smgr.truncate(reln, *fork, *old, *new)?;
                // Truncating past the end is skipped during recovery, the
                // fork keeps its old size then.
                if new <= old {
                    reln.cached_nblocks[fork.index()] = Some(*new);
                }
            }
            Ok(())
        })
    }

    /// Request a fork to be synced at the next checkpoint.
    ///
    /// Used after writes with `skip_fsync` set, to register the skipped
    /// fsyncs. If a checkpoint may have happened since those writes the
    /// caller must use [StorageManager::immed_sync] instead.
    pub fn register_sync(&self, reln: &SMgrRelation, fork: ForkNumber) -> Result<()> {
        self.dispatch(reln, |smgr, reln| smgr.register_sync(reln, fork))
    }

    /// Synchronously force all previous writes of a fork to stable storage.
    ///
    /// Buffered pages of the fork must have been flushed first, otherwise the
    /// sync is not very meaningful.
    pub fn immed_sync(&self, reln: &SMgrRelation, fork: ForkNumber) -> Result<()> {
        self.dispatch(reln, |smgr, reln| smgr.immed_sync(reln, fork))
    }

    /// Return the file descriptor holding `blocknum` and the block offset in it.
    ///
    /// Only to be used when an IO must be performed on a different context
    /// than the one that issued it. The caller must hold interrupts,
    /// otherwise the descriptor could be closed before it is used.
    pub fn fd(
        &self,
        reln: &SMgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
    ) -> Result<(RawFd, u64)> {
        debug_assert!(
            !self.interrupts().can_be_processed(),
            "smgr fd requested without holding interrupts"
        );
        let mut data = reln.borrow_mut();
        self.switch.get(data.which).fd(&mut data, fork, blocknum)
    }

    /// Run an operation on the implementation of a handle, with interrupts held.
    fn dispatch<T, F>(&self, reln: &SMgrRelation, op: F) -> T
    where
        F: FnOnce(&dyn Smgr, &mut SMgrRelationData) -> T,
    {
        let _held = self.interrupts().hold();
        let mut data = reln.borrow_mut();
        let smgr = self.switch.get(data.which);
        op(smgr, &mut *data)
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        let _held = self.ctx.interrupts().hold();
        for smgr in self.switch.iter() {
            info!("Shutting down {} storage manager", smgr.name());
            smgr.shutdown();
        }
    }
}
