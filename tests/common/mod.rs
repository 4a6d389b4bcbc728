#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    os::unix::io::RawFd,
    rc::Rc,
    sync::Once,
};

use anyhow::{anyhow, bail, Result};
use rand::prelude::random;
use tempfile::TempDir;
use tinydb_smgr::{
    catalog::pg_tablespace::DEFAULTTABLESPACE_OID,
    process::{Interrupts, ProcContext},
    relation::{ForkNumber, RelationLocator, RelationLocatorBackend},
    storage::{
        aio::AioHandle,
        bufmgr::RelationBuffers,
        inval::SmgrInvalidation,
        smgr::{set_target_smgr, Config, SMgrRelationData, Smgr, SmgrSwitch},
        BlockNumber, Page, SMgrRelation, StorageManager, PAGE_SIZE,
    },
    ProcNumber,
};

static INIT_LOGGER: Once = Once::new();

/// Log to stderr, enable with RUST_LOG_VERBOSITY=<n>.
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        let verbosity = std::env::var("RUST_LOG_VERBOSITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        stderrlog::new()
            .module("tinydb_smgr")
            .verbosity(verbosity)
            .init()
            .unwrap();
    });
}

/// Create a locator on the default tablespace with a random relation oid.
pub fn random_locator() -> RelationLocator {
    RelationLocator {
        tablespace: DEFAULTTABLESPACE_OID,
        database: 1,
        oid: 16384 + random::<u16>() as u64,
    }
}

/// Everything observed by the recording storage manager and collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Init,
    Shutdown,
    Open(RelationLocatorBackend),
    Close(RelationLocatorBackend, ForkNumber),
    Create(RelationLocatorBackend, ForkNumber, bool),
    Exists(RelationLocatorBackend, ForkNumber),
    Unlink(RelationLocatorBackend, ForkNumber, bool),
    Extend(RelationLocatorBackend, ForkNumber, BlockNumber),
    ZeroExtend(RelationLocatorBackend, ForkNumber, BlockNumber, u32),
    Prefetch(RelationLocatorBackend, ForkNumber, BlockNumber, u32),
    Readv(RelationLocatorBackend, ForkNumber, BlockNumber, usize),
    StartReadv(RelationLocatorBackend, ForkNumber, BlockNumber, usize),
    Writev(RelationLocatorBackend, ForkNumber, BlockNumber, usize),
    Writeback(RelationLocatorBackend, ForkNumber, BlockNumber, BlockNumber),
    Nblocks(RelationLocatorBackend, ForkNumber),
    Truncate(RelationLocatorBackend, ForkNumber, BlockNumber, BlockNumber),
    ImmedSync(RelationLocatorBackend, ForkNumber),
    RegisterSync(RelationLocatorBackend, ForkNumber),
    Invalidate(RelationLocatorBackend),
    FlushBuffers(Vec<RelationLocatorBackend>),
    DropBuffers(Vec<RelationLocatorBackend>),
    DropRelationBuffers(RelationLocatorBackend, Vec<ForkNumber>, Vec<BlockNumber>),
}

/// State shared by the recording storage manager, buffer cache and
/// invalidation channel.
#[derive(Debug, Default)]
pub struct Recorder {
    events: RefCell<Vec<Event>>,

    /// Number of storage manager callbacks invoked without interrupts held.
    pub unheld_calls: Cell<usize>,

    /// Size of every fork that exists.
    sizes: RefCell<HashMap<(RelationLocatorBackend, ForkNumber), BlockNumber>>,

    /// Make every unlink fail.
    pub fail_unlink: Cell<bool>,
}

impl Recorder {
    pub fn record(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    /// Events except fork closes, which happen on every release.
    pub fn events_without_closes(&self) -> Vec<Event> {
        self.events
            .borrow()
            .iter()
            .filter(|event| !matches!(event, Event::Close(..)))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| predicate(e)).count()
    }

    /// Backend view of the size of a fork.
    pub fn size(&self, rlocator: &RelationLocatorBackend, fork: ForkNumber) -> Option<BlockNumber> {
        self.sizes.borrow().get(&(*rlocator, fork)).cloned()
    }

    fn grow(&self, rlocator: &RelationLocatorBackend, fork: ForkNumber, nblocks: BlockNumber) {
        let mut sizes = self.sizes.borrow_mut();
        let size = sizes.entry((*rlocator, fork)).or_insert(0);
        *size = (*size).max(nblocks);
    }
}

/// In-memory storage manager that records every call.
pub struct RecordingSmgr {
    recorder: Rc<Recorder>,
    interrupts: Rc<Interrupts>,
}

impl RecordingSmgr {
    pub fn new(recorder: Rc<Recorder>, ctx: &ProcContext) -> Self {
        Self {
            recorder,
            interrupts: ctx.interrupts().clone(),
        }
    }

    fn called(&self, event: Event) {
        if self.interrupts.can_be_processed() {
            self.recorder.unheld_calls.set(self.recorder.unheld_calls.get() + 1);
        }
        self.recorder.record(event);
    }
}

impl Smgr for RecordingSmgr {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn init(&self) -> Result<()> {
        self.called(Event::Init);
        Ok(())
    }

    fn shutdown(&self) {
        self.called(Event::Shutdown);
    }

    fn open(&self, reln: &mut SMgrRelationData) {
        self.called(Event::Open(*reln.rlocator()));
    }

    fn close(&self, reln: &mut SMgrRelationData, fork: ForkNumber) {
        self.called(Event::Close(*reln.rlocator(), fork));
    }

    fn create(&self, reln: &mut SMgrRelationData, fork: ForkNumber, is_redo: bool) -> Result<()> {
        self.called(Event::Create(*reln.rlocator(), fork, is_redo));
        if !is_redo && self.recorder.size(reln.rlocator(), fork).is_some() {
            bail!("fork already exists");
        }
        self.recorder.grow(reln.rlocator(), fork, 0);
        Ok(())
    }

    fn exists(&self, reln: &mut SMgrRelationData, fork: ForkNumber) -> Result<bool> {
        self.called(Event::Exists(*reln.rlocator(), fork));
        Ok(self.recorder.size(reln.rlocator(), fork).is_some())
    }

    fn unlink(
        &self,
        rlocator: &RelationLocatorBackend,
        fork: ForkNumber,
        is_redo: bool,
    ) -> Result<()> {
        self.called(Event::Unlink(*rlocator, fork, is_redo));
        if self.recorder.fail_unlink.get() {
            bail!("injected unlink failure");
        }
        self.recorder.sizes.borrow_mut().remove(&(*rlocator, fork));
        Ok(())
    }

    fn extend(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        _buffer: &Page,
        _skip_fsync: bool,
    ) -> Result<()> {
        self.called(Event::Extend(*reln.rlocator(), fork, blocknum));
        self.recorder.grow(reln.rlocator(), fork, blocknum + 1);
        Ok(())
    }

    fn zero_extend(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: u32,
        _skip_fsync: bool,
    ) -> Result<()> {
        self.called(Event::ZeroExtend(*reln.rlocator(), fork, blocknum, nblocks));
        self.recorder.grow(reln.rlocator(), fork, blocknum + nblocks);
        Ok(())
    }

    fn prefetch(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: u32,
    ) -> Result<bool> {
        self.called(Event::Prefetch(*reln.rlocator(), fork, blocknum, nblocks));
        Ok(self.recorder.size(reln.rlocator(), fork).is_some())
    }

    fn max_combine(
        &self,
        _reln: &SMgrRelationData,
        _fork: ForkNumber,
        _blocknum: BlockNumber,
    ) -> u32 {
        16
    }

    fn readv(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffers: &mut [&mut Page],
    ) -> Result<()> {
        self.called(Event::Readv(*reln.rlocator(), fork, blocknum, buffers.len()));
        for (i, page) in buffers.iter_mut().enumerate() {
            **page = [(blocknum as usize + i) as u8; PAGE_SIZE];
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
        self.called(Event::StartReadv(*reln.rlocator(), fork, blocknum, buffers.len()));
        set_target_smgr(ioh, reln, fork, blocknum, buffers.len() as u32, false);
        ioh.prepare_readv(-1, blocknum as u64 * PAGE_SIZE as u64, buffers)
    }

    fn writev(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffers: &[&Page],
        _skip_fsync: bool,
    ) -> Result<()> {
        self.called(Event::Writev(*reln.rlocator(), fork, blocknum, buffers.len()));
        Ok(())
    }

    fn writeback(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        self.called(Event::Writeback(*reln.rlocator(), fork, blocknum, nblocks));
        Ok(())
    }

    fn nblocks(&self, reln: &mut SMgrRelationData, fork: ForkNumber) -> Result<BlockNumber> {
        self.called(Event::Nblocks(*reln.rlocator(), fork));
        self.recorder
            .size(reln.rlocator(), fork)
            .ok_or_else(|| anyhow!("fork does not exist"))
    }

    fn truncate(
        &self,
        reln: &mut SMgrRelationData,
        fork: ForkNumber,
        old_blocks: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        self.called(Event::Truncate(*reln.rlocator(), fork, old_blocks, nblocks));
        self.recorder
            .sizes
            .borrow_mut()
            .insert((*reln.rlocator(), fork), nblocks);
        Ok(())
    }

    fn immed_sync(&self, reln: &mut SMgrRelationData, fork: ForkNumber) -> Result<()> {
        self.called(Event::ImmedSync(*reln.rlocator(), fork));
        Ok(())
    }

    fn register_sync(&self, reln: &mut SMgrRelationData, fork: ForkNumber) -> Result<()> {
        self.called(Event::RegisterSync(*reln.rlocator(), fork));
        Ok(())
    }

    fn fd(
        &self,
        _reln: &mut SMgrRelationData,
        _fork: ForkNumber,
        blocknum: BlockNumber,
    ) -> Result<(RawFd, u64)> {
        Ok((-1, blocknum as u64 * PAGE_SIZE as u64))
    }
}

/// Buffer cache that records the requests of the storage manager.
pub struct RecordingBuffers(pub Rc<Recorder>);

impl RelationBuffers for RecordingBuffers {
    fn flush_relations_all_buffers(&self, rels: &[SMgrRelation]) -> Result<()> {
        self.0.record(Event::FlushBuffers(rlocators(rels)));
        Ok(())
    }

    fn drop_relations_all_buffers(&self, rels: &[SMgrRelation]) {
        self.0.record(Event::DropBuffers(rlocators(rels)));
    }

    fn drop_relation_buffers(
        &self,
        reln: &SMgrRelation,
        forks: &[ForkNumber],
        first_del_blocks: &[BlockNumber],
    ) {
        self.0.record(Event::DropRelationBuffers(
            *reln.borrow().rlocator(),
            forks.to_vec(),
            first_del_blocks.to_vec(),
        ));
    }
}

/// Invalidation channel that records every message.
pub struct RecordingInvalidation(pub Rc<Recorder>);

impl SmgrInvalidation for RecordingInvalidation {
    fn invalidate_smgr(&self, rlocator: RelationLocatorBackend) {
        self.0.record(Event::Invalidate(rlocator));
    }
}

fn rlocators(rels: &[SMgrRelation]) -> Vec<RelationLocatorBackend> {
    rels.iter().map(|reln| *reln.borrow().rlocator()).collect()
}

/// Create a storage manager over the recording backend and collaborators.
pub fn recording_smgr() -> (StorageManager, Rc<Recorder>) {
    init_logger();

    let recorder = Rc::new(Recorder::default());
    let ctx = ProcContext::new();
    let switch = SmgrSwitch::new(vec![Box::new(RecordingSmgr::new(recorder.clone(), &ctx))]);
    let smgr = StorageManager::with_switch(Config::default(), ctx, switch)
        .unwrap()
        .with_buffers(Rc::new(RecordingBuffers(recorder.clone())))
        .with_invalidation(Rc::new(RecordingInvalidation(recorder.clone())));

    (smgr, recorder)
}

/// Create a storage manager over the magnetic disk backend on `dir`.
pub fn md_smgr(dir: &TempDir, proc_number: ProcNumber) -> StorageManager {
    init_logger();

    StorageManager::new(Config {
        data_dir: dir.path().to_path_buf(),
        proc_number,
        ..Config::default()
    })
    .unwrap()
}
