//! Asynchronous IO handles.
//!
//! An [AioHandle] describes one IO on a range of blocks: the process that
//! issued it, the target of the IO (what is being read or written, e.g. a
//! relation fork) and the operation itself (a file descriptor, an offset and
//! the buffers). The IO may be executed by a different process than the one
//! that issued it. In that case the handle is shipped to the executor with
//! [AioHandle::encode] and the target is asked to [reopen](AioTargetInfo::reopen)
//! the file descriptor in the context of the executor, since descriptors are
//! private to the process that opened them.
use std::{
    fs::File,
    io::ErrorKind,
    mem::ManuallyDrop,
    os::unix::{
        fs::FileExt,
        io::{FromRawFd, RawFd},
    },
};

use anyhow::{bail, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    relation::{ForkNumber, RelationLocator},
    ProcNumber,
};

use super::{
    smgr::{md::read_blocks, SMGR_AIO_TARGET},
    BlockNumber, Page, StorageManager, PAGE_SIZE,
};

/// Represents errors that an IO handle can have.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    /// The handle does not have a target.
    #[error("IO handle has no target")]
    NoTarget,

    /// The handle does not have an operation to perform.
    #[error("IO handle has no operation")]
    NoOperation,

    /// An operation was already prepared on the handle.
    #[error("IO handle already has an operation")]
    AlreadyPrepared,

    /// The operation of the handle was already performed.
    #[error("IO handle was already performed")]
    AlreadyPerformed,
}

/// Target data of an IO on a block range of a relation fork.
///
/// The owning process of temporary relations is implied by the owner of the
/// IO handle.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SmgrTargetData {
    pub rlocator: RelationLocator,
    pub fork: ForkNumber,
    pub block_num: BlockNumber,
    pub nblocks: u32,
    pub is_temp: bool,
    pub skip_fsync: bool,
}

/// What an IO operates on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum AioTarget {
    Invalid,
    Smgr(SmgrTargetData),
}

impl AioTarget {
    /// Return the callbacks of the target kind.
    pub fn info(&self) -> Option<&'static dyn AioTargetInfo> {
        match self {
            AioTarget::Invalid => None,
            AioTarget::Smgr(_) => Some(&SMGR_AIO_TARGET),
        }
    }
}

/// The operation of an IO. The offset is the byte offset of the first block.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum AioOp {
    Invalid,
    Readv { fd: RawFd, offset: u64, nblocks: u32 },
    Writev { fd: RawFd, offset: u64, nblocks: u32 },
}

impl AioOp {
    /// Byte offset of the operation, None if there is no operation.
    pub fn offset(&self) -> Option<u64> {
        match self {
            AioOp::Invalid => None,
            AioOp::Readv { offset, .. } | AioOp::Writev { offset, .. } => Some(*offset),
        }
    }
}

/// Outcome of a performed IO.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum AioResult {
    /// All blocks were transferred.
    Ok { blocks: u32 },

    /// Only the first `blocks` blocks were transferred.
    Partial { blocks: u32 },

    /// The IO failed.
    Error { message: String },
}

/// Callbacks of an IO target kind.
pub trait AioTargetInfo {
    /// Name of the target kind.
    fn name(&self) -> &'static str;

    /// Reopen the file descriptor of the IO in the context of `smgr`.
    ///
    /// The caller must hold interrupts until the IO is performed, otherwise
    /// the descriptor could be closed before it is used.
    fn reopen(&self, smgr: &StorageManager, ioh: &mut AioHandle) -> Result<()>;

    /// Describe the target of the IO, used on diagnostics.
    fn describe_identity(&self, smgr: &StorageManager, target: &AioTarget) -> String;
}

/// A single asynchronous IO.
#[derive(Serialize, Deserialize, Debug)]
pub struct AioHandle {
    /// Process that issued the IO.
    owner: ProcNumber,

    target: AioTarget,

    op: AioOp,

    /// Buffers of the IO, owned by the handle until it completes.
    #[serde(with = "pages")]
    buffers: Vec<Box<Page>>,

    result: Option<AioResult>,
}

impl AioHandle {
    pub fn new(owner: ProcNumber) -> Self {
        Self {
            owner,
            target: AioTarget::Invalid,
            op: AioOp::Invalid,
            buffers: Vec::new(),
            result: None,
        }
    }

    pub fn owner(&self) -> ProcNumber {
        self.owner
    }

    pub fn target(&self) -> &AioTarget {
        &self.target
    }

    pub fn set_target(&mut self, target: AioTarget) {
        self.target = target;
    }

    pub fn op(&self) -> &AioOp {
        &self.op
    }

    pub fn result(&self) -> Option<&AioResult> {
        self.result.as_ref()
    }

    /// Prepare a read of consecutive blocks into `buffers`.
    pub fn prepare_readv(
        &mut self,
        fd: RawFd,
        offset: u64,
        buffers: Vec<Box<Page>>,
    ) -> Result<()> {
        self.prepare(
            AioOp::Readv {
                fd,
                offset,
                nblocks: buffers.len() as u32,
            },
            buffers,
        )
    }

    /// Prepare a write of `buffers` on consecutive blocks.
    pub fn prepare_writev(
        &mut self,
        fd: RawFd,
        offset: u64,
        buffers: Vec<Box<Page>>,
    ) -> Result<()> {
        self.prepare(
            AioOp::Writev {
                fd,
                offset,
                nblocks: buffers.len() as u32,
            },
            buffers,
        )
    }

    /// Replace the file descriptor of the operation, after reopening it in
    /// another process.
    pub fn set_op_fd(&mut self, new_fd: RawFd) {
        match &mut self.op {
            AioOp::Invalid => panic!("setting file descriptor of IO handle without operation"),
            AioOp::Readv { fd, .. } | AioOp::Writev { fd, .. } => *fd = new_fd,
        }
    }

    /// Take the buffers back from the handle.
    pub fn take_buffers(&mut self) -> Vec<Box<Page>> {
        std::mem::take(&mut self.buffers)
    }

    /// Describe the target of the IO.
    pub fn describe(&self, smgr: &StorageManager) -> String {
        match self.target.info() {
            Some(info) => info.describe_identity(smgr, &self.target),
            None => String::from("invalid target"),
        }
    }

    /// Reopen the file descriptor of the IO in the context of `smgr`.
    pub fn reopen(&mut self, smgr: &StorageManager) -> Result<()> {
        match self.target.info() {
            Some(info) => info.reopen(smgr, self),
            None => bail!(Error::NoTarget),
        }
    }

    /// Perform the IO on behalf of its owner, in the context of `smgr`.
    pub fn perform_in(&mut self, smgr: &StorageManager) -> Result<()> {
        let _held = smgr.interrupts().hold();
        self.reopen(smgr)?;
        self.perform_synchronously()
    }

    /// Execute the operation using the file descriptor on the handle.
    ///
    /// The descriptor must have been reopened in the executing process, with
    /// interrupts held since then. Failures of the IO itself are reported on
    /// [AioHandle::result].
    fn perform_synchronously(&mut self) -> Result<()> {
        if self.result.is_some() {
            bail!(Error::AlreadyPerformed);
        }

        let (fd, offset, nblocks) = match self.op {
            AioOp::Invalid => bail!(Error::NoOperation),
            AioOp::Readv {
                fd,
                offset,
                nblocks,
            }
            | AioOp::Writev {
                fd,
                offset,
                nblocks,
            } => (fd, offset, nblocks),
        };

        // The descriptor is owned by a relation handle, it must not be closed here.
        // SAFETY: the target reopened the descriptor and interrupts are held
        // by the caller, so it stays open until the IO finishes.
        let file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });

        let transferred = match self.op {
            AioOp::Readv { .. } => {
                read_blocks(&file, offset, self.buffers.iter_mut().map(|b| &mut **b))
                    .map(|bytes| (bytes / PAGE_SIZE) as u32)
            }
            _ => write_blocks(&file, offset, &self.buffers),
        };

        let result = match transferred {
            Ok(blocks) if blocks == nblocks => AioResult::Ok { blocks },
            Ok(blocks) => AioResult::Partial { blocks },
            Err(err) => AioResult::Error {
                message: err.to_string(),
            },
        };
        debug!("Performed IO {:?}: {:?}", self.op, result);
        self.result = Some(result);
        Ok(())
    }

    /// Export the handle, so it can be performed by another process.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Import a handle exported with [AioHandle::encode].
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    fn prepare(&mut self, op: AioOp, buffers: Vec<Box<Page>>) -> Result<()> {
        if self.op != AioOp::Invalid {
            bail!(Error::AlreadyPrepared);
        }
        self.op = op;
        self.buffers = buffers;
        Ok(())
    }
}

/// Write all buffers on consecutive blocks, returning the number of blocks
/// written.
fn write_blocks(file: &File, offset: u64, buffers: &[Box<Page>]) -> std::io::Result<u32> {
    for (i, page) in buffers.iter().enumerate() {
        let at = offset + (i * PAGE_SIZE) as u64;
        if let Err(err) = file.write_all_at(&page[..], at) {
            if err.kind() == ErrorKind::WriteZero && i > 0 {
                return Ok(i as u32);
            }
            return Err(err);
        }
    }
    Ok(buffers.len() as u32)
}

/// Serde representation of IO buffers, serde does not support large arrays.
mod pages {
    use std::convert::TryInto;

    use serde::{de::Error, ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    use crate::storage::Page;

    pub fn serialize<S>(pages: &[Box<Page>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(pages.len()))?;
        for page in pages {
            seq.serialize_element(&page[..])?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Box<Page>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Vec<Vec<u8>> = Vec::deserialize(deserializer)?;
        raw.into_iter()
            .map(|data| {
                data.into_boxed_slice()
                    .try_into()
                    .map_err(|data: Box<[u8]>| D::Error::invalid_length(data.len(), &"a page"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use tempfile::NamedTempFile;

    #[test]
    fn test_perform_readv() -> Result<()> {
        let file = NamedTempFile::new()?;
        file.as_file().write_all_at(&[5; PAGE_SIZE], 0)?;
        file.as_file().write_all_at(&[6; PAGE_SIZE], PAGE_SIZE as u64)?;

        let mut ioh = AioHandle::new(1);
        ioh.prepare_readv(
            file.as_file().as_raw_fd(),
            0,
            vec![Box::new([0; PAGE_SIZE]), Box::new([0; PAGE_SIZE])],
        )?;
        ioh.perform_synchronously()?;

        assert_eq!(ioh.result(), Some(&AioResult::Ok { blocks: 2 }));
        let buffers = ioh.take_buffers();
        assert_eq!(buffers[0][..], [5; PAGE_SIZE][..]);
        assert_eq!(buffers[1][..], [6; PAGE_SIZE][..]);

        Ok(())
    }

    #[test]
    fn test_perform_partial_readv() -> Result<()> {
        let file = NamedTempFile::new()?;
        file.as_file().write_all_at(&[5; PAGE_SIZE], 0)?;

        let mut ioh = AioHandle::new(1);
        ioh.prepare_readv(
            file.as_file().as_raw_fd(),
            0,
            vec![Box::new([0; PAGE_SIZE]), Box::new([0; PAGE_SIZE])],
        )?;
        ioh.perform_synchronously()?;

        assert_eq!(ioh.result(), Some(&AioResult::Partial { blocks: 1 }));
        Ok(())
    }

    #[test]
    fn test_perform_writev() -> Result<()> {
        let file = NamedTempFile::new()?;

        let mut ioh = AioHandle::new(1);
        ioh.prepare_writev(
            file.as_file().as_raw_fd(),
            PAGE_SIZE as u64,
            vec![Box::new([3; PAGE_SIZE])],
        )?;
        ioh.perform_synchronously()?;

        assert_eq!(ioh.result(), Some(&AioResult::Ok { blocks: 1 }));
        assert_eq!(file.as_file().metadata()?.len(), 2 * PAGE_SIZE as u64);

        let mut page = [0; PAGE_SIZE];
        file.as_file().read_exact_at(&mut page, PAGE_SIZE as u64)?;
        assert_eq!(page[..], [3; PAGE_SIZE][..]);
        Ok(())
    }

    #[test]
    fn test_handle_misuse() -> Result<()> {
        let mut ioh = AioHandle::new(1);
        let err = ioh.perform_synchronously().unwrap_err();
        assert_eq!(Error::NoOperation, err.downcast::<Error>().unwrap());

        ioh.prepare_readv(-1, 0, Vec::new())?;
        let err = ioh.prepare_readv(-1, 0, Vec::new()).unwrap_err();
        assert_eq!(Error::AlreadyPrepared, err.downcast::<Error>().unwrap());

        Ok(())
    }

    #[test]
    fn test_encode_decode() -> Result<()> {
        let mut ioh = AioHandle::new(4);
        ioh.set_target(AioTarget::Smgr(SmgrTargetData {
            rlocator: RelationLocator {
                tablespace: 1663,
                database: 1,
                oid: 16384,
            },
            fork: ForkNumber::VisibilityMap,
            block_num: 10,
            nblocks: 1,
            is_temp: false,
            skip_fsync: true,
        }));
        ioh.prepare_writev(9, 10 * PAGE_SIZE as u64, vec![Box::new([8; PAGE_SIZE])])?;

        let mut decoded = AioHandle::decode(&ioh.encode()?)?;

        assert_eq!(decoded.owner(), 4);
        assert_eq!(decoded.target(), ioh.target());
        assert_eq!(decoded.op(), ioh.op());
        assert_eq!(decoded.take_buffers()[0][..], [8; PAGE_SIZE][..]);
        Ok(())
    }
}
