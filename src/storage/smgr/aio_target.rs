//! Storage manager target of asynchronous IOs.
use std::path::Path;

use anyhow::{bail, Result};
use log::debug;

use crate::{
    relation::{locator::relation_path, ForkNumber},
    storage::{
        aio::{self, AioHandle, AioOp, AioTarget, AioTargetInfo, SmgrTargetData},
        BlockNumber,
    },
};

use super::{SMgrRelationData, StorageManager};

/// IO target callbacks of relation forks.
#[derive(Debug)]
pub struct SmgrAioTarget;

pub static SMGR_AIO_TARGET: SmgrAioTarget = SmgrAioTarget;

/// Set the target of an IO handle to a block range of a relation fork.
pub fn set_target_smgr(
    ioh: &mut AioHandle,
    reln: &SMgrRelationData,
    fork: ForkNumber,
    blocknum: BlockNumber,
    nblocks: u32,
    skip_fsync: bool,
) {
    let is_temp = reln.is_temp();
    ioh.set_target(AioTarget::Smgr(SmgrTargetData {
        rlocator: reln.rlocator().locator,
        fork,
        block_num: blocknum,
        nblocks,
        is_temp,
        // Temp relations are never fsync'd.
        skip_fsync: skip_fsync && !is_temp,
    }));
}

/// Describe a block range of a file.
pub fn describe_block_range(path: &Path, blocknum: BlockNumber, nblocks: u32) -> String {
    match nblocks {
        0 => format!("file \"{}\"", path.display()),
        1 => format!("block {} in file \"{}\"", blocknum, path.display()),
        _ => format!(
            "blocks {}..{} in file \"{}\"",
            blocknum,
            blocknum as u64 + nblocks as u64 - 1,
            path.display()
        ),
    }
}

impl AioTargetInfo for SmgrAioTarget {
    fn name(&self) -> &'static str {
        "smgr"
    }

    fn reopen(&self, smgr: &StorageManager, ioh: &mut AioHandle) -> Result<()> {
        // Otherwise the file could be closed again before the IO is executed.
        debug_assert!(
            !smgr.interrupts().can_be_processed(),
            "reopening IO target without holding interrupts"
        );

        let target = match ioh.target() {
            AioTarget::Smgr(target) => *target,
            _ => bail!(aio::Error::NoTarget),
        };

        // Temp relations must be looked up as the process that issued the IO.
        let backend = if target.is_temp {
            Some(ioh.owner())
        } else {
            None
        };

        let reln = smgr.open(target.rlocator, backend);
        let (fd, offset) = smgr.fd(&reln, target.fork, target.block_num)?;
        if *ioh.op() == AioOp::Invalid {
            bail!(aio::Error::NoOperation);
        }
        debug_assert_eq!(ioh.op().offset(), Some(offset));

        debug!("Reopened {}", self.describe_identity(smgr, ioh.target()));
        ioh.set_op_fd(fd);
        Ok(())
    }

    fn describe_identity(&self, smgr: &StorageManager, target: &AioTarget) -> String {
        let target = match target {
            AioTarget::Smgr(target) => target,
            _ => return String::from("invalid target"),
        };

        let backend = if target.is_temp {
            Some(smgr.config().proc_number)
        } else {
            None
        };
        let path = relation_path(&target.rlocator, backend, target.fork);
        describe_block_range(&path, target.block_num, target.nblocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::pg_tablespace::DEFAULTTABLESPACE_OID,
        relation::RelationLocator,
        storage::{aio::AioResult, smgr::Config, PAGE_SIZE},
    };

    #[test]
    fn test_describe_block_range() {
        let path = Path::new("db/1/16384");
        assert_eq!(describe_block_range(path, 0, 0), "file \"db/1/16384\"");
        assert_eq!(
            describe_block_range(path, 5, 1),
            "block 5 in file \"db/1/16384\""
        );
        assert_eq!(
            describe_block_range(path, 5, 5),
            "blocks 5..9 in file \"db/1/16384\""
        );
    }

    #[test]
    fn test_start_readv_sets_target() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let smgr = StorageManager::new(Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        })?;
        let reln = smgr.open(test_locator(), None);
        smgr.create(&reln, ForkNumber::Main, false)?;
        smgr.zero_extend(&reln, ForkNumber::Main, 0, 4, false)?;

        let mut ioh = AioHandle::new(smgr.config().proc_number);
        let buffers = vec![Box::new([1; PAGE_SIZE]), Box::new([1; PAGE_SIZE])];
        smgr.start_readv(&mut ioh, &reln, ForkNumber::Main, 2, buffers)?;

        assert_eq!(
            ioh.target(),
            &AioTarget::Smgr(SmgrTargetData {
                rlocator: test_locator(),
                fork: ForkNumber::Main,
                block_num: 2,
                nblocks: 2,
                is_temp: false,
                skip_fsync: false,
            })
        );
        assert_eq!(ioh.op().offset(), Some(2 * PAGE_SIZE as u64));
        assert_eq!(ioh.describe(&smgr), "blocks 2..3 in file \"base/1/16384\"");

        ioh.perform_in(&smgr)?;
        assert_eq!(ioh.result(), Some(&AioResult::Ok { blocks: 2 }));
        assert!(ioh.take_buffers().iter().all(|page| page[..] == [0; PAGE_SIZE][..]));
        Ok(())
    }

    #[test]
    fn test_temp_target_never_skips_fsync() {
        let mut ioh = AioHandle::new(3);
        let temp = SMgrRelationData::new(
            crate::relation::RelationLocatorBackend::new(test_locator(), Some(3)),
            0,
        );
        set_target_smgr(&mut ioh, &temp, ForkNumber::Main, 0, 1, true);

        match ioh.target() {
            AioTarget::Smgr(target) => {
                assert!(target.is_temp);
                assert!(!target.skip_fsync);
            }
            other => panic!("unexpected target {:?}", other),
        }
    }

    fn test_locator() -> RelationLocator {
        RelationLocator {
            tablespace: DEFAULTTABLESPACE_OID,
            database: 1,
            oid: 16384,
        }
    }
}
