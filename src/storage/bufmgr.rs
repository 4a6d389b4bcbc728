use anyhow::Result;

use crate::relation::ForkNumber;

use super::{BlockNumber, SMgrRelation};

/// Operations of the buffer cache that the storage manager needs before
/// destructive or durability sensitive bulk operations.
///
/// The storage manager never looks at buffer contents, it only asks the
/// buffer cache to get rid of them or to write them out.
pub trait RelationBuffers {
    /// Write out all dirty buffers of the given relations.
    fn flush_relations_all_buffers(&self, rels: &[SMgrRelation]) -> Result<()>;

    /// Drop all buffers of the given relations without writing them back.
    fn drop_relations_all_buffers(&self, rels: &[SMgrRelation]);

    /// Drop the buffers of the given forks of a relation starting at
    /// `first_del_blocks[i]` for `forks[i]`, without writing them back.
    fn drop_relation_buffers(
        &self,
        reln: &SMgrRelation,
        forks: &[ForkNumber],
        first_del_blocks: &[BlockNumber],
    );
}

/// Buffer cache that never holds any page, used when the storage manager
/// is driven without a buffer pool on top of it.
#[derive(Debug, Default)]
pub struct NoBuffers;

impl RelationBuffers for NoBuffers {
    fn flush_relations_all_buffers(&self, _rels: &[SMgrRelation]) -> Result<()> {
        Ok(())
    }

    fn drop_relations_all_buffers(&self, _rels: &[SMgrRelation]) {}

    fn drop_relation_buffers(
        &self,
        _reln: &SMgrRelation,
        _forks: &[ForkNumber],
        _first_del_blocks: &[BlockNumber],
    ) {
    }
}
