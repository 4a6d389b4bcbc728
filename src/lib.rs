pub mod catalog;
pub mod process;
pub mod relation;
pub mod storage;

/// Objecct identifier.
pub type Oid = u64;

/// Oid that does not identify any object.
pub const INVALID_OID: Oid = 0;

/// Number of a process attached to the database cluster.
///
/// Used to tag storage that is private to one process (temporary relations).
pub type ProcNumber = u32;
