use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    catalog::pg_tablespace::{
        DEFAULTTABLESPACE_OID, GLOBALTABLESPACE_OID, TABLESPACE_VERSION_DIRECTORY,
    },
    Oid, ProcNumber, INVALID_OID,
};

use super::fork::ForkNumber;

/// RelationLocator provide all that we need to know to physically access a relation.
///
/// Note that the oid stored here is the relation file number, not the
/// catalog oid of the relation, they may diverge after a rewrite.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelationLocator {
    /// Tablespace oid where relation is stored.
    pub tablespace: Oid,

    /// Database oid that this relation belongs.
    pub database: Oid,

    /// Oid of relation.
    pub oid: Oid,
}

/// Augmenting a relation locator with the process that owns it.
///
/// Temporary relations are private to the process that created them and are
/// stored under a different file name, so the owner is part of the identity.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelationLocatorBackend {
    pub locator: RelationLocator,

    /// Owner process of a temporary relation, None for shared storage.
    pub backend: Option<ProcNumber>,
}

impl RelationLocator {
    /// Return the physical path of the given fork of a relation, relative to
    /// the data directory.
    pub fn relation_path(&self, fork: ForkNumber) -> PathBuf {
        relation_path(self, None, fork)
    }
}

impl RelationLocatorBackend {
    pub fn new(locator: RelationLocator, backend: Option<ProcNumber>) -> Self {
        Self { locator, backend }
    }

    /// Return true if the relation is session-private storage.
    pub fn is_temp(&self) -> bool {
        self.backend.is_some()
    }

    /// Return the physical path of the given fork of a relation, relative to
    /// the data directory.
    pub fn relation_path(&self, fork: ForkNumber) -> PathBuf {
        relation_path(&self.locator, self.backend, fork)
    }
}

/// Compute the path of a relation fork file.
///
/// Shared relations live on `global/`, relations of the default tablespace on
/// `base/<db>/` and the others on `pg_tblspc/<spc>/<version>/<db>/`. Temp
/// relations are prefixed with `t<procnumber>_`, non-main forks are suffixed
/// with `_<forkname>`.
pub fn relation_path(
    locator: &RelationLocator,
    backend: Option<ProcNumber>,
    fork: ForkNumber,
) -> PathBuf {
    assert_ne!(locator.tablespace, INVALID_OID);
    assert_ne!(locator.oid, INVALID_OID);

    let mut filename = match backend {
        Some(procno) => format!("t{}_{}", procno, locator.oid),
        None => locator.oid.to_string(),
    };
    if let Some(suffix) = fork.file_suffix() {
        filename.push('_');
        filename.push_str(suffix);
    }

    match locator.tablespace {
        GLOBALTABLESPACE_OID => {
            // Shared relations are never temporary and have no database.
            assert_eq!(locator.database, INVALID_OID);
            assert!(backend.is_none());
            Path::new("global").join(filename)
        }
        DEFAULTTABLESPACE_OID => {
            assert_ne!(locator.database, INVALID_OID);
            Path::new("base")
                .join(locator.database.to_string())
                .join(filename)
        }
        tablespace => {
            assert_ne!(locator.database, INVALID_OID);
            Path::new("pg_tblspc")
                .join(tablespace.to_string())
                .join(TABLESPACE_VERSION_DIRECTORY)
                .join(locator.database.to_string())
                .join(filename)
        }
    }
}
