use crate::Oid;

/// Default tablespace oid to store per database relation files.
pub const DEFAULTTABLESPACE_OID: Oid = 1663;

/// Global tablespace oid to store global database relation files, such as pg_database and
/// pg_tablespace.
pub const GLOBALTABLESPACE_OID: Oid = 1664;

/// Directory created inside of a user tablespace, so that different versions
/// of the storage layout can share the same tablespace location.
pub const TABLESPACE_VERSION_DIRECTORY: &str = "TINYDB_1";
