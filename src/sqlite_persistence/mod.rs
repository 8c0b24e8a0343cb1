mod versioned_schema;

pub use versioned_schema::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
};

/// Offset added to every schema version stored in `PRAGMA user_version`.
///
/// A database whose user_version is below this value was not created by us.
pub const BASE_DB_VERSION: usize = 99999;
