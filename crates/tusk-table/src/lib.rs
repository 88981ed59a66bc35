//! Table, spec and column accessors for TuskDB.
//!
//! The persistent layout of one table is:
//! ```text
//! table top = [spec_ref, columns_ref, tagged(row_count)]
//! spec      = [types_ref, names_ref, attrs_ref, opposites_ref, pairs_ref]
//! columns   = one root ref per column, parallel to the spec arrays
//! ```
//!
//! Link and backlink columns are reciprocal: a link column in the origin
//! table is paired with a backlink column in the target table, each side
//! recording the opposite table's index and the paired column's index in
//! its spec. Backlink columns always sit after the user-visible columns.

pub mod spec;
pub mod table;

pub use spec::{ColumnAttr, ColumnType, Spec};
pub use table::Table;

/// Maximum length of a table name in bytes.
pub const MAX_TABLE_NAME_LENGTH: usize = 63;
