//! Public API facade for TuskDB.
//!
//! Re-exports the stable surface: the [`Group`] snapshot root, table
//! handles, column types, errors, and the transaction-log endpoints used
//! by session-layer integrations.

pub use tusk_alloc;
pub use tusk_error::{LogicErrorKind, Result, TuskError};
pub use tusk_group::{
    get_target_file_format_version_for_session, Group, HistoryType, OpenMode, TableRef,
};
pub use tusk_table::{ColumnAttr, ColumnType, MAX_TABLE_NAME_LENGTH};
pub use tusk_translog::{InstructionHandler, TransactLogEncoder, TransactLogParser};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facade_smoke_in_memory() {
        let mut group = Group::new().expect("fresh group");
        {
            let mut t = group.add_table("notes", true).expect("add table");
            t.add_column(ColumnType::String, "text").expect("add column");
            t.add_empty_row().expect("add row");
            t.set_string(0, 0, "hello tusk").expect("set cell");
        }
        let mut t = group
            .get_table_by_name("notes")
            .expect("lookup")
            .expect("present");
        assert_eq!(t.get_string(0, 0).unwrap(), "hello tusk");
        group.verify().expect("consistent");
    }

    #[test]
    fn facade_smoke_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smoke.tusk");
        {
            let mut group = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
            let mut t = group.add_table("kv", true).unwrap();
            t.add_column(ColumnType::String, "k").unwrap();
            t.add_column(ColumnType::Int, "v").unwrap();
            t.add_empty_row().unwrap();
            t.set_string(0, 0, "answer").unwrap();
            t.set_int(1, 0, 42).unwrap();
            group.commit().unwrap();
        }
        let mut group = Group::open(&path, None, OpenMode::ReadOnly).unwrap();
        let mut t = group.get_table_by_name("kv").unwrap().unwrap();
        assert_eq!(t.get_string(0, 0).unwrap(), "answer");
        assert_eq!(t.get_int(1, 0).unwrap(), 42);
    }
}
