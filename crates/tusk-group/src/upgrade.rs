//! File-format upgrade pipeline.
//!
//! Upgrades run only inside a read-write session of the higher
//! concurrency layer; the bare open path rejects any file whose version
//! it cannot read as-is.

use tracing::info;
use tusk_alloc::CURRENT_FILE_FORMAT;
use tusk_error::Result;

use crate::group::Group;
use crate::top::HistoryType;

/// Choose the file format a new session will run at.
///
/// `current_file_format_version` may be zero, meaning the format is not
/// yet decided (only possible for empty files whose top-ref is zero). A
/// version different from the current one triggers the upgrade process.
#[must_use]
pub fn get_target_file_format_version_for_session(
    current_file_format_version: u8,
    requested_history_type: HistoryType,
) -> u8 {
    if requested_history_type == HistoryType::None
        && matches!(current_file_format_version, 6 | 7 | 8)
    {
        return current_file_format_version;
    }
    CURRENT_FILE_FORMAT
}

impl Group {
    /// Migrate the attached image from its current format to
    /// `target_file_format_version`.
    pub fn upgrade_file_format(&mut self, target_file_format_version: u8) -> Result<()> {
        debug_assert!(self.is_attached());
        // Revisit this when a new file format version is introduced.
        debug_assert_eq!(target_file_format_version, CURRENT_FILE_FORMAT);

        let current = self.get_file_format_version();
        debug_assert!(current < target_file_format_version);
        // The session layer's open path guarantees this range.
        debug_assert!((2..=8).contains(&current));

        // Prior to version 5: legacy datetime columns become timestamps.
        if current < 5 {
            let num_tables = self.size();
            for table_ndx in 0..num_tables {
                self.with_table(table_ndx, |table, alloc| table.upgrade_olddatetime(alloc))?;
            }
        }

        // Prior to version 6: the string index format changed.
        if current < 6 {
            let num_tables = self.size();
            for table_ndx in 0..num_tables {
                self.with_table(table_ndx, |table, alloc| {
                    table.rebuild_search_index(alloc, current)
                })?;
            }
        }

        // Prior to version 7: the history schema version joined the top
        // array. A size-9 top gains the missing tenth slot.
        if current <= 6 && target_file_format_version >= 7 {
            let top_size = self.top.size(&self.alloc)?;
            debug_assert!(top_size <= 9);
            if top_size == 9 {
                let initial_history_schema_version = 0;
                self.top.add(&mut self.alloc, initial_history_schema_version)?;
            }
        }

        // Upgrading to version 9 requires no further changes.

        info!(
            from = current,
            to = target_file_format_version,
            "upgraded file format"
        );
        self.set_file_format_version(target_file_format_version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tusk_table::ColumnType;

    #[test]
    fn target_version_for_session() {
        assert_eq!(
            get_target_file_format_version_for_session(0, HistoryType::None),
            9
        );
        for stay in [6, 7, 8] {
            assert_eq!(
                get_target_file_format_version_for_session(stay, HistoryType::None),
                stay
            );
        }
        assert_eq!(
            get_target_file_format_version_for_session(5, HistoryType::None),
            9
        );
        // Any sync history forces the current format.
        assert_eq!(
            get_target_file_format_version_for_session(6, HistoryType::SyncClient),
            9
        );
    }

    #[test]
    fn upgrade_from_v4_converts_datetime_columns() {
        let mut group = Group::new().unwrap();
        {
            let mut t = group.add_table("events", true).unwrap();
            t.add_column(ColumnType::OldDateTime, "at").unwrap();
            t.add_column(ColumnType::Int, "kind").unwrap();
            t.add_empty_row().unwrap();
        }
        group
            .with_table(0, |table, alloc| table.set_olddatetime(alloc, 0, 0, 777))
            .unwrap();
        group.set_file_format_version(4);

        group.upgrade_file_format(9).unwrap();
        assert_eq!(group.get_file_format_version(), 9);
        let mut t = group.get_table(0).unwrap();
        assert_eq!(t.column_type(0).unwrap(), ColumnType::Timestamp);
        assert_eq!(t.get_timestamp(0, 0).unwrap(), 777);
        assert_eq!(t.column_type(1).unwrap(), ColumnType::Int);
    }

    #[test]
    fn upgrade_from_v8_is_structure_preserving() {
        let mut group = Group::new().unwrap();
        {
            let mut t = group.add_table("t", true).unwrap();
            t.add_column(ColumnType::Int, "x").unwrap();
            t.add_empty_row().unwrap();
            t.set_int(0, 0, 1).unwrap();
        }
        group.set_file_format_version(8);
        group.upgrade_file_format(9).unwrap();
        assert_eq!(group.get_file_format_version(), 9);
        assert_eq!(group.get_table(0).unwrap().get_int(0, 0).unwrap(), 1);
    }

    #[test]
    fn upgrade_appends_history_schema_version_to_size_9_top() {
        let mut group = Group::new().unwrap();
        // Grow the top to the legacy size-9 shape.
        group.set_file_format_version(7);
        group
            .prepare_history_parent(crate::top::HistoryType::Local, 0)
            .unwrap();
        // prepare_history_parent produces a size-10 top; emulate the
        // legacy size-9 intermediate by truncating the last slot.
        group.top.truncate(&mut group.alloc, 9).unwrap();
        assert_eq!(group.top.size(&group.alloc).unwrap(), 9);

        group.set_file_format_version(6);
        group.upgrade_file_format(9).unwrap();
        assert_eq!(group.top.size(&group.alloc).unwrap(), 10);
        assert_eq!(group.top.get(&group.alloc, 9).unwrap(), 0);
    }
}
