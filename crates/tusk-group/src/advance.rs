//! Accessor refresh across snapshots: the transact advancer.
//!
//! `advance_transact` brings a group holding read snapshot *A* up to
//! snapshot *B* produced by another writer. The underlying node
//! structure is already *B* when it runs; the transaction log is replayed
//! only to bring the accessors back into structural correspondence:
//! immediate positional fixups (null column slots so indices line up)
//! plus dirty marks. A final refresh pass then rebuilds every marked
//! accessor from the new node structure.

use tracing::debug;
use tusk_error::Result;
use tusk_translog::{InstructionHandler, TransactLogParser};

use crate::group::Group;

impl Group {
    /// Replay a transaction log against the accessor hierarchy: adjust
    /// accessor structure immediately where positional indices would
    /// otherwise drift, and mark every touched accessor (and its
    /// link/backlink neighbours) dirty. Returns whether the log carried
    /// a schema change.
    ///
    /// The marks are left in place; callers follow up with
    /// [`Self::refresh_dirty_accessors`].
    pub(crate) fn apply_transact_log(&mut self, log: &[u8]) -> Result<bool> {
        let mut advancer = TransactAdvancer {
            group: self,
            selected_table: None,
            desc_selected: false,
            schema_changed: false,
        };
        TransactLogParser::new().parse(log, &mut advancer)?;
        Ok(advancer.schema_changed)
    }

    /// Bring this group from its current snapshot to the one rooted at
    /// `new_top_ref`, replaying `log` to refresh the live accessors.
    ///
    /// On success the accessors are fully consistent with the new
    /// snapshot. On failure only minimal consistency remains: the caller
    /// must destroy the group or call [`Self::detach`]; any other access
    /// is undefined.
    pub fn advance_transact(
        &mut self,
        new_top_ref: u64,
        new_file_size: u64,
        log: &[u8],
    ) -> Result<()> {
        debug_assert!(self.is_attached());

        // A freshly created empty tree lives in the slab; drop it before
        // the reader view grows over its refs. The attach below rebinds
        // everything from the file.
        if self.top.is_attached() && self.top.get_ref() >= self.alloc.get_baseline() {
            self.top.detach();
            self.tables.detach();
            self.table_names.detach();
            self.alloc.reset_free_space_tracking();
        }

        self.alloc.update_reader_view(new_file_size)?;

        let schema_changed = self.apply_transact_log(log)?;

        self.top.detach(); // soft detach
        let create_group_when_missing = false; // see attach_shared()
        self.attach(new_top_ref, create_group_when_missing)?;
        self.refresh_dirty_accessors()?;

        debug!(new_top_ref, new_file_size, schema_changed, "advanced group");
        if schema_changed {
            if let Some(listener) = self.schema_change_listener.as_mut() {
                listener();
            }
        }
        Ok(())
    }

    /// Re-publish every accessor's index in the group and rebuild the
    /// marked ones from the current node structure.
    pub(crate) fn refresh_dirty_accessors(&mut self) -> Result<()> {
        self.alloc.bump_global_version();

        for ndx in 0..self.table_accessors.len() {
            if let Some(mut table) = self.table_accessors[ndx].take() {
                table.set_ndx_in_parent(ndx);
                let outcome = if table.is_marked() {
                    let refreshed = self
                        .tables
                        .get_as_ref(&self.alloc, ndx)
                        .and_then(|table_ref| table.refresh_accessor_tree(&self.alloc, table_ref));
                    if refreshed.is_ok() {
                        table.bump_version();
                    }
                    refreshed
                } else {
                    Ok(())
                };
                self.table_accessors[ndx] = Some(table);
                outcome?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessor-marking helpers used by the advancer
    // -----------------------------------------------------------------------

    fn acc_mark(&mut self, table_ndx: usize) {
        if let Some(Some(table)) = self.table_accessors.get_mut(table_ndx) {
            table.mark();
        }
    }

    /// Mark the accessors of every table on the opposite end of this
    /// table's link and backlink columns.
    fn acc_mark_opposite_link_tables(&mut self, table_ndx: usize) -> Result<()> {
        let opposites: Vec<usize> =
            match self.table_accessors.get(table_ndx).and_then(Option::as_ref) {
                Some(table) => table
                    .link_columns(&self.alloc)?
                    .into_iter()
                    .map(|(_, _, opposite)| opposite)
                    .collect(),
                None => return Ok(()),
            };
        for opposite in opposites {
            self.acc_mark(opposite);
        }
        Ok(())
    }

    /// Mark the target-table accessors of link-carrying columns at
    /// positions `col_begin..` of this table's (pre-refresh) spec.
    fn acc_mark_link_targets_from(&mut self, table_ndx: usize, col_begin: usize) -> Result<()> {
        let opposites: Vec<usize> =
            match self.table_accessors.get(table_ndx).and_then(Option::as_ref) {
                Some(table) => table
                    .link_columns(&self.alloc)?
                    .into_iter()
                    .filter(|&(col, _, _)| col >= col_begin)
                    .map(|(_, _, opposite)| opposite)
                    .collect(),
                None => return Ok(()),
            };
        for opposite in opposites {
            self.acc_mark(opposite);
        }
        Ok(())
    }

    /// Mark the link-target accessor of one column, when both exist. The
    /// target accessor exists iff the origin accessor exists, except for
    /// columns inserted earlier in the same replay, whose targets were
    /// already marked by the column-insert instruction.
    fn acc_mark_link_target_of_col(&mut self, table_ndx: usize, col_ndx: usize) -> Result<()> {
        let opposite = match self.table_accessors.get(table_ndx).and_then(Option::as_ref) {
            Some(table) => {
                let spec = table.spec();
                if col_ndx < spec.column_count(&self.alloc)?
                    && spec.column_type(&self.alloc, col_ndx)?.has_opposite_table()
                {
                    Some(spec.opposite_table_ndx(&self.alloc, col_ndx)?)
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(opposite) = opposite {
            self.acc_mark(opposite);
        }
        Ok(())
    }

    fn acc_adj_insert_column(&mut self, table_ndx: usize, col_ndx: usize) {
        if let Some(Some(table)) = self.table_accessors.get_mut(table_ndx) {
            table.adj_insert_column(col_ndx);
        }
    }

    fn acc_adj_erase_column(&mut self, table_ndx: usize, col_ndx: usize) {
        if let Some(Some(table)) = self.table_accessors.get_mut(table_ndx) {
            table.adj_erase_column(col_ndx);
        }
    }
}

/// Visitor that replays one transaction log against a group's accessor
/// hierarchy.
///
/// It can assume no more than minimal accessor consistency, but
/// instruction arguments are meaningful with respect to the current
/// state of the hierarchy (a column index refers to the accessor's
/// positional column slots). Cell-value instructions are deliberately
/// not overridden: values live below the accessor tree and are
/// rediscovered during the final refresh, so the trait's no-op defaults
/// apply.
struct TransactAdvancer<'g> {
    group: &'g mut Group,
    selected_table: Option<usize>,
    desc_selected: bool,
    schema_changed: bool,
}

impl InstructionHandler for TransactAdvancer<'_> {
    fn insert_group_level_table(
        &mut self,
        table_ndx: usize,
        num_tables: usize,
        _name: &str,
    ) -> Result<()> {
        debug_assert!(table_ndx <= num_tables);
        debug_assert!(
            self.group.table_accessors.is_empty()
                || self.group.table_accessors.len() == num_tables
        );

        if !self.group.table_accessors.is_empty() {
            let at = table_ndx.min(self.group.table_accessors.len());
            self.group.table_accessors.insert(at, None);
            for moved in at + 1..self.group.table_accessors.len() {
                self.group.acc_mark(moved);
                self.group.acc_mark_opposite_link_tables(moved)?;
            }
        }

        self.selected_table = None;
        self.schema_changed = true;
        Ok(())
    }

    fn erase_group_level_table(&mut self, table_ndx: usize, num_tables: usize) -> Result<()> {
        debug_assert!(table_ndx < num_tables);
        debug_assert!(
            self.group.table_accessors.is_empty()
                || self.group.table_accessors.len() == num_tables
        );

        if !self.group.table_accessors.is_empty() && table_ndx < self.group.table_accessors.len() {
            // Link target tables need no marking here: every column was
            // already removed by the preceding instructions.
            if let Some(mut table) = self.group.table_accessors.remove(table_ndx) {
                table.detach();
            }
            for moved in table_ndx..self.group.table_accessors.len() {
                self.group.acc_mark(moved);
                self.group.acc_mark_opposite_link_tables(moved)?;
            }
        }

        self.selected_table = None;
        self.schema_changed = true;
        Ok(())
    }

    fn rename_group_level_table(&mut self, _table_ndx: usize, _name: &str) -> Result<()> {
        // Table names are a property of the group, and the group is
        // always refreshed.
        self.schema_changed = true;
        Ok(())
    }

    fn select_table(&mut self, group_level_ndx: usize, path: &[(usize, usize)]) -> Result<()> {
        self.selected_table = None;
        self.desc_selected = false;
        // The accessor list is either empty or reflects the table count
        // prior to this instruction.
        debug_assert!(
            self.group.table_accessors.is_empty()
                || group_level_ndx < self.group.table_accessors.len()
        );
        if self
            .group
            .table_accessors
            .get(group_level_ndx)
            .is_some_and(Option::is_some)
        {
            self.group.acc_mark(group_level_ndx);
            // Subtable hops carry no accessors in this engine; a
            // non-empty path leaves no table selected.
            if path.is_empty() {
                self.selected_table = Some(group_level_ndx);
            }
        }
        Ok(())
    }

    fn select_descriptor(&mut self, path: &[usize]) -> Result<()> {
        self.desc_selected = self.selected_table.is_some() && path.is_empty();
        if let Some(table_ndx) = self.selected_table {
            self.group.acc_mark(table_ndx);
        }
        Ok(())
    }

    fn insert_empty_rows(
        &mut self,
        _row_ndx: usize,
        num_rows_to_insert: usize,
        _prior_num_rows: usize,
        unordered: bool,
    ) -> Result<()> {
        debug_assert!(!unordered || num_rows_to_insert <= 1);
        if let Some(table_ndx) = self.selected_table {
            self.group.acc_mark(table_ndx);
        }
        Ok(())
    }

    fn erase_rows(
        &mut self,
        _row_ndx: usize,
        num_rows_to_erase: usize,
        _prior_num_rows: usize,
        unordered: bool,
    ) -> Result<()> {
        debug_assert!(!unordered || num_rows_to_erase <= 1);
        if let Some(table_ndx) = self.selected_table {
            if unordered {
                // Opposite link tables must be marked even when
                // `num_rows_to_erase` is zero; the observers are
                // notified either way.
                self.group.acc_mark(table_ndx);
                self.group.acc_mark_opposite_link_tables(table_ndx)?;
            } else if num_rows_to_erase == 0 {
                self.group.acc_mark_opposite_link_tables(table_ndx)?;
            } else {
                self.group.acc_mark(table_ndx);
            }
        }
        Ok(())
    }

    fn swap_rows(&mut self, _row_ndx_1: usize, _row_ndx_2: usize) -> Result<()> {
        if let Some(table_ndx) = self.selected_table {
            self.group.acc_mark(table_ndx);
        }
        Ok(())
    }

    fn move_row(&mut self, _from_ndx: usize, _to_ndx: usize) -> Result<()> {
        if let Some(table_ndx) = self.selected_table {
            self.group.acc_mark(table_ndx);
        }
        Ok(())
    }

    fn merge_rows(&mut self, _row_ndx: usize, _new_row_ndx: usize) -> Result<()> {
        if let Some(table_ndx) = self.selected_table {
            self.group.acc_mark(table_ndx);
        }
        Ok(())
    }

    fn clear_table(&mut self, _prior_num_rows: usize) -> Result<()> {
        if let Some(table_ndx) = self.selected_table {
            self.group.acc_mark(table_ndx);
        }
        Ok(())
    }

    fn insert_column(
        &mut self,
        col_ndx: usize,
        _col_type: u8,
        _name: &str,
        _nullable: bool,
    ) -> Result<()> {
        if let Some(table_ndx) = self.selected_table {
            self.group.acc_adj_insert_column(table_ndx, col_ndx);
            self.group.acc_mark(table_ndx);
            self.group.acc_mark_link_targets_from(table_ndx, col_ndx)?;
        }
        self.schema_changed = true;
        Ok(())
    }

    fn insert_link_column(
        &mut self,
        col_ndx: usize,
        _col_type: u8,
        _name: &str,
        link_target_table_ndx: usize,
        backlink_col_ndx: usize,
    ) -> Result<()> {
        if let Some(table_ndx) = self.selected_table {
            self.group.acc_adj_insert_column(table_ndx, col_ndx);
            self.group.acc_mark(table_ndx);
            self.group.acc_mark_link_targets_from(table_ndx, col_ndx)?;
        }
        // Inserting a link column also adds a backlink column to the
        // target table, whose accessor must follow suit. During a replay
        // the usual "origin accessor exists iff target accessor exists"
        // only holds again after the final refresh.
        if link_target_table_ndx < self.group.table_accessors.len() {
            self.group
                .acc_adj_insert_column(link_target_table_ndx, backlink_col_ndx);
            self.group.acc_mark(link_target_table_ndx);
        }
        self.schema_changed = true;
        Ok(())
    }

    fn erase_column(&mut self, col_ndx: usize) -> Result<()> {
        if let Some(table_ndx) = self.selected_table {
            self.group.acc_adj_erase_column(table_ndx, col_ndx);
            self.group.acc_mark(table_ndx);
            self.group.acc_mark_link_targets_from(table_ndx, col_ndx)?;
        }
        self.schema_changed = true;
        Ok(())
    }

    fn erase_link_column(
        &mut self,
        col_ndx: usize,
        link_target_table_ndx: usize,
        backlink_col_ndx: usize,
    ) -> Result<()> {
        // The backlink side goes first: it sits after the user columns,
        // so its index is valid even when the target table is the origin
        // itself.
        if link_target_table_ndx < self.group.table_accessors.len() {
            self.group
                .acc_adj_erase_column(link_target_table_ndx, backlink_col_ndx);
            self.group.acc_mark(link_target_table_ndx);
        }
        if let Some(table_ndx) = self.selected_table {
            self.group.acc_adj_erase_column(table_ndx, col_ndx);
            self.group.acc_mark(table_ndx);
            self.group.acc_mark_link_targets_from(table_ndx, col_ndx)?;
        }
        self.schema_changed = true;
        Ok(())
    }

    fn rename_column(&mut self, _col_ndx: usize, _name: &str) -> Result<()> {
        self.schema_changed = true;
        Ok(())
    }

    fn set_link(
        &mut self,
        col_ndx: usize,
        _row_ndx: usize,
        _target_row_plus_one: usize,
        _target_group_ndx: usize,
    ) -> Result<()> {
        // A link change also dirties the link-target table; its accessor
        // exists iff the origin's does, because backlink column accessors
        // reference the origin accessor and vice versa.
        if let Some(table_ndx) = self.selected_table {
            self.group.acc_mark_link_target_of_col(table_ndx, col_ndx)?;
        }
        Ok(())
    }

    fn select_link_list(
        &mut self,
        col_ndx: usize,
        _row_ndx: usize,
        _target_group_ndx: usize,
    ) -> Result<()> {
        if let Some(table_ndx) = self.selected_table {
            self.group.acc_mark_link_target_of_col(table_ndx, col_ndx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{Group, OpenMode};
    use tusk_table::ColumnType;
    use tusk_translog::TransactLogEncoder;

    /// Writer/reader pair over one file, with a committed base state so
    /// the reader's accessors are rooted in the file image.
    fn writer_reader_pair(
        dir: &tempfile::TempDir,
        base: impl FnOnce(&mut Group),
    ) -> (Group, Group) {
        let path = dir.path().join("pair.tusk");
        let mut writer = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
        base(&mut writer);
        writer.commit().unwrap();
        let reader = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
        writer.set_replication(Some(TransactLogEncoder::new()));
        (writer, reader)
    }

    fn advance_to_writer(reader: &mut Group, writer: &mut Group) {
        let log = writer.take_transact_log().unwrap();
        let new_top_ref = writer.top.get_ref();
        let new_file_size = writer.alloc.get_baseline();
        reader
            .advance_transact(new_top_ref, new_file_size, &log)
            .unwrap();
    }

    #[test]
    fn advance_converges_on_schema_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, mut reader) = writer_reader_pair(&dir, |group| {
            let mut t = group.add_table("base", true).unwrap();
            t.add_column(ColumnType::Int, "x").unwrap();
            t.add_empty_row().unwrap();
        });
        // Instantiate the reader's accessor so the replay has structure
        // to fix up.
        reader.get_table(0).unwrap();

        {
            let mut t = writer.get_table(0).unwrap();
            t.add_column(ColumnType::String, "s").unwrap();
            t.add_empty_rows(2).unwrap();
            t.set_int(0, 1, 10).unwrap();
            t.set_string(1, 2, "via log").unwrap();
        }
        writer.add_table("second", true).unwrap();
        writer.commit().unwrap();
        advance_to_writer(&mut reader, &mut writer);

        assert!(reader == writer);
        let mut t = reader.get_table(0).unwrap();
        assert_eq!(t.size().unwrap(), 3);
        assert_eq!(t.get_int(0, 1).unwrap(), 10);
        assert_eq!(t.get_string(1, 2).unwrap(), "via log");
        assert_eq!(reader.get_table_name(1).unwrap(), "second");
    }

    #[test]
    fn advance_handles_table_insert_before_cached_accessor() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, mut reader) = writer_reader_pair(&dir, |group| {
            let mut t = group.add_table("tail", true).unwrap();
            t.add_column(ColumnType::Int, "v").unwrap();
            t.add_empty_row().unwrap();
            t.set_int(0, 0, 99).unwrap();
        });
        reader.get_table(0).unwrap();

        writer.insert_table(0, "head", true).unwrap();
        writer.commit().unwrap();
        advance_to_writer(&mut reader, &mut writer);

        assert_eq!(reader.size(), 2);
        assert_eq!(reader.get_table_name(0).unwrap(), "head");
        // The cached accessor moved to index 1 and still reads its data.
        let mut tail = reader.get_table(1).unwrap();
        assert_eq!(tail.get_int(0, 0).unwrap(), 99);
        assert!(reader == writer);
    }

    #[test]
    fn advance_detaches_erased_table_accessor() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, mut reader) = writer_reader_pair(&dir, |group| {
            group.add_table("a", true).unwrap();
            group.add_table("b", true).unwrap();
        });
        reader.get_table(0).unwrap();
        reader.get_table(1).unwrap();

        writer.remove_table_by_name("a").unwrap();
        writer.commit().unwrap();
        advance_to_writer(&mut reader, &mut writer);

        assert_eq!(reader.size(), 1);
        assert_eq!(reader.get_table_name(0).unwrap(), "b");
        assert!(reader == writer);
    }

    #[test]
    fn advance_wires_link_columns_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, mut reader) = writer_reader_pair(&dir, |group| {
            let mut origin = group.add_table("origin", true).unwrap();
            origin.add_empty_row().unwrap();
            group.add_table("target", true).unwrap();
        });
        reader.get_table(0).unwrap();
        reader.get_table(1).unwrap();

        {
            let mut origin = writer.get_table(0).unwrap();
            origin.add_link_column(ColumnType::Link, "to_target", 1).unwrap();
            let mut target = writer.get_table(1).unwrap();
            target.add_empty_row().unwrap();
            let mut origin = writer.get_table(0).unwrap();
            origin.set_link(0, 0, Some(0)).unwrap();
        }
        writer.commit().unwrap();
        advance_to_writer(&mut reader, &mut writer);

        assert!(reader == writer);
        let mut origin = reader.get_table(0).unwrap();
        assert_eq!(origin.get_link(0, 0).unwrap(), Some(0));
    }

    #[test]
    fn unordered_erase_of_zero_rows_marks_opposite_tables() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, mut reader) = writer_reader_pair(&dir, |group| {
            let mut origin = group.add_table("origin", true).unwrap();
            origin.add_empty_row().unwrap();
            group.add_table("neighbour", true).unwrap();
            let mut origin = group.get_table(0).unwrap();
            origin.add_link_column(ColumnType::Link, "to_n", 1).unwrap();
        });
        reader.get_table(0).unwrap();
        reader.get_table(1).unwrap();
        assert!(!reader.table_is_marked(0));
        assert!(!reader.table_is_marked(1));

        // Erase zero rows, unordered: the neighbour must still observe a
        // mark when the log is replayed.
        writer.get_table(0).unwrap().erase_rows(0, 0, true).unwrap();
        writer.commit().unwrap();

        let log = writer.take_transact_log().unwrap();
        reader
            .alloc
            .update_reader_view(writer.alloc.get_baseline())
            .unwrap();
        reader.apply_transact_log(&log).unwrap();
        assert!(reader.table_is_marked(1), "opposite table must be marked");

        // Finishing the refresh converges as usual.
        let new_top_ref = writer.top.get_ref();
        reader.top.detach();
        reader.attach(new_top_ref, false).unwrap();
        reader.refresh_dirty_accessors().unwrap();
        assert!(!reader.table_is_marked(1));
        assert!(reader == writer);
    }

    #[test]
    fn advance_from_empty_in_memory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.tusk");
        let mut writer = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
        writer.commit().unwrap();
        let mut reader = Group::open(&path, None, OpenMode::ReadWrite).unwrap();

        writer.set_replication(Some(TransactLogEncoder::new()));
        {
            let mut t = writer.add_table("t", true).unwrap();
            t.add_column(ColumnType::Int, "x").unwrap();
            t.add_empty_row().unwrap();
            t.set_int(0, 0, 5).unwrap();
        }
        writer.commit().unwrap();
        advance_to_writer(&mut reader, &mut writer);
        assert!(reader == writer);
        assert_eq!(reader.get_table(0).unwrap().get_int(0, 0).unwrap(), 5);
    }

    #[test]
    fn schema_change_notification_fires() {
        use std::cell::Cell;
        use std::rc::Rc;

        let dir = tempfile::tempdir().unwrap();
        let (mut writer, mut reader) = writer_reader_pair(&dir, |group| {
            group.add_table("t", true).unwrap();
        });
        let fired = Rc::new(Cell::new(0u32));
        let observer = Rc::clone(&fired);
        reader.set_schema_change_listener(Some(Box::new(move || {
            observer.set(observer.get() + 1);
        })));

        // Row-only change: no notification.
        {
            let mut t = writer.get_table(0).unwrap();
            t.add_column(ColumnType::Int, "x").unwrap();
        }
        writer.commit().unwrap();
        advance_to_writer(&mut reader, &mut writer);
        assert_eq!(fired.get(), 1, "column insert is a schema change");

        {
            let mut t = writer.get_table(0).unwrap();
            t.add_empty_row().unwrap();
            t.set_int(0, 0, 3).unwrap();
        }
        writer.commit().unwrap();
        advance_to_writer(&mut reader, &mut writer);
        assert_eq!(fired.get(), 1, "row changes are not schema changes");
    }
}
