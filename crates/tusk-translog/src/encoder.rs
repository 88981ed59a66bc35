//! The replication side of the transaction log.

use crate::{op, write_bytes, write_int, write_string, write_uint, write_usize};

/// Collects the instruction stream for one transaction.
///
/// Table-scoped instructions are preceded by a `SelectTable`; the encoder
/// elides repeated selections of the same table and re-selects after any
/// group-level schema change (table indices may have shifted).
#[derive(Debug, Default)]
pub struct TransactLogEncoder {
    log: Vec<u8>,
    selected_table: Option<usize>,
}

impl TransactLogEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// Consume the encoder, returning the raw log.
    #[must_use]
    pub fn into_log(self) -> Vec<u8> {
        self.log
    }

    /// Drain the collected log and reset the selection state.
    pub fn take_log(&mut self) -> Vec<u8> {
        self.selected_table = None;
        std::mem::take(&mut self.log)
    }

    // --- group level -------------------------------------------------------

    pub fn insert_group_level_table(&mut self, table_ndx: usize, num_tables: usize, name: &str) {
        self.selected_table = None;
        self.log.push(op::INSERT_GROUP_LEVEL_TABLE);
        write_usize(&mut self.log, table_ndx);
        write_usize(&mut self.log, num_tables);
        write_string(&mut self.log, name);
    }

    pub fn erase_group_level_table(&mut self, table_ndx: usize, num_tables: usize) {
        self.selected_table = None;
        self.log.push(op::ERASE_GROUP_LEVEL_TABLE);
        write_usize(&mut self.log, table_ndx);
        write_usize(&mut self.log, num_tables);
    }

    pub fn rename_group_level_table(&mut self, table_ndx: usize, name: &str) {
        self.log.push(op::RENAME_GROUP_LEVEL_TABLE);
        write_usize(&mut self.log, table_ndx);
        write_string(&mut self.log, name);
    }

    /// Select the group-level table for subsequent instructions. Elided if
    /// it is already selected.
    pub fn select_table(&mut self, group_level_ndx: usize) {
        if self.selected_table == Some(group_level_ndx) {
            return;
        }
        self.selected_table = Some(group_level_ndx);
        self.log.push(op::SELECT_TABLE);
        write_usize(&mut self.log, group_level_ndx);
        write_usize(&mut self.log, 0); // no subtable hops
    }

    pub fn select_descriptor(&mut self, path: &[usize]) {
        self.log.push(op::SELECT_DESCRIPTOR);
        write_usize(&mut self.log, path.len());
        for &col in path {
            write_usize(&mut self.log, col);
        }
    }

    // --- rows --------------------------------------------------------------

    pub fn insert_empty_rows(
        &mut self,
        row_ndx: usize,
        num_rows_to_insert: usize,
        prior_num_rows: usize,
        unordered: bool,
    ) {
        self.log.push(op::INSERT_EMPTY_ROWS);
        write_usize(&mut self.log, row_ndx);
        write_usize(&mut self.log, num_rows_to_insert);
        write_usize(&mut self.log, prior_num_rows);
        self.log.push(u8::from(unordered));
    }

    pub fn add_row_with_key(
        &mut self,
        row_ndx: usize,
        prior_num_rows: usize,
        key_col_ndx: usize,
        key: i64,
    ) {
        self.log.push(op::ADD_ROW_WITH_KEY);
        write_usize(&mut self.log, row_ndx);
        write_usize(&mut self.log, prior_num_rows);
        write_usize(&mut self.log, key_col_ndx);
        write_int(&mut self.log, key);
    }

    pub fn erase_rows(
        &mut self,
        row_ndx: usize,
        num_rows_to_erase: usize,
        prior_num_rows: usize,
        unordered: bool,
    ) {
        self.log.push(op::ERASE_ROWS);
        write_usize(&mut self.log, row_ndx);
        write_usize(&mut self.log, num_rows_to_erase);
        write_usize(&mut self.log, prior_num_rows);
        self.log.push(u8::from(unordered));
    }

    pub fn swap_rows(&mut self, row_ndx_1: usize, row_ndx_2: usize) {
        self.log.push(op::SWAP_ROWS);
        write_usize(&mut self.log, row_ndx_1);
        write_usize(&mut self.log, row_ndx_2);
    }

    pub fn move_row(&mut self, from_ndx: usize, to_ndx: usize) {
        self.log.push(op::MOVE_ROW);
        write_usize(&mut self.log, from_ndx);
        write_usize(&mut self.log, to_ndx);
    }

    pub fn merge_rows(&mut self, row_ndx: usize, new_row_ndx: usize) {
        self.log.push(op::MERGE_ROWS);
        write_usize(&mut self.log, row_ndx);
        write_usize(&mut self.log, new_row_ndx);
    }

    pub fn clear_table(&mut self, prior_num_rows: usize) {
        self.log.push(op::CLEAR_TABLE);
        write_usize(&mut self.log, prior_num_rows);
    }

    pub fn optimize_table(&mut self) {
        self.log.push(op::OPTIMIZE_TABLE);
    }

    // --- columns -----------------------------------------------------------

    pub fn insert_column(&mut self, col_ndx: usize, col_type: u8, name: &str, nullable: bool) {
        self.log.push(op::INSERT_COLUMN);
        write_usize(&mut self.log, col_ndx);
        self.log.push(col_type);
        write_string(&mut self.log, name);
        self.log.push(u8::from(nullable));
    }

    pub fn insert_link_column(
        &mut self,
        col_ndx: usize,
        col_type: u8,
        name: &str,
        link_target_table_ndx: usize,
        backlink_col_ndx: usize,
    ) {
        self.log.push(op::INSERT_LINK_COLUMN);
        write_usize(&mut self.log, col_ndx);
        self.log.push(col_type);
        write_string(&mut self.log, name);
        write_usize(&mut self.log, link_target_table_ndx);
        write_usize(&mut self.log, backlink_col_ndx);
    }

    pub fn erase_column(&mut self, col_ndx: usize) {
        self.log.push(op::ERASE_COLUMN);
        write_usize(&mut self.log, col_ndx);
    }

    pub fn erase_link_column(
        &mut self,
        col_ndx: usize,
        link_target_table_ndx: usize,
        backlink_col_ndx: usize,
    ) {
        self.log.push(op::ERASE_LINK_COLUMN);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, link_target_table_ndx);
        write_usize(&mut self.log, backlink_col_ndx);
    }

    pub fn rename_column(&mut self, col_ndx: usize, name: &str) {
        self.log.push(op::RENAME_COLUMN);
        write_usize(&mut self.log, col_ndx);
        write_string(&mut self.log, name);
    }

    pub fn add_search_index(&mut self, col_ndx: usize) {
        self.log.push(op::ADD_SEARCH_INDEX);
        write_usize(&mut self.log, col_ndx);
    }

    pub fn remove_search_index(&mut self, col_ndx: usize) {
        self.log.push(op::REMOVE_SEARCH_INDEX);
        write_usize(&mut self.log, col_ndx);
    }

    pub fn add_primary_key(&mut self, col_ndx: usize) {
        self.log.push(op::ADD_PRIMARY_KEY);
        write_usize(&mut self.log, col_ndx);
    }

    pub fn remove_primary_key(&mut self) {
        self.log.push(op::REMOVE_PRIMARY_KEY);
    }

    pub fn set_link_type(&mut self, col_ndx: usize, strong: bool) {
        self.log.push(op::SET_LINK_TYPE);
        write_usize(&mut self.log, col_ndx);
        self.log.push(u8::from(strong));
    }

    // --- cell values --------------------------------------------------------

    pub fn set_int(&mut self, col_ndx: usize, row_ndx: usize, value: i64) {
        self.log.push(op::SET_INT);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        write_int(&mut self.log, value);
    }

    pub fn add_int(&mut self, col_ndx: usize, row_ndx: usize, value: i64) {
        self.log.push(op::ADD_INT);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        write_int(&mut self.log, value);
    }

    pub fn set_bool(&mut self, col_ndx: usize, row_ndx: usize, value: bool) {
        self.log.push(op::SET_BOOL);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        self.log.push(u8::from(value));
    }

    pub fn set_float(&mut self, col_ndx: usize, row_ndx: usize, value: f32) {
        self.log.push(op::SET_FLOAT);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        self.log.extend_from_slice(&value.to_le_bytes());
    }

    pub fn set_double(&mut self, col_ndx: usize, row_ndx: usize, value: f64) {
        self.log.push(op::SET_DOUBLE);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        self.log.extend_from_slice(&value.to_le_bytes());
    }

    pub fn set_string(&mut self, col_ndx: usize, row_ndx: usize, value: &str) {
        self.log.push(op::SET_STRING);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        write_string(&mut self.log, value);
    }

    pub fn set_binary(&mut self, col_ndx: usize, row_ndx: usize, value: &[u8]) {
        self.log.push(op::SET_BINARY);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        write_bytes(&mut self.log, value);
    }

    pub fn set_olddatetime(&mut self, col_ndx: usize, row_ndx: usize, value: i64) {
        self.log.push(op::SET_OLD_DATETIME);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        write_int(&mut self.log, value);
    }

    pub fn set_timestamp(&mut self, col_ndx: usize, row_ndx: usize, seconds: i64, nanos: u32) {
        self.log.push(op::SET_TIMESTAMP);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        write_int(&mut self.log, seconds);
        write_uint(&mut self.log, u64::from(nanos));
    }

    pub fn set_table(&mut self, col_ndx: usize, row_ndx: usize) {
        self.log.push(op::SET_TABLE);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
    }

    pub fn set_mixed(&mut self, col_ndx: usize, row_ndx: usize) {
        self.log.push(op::SET_MIXED);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
    }

    pub fn set_null(&mut self, col_ndx: usize, row_ndx: usize) {
        self.log.push(op::SET_NULL);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
    }

    pub fn set_link(
        &mut self,
        col_ndx: usize,
        row_ndx: usize,
        target_row_plus_one: usize,
        target_group_ndx: usize,
    ) {
        self.log.push(op::SET_LINK);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        write_usize(&mut self.log, target_row_plus_one);
        write_usize(&mut self.log, target_group_ndx);
    }

    pub fn nullify_link(&mut self, col_ndx: usize, row_ndx: usize, target_group_ndx: usize) {
        self.log.push(op::NULLIFY_LINK);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        write_usize(&mut self.log, target_group_ndx);
    }

    pub fn insert_substring(&mut self, col_ndx: usize, row_ndx: usize, pos: usize, value: &str) {
        self.log.push(op::INSERT_SUBSTRING);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        write_usize(&mut self.log, pos);
        write_string(&mut self.log, value);
    }

    pub fn erase_substring(&mut self, col_ndx: usize, row_ndx: usize, pos: usize, size: usize) {
        self.log.push(op::ERASE_SUBSTRING);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        write_usize(&mut self.log, pos);
        write_usize(&mut self.log, size);
    }

    // --- link lists ---------------------------------------------------------

    pub fn select_link_list(&mut self, col_ndx: usize, row_ndx: usize, target_group_ndx: usize) {
        self.log.push(op::SELECT_LINK_LIST);
        write_usize(&mut self.log, col_ndx);
        write_usize(&mut self.log, row_ndx);
        write_usize(&mut self.log, target_group_ndx);
    }

    pub fn link_list_set(&mut self, link_ndx: usize, value: usize, prior_size: usize) {
        self.log.push(op::LINK_LIST_SET);
        write_usize(&mut self.log, link_ndx);
        write_usize(&mut self.log, value);
        write_usize(&mut self.log, prior_size);
    }

    pub fn link_list_insert(&mut self, link_ndx: usize, value: usize, prior_size: usize) {
        self.log.push(op::LINK_LIST_INSERT);
        write_usize(&mut self.log, link_ndx);
        write_usize(&mut self.log, value);
        write_usize(&mut self.log, prior_size);
    }

    pub fn link_list_move(&mut self, from_ndx: usize, to_ndx: usize) {
        self.log.push(op::LINK_LIST_MOVE);
        write_usize(&mut self.log, from_ndx);
        write_usize(&mut self.log, to_ndx);
    }

    pub fn link_list_swap(&mut self, link_ndx_1: usize, link_ndx_2: usize) {
        self.log.push(op::LINK_LIST_SWAP);
        write_usize(&mut self.log, link_ndx_1);
        write_usize(&mut self.log, link_ndx_2);
    }

    pub fn link_list_erase(&mut self, link_ndx: usize, prior_size: usize) {
        self.log.push(op::LINK_LIST_ERASE);
        write_usize(&mut self.log, link_ndx);
        write_usize(&mut self.log, prior_size);
    }

    pub fn link_list_clear(&mut self, prior_size: usize) {
        self.log.push(op::LINK_LIST_CLEAR);
        write_usize(&mut self.log, prior_size);
    }

    pub fn link_list_nullify(&mut self, link_ndx: usize, prior_size: usize) {
        self.log.push(op::LINK_LIST_NULLIFY);
        write_usize(&mut self.log, link_ndx);
        write_usize(&mut self.log, prior_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_table_is_elided_when_repeated() {
        let mut enc = TransactLogEncoder::new();
        enc.select_table(2);
        let len_after_first = enc.len();
        enc.select_table(2);
        assert_eq!(enc.len(), len_after_first);
        enc.select_table(3);
        assert!(enc.len() > len_after_first);
    }

    #[test]
    fn group_level_change_forces_reselect() {
        let mut enc = TransactLogEncoder::new();
        enc.select_table(0);
        let len_selected = enc.len();
        enc.insert_group_level_table(0, 1, "u");
        enc.select_table(0);
        // The second select is not elided: indices shifted.
        assert!(enc.len() > len_selected);
    }

    #[test]
    fn take_log_resets_state() {
        let mut enc = TransactLogEncoder::new();
        enc.select_table(1);
        let log = enc.take_log();
        assert!(!log.is_empty());
        assert!(enc.is_empty());
        enc.select_table(1);
        assert!(!enc.is_empty());
    }
}
