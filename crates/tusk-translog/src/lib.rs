//! Transaction-log wire format.
//!
//! A log is a flat byte sequence of instructions: one opcode byte followed
//! by the instruction's arguments. Integers are unsigned LEB128 varints
//! (signed values zigzag-encoded), strings and binary payloads are a
//! varint length followed by the raw bytes, floats are little-endian IEEE
//! bits.
//!
//! The [`TransactLogEncoder`] is the replication side: schema and row
//! mutations append instructions as they happen. The
//! [`TransactLogParser`] replays a log through an [`InstructionHandler`]
//! visitor; all handler methods default to no-ops so a visitor only
//! implements the instructions it cares about.

mod encoder;
mod parser;

pub use encoder::TransactLogEncoder;
pub use parser::TransactLogParser;

use tusk_error::Result;

/// Instruction opcodes.
///
/// The numeric values are part of the wire format; append new instructions
/// at the end.
pub(crate) mod op {
    pub const INSERT_GROUP_LEVEL_TABLE: u8 = 0x01;
    pub const ERASE_GROUP_LEVEL_TABLE: u8 = 0x02;
    pub const RENAME_GROUP_LEVEL_TABLE: u8 = 0x03;
    pub const SELECT_TABLE: u8 = 0x04;
    pub const SELECT_DESCRIPTOR: u8 = 0x05;

    pub const INSERT_EMPTY_ROWS: u8 = 0x10;
    pub const ADD_ROW_WITH_KEY: u8 = 0x11;
    pub const ERASE_ROWS: u8 = 0x12;
    pub const SWAP_ROWS: u8 = 0x13;
    pub const MOVE_ROW: u8 = 0x14;
    pub const MERGE_ROWS: u8 = 0x15;
    pub const CLEAR_TABLE: u8 = 0x16;
    pub const OPTIMIZE_TABLE: u8 = 0x17;

    pub const INSERT_COLUMN: u8 = 0x20;
    pub const INSERT_LINK_COLUMN: u8 = 0x21;
    pub const ERASE_COLUMN: u8 = 0x22;
    pub const ERASE_LINK_COLUMN: u8 = 0x23;
    pub const RENAME_COLUMN: u8 = 0x24;
    pub const ADD_SEARCH_INDEX: u8 = 0x25;
    pub const REMOVE_SEARCH_INDEX: u8 = 0x26;
    pub const ADD_PRIMARY_KEY: u8 = 0x27;
    pub const REMOVE_PRIMARY_KEY: u8 = 0x28;
    pub const SET_LINK_TYPE: u8 = 0x29;

    pub const SET_INT: u8 = 0x30;
    pub const ADD_INT: u8 = 0x31;
    pub const SET_BOOL: u8 = 0x32;
    pub const SET_FLOAT: u8 = 0x33;
    pub const SET_DOUBLE: u8 = 0x34;
    pub const SET_STRING: u8 = 0x35;
    pub const SET_BINARY: u8 = 0x36;
    pub const SET_OLD_DATETIME: u8 = 0x37;
    pub const SET_TIMESTAMP: u8 = 0x38;
    pub const SET_TABLE: u8 = 0x39;
    pub const SET_MIXED: u8 = 0x3A;
    pub const SET_NULL: u8 = 0x3B;
    pub const SET_LINK: u8 = 0x3C;
    pub const NULLIFY_LINK: u8 = 0x3D;
    pub const INSERT_SUBSTRING: u8 = 0x3E;
    pub const ERASE_SUBSTRING: u8 = 0x3F;

    pub const SELECT_LINK_LIST: u8 = 0x40;
    pub const LINK_LIST_SET: u8 = 0x41;
    pub const LINK_LIST_INSERT: u8 = 0x42;
    pub const LINK_LIST_MOVE: u8 = 0x43;
    pub const LINK_LIST_SWAP: u8 = 0x44;
    pub const LINK_LIST_ERASE: u8 = 0x45;
    pub const LINK_LIST_CLEAR: u8 = 0x46;
    pub const LINK_LIST_NULLIFY: u8 = 0x47;
}

/// Visitor over a transaction log.
///
/// One method per instruction; every method defaults to a no-op so
/// implementations override only what they observe. Handlers return
/// `Err` to abort the replay.
#[allow(unused_variables)]
pub trait InstructionHandler {
    // --- group level -------------------------------------------------------
    fn insert_group_level_table(
        &mut self,
        table_ndx: usize,
        num_tables: usize,
        name: &str,
    ) -> Result<()> {
        Ok(())
    }
    fn erase_group_level_table(&mut self, table_ndx: usize, num_tables: usize) -> Result<()> {
        Ok(())
    }
    fn rename_group_level_table(&mut self, table_ndx: usize, name: &str) -> Result<()> {
        Ok(())
    }
    /// `path` is a sequence of `(column, row)` subtable hops below the
    /// group-level table.
    fn select_table(&mut self, group_level_ndx: usize, path: &[(usize, usize)]) -> Result<()> {
        Ok(())
    }
    /// `path` is a sequence of subtable-column hops below the root
    /// descriptor.
    fn select_descriptor(&mut self, path: &[usize]) -> Result<()> {
        Ok(())
    }

    // --- rows --------------------------------------------------------------
    fn insert_empty_rows(
        &mut self,
        row_ndx: usize,
        num_rows_to_insert: usize,
        prior_num_rows: usize,
        unordered: bool,
    ) -> Result<()> {
        Ok(())
    }
    fn add_row_with_key(
        &mut self,
        row_ndx: usize,
        prior_num_rows: usize,
        key_col_ndx: usize,
        key: i64,
    ) -> Result<()> {
        Ok(())
    }
    fn erase_rows(
        &mut self,
        row_ndx: usize,
        num_rows_to_erase: usize,
        prior_num_rows: usize,
        unordered: bool,
    ) -> Result<()> {
        Ok(())
    }
    fn swap_rows(&mut self, row_ndx_1: usize, row_ndx_2: usize) -> Result<()> {
        Ok(())
    }
    fn move_row(&mut self, from_ndx: usize, to_ndx: usize) -> Result<()> {
        Ok(())
    }
    fn merge_rows(&mut self, row_ndx: usize, new_row_ndx: usize) -> Result<()> {
        Ok(())
    }
    fn clear_table(&mut self, prior_num_rows: usize) -> Result<()> {
        Ok(())
    }
    fn optimize_table(&mut self) -> Result<()> {
        Ok(())
    }

    // --- columns -----------------------------------------------------------
    fn insert_column(
        &mut self,
        col_ndx: usize,
        col_type: u8,
        name: &str,
        nullable: bool,
    ) -> Result<()> {
        Ok(())
    }
    fn insert_link_column(
        &mut self,
        col_ndx: usize,
        col_type: u8,
        name: &str,
        link_target_table_ndx: usize,
        backlink_col_ndx: usize,
    ) -> Result<()> {
        Ok(())
    }
    fn erase_column(&mut self, col_ndx: usize) -> Result<()> {
        Ok(())
    }
    fn erase_link_column(
        &mut self,
        col_ndx: usize,
        link_target_table_ndx: usize,
        backlink_col_ndx: usize,
    ) -> Result<()> {
        Ok(())
    }
    fn rename_column(&mut self, col_ndx: usize, name: &str) -> Result<()> {
        Ok(())
    }
    fn add_search_index(&mut self, col_ndx: usize) -> Result<()> {
        Ok(())
    }
    fn remove_search_index(&mut self, col_ndx: usize) -> Result<()> {
        Ok(())
    }
    fn add_primary_key(&mut self, col_ndx: usize) -> Result<()> {
        Ok(())
    }
    fn remove_primary_key(&mut self) -> Result<()> {
        Ok(())
    }
    fn set_link_type(&mut self, col_ndx: usize, strong: bool) -> Result<()> {
        Ok(())
    }

    // --- cell values (no-ops for the advancer) ------------------------------
    fn set_int(&mut self, col_ndx: usize, row_ndx: usize, value: i64) -> Result<()> {
        Ok(())
    }
    fn add_int(&mut self, col_ndx: usize, row_ndx: usize, value: i64) -> Result<()> {
        Ok(())
    }
    fn set_bool(&mut self, col_ndx: usize, row_ndx: usize, value: bool) -> Result<()> {
        Ok(())
    }
    fn set_float(&mut self, col_ndx: usize, row_ndx: usize, value: f32) -> Result<()> {
        Ok(())
    }
    fn set_double(&mut self, col_ndx: usize, row_ndx: usize, value: f64) -> Result<()> {
        Ok(())
    }
    fn set_string(&mut self, col_ndx: usize, row_ndx: usize, value: &str) -> Result<()> {
        Ok(())
    }
    fn set_binary(&mut self, col_ndx: usize, row_ndx: usize, value: &[u8]) -> Result<()> {
        Ok(())
    }
    fn set_olddatetime(&mut self, col_ndx: usize, row_ndx: usize, value: i64) -> Result<()> {
        Ok(())
    }
    fn set_timestamp(
        &mut self,
        col_ndx: usize,
        row_ndx: usize,
        seconds: i64,
        nanoseconds: u32,
    ) -> Result<()> {
        Ok(())
    }
    fn set_table(&mut self, col_ndx: usize, row_ndx: usize) -> Result<()> {
        Ok(())
    }
    fn set_mixed(&mut self, col_ndx: usize, row_ndx: usize) -> Result<()> {
        Ok(())
    }
    fn set_null(&mut self, col_ndx: usize, row_ndx: usize) -> Result<()> {
        Ok(())
    }
    /// `target_row_plus_one` is 0 for a null link.
    fn set_link(
        &mut self,
        col_ndx: usize,
        row_ndx: usize,
        target_row_plus_one: usize,
        target_group_ndx: usize,
    ) -> Result<()> {
        Ok(())
    }
    fn nullify_link(
        &mut self,
        col_ndx: usize,
        row_ndx: usize,
        target_group_ndx: usize,
    ) -> Result<()> {
        Ok(())
    }
    fn insert_substring(
        &mut self,
        col_ndx: usize,
        row_ndx: usize,
        pos: usize,
        value: &str,
    ) -> Result<()> {
        Ok(())
    }
    fn erase_substring(
        &mut self,
        col_ndx: usize,
        row_ndx: usize,
        pos: usize,
        size: usize,
    ) -> Result<()> {
        Ok(())
    }

    // --- link lists ---------------------------------------------------------
    fn select_link_list(
        &mut self,
        col_ndx: usize,
        row_ndx: usize,
        target_group_ndx: usize,
    ) -> Result<()> {
        Ok(())
    }
    fn link_list_set(&mut self, link_ndx: usize, value: usize, prior_size: usize) -> Result<()> {
        Ok(())
    }
    fn link_list_insert(&mut self, link_ndx: usize, value: usize, prior_size: usize) -> Result<()> {
        Ok(())
    }
    fn link_list_move(&mut self, from_ndx: usize, to_ndx: usize) -> Result<()> {
        Ok(())
    }
    fn link_list_swap(&mut self, link_ndx_1: usize, link_ndx_2: usize) -> Result<()> {
        Ok(())
    }
    fn link_list_erase(&mut self, link_ndx: usize, prior_size: usize) -> Result<()> {
        Ok(())
    }
    fn link_list_clear(&mut self, prior_size: usize) -> Result<()> {
        Ok(())
    }
    fn link_list_nullify(&mut self, link_ndx: usize, prior_size: usize) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Varint helpers shared by encoder and parser
// ---------------------------------------------------------------------------

pub(crate) fn write_uint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub(crate) fn write_usize(buf: &mut Vec<u8>, value: usize) {
    write_uint(buf, value as u64);
}

#[allow(clippy::cast_sign_loss)]
pub(crate) fn write_int(buf: &mut Vec<u8>, value: i64) {
    // Zigzag: small magnitudes of either sign stay short.
    write_uint(buf, ((value << 1) ^ (value >> 63)) as u64);
}

pub(crate) fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_usize(buf, value.len());
    buf.extend_from_slice(value.as_bytes());
}

pub(crate) fn write_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    write_usize(buf, value.len());
    buf.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // A handler that records nothing: exercises the default no-op bodies.
    struct Silent;
    impl InstructionHandler for Silent {}

    #[test]
    fn default_handler_accepts_everything() {
        let mut enc = TransactLogEncoder::new();
        enc.insert_group_level_table(0, 0, "t");
        enc.select_table(0);
        enc.insert_empty_rows(0, 3, 0, false);
        enc.set_int(0, 1, -42);
        enc.optimize_table();
        let log = enc.into_log();
        TransactLogParser::new().parse(&log, &mut Silent).unwrap();
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 1 << 20, u64::MAX] {
            let mut buf = Vec::new();
            write_uint(&mut buf, value);
            let mut rd = parser::Reader::new(&buf);
            assert_eq!(rd.read_uint().unwrap(), value);
            assert!(rd.is_empty());
        }
    }

    #[test]
    fn zigzag_round_trip() {
        for value in [0i64, -1, 1, -64, 63, i64::MIN, i64::MAX] {
            let mut buf = Vec::new();
            write_int(&mut buf, value);
            let mut rd = parser::Reader::new(&buf);
            assert_eq!(rd.read_int().unwrap(), value);
        }
    }
}
