//! The replay side of the transaction log.

use tracing::trace;
use tusk_error::{Result, TuskError};

use crate::{op, InstructionHandler};

/// Validating cursor over a raw log.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn corrupt(&self, what: &str) -> TuskError {
        TuskError::corrupt(format!(
            "malformed transaction log: {what} at byte {}",
            self.pos
        ))
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| self.corrupt("unexpected end"))?;
        self.pos += 1;
        Ok(byte)
    }

    pub(crate) fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(self.corrupt(&format!("invalid bool {other}"))),
        }
    }

    pub(crate) fn read_uint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(self.corrupt("varint too long"));
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub(crate) fn read_usize(&mut self) -> Result<usize> {
        usize::try_from(self.read_uint()?).map_err(|_| self.corrupt("index overflows usize"))
    }

    #[allow(clippy::cast_possible_wrap)]
    pub(crate) fn read_int(&mut self) -> Result<i64> {
        let raw = self.read_uint()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    pub(crate) fn read_str(&mut self) -> Result<&'a str> {
        let len = self.read_usize()?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| self.corrupt("string runs past end"))?;
        let s = std::str::from_utf8(&self.buf[self.pos..end])
            .map_err(|_| self.corrupt("invalid UTF-8"))?;
        self.pos = end;
        Ok(s)
    }

    pub(crate) fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_usize()?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| self.corrupt("binary runs past end"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn read_f32(&mut self) -> Result<f32> {
        let end = self.pos + 4;
        if end > self.buf.len() {
            return Err(self.corrupt("float runs past end"));
        }
        let bits: [u8; 4] = self.buf[self.pos..end].try_into().expect("4 bytes");
        self.pos = end;
        Ok(f32::from_le_bytes(bits))
    }

    pub(crate) fn read_f64(&mut self) -> Result<f64> {
        let end = self.pos + 8;
        if end > self.buf.len() {
            return Err(self.corrupt("double runs past end"));
        }
        let bits: [u8; 8] = self.buf[self.pos..end].try_into().expect("8 bytes");
        self.pos = end;
        Ok(f64::from_le_bytes(bits))
    }
}

/// Parses a transaction log, dispatching each instruction to an
/// [`InstructionHandler`].
#[derive(Debug, Default)]
pub struct TransactLogParser;

impl TransactLogParser {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Replay `log` through `handler`. Stops at the first malformed
    /// instruction or handler error.
    pub fn parse(&self, log: &[u8], handler: &mut impl InstructionHandler) -> Result<()> {
        let mut rd = Reader::new(log);
        while !rd.is_empty() {
            self.parse_one(&mut rd, handler)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn parse_one(&self, rd: &mut Reader<'_>, handler: &mut impl InstructionHandler) -> Result<()> {
        let opcode = rd.read_u8()?;
        trace!(opcode, "transaction log instruction");
        match opcode {
            op::INSERT_GROUP_LEVEL_TABLE => {
                let table_ndx = rd.read_usize()?;
                let num_tables = rd.read_usize()?;
                let name = rd.read_str()?;
                if table_ndx > num_tables {
                    return Err(rd.corrupt("table insert index beyond table count"));
                }
                handler.insert_group_level_table(table_ndx, num_tables, name)
            }
            op::ERASE_GROUP_LEVEL_TABLE => {
                let table_ndx = rd.read_usize()?;
                let num_tables = rd.read_usize()?;
                if table_ndx >= num_tables {
                    return Err(rd.corrupt("table erase index beyond table count"));
                }
                handler.erase_group_level_table(table_ndx, num_tables)
            }
            op::RENAME_GROUP_LEVEL_TABLE => {
                let table_ndx = rd.read_usize()?;
                let name = rd.read_str()?;
                handler.rename_group_level_table(table_ndx, name)
            }
            op::SELECT_TABLE => {
                let group_level_ndx = rd.read_usize()?;
                let levels = rd.read_usize()?;
                let mut path = Vec::with_capacity(levels);
                for _ in 0..levels {
                    let col = rd.read_usize()?;
                    let row = rd.read_usize()?;
                    path.push((col, row));
                }
                handler.select_table(group_level_ndx, &path)
            }
            op::SELECT_DESCRIPTOR => {
                let levels = rd.read_usize()?;
                let mut path = Vec::with_capacity(levels);
                for _ in 0..levels {
                    path.push(rd.read_usize()?);
                }
                handler.select_descriptor(&path)
            }
            op::INSERT_EMPTY_ROWS => {
                let row_ndx = rd.read_usize()?;
                let num_rows = rd.read_usize()?;
                let prior_num_rows = rd.read_usize()?;
                let unordered = rd.read_bool()?;
                if unordered && num_rows > 1 {
                    return Err(rd.corrupt("unordered insert of more than one row"));
                }
                handler.insert_empty_rows(row_ndx, num_rows, prior_num_rows, unordered)
            }
            op::ADD_ROW_WITH_KEY => {
                let row_ndx = rd.read_usize()?;
                let prior_num_rows = rd.read_usize()?;
                let key_col_ndx = rd.read_usize()?;
                let key = rd.read_int()?;
                handler.add_row_with_key(row_ndx, prior_num_rows, key_col_ndx, key)
            }
            op::ERASE_ROWS => {
                let row_ndx = rd.read_usize()?;
                let num_rows = rd.read_usize()?;
                let prior_num_rows = rd.read_usize()?;
                let unordered = rd.read_bool()?;
                if unordered && num_rows > 1 {
                    return Err(rd.corrupt("unordered erase of more than one row"));
                }
                handler.erase_rows(row_ndx, num_rows, prior_num_rows, unordered)
            }
            op::SWAP_ROWS => {
                let a = rd.read_usize()?;
                let b = rd.read_usize()?;
                handler.swap_rows(a, b)
            }
            op::MOVE_ROW => {
                let from = rd.read_usize()?;
                let to = rd.read_usize()?;
                handler.move_row(from, to)
            }
            op::MERGE_ROWS => {
                let row_ndx = rd.read_usize()?;
                let new_row_ndx = rd.read_usize()?;
                handler.merge_rows(row_ndx, new_row_ndx)
            }
            op::CLEAR_TABLE => {
                let prior_num_rows = rd.read_usize()?;
                handler.clear_table(prior_num_rows)
            }
            op::OPTIMIZE_TABLE => handler.optimize_table(),
            op::INSERT_COLUMN => {
                let col_ndx = rd.read_usize()?;
                let col_type = rd.read_u8()?;
                let name = rd.read_str()?;
                let nullable = rd.read_bool()?;
                handler.insert_column(col_ndx, col_type, name, nullable)
            }
            op::INSERT_LINK_COLUMN => {
                let col_ndx = rd.read_usize()?;
                let col_type = rd.read_u8()?;
                let name = rd.read_str()?;
                let target = rd.read_usize()?;
                let backlink_col = rd.read_usize()?;
                handler.insert_link_column(col_ndx, col_type, name, target, backlink_col)
            }
            op::ERASE_COLUMN => {
                let col_ndx = rd.read_usize()?;
                handler.erase_column(col_ndx)
            }
            op::ERASE_LINK_COLUMN => {
                let col_ndx = rd.read_usize()?;
                let target = rd.read_usize()?;
                let backlink_col = rd.read_usize()?;
                handler.erase_link_column(col_ndx, target, backlink_col)
            }
            op::RENAME_COLUMN => {
                let col_ndx = rd.read_usize()?;
                let name = rd.read_str()?;
                handler.rename_column(col_ndx, name)
            }
            op::ADD_SEARCH_INDEX => handler.add_search_index(rd.read_usize()?),
            op::REMOVE_SEARCH_INDEX => handler.remove_search_index(rd.read_usize()?),
            op::ADD_PRIMARY_KEY => handler.add_primary_key(rd.read_usize()?),
            op::REMOVE_PRIMARY_KEY => handler.remove_primary_key(),
            op::SET_LINK_TYPE => {
                let col_ndx = rd.read_usize()?;
                let strong = rd.read_bool()?;
                handler.set_link_type(col_ndx, strong)
            }
            op::SET_INT => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let value = rd.read_int()?;
                handler.set_int(col, row, value)
            }
            op::ADD_INT => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let value = rd.read_int()?;
                handler.add_int(col, row, value)
            }
            op::SET_BOOL => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let value = rd.read_bool()?;
                handler.set_bool(col, row, value)
            }
            op::SET_FLOAT => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let value = rd.read_f32()?;
                handler.set_float(col, row, value)
            }
            op::SET_DOUBLE => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let value = rd.read_f64()?;
                handler.set_double(col, row, value)
            }
            op::SET_STRING => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let value = rd.read_str()?;
                handler.set_string(col, row, value)
            }
            op::SET_BINARY => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let value = rd.read_bytes()?;
                handler.set_binary(col, row, value)
            }
            op::SET_OLD_DATETIME => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let value = rd.read_int()?;
                handler.set_olddatetime(col, row, value)
            }
            op::SET_TIMESTAMP => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let seconds = rd.read_int()?;
                let nanos = u32::try_from(rd.read_uint()?)
                    .map_err(|_| rd.corrupt("timestamp nanoseconds overflow"))?;
                handler.set_timestamp(col, row, seconds, nanos)
            }
            op::SET_TABLE => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                handler.set_table(col, row)
            }
            op::SET_MIXED => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                handler.set_mixed(col, row)
            }
            op::SET_NULL => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                handler.set_null(col, row)
            }
            op::SET_LINK => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let target_row_plus_one = rd.read_usize()?;
                let target_group_ndx = rd.read_usize()?;
                handler.set_link(col, row, target_row_plus_one, target_group_ndx)
            }
            op::NULLIFY_LINK => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let target_group_ndx = rd.read_usize()?;
                handler.nullify_link(col, row, target_group_ndx)
            }
            op::INSERT_SUBSTRING => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let pos = rd.read_usize()?;
                let value = rd.read_str()?;
                handler.insert_substring(col, row, pos, value)
            }
            op::ERASE_SUBSTRING => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let pos = rd.read_usize()?;
                let size = rd.read_usize()?;
                handler.erase_substring(col, row, pos, size)
            }
            op::SELECT_LINK_LIST => {
                let col = rd.read_usize()?;
                let row = rd.read_usize()?;
                let target_group_ndx = rd.read_usize()?;
                handler.select_link_list(col, row, target_group_ndx)
            }
            op::LINK_LIST_SET => {
                let ndx = rd.read_usize()?;
                let value = rd.read_usize()?;
                let prior = rd.read_usize()?;
                handler.link_list_set(ndx, value, prior)
            }
            op::LINK_LIST_INSERT => {
                let ndx = rd.read_usize()?;
                let value = rd.read_usize()?;
                let prior = rd.read_usize()?;
                handler.link_list_insert(ndx, value, prior)
            }
            op::LINK_LIST_MOVE => {
                let from = rd.read_usize()?;
                let to = rd.read_usize()?;
                handler.link_list_move(from, to)
            }
            op::LINK_LIST_SWAP => {
                let a = rd.read_usize()?;
                let b = rd.read_usize()?;
                handler.link_list_swap(a, b)
            }
            op::LINK_LIST_ERASE => {
                let ndx = rd.read_usize()?;
                let prior = rd.read_usize()?;
                handler.link_list_erase(ndx, prior)
            }
            op::LINK_LIST_CLEAR => handler.link_list_clear(rd.read_usize()?),
            op::LINK_LIST_NULLIFY => {
                let ndx = rd.read_usize()?;
                let prior = rd.read_usize()?;
                handler.link_list_nullify(ndx, prior)
            }
            other => Err(rd.corrupt(&format!("unknown opcode {other:#x}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransactLogEncoder;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl InstructionHandler for Recorder {
        fn insert_group_level_table(
            &mut self,
            table_ndx: usize,
            num_tables: usize,
            name: &str,
        ) -> Result<()> {
            self.events
                .push(format!("insert_table {table_ndx}/{num_tables} {name}"));
            Ok(())
        }
        fn select_table(&mut self, group_level_ndx: usize, path: &[(usize, usize)]) -> Result<()> {
            self.events
                .push(format!("select {group_level_ndx} path={}", path.len()));
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
            self.events.push(format!(
                "insert_link_col {col_ndx} ty={col_type} {name} -> {link_target_table_ndx}.{backlink_col_ndx}"
            ));
            Ok(())
        }
        fn erase_rows(
            &mut self,
            row_ndx: usize,
            num_rows_to_erase: usize,
            prior_num_rows: usize,
            unordered: bool,
        ) -> Result<()> {
            self.events.push(format!(
                "erase_rows {row_ndx} n={num_rows_to_erase} prior={prior_num_rows} unordered={unordered}"
            ));
            Ok(())
        }
        fn set_int(&mut self, col_ndx: usize, row_ndx: usize, value: i64) -> Result<()> {
            self.events
                .push(format!("set_int {col_ndx},{row_ndx} = {value}"));
            Ok(())
        }
    }

    #[test]
    fn encode_parse_round_trip() {
        let mut enc = TransactLogEncoder::new();
        enc.insert_group_level_table(0, 0, "people");
        enc.select_table(0);
        enc.insert_link_column(1, 12, "spouse", 0, 2);
        enc.erase_rows(3, 0, 5, true);
        enc.set_int(0, 2, -7);
        let log = enc.into_log();

        let mut rec = Recorder::default();
        TransactLogParser::new().parse(&log, &mut rec).unwrap();
        assert_eq!(
            rec.events,
            vec![
                "insert_table 0/0 people",
                "select 0 path=0",
                "insert_link_col 1 ty=12 spouse -> 0.2",
                "erase_rows 3 n=0 prior=5 unordered=true",
                "set_int 0,2 = -7",
            ]
        );
    }

    #[test]
    fn unknown_opcode_is_corrupt() {
        let mut rec = Recorder::default();
        let err = TransactLogParser::new()
            .parse(&[0xEE], &mut rec)
            .unwrap_err();
        assert!(err.to_string().contains("unknown opcode"));
    }

    #[test]
    fn truncated_log_is_corrupt() {
        let mut enc = TransactLogEncoder::new();
        enc.insert_group_level_table(0, 0, "table-with-a-name");
        let log = enc.into_log();
        let mut rec = Recorder::default();
        let err = TransactLogParser::new()
            .parse(&log[..log.len() - 4], &mut rec)
            .unwrap_err();
        assert!(matches!(err, TuskError::DatabaseCorrupt { .. }));
    }

    #[test]
    fn unordered_bulk_erase_rejected() {
        let mut enc = TransactLogEncoder::new();
        enc.erase_rows(0, 2, 5, true);
        let log = enc.into_log();
        let mut rec = Recorder::default();
        let err = TransactLogParser::new().parse(&log, &mut rec).unwrap_err();
        assert!(err.to_string().contains("unordered erase"));
    }
}
