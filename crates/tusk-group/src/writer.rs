//! Snapshot writers: in-place commit, compact streaming copy, and the
//! in-memory image writer.
//!
//! The in-place commit appends only dirty nodes at the file tail and
//! publishes with a header-slot flip, so readers on the previous snapshot
//! never observe a partial state. The compact writer produces a fresh
//! self-contained streaming file terminated by a footer.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use tracing::debug;
use tusk_alloc::{
    node, round_up_8, round_up_to_page_size, Array, FileHeader, OutputStream, RefOrTagged,
    SlabAlloc, StreamingFooter, CURRENT_FILE_FORMAT, FILE_HEADER_SIZE, STREAMING_FOOTER_SIZE,
};
use tusk_error::{LogicErrorKind, Result, TuskError};

use crate::group::Group;
use crate::top::{self, slot, HistoryType};

/// History metadata captured while writing a compact copy.
#[derive(Debug, Clone, Copy)]
pub struct HistoryInfo {
    pub history_type: HistoryType,
    pub ref_: u64,
    /// History schema version.
    pub version: i64,
}

impl HistoryInfo {
    #[must_use]
    pub fn none() -> Self {
        Self {
            history_type: HistoryType::None,
            ref_: 0,
            version: 0,
        }
    }
}

/// Serialization seam used by the compact writer. The group supplies the
/// default implementation; the session layer can substitute its own to
/// stream alternate table sets.
pub trait TableWriter {
    fn write_names<W: Write>(&mut self, out: &mut OutputStream<'_, W>) -> Result<u64>;
    fn write_tables<W: Write>(&mut self, out: &mut OutputStream<'_, W>) -> Result<u64>;
    fn write_history<W: Write>(&mut self, out: &mut OutputStream<'_, W>) -> Result<HistoryInfo>;
}

struct DefaultTableWriter<'g> {
    group: &'g Group,
}

impl TableWriter for DefaultTableWriter<'_> {
    fn write_names<W: Write>(&mut self, out: &mut OutputStream<'_, W>) -> Result<u64> {
        // Deep, and always (never "only if modified").
        node::write_node_deep(&self.group.alloc, self.group.table_names.get_ref(), out)
    }

    fn write_tables<W: Write>(&mut self, out: &mut OutputStream<'_, W>) -> Result<u64> {
        node::write_node_deep(&self.group.alloc, self.group.tables.get_ref(), out)
    }

    fn write_history<W: Write>(&mut self, out: &mut OutputStream<'_, W>) -> Result<HistoryInfo> {
        let group = self.group;
        let info = HistoryInfo::none();
        if !group.top.is_attached() {
            return Ok(info);
        }
        let top_size = group.top.size(&group.alloc)?;
        if top_size <= slot::HISTORY_REF {
            return Ok(info);
        }
        let history_ref = group
            .top
            .get_rt(&group.alloc, slot::HISTORY_REF)?
            .get_as_ref();
        if history_ref == 0 {
            return Ok(info);
        }
        let history_type = HistoryType::from_code(
            group
                .top
                .get_rt(&group.alloc, slot::HISTORY_TYPE)?
                .get_as_int(),
        )?;
        debug_assert!(history_type != HistoryType::None);
        if !history_type.is_sync() {
            // Only sync history is preserved when writing to a new file.
            return Ok(info);
        }
        let version = if top_size > slot::HISTORY_VERSION {
            group
                .top
                .get_rt(&group.alloc, slot::HISTORY_VERSION)?
                .get_as_int()
        } else {
            0
        };
        Ok(HistoryInfo {
            history_type,
            ref_: node::write_node_deep(&group.alloc, history_ref, out)?,
            version,
        })
    }
}

/// Append-only relocation of one subtree for the in-place commit: nodes
/// below the old baseline are unchanged and keep their refs; everything
/// else is serialized to the tail, children first.
fn write_commit_subtree<W: Write>(
    alloc: &SlabAlloc,
    ref_: u64,
    old_baseline: u64,
    out: &mut OutputStream<'_, W>,
) -> Result<u64> {
    if ref_ < old_baseline {
        return Ok(ref_);
    }
    let (header, _) = node::read_node(alloc, ref_)?;
    if !header.has_refs() {
        return node::write_node_shallow(alloc, ref_, out);
    }
    let (_, mut values) = node::read_int_values(alloc, ref_)?;
    for value in values.iter_mut() {
        if *value > 0 && *value & 1 == 0 {
            #[allow(clippy::cast_sign_loss)]
            let new_child = write_commit_subtree(alloc, *value as u64, old_baseline, out)?;
            #[allow(clippy::cast_possible_wrap)]
            {
                *value = new_child as i64;
            }
        }
    }
    out.write_node(&node::encode_int_node(&values, true, 1))
}

fn merge_free_entries(mut entries: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    entries.retain(|&(_, len)| len > 0);
    entries.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(entries.len());
    for (ref_, len) in entries {
        match merged.last_mut() {
            Some((last_ref, last_len)) if *last_ref + *last_len == ref_ => *last_len += len,
            _ => merged.push((ref_, len)),
        }
    }
    merged
}

impl Group {
    /// Commit all changes to the attached file and bring the accessors
    /// along to the new snapshot. Not legal on a shared group.
    pub fn commit(&mut self) -> Result<()> {
        if !self.is_attached() {
            return Err(TuskError::logic(LogicErrorKind::DetachedAccessor));
        }
        if self.is_shared() {
            return Err(TuskError::logic(LogicErrorKind::WrongGroupState));
        }
        if !self.alloc.is_file_backed_writable() {
            return Err(TuskError::logic(LogicErrorKind::WrongGroupState));
        }

        let file_format = if self.file_format_version == 0 {
            CURRENT_FILE_FORMAT
        } else {
            self.file_format_version
        };

        // The canonical empty tree commits as a null top-ref: the file
        // stays at header size and a reopen reconstructs the same tree.
        if self.top.size(&self.alloc)? == 3
            && self.table_names.is_empty(&self.alloc)?
            && self.tables.is_empty(&self.alloc)?
        {
            self.alloc.commit_top_ref(0, file_format)?;
            self.set_file_format_version(file_format);
            self.detach_table_accessors();
            self.table_accessors.clear();
            self.table_names.detach();
            self.tables.detach();
            self.top.detach();
            self.alloc.reset_free_space_tracking();
            let _ = self.alloc.take_read_only_free();
            self.create_empty_group()?;
            debug!("committed canonical empty group");
            return Ok(());
        }

        let old_baseline = self.alloc.get_baseline();
        let current_top_ref = self.top.get_ref();
        if current_top_ref < old_baseline {
            // No node was touched since the last commit; republish.
            self.alloc.commit_top_ref(current_top_ref, file_format)?;
            self.set_file_format_version(file_format);
            return Ok(());
        }

        // Recursively write all changed arrays to the tail of the file.
        // The publish is postponed until the tail is durable.
        let (top_ref, final_file_size, tail) = self.write_group_tail(old_baseline)?;
        self.alloc.write_file_at(old_baseline, &tail)?;
        self.alloc.sync_file()?;
        self.alloc.commit_top_ref(top_ref, file_format)?;
        self.set_file_format_version(file_format);

        // Mark all managed space beyond the attached file as free, grow
        // the reader view over the new tail, and rebind the accessors.
        self.alloc.reset_free_space_tracking();
        self.alloc.update_reader_view(final_file_size)?;
        self.update_refs(top_ref, old_baseline)?;

        let free = top::read_free_lists(&self.top, &self.alloc)?;
        self.alloc.set_read_only_free(free);
        debug!(top_ref, final_file_size, "committed group");
        Ok(())
    }

    /// Serialize every dirty subtree into a tail buffer whose refs start
    /// at the old baseline; returns the new top-ref, the final file size,
    /// and the tail bytes.
    fn write_group_tail(&mut self, old_baseline: u64) -> Result<(u64, u64, Vec<u8>)> {
        let old_logical = self.logical_file_size()?;
        let old_top_size = self.top.size(&self.alloc)?;

        // Free space to persist: chunks freed during this session, the
        // superseded free-list nodes, and the logical/physical gap left
        // by a streaming footer or an interrupted append.
        let mut free = self.alloc.take_read_only_free();
        for free_slot in [slot::FREE_POSITIONS, slot::FREE_SIZES, slot::FREE_VERSIONS] {
            if free_slot < old_top_size {
                let ref_ = self.top.get_rt(&self.alloc, free_slot)?.get_as_ref();
                if ref_ != 0 && ref_ < old_baseline {
                    free.push((ref_, node::node_byte_size(&self.alloc, ref_)?));
                }
            }
        }
        if old_logical < old_baseline {
            free.push((old_logical, old_baseline - old_logical));
        }
        let free = merge_free_entries(free);

        let mut tail: Vec<u8> = Vec::new();
        let mut out = OutputStream::new(&mut tail, old_baseline);
        let names_ref =
            write_commit_subtree(&self.alloc, self.table_names.get_ref(), old_baseline, &mut out)?;
        let tables_ref =
            write_commit_subtree(&self.alloc, self.tables.get_ref(), old_baseline, &mut out)?;
        let history_ref = if old_top_size > slot::HISTORY_REF {
            let ref_ = self.top.get_rt(&self.alloc, slot::HISTORY_REF)?.get_as_ref();
            if ref_ != 0 {
                write_commit_subtree(&self.alloc, ref_, old_baseline, &mut out)?
            } else {
                0
            }
        } else {
            0
        };

        #[allow(clippy::cast_possible_wrap)]
        let positions: Vec<i64> = free.iter().map(|&(ref_, _)| ref_ as i64).collect();
        #[allow(clippy::cast_possible_wrap)]
        let lengths: Vec<i64> = free.iter().map(|&(_, len)| len as i64).collect();
        let free_pos_ref = out.write_node(&node::encode_int_node(&positions, false, 1))?;
        let free_len_ref = out.write_node(&node::encode_int_node(&lengths, false, 1))?;

        // Assemble the new top. A size-3 top grows to 5 to carry the
        // free lists; history-bearing shapes are preserved.
        let new_top_size = old_top_size.max(5);
        #[allow(clippy::cast_possible_wrap)]
        let mut values: Vec<i64> = vec![
            names_ref as i64,
            tables_ref as i64,
            0, // patched below
            free_pos_ref as i64,
            free_len_ref as i64,
        ];
        if new_top_size >= 7 {
            // Free-list versions are session-layer state; a bare commit
            // stores a null ref there.
            values.push(0);
            values.push(self.top.get(&self.alloc, slot::VERSION)?);
        }
        if new_top_size >= 9 {
            values.push(self.top.get(&self.alloc, slot::HISTORY_TYPE)?);
            #[allow(clippy::cast_possible_wrap)]
            values.push(history_ref as i64);
            if new_top_size == 10 {
                values.push(self.top.get(&self.alloc, slot::HISTORY_VERSION)?);
            }
        }
        debug_assert_eq!(values.len(), new_top_size);

        // Pre-widen so patching the logical size cannot change the top's
        // byte size after its ref has been fixed.
        let top_ref = out.ref_of_next_array();
        let max_top_byte_size = 8 + round_up_8(8 * new_top_size as u64);
        let max_final_file_size = top_ref + max_top_byte_size;
        #[allow(clippy::cast_possible_wrap)]
        let min_width =
            node::width_for(RefOrTagged::make_tagged(max_final_file_size as i64).to_raw());
        let probe = node::encode_int_node(&values, true, min_width);
        let final_file_size = top_ref + probe.len() as u64;
        #[allow(clippy::cast_possible_wrap)]
        {
            values[slot::LOGICAL_SIZE] =
                RefOrTagged::make_tagged(final_file_size as i64).to_raw();
        }
        let top_bytes = node::encode_int_node(&values, true, min_width);
        debug_assert_eq!(top_bytes.len(), probe.len());
        let written_ref = out.write_node(&top_bytes)?;
        debug_assert_eq!(written_ref, top_ref);
        debug_assert_eq!(out.ref_of_next_array(), final_file_size);

        Ok((top_ref, final_file_size, tail))
    }

    /// Rebind the accessor hierarchy after a commit.
    ///
    /// Array nodes of the previous version are never overwritten by a
    /// commit, so an array is unchanged across it iff its ref is equal to
    /// the old one and below the previous baseline.
    pub(crate) fn update_refs(&mut self, top_ref: u64, old_baseline: u64) -> Result<()> {
        let _ = old_baseline;
        let old_baseline = 0; // force update of all refs

        if top_ref < old_baseline && self.top.get_ref() == top_ref {
            return Ok(());
        }

        self.top.init_from_ref(top_ref);
        // After a commit there is always free-space tracking info.
        debug_assert!(self.top.size(&self.alloc).map_or(true, |n| n >= 5));
        self.table_names
            .init_from_ref(self.top.get_as_ref(&self.alloc, slot::TABLE_NAMES)?);
        self.tables
            .init_from_ref(self.top.get_as_ref(&self.alloc, slot::TABLES)?);

        for ndx in 0..self.table_accessors.len() {
            if let Some(mut table) = self.table_accessors[ndx].take() {
                let new_ref = self.tables.get_as_ref(&self.alloc, ndx)?;
                let rebound = table.update_from_parent(&self.alloc, new_ref);
                self.table_accessors[ndx] = Some(table);
                rebound?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Compact copy
    // -----------------------------------------------------------------------

    /// Write a compact, self-contained streaming copy of the live state.
    ///
    /// With a non-zero `version_number`, empty free-list arrays and the
    /// version are included (size-7 top); sync history, when present,
    /// extends it to size 10. With `pad_for_encryption`, zero padding
    /// aligns the footer end to a page boundary.
    pub fn write<W: Write>(
        &self,
        out: &mut W,
        pad_for_encryption: bool,
        version_number: u64,
    ) -> Result<()> {
        if !self.is_attached() {
            return Err(TuskError::logic(LogicErrorKind::DetachedAccessor));
        }
        let mut table_writer = DefaultTableWriter { group: self };
        let no_top_array = !self.top.is_attached();
        write_stream(
            out,
            self.get_file_format_version(),
            &mut table_writer,
            no_top_array,
            pad_for_encryption,
            version_number,
        )
    }

    /// Write a compact copy to a new file. The file must not exist.
    pub fn write_path(
        &self,
        path: impl AsRef<Path>,
        key: Option<&[u8]>,
        version_number: u64,
    ) -> Result<()> {
        if key.is_some() {
            return Err(TuskError::Unsupported("encryption"));
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        self.write(&mut file, key.is_some(), version_number)?;
        file.sync_all()?;
        Ok(())
    }

    /// Write a compact copy into a freshly allocated buffer.
    pub fn write_to_mem(&self) -> Result<Vec<u8>> {
        // The allocator's total size is a safe over-estimate of the
        // compact image.
        let max_size = usize::try_from(self.alloc.get_total_size())
            .map_err(|_| TuskError::BadAlloc)?;
        let mut buffer: Vec<u8> = Vec::new();
        buffer
            .try_reserve(max_size + (STREAMING_FOOTER_SIZE as usize))
            .map_err(|_| TuskError::BadAlloc)?;
        self.write(&mut buffer, false, 0)?;
        Ok(buffer)
    }
}

#[allow(clippy::too_many_lines)]
fn write_stream<W: Write, TW: TableWriter>(
    out: &mut W,
    file_format_version: u8,
    table_writer: &mut TW,
    no_top_array: bool,
    pad_for_encryption: bool,
    version_number: u64,
) -> Result<()> {
    let file_format = if no_top_array {
        0
    } else if file_format_version == 0 {
        CURRENT_FILE_FORMAT
    } else {
        file_format_version
    };
    let header = FileHeader::new_streaming(file_format);
    let mut out2 = OutputStream::new(out, FILE_HEADER_SIZE);
    out2.write_bytes(&header.to_bytes())?;

    let mut top_ref = 0u64;
    let mut final_file_size = FILE_HEADER_SIZE;
    if no_top_array {
        // Version number 1 is (also) used to denote the empty initial
        // state of a file.
        debug_assert!(version_number == 0 || version_number == 1);
    } else {
        // The top array records the total logical file size, so
        // everything else is written first and the top is patched last.
        let names_ref = table_writer.write_names(&mut out2)?;
        let tables_ref = table_writer.write_tables(&mut out2)?;
        let history_info = table_writer.write_history(&mut out2)?;

        let mut scratch = SlabAlloc::new();
        scratch.attach_empty()?;
        let mut top = Array::create(&mut scratch, true)?;
        top.add_rt(&mut scratch, RefOrTagged::make_ref(names_ref))?;
        top.add_rt(&mut scratch, RefOrTagged::make_ref(tables_ref))?;
        top.add(&mut scratch, 0)?;

        if version_number != 0 {
            // Free-space info is only included when versioning info is
            // to be saved (compacting the database into a new file).
            let free_positions = Array::create(&mut scratch, false)?;
            let free_sizes = Array::create(&mut scratch, false)?;
            let free_versions = Array::create(&mut scratch, false)?;
            let pos_ref = free_positions.write_deep(&scratch, &mut out2)?;
            let size_ref = free_sizes.write_deep(&scratch, &mut out2)?;
            let ver_ref = free_versions.write_deep(&scratch, &mut out2)?;
            top.add_rt(&mut scratch, RefOrTagged::make_ref(pos_ref))?;
            top.add_rt(&mut scratch, RefOrTagged::make_ref(size_ref))?;
            top.add_rt(&mut scratch, RefOrTagged::make_ref(ver_ref))?;
            #[allow(clippy::cast_possible_wrap)]
            top.add_rt(
                &mut scratch,
                RefOrTagged::make_tagged(version_number as i64),
            )?;

            if history_info.history_type != HistoryType::None {
                top.add_rt(
                    &mut scratch,
                    RefOrTagged::make_tagged(history_info.history_type.code()),
                )?;
                top.add_rt(&mut scratch, RefOrTagged::make_ref(history_info.ref_))?;
                top.add_rt(
                    &mut scratch,
                    RefOrTagged::make_tagged(history_info.version),
                )?;
            }
        }

        top_ref = out2.ref_of_next_array();

        // Produce a preliminary top whose representation is guaranteed
        // to hold the final file size, then patch and emit it.
        let top_size = top.size(&scratch)?;
        let max_top_byte_size = 8 + round_up_8(8 * top_size as u64);
        let max_final_file_size = top_ref + max_top_byte_size;
        #[allow(clippy::cast_possible_wrap)]
        top.ensure_minimum_width(
            &mut scratch,
            RefOrTagged::make_tagged(max_final_file_size as i64).to_raw(),
        )?;
        let top_byte_size = top.byte_size(&scratch)?;
        final_file_size = top_ref + top_byte_size;
        #[allow(clippy::cast_possible_wrap)]
        top.set_rt(
            &mut scratch,
            slot::LOGICAL_SIZE,
            RefOrTagged::make_tagged(final_file_size as i64),
        )?;

        let written_ref = top.write_shallow(&scratch, &mut out2)?;
        debug_assert_eq!(written_ref, top_ref);
        debug_assert_eq!(out2.ref_of_next_array(), final_file_size);
    }

    // Encryption pads the file to a multiple of the page size, so the
    // footer must end on a page boundary.
    if pad_for_encryption {
        let unrounded_size = final_file_size + STREAMING_FOOTER_SIZE;
        let rounded_size = round_up_to_page_size(unrounded_size);
        if rounded_size != unrounded_size {
            out2.write_bytes(&vec![0u8; (rounded_size - unrounded_size) as usize])?;
        }
    }

    out2.write_bytes(&StreamingFooter::new(top_ref).to_bytes())?;
    Ok(())
}
