//! Consistency verification and debug output.

use std::fmt::Write as _;

use tusk_alloc::{node, FILE_HEADER_SIZE};
use tusk_error::{LogicErrorKind, Result, TuskError};

use crate::group::Group;

/// One allocated or free byte range, for coverage accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Chunk {
    ref_: u64,
    size: u64,
}

/// Sort chunks by ref and merge adjacent ones, rejecting any overlap.
fn canonicalize(chunks: &mut Vec<Chunk>) -> Result<()> {
    chunks.sort_unstable();
    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks.drain(..) {
        match merged.last_mut() {
            Some(last) => {
                let last_end = last.ref_ + last.size;
                if chunk.ref_ < last_end {
                    return Err(TuskError::corrupt(format!(
                        "overlapping memory chunks at ref {} (previous ends at {last_end})",
                        chunk.ref_
                    )));
                }
                if chunk.ref_ == last_end {
                    last.size += chunk.size;
                } else {
                    merged.push(chunk);
                }
            }
            None => merged.push(chunk),
        }
    }
    *chunks = merged;
    Ok(())
}

impl Group {
    /// Verify the structural invariants of the group and prove that the
    /// live tree, the free lists, and the logical/physical gap together
    /// cover every byte the allocator manages.
    pub fn verify(&self) -> Result<()> {
        if !self.is_attached() {
            return Err(TuskError::logic(LogicErrorKind::DetachedAccessor));
        }
        if !self.top.is_attached() {
            if !self.alloc.is_free_space_clean() {
                return Err(TuskError::corrupt(
                    "detached top with unclean free space",
                ));
            }
            return Ok(());
        }

        let num_tables = self.size();
        if self.table_names.size(&self.alloc)? != num_tables {
            return Err(TuskError::corrupt(
                "table-names array out of step with the tables array",
            ));
        }

        for table_ndx in 0..num_tables {
            let table = self.transient_accessor(table_ndx)?;
            table.verify(&self.alloc)?;
            for (col_ndx, _, opposite) in table.link_columns(&self.alloc)? {
                if opposite >= num_tables {
                    return Err(TuskError::corrupt(format!(
                        "table {table_ndx} column {col_ndx} links to nonexistent table {opposite}"
                    )));
                }
            }
        }

        let logical_file_size = self.logical_file_size()?;
        let baseline = self.alloc.get_baseline();
        let total_size = self.alloc.get_total_size();
        if logical_file_size > baseline {
            return Err(TuskError::corrupt(format!(
                "logical file size {logical_file_size} exceeds baseline {baseline}"
            )));
        }

        let mut chunks: Vec<Chunk> = Vec::new();
        node::report_node_memory(&self.alloc, self.top.get_ref(), &mut |ref_, size| {
            chunks.push(Chunk { ref_, size });
        })?;
        for &(ref_, size) in self.alloc.read_only_free() {
            chunks.push(Chunk { ref_, size });
        }
        self.alloc
            .for_all_free_entries(|ref_, size| chunks.push(Chunk { ref_, size }));

        // The baseline tracks the physical file size, not the logical
        // one; the gap between them is unusable ref-space accounted as
        // mutable free space.
        if logical_file_size < baseline {
            chunks.push(Chunk {
                ref_: logical_file_size,
                size: baseline - logical_file_size,
            });
        }

        canonicalize(&mut chunks)?;
        let covered = chunks.len() == 1
            && chunks[0].ref_ == FILE_HEADER_SIZE
            && chunks[0].ref_ + chunks[0].size == total_size;
        if !covered {
            return Err(TuskError::corrupt(format!(
                "memory accounting does not cover [{FILE_HEADER_SIZE}, {total_size}): {chunks:?}"
            )));
        }
        Ok(())
    }

    /// Render the reachable node graph in Graphviz dot form.
    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::new();
        let _ = writeln!(out, "digraph tusk_group {{");
        let _ = writeln!(out, "  node [shape=box, fontname=\"monospace\"];");
        if self.top.is_attached() {
            self.dot_subtree(self.top.get_ref(), "top", &mut out)?;
        }
        let _ = writeln!(out, "}}");
        Ok(out)
    }

    fn dot_subtree(&self, ref_: u64, label: &str, out: &mut String) -> Result<()> {
        let byte_size = node::node_byte_size(&self.alloc, ref_)?;
        let _ = writeln!(out, "  n{ref_} [label=\"{label}\\nref {ref_} ({byte_size} B)\"];");
        let (header, _) = node::read_node(&self.alloc, ref_)?;
        if header.has_refs() {
            let (_, values) = node::read_int_values(&self.alloc, ref_)?;
            for (idx, value) in values.into_iter().enumerate() {
                if value > 0 && value & 1 == 0 {
                    #[allow(clippy::cast_sign_loss)]
                    let child = value as u64;
                    let _ = writeln!(out, "  n{ref_} -> n{child} [label=\"{idx}\"];");
                    self.dot_subtree(child, "node", out)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::OpenMode;
    use tusk_table::ColumnType;

    #[test]
    fn fresh_group_verifies() {
        let group = Group::new().unwrap();
        group.verify().unwrap();
    }

    #[test]
    fn mutated_group_verifies() {
        let mut group = Group::new().unwrap();
        {
            let mut t = group.add_table("t", true).unwrap();
            t.add_column(ColumnType::Int, "x").unwrap();
            t.add_column(ColumnType::String, "s").unwrap();
            t.add_empty_rows(5).unwrap();
            t.set_int(0, 3, 12).unwrap();
            t.set_string(1, 3, "twelve").unwrap();
        }
        group.add_table("u", true).unwrap();
        group.remove_table_by_name("u").unwrap();
        group.verify().unwrap();
    }

    #[test]
    fn committed_and_reopened_group_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verify.tusk");
        {
            let mut group = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
            let mut t = group.add_table("t", true).unwrap();
            t.add_column(ColumnType::Int, "x").unwrap();
            t.add_empty_rows(8).unwrap();
            group.commit().unwrap();
            group.verify().unwrap();

            // Mutate and commit again so the file carries free space.
            let mut t = group.get_table(0).unwrap();
            t.set_int(0, 0, -1).unwrap();
            group.commit().unwrap();
            group.verify().unwrap();
        }
        let group = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
        group.verify().unwrap();
    }

    #[test]
    fn streamed_file_gap_is_accounted() {
        let dir = tempfile::tempdir().unwrap();
        let streamed = dir.path().join("streamed.tusk");
        {
            let mut source = Group::new().unwrap();
            source.add_table("t", true).unwrap();
            source.write_path(&streamed, None, 0).unwrap();
        }
        // The footer makes the logical size smaller than the physical
        // size; verify must treat the gap as free space.
        let group = Group::open(&streamed, None, OpenMode::ReadWrite).unwrap();
        assert!(group.logical_file_size().unwrap() < group.alloc.get_baseline());
        group.verify().unwrap();
    }

    #[test]
    fn to_dot_names_the_top() {
        let mut group = Group::new().unwrap();
        group.add_table("t", true).unwrap();
        let dot = group.to_dot().unwrap();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("top"));
        assert!(dot.contains("->"));
    }

    #[test]
    fn canonicalize_rejects_overlap() {
        let mut chunks = vec![
            Chunk { ref_: 24, size: 16 },
            Chunk { ref_: 32, size: 8 },
        ];
        assert!(canonicalize(&mut chunks).is_err());

        let mut chunks = vec![
            Chunk { ref_: 40, size: 8 },
            Chunk { ref_: 24, size: 16 },
        ];
        canonicalize(&mut chunks).unwrap();
        assert_eq!(chunks, vec![Chunk { ref_: 24, size: 24 }]);
    }
}
