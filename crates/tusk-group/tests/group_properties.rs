//! End-to-end properties of the group layer: open/commit round trips,
//! registry behavior, compact copies, validation, and snapshot
//! advancement.

use proptest::prelude::*;
use tusk_alloc::{node, FileHeader, StreamingFooter, FILE_HEADER_SIZE, STREAMING_FOOTER_SIZE};
use tusk_error::TuskError;
use tusk_group::{Group, OpenMode};
use tusk_table::ColumnType;
use tusk_translog::TransactLogEncoder;

// ---------------------------------------------------------------------------
// Open / commit round trips
// ---------------------------------------------------------------------------

#[test]
fn empty_open_idempotence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fresh.tusk");

    let mut group = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
    group.commit().unwrap();
    drop(group);

    let group = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
    assert_eq!(group.size(), 0);
    assert_eq!(group.get_file_format_version(), 9);
    assert_eq!(group.logical_file_size().unwrap(), FILE_HEADER_SIZE);
    group.verify().unwrap();
}

#[test]
fn scenario_insert_commit_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s1.tusk");
    {
        let mut group = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
        let mut t = group.add_table("t", true).unwrap();
        t.add_column(ColumnType::Int, "x").unwrap();
        t.add_empty_rows(3).unwrap();
        t.set_int(0, 0, 1).unwrap();
        t.set_int(0, 1, 2).unwrap();
        t.set_int(0, 2, 3).unwrap();
        group.commit().unwrap();
    }
    let mut group = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
    assert_eq!(group.size(), 1);
    let mut t = group.get_table_by_name("t").unwrap().unwrap();
    assert_eq!(t.size().unwrap(), 3);
    assert_eq!(t.get_int(0, 0).unwrap(), 1);
    assert_eq!(t.get_int(0, 2).unwrap(), 3);
}

#[test]
fn scenario_remove_middle_table() {
    let mut group = Group::new().unwrap();
    group.add_table("A", true).unwrap();
    group.add_table("B", true).unwrap();
    group.add_table("C", true).unwrap();
    group.remove_table_by_name("B").unwrap();
    assert_eq!(group.get_table_name(0).unwrap(), "A");
    assert_eq!(group.get_table_name(1).unwrap(), "C");
    assert_eq!(group.size(), 2);
}

#[test]
fn scenario_self_link_survives_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s3.tusk");
    {
        let mut group = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
        let mut a = group.add_table("A", true).unwrap();
        a.add_link_column(ColumnType::Link, "self", 0).unwrap();
        a.add_empty_row().unwrap();
        a.set_link(0, 0, Some(0)).unwrap();
        group.commit().unwrap();
    }
    let mut group = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
    let mut a = group.get_table_by_name("A").unwrap().unwrap();
    assert_eq!(a.get_link(0, 0).unwrap(), Some(0));
}

#[test]
fn scenario_cross_table_link_guard_keeps_group_usable() {
    let mut group = Group::new().unwrap();
    group.add_table("A", true).unwrap();
    group.add_table("B", true).unwrap();
    {
        let mut a = group.get_table_by_name("A").unwrap().unwrap();
        a.add_link_column(ColumnType::Link, "b", 1).unwrap();
    }
    let err = group.remove_table_by_name("B").unwrap_err();
    assert!(matches!(err, TuskError::CrossTableLinkTarget));
    assert_eq!(group.size(), 2);
    // Both tables open normally afterwards.
    assert!(group.get_table_by_name("A").unwrap().is_some());
    assert!(group.get_table_by_name("B").unwrap().is_some());
    group.verify().unwrap();
}

#[test]
fn link_renumbering_preserved_across_table_insert() {
    let mut group = Group::new().unwrap();
    group.add_table("T0", true).unwrap();
    group.add_table("T1", true).unwrap();
    group.add_table("T2", true).unwrap();
    {
        let mut t2 = group.get_table(2).unwrap();
        t2.add_link_column(ColumnType::Link, "to_t0", 0).unwrap();
        t2.add_empty_row().unwrap();
    }
    {
        let mut t0 = group.get_table(0).unwrap();
        t0.add_empty_row().unwrap();
    }
    group.get_table(2).unwrap().set_link(0, 0, Some(0)).unwrap();

    group.insert_table(1, "fresh", true).unwrap();

    // T2 moved to index 3; its link still targets the table originally
    // named T0, which stayed at index 0.
    assert_eq!(group.get_table_name(3).unwrap(), "T2");
    let mut t2 = group.get_table(3).unwrap();
    assert_eq!(t2.get_link_target(0).unwrap(), 0);
    assert_eq!(t2.get_link(0, 0).unwrap(), Some(0));
    group.verify().unwrap();
}

#[test]
fn commit_round_trip_matches_memory_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("p5.tusk");

    let mut group = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
    {
        let mut t = group.add_table("alpha", true).unwrap();
        t.add_column(ColumnType::Int, "n").unwrap();
        t.add_column(ColumnType::String, "s").unwrap();
        t.add_column(ColumnType::Double, "d").unwrap();
        t.add_empty_rows(4).unwrap();
        for row in 0..4 {
            #[allow(clippy::cast_possible_wrap)]
            t.set_int(0, row, row as i64 * 11).unwrap();
            t.set_string(1, row, &format!("row-{row}")).unwrap();
            t.set_double(2, row, row as f64 / 2.0).unwrap();
        }
        t.erase_row(1).unwrap();
    }
    group.add_table("beta", true).unwrap();
    group.remove_table_by_name("beta").unwrap();

    let snapshot = Group::from_buffer(group.write_to_mem().unwrap()).unwrap();
    group.commit().unwrap();
    drop(group);

    let reopened = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
    assert!(reopened == snapshot);
    reopened.verify().unwrap();
}

// ---------------------------------------------------------------------------
// Compact copies
// ---------------------------------------------------------------------------

#[test]
fn compact_write_round_trip_after_fragmentation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source.tusk");
    let compacted = dir.path().join("compacted.tusk");

    let mut group = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
    {
        let mut t = group.add_table("t", true).unwrap();
        t.add_column(ColumnType::Int, "x").unwrap();
        t.add_empty_rows(32).unwrap();
    }
    group.commit().unwrap();
    for round in 0..3 {
        {
            let mut t = group.get_table(0).unwrap();
            for row in 0..32 {
                #[allow(clippy::cast_possible_wrap)]
                t.set_int(0, row, (round + row) as i64).unwrap();
            }
        }
        group.commit().unwrap();
    }

    group.write_path(&compacted, None, 0).unwrap();
    let copy = Group::open(&compacted, None, OpenMode::ReadWrite).unwrap();
    assert!(copy == group);
    copy.verify().unwrap();
}

#[test]
fn streaming_footer_well_formed() {
    let mut group = Group::new().unwrap();
    {
        let mut t = group.add_table("t", true).unwrap();
        t.add_column(ColumnType::Int, "x").unwrap();
    }
    let image = group.write_to_mem().unwrap();
    let footer_at = image.len() - STREAMING_FOOTER_SIZE as usize;
    let footer = StreamingFooter::from_bytes(&image[footer_at..]).unwrap();
    assert!(footer.top_ref < footer_at as u64);
}

// ---------------------------------------------------------------------------
// Top-array validation
// ---------------------------------------------------------------------------

/// Hand-crafted streaming image: header, appended nodes, footer.
struct ImageBuilder {
    bytes: Vec<u8>,
}

impl ImageBuilder {
    fn new() -> Self {
        Self {
            bytes: FileHeader::new_streaming(9).to_bytes().to_vec(),
        }
    }

    /// Append an encoded node and return its ref.
    fn add_node(&mut self, encoded: &[u8]) -> u64 {
        let ref_ = self.bytes.len() as u64;
        self.bytes.extend_from_slice(encoded);
        ref_
    }

    /// Append a leaf node usable as a placeholder child.
    fn add_leaf(&mut self) -> u64 {
        self.add_node(&node::encode_int_node(&[], false, 1))
    }

    fn finish(mut self, top_ref: u64) -> Vec<u8> {
        self.bytes
            .extend_from_slice(&StreamingFooter::new(top_ref).to_bytes());
        self.bytes
    }
}

fn tagged(value: i64) -> i64 {
    (value << 1) | 1
}

#[test]
fn top_size_4_rejected_with_top_array_diagnostic() {
    let mut image = ImageBuilder::new();
    let names_ref = image.add_leaf();
    let tables_ref = image.add_leaf();
    #[allow(clippy::cast_possible_wrap)]
    let top_ref = image.add_node(&node::encode_int_node(
        &[names_ref as i64, tables_ref as i64, tagged(200), 1],
        true,
        1,
    ));
    let err = Group::from_buffer(image.finish(top_ref)).unwrap_err();
    let msg = err.to_string();
    assert!(matches!(err, TuskError::InvalidDatabase { .. }));
    assert!(msg.contains("top array"), "diagnostic was: {msg}");
}

#[test]
fn every_illegal_top_size_rejected() {
    for top_size in [0usize, 1, 2, 4, 6, 8, 11] {
        let mut image = ImageBuilder::new();
        let names_ref = image.add_leaf();
        let tables_ref = image.add_leaf();
        #[allow(clippy::cast_possible_wrap)]
        let values: Vec<i64> = (0..top_size)
            .map(|slot| match slot {
                0 => names_ref as i64,
                1 => tables_ref as i64,
                _ => tagged(200),
            })
            .collect();
        let top_ref = image.add_node(&node::encode_int_node(&values, true, 1));
        let err = Group::from_buffer(image.finish(top_ref)).unwrap_err();
        assert!(
            matches!(err, TuskError::InvalidDatabase { .. }),
            "top size {top_size} must be rejected"
        );
    }
}

#[test]
fn misaligned_and_out_of_range_child_refs_rejected() {
    // Misaligned table-names ref (even but not 8-aligned).
    let mut image = ImageBuilder::new();
    let tables_ref = image.add_leaf();
    #[allow(clippy::cast_possible_wrap)]
    let top_ref = image.add_node(&node::encode_int_node(
        &[30, tables_ref as i64, tagged(48)],
        true,
        1,
    ));
    let err = Group::from_buffer(image.finish(top_ref)).unwrap_err();
    assert!(matches!(err, TuskError::InvalidDatabase { .. }));

    // Tables ref beyond the logical file size.
    let mut image = ImageBuilder::new();
    let names_ref = image.add_leaf();
    #[allow(clippy::cast_possible_wrap)]
    let top_ref = image.add_node(&node::encode_int_node(
        &[names_ref as i64, 1 << 30, tagged(48)],
        true,
        1,
    ));
    let err = Group::from_buffer(image.finish(top_ref)).unwrap_err();
    assert!(matches!(err, TuskError::InvalidDatabase { .. }));

    // Null table-names ref.
    let mut image = ImageBuilder::new();
    let tables_ref = image.add_leaf();
    #[allow(clippy::cast_possible_wrap)]
    let top_ref = image.add_node(&node::encode_int_node(
        &[0, tables_ref as i64, tagged(48)],
        true,
        1,
    ));
    let err = Group::from_buffer(image.finish(top_ref)).unwrap_err();
    assert!(matches!(err, TuskError::InvalidDatabase { .. }));
}

// ---------------------------------------------------------------------------
// Advancement
// ---------------------------------------------------------------------------

#[test]
fn advance_convergence_equals_fresh_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adv.tusk");

    let mut writer = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
    {
        let mut t = writer.add_table("base", true).unwrap();
        t.add_column(ColumnType::Int, "x").unwrap();
        t.add_empty_rows(2).unwrap();
    }
    writer.commit().unwrap();

    let mut reader = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
    reader.get_table(0).unwrap();

    writer.set_replication(Some(TransactLogEncoder::new()));
    {
        let mut t = writer.get_table(0).unwrap();
        t.set_int(0, 0, -5).unwrap();
        t.add_column(ColumnType::Bool, "flag").unwrap();
        t.set_bool(1, 1, true).unwrap();
        t.erase_rows(0, 1, true).unwrap();
    }
    {
        let mut u = writer.add_table("extra", true).unwrap();
        u.add_column(ColumnType::String, "s").unwrap();
        u.add_empty_row().unwrap();
        u.set_string(0, 0, "log-borne").unwrap();
    }
    writer.commit().unwrap();

    let log = writer.take_transact_log().unwrap();
    let new_size = std::fs::metadata(&path).unwrap().len();
    // The committed top-ref is where a fresh open lands.
    let fresh = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
    let new_top_ref = {
        // Read the published top-ref straight from the header.
        let bytes = std::fs::read(&path).unwrap();
        FileHeader::from_bytes(&bytes).unwrap().active_top_ref()
    };

    reader.advance_transact(new_top_ref, new_size, &log).unwrap();
    assert!(reader == fresh);
    assert!(reader == writer);
    reader.verify().unwrap();

    let mut t = reader.get_table(0).unwrap();
    assert_eq!(t.size().unwrap(), 1);
    assert!(t.get_bool(1, 0).unwrap());
}

// ---------------------------------------------------------------------------
// Name <-> index bijection under random mutation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum RegistryOp {
    Insert(usize, u8),
    Remove(usize),
    Rename(usize, u8),
}

fn registry_op_strategy() -> impl Strategy<Value = RegistryOp> {
    prop_oneof![
        (any::<usize>(), any::<u8>()).prop_map(|(at, tag)| RegistryOp::Insert(at, tag)),
        any::<usize>().prop_map(RegistryOp::Remove),
        (any::<usize>(), any::<u8>()).prop_map(|(at, tag)| RegistryOp::Rename(at, tag)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_name_index_bijection(ops in proptest::collection::vec(registry_op_strategy(), 1..24)) {
        let mut group = Group::new().unwrap();
        let mut next_unique = 0u32;

        for op in ops {
            let n = group.size();
            match op {
                RegistryOp::Insert(at, _) => {
                    let name = format!("table_{next_unique}");
                    next_unique += 1;
                    group.insert_table(at % (n + 1), &name, true).unwrap();
                }
                RegistryOp::Remove(at) => {
                    if n > 0 {
                        group.remove_table(at % n).unwrap();
                    }
                }
                RegistryOp::Rename(at, _) => {
                    if n > 0 {
                        let name = format!("renamed_{next_unique}");
                        next_unique += 1;
                        group.rename_table(at % n, &name, true).unwrap();
                    }
                }
            }

            // Bijection: every index's name resolves back to the index.
            for i in 0..group.size() {
                let name = group.get_table_name(i).unwrap();
                prop_assert!(group.has_table(&name));
                prop_assert_eq!(group.find_table(&name), Some(i));
            }
            group.verify().unwrap();
        }
    }
}
