//! Top-array codec: slot layout, shape validation, history metadata.
//!
//! The top array roots every snapshot. Slot meanings by position:
//!
//! | Slot | Kind   | Meaning                    | Present when size >= |
//! |------|--------|----------------------------|----------------------|
//! | 0    | ref    | table-names array          | 3                    |
//! | 1    | ref    | tables array               | 3                    |
//! | 2    | tagged | logical file size          | 3                    |
//! | 3    | ref    | free-list positions        | 5                    |
//! | 4    | ref    | free-list lengths          | 5                    |
//! | 5    | ref    | free-list versions         | 7 (may be null)      |
//! | 6    | tagged | transaction version        | 7                    |
//! | 7    | tagged | history type               | 10                   |
//! | 8    | ref    | history root               | 10                   |
//! | 9    | tagged | history schema version     | 10                   |

use std::path::Path;

use tusk_alloc::{node, Array, SlabAlloc};
use tusk_error::{Result, TuskError};

/// Slot indices of the top array.
pub(crate) mod slot {
    pub const TABLE_NAMES: usize = 0;
    pub const TABLES: usize = 1;
    pub const LOGICAL_SIZE: usize = 2;
    pub const FREE_POSITIONS: usize = 3;
    pub const FREE_SIZES: usize = 4;
    pub const FREE_VERSIONS: usize = 5;
    pub const VERSION: usize = 6;
    pub const HISTORY_TYPE: usize = 7;
    pub const HISTORY_REF: usize = 8;
    pub const HISTORY_VERSION: usize = 9;
}

/// The only sizes a top array may legally have. Size 9 is a legacy
/// intermediate; the format upgrade appends a history schema version to
/// reach 10.
pub const LEGAL_TOP_SIZES: [usize; 5] = [3, 5, 7, 9, 10];

/// Kind of history attached to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum HistoryType {
    None = 0,
    /// Local (in-file) continuous history.
    Local = 1,
    SyncClient = 2,
    SyncServer = 3,
}

impl HistoryType {
    pub fn from_code(code: i64) -> Result<Self> {
        Ok(match code {
            0 => Self::None,
            1 => Self::Local,
            2 => Self::SyncClient,
            3 => Self::SyncServer,
            other => {
                return Err(TuskError::corrupt(format!(
                    "invalid history type {other}"
                )))
            }
        })
    }

    #[must_use]
    pub const fn code(self) -> i64 {
        self as i64
    }

    /// Only sync history survives a compact rewrite to a new file.
    #[must_use]
    pub const fn is_sync(self) -> bool {
        matches!(self, Self::SyncClient | Self::SyncServer)
    }
}

/// Validate the decoded top array of a snapshot.
///
/// Rejects any size outside [`LEGAL_TOP_SIZES`], a logical file size
/// beyond the physical baseline, and child refs in slots 0 and 1 that are
/// null, misaligned, or outside the logical file.
pub(crate) fn validate_top_array(top: &Array, alloc: &SlabAlloc, path: &Path) -> Result<()> {
    let top_size = top.size(alloc)?;
    let top_ref = top.get_ref();

    if !LEGAL_TOP_SIZES.contains(&top_size) {
        return Err(TuskError::invalid_database(
            format!("Invalid top array (ref: {top_ref}, size: {top_size})"),
            path,
        ));
    }

    let table_names_ref = top.get_rt(alloc, slot::TABLE_NAMES)?.get_as_ref();
    let tables_ref = top.get_rt(alloc, slot::TABLES)?.get_as_ref();
    let logical_file_size = top.get_rt(alloc, slot::LOGICAL_SIZE)?.get_as_int();
    let logical_file_size =
        u64::try_from(logical_file_size).unwrap_or(0);

    // The logical file size must never exceed the physical size, and the
    // first two entries must be valid refs pointing inside the file.
    let file_size = alloc.get_baseline();
    if logical_file_size > file_size
        || table_names_ref == 0
        || table_names_ref > logical_file_size
        || table_names_ref % 8 != 0
        || tables_ref == 0
        || tables_ref > logical_file_size
        || tables_ref % 8 != 0
    {
        return Err(TuskError::invalid_database(
            format!(
                "Invalid top array (ref, [0], [1], [2]): {top_ref}, {table_names_ref}, \
                 {tables_ref}, {logical_file_size}"
            ),
            path,
        ));
    }
    Ok(())
}

/// Read the persisted free-list position/length arrays (slots 3 and 4)
/// into `(ref, size)` pairs.
pub(crate) fn read_free_lists(top: &Array, alloc: &SlabAlloc) -> Result<Vec<(u64, u64)>> {
    if top.size(alloc)? < 5 {
        return Ok(Vec::new());
    }
    let pos_ref = top.get_rt(alloc, slot::FREE_POSITIONS)?.get_as_ref();
    let len_ref = top.get_rt(alloc, slot::FREE_SIZES)?.get_as_ref();
    if pos_ref == 0 || len_ref == 0 {
        return Ok(Vec::new());
    }
    let positions = Array::from_ref(pos_ref).values(alloc)?;
    let lengths = Array::from_ref(len_ref).values(alloc)?;
    if positions.len() != lengths.len() {
        return Err(TuskError::corrupt(
            "free-list position/length arrays differ in size",
        ));
    }
    positions
        .into_iter()
        .zip(lengths)
        .map(|(p, l)| {
            let p = u64::try_from(p).map_err(|_| TuskError::corrupt("negative free position"))?;
            let l = u64::try_from(l).map_err(|_| TuskError::corrupt("negative free length"))?;
            Ok((p, l))
        })
        .collect()
}

/// Byte size of the subtree below `ref_`, or 0 for a null ref.
pub(crate) fn size_of_tree_from_ref(alloc: &SlabAlloc, ref_: u64) -> Result<u64> {
    if ref_ == 0 {
        return Ok(0);
    }
    let mut total = 0;
    node::report_node_memory(alloc, ref_, &mut |_, size| total += size)?;
    Ok(total)
}
