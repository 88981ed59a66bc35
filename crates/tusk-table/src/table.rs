//! The table accessor.
//!
//! A `Table` mirrors one per-table tree: the table top, its spec, and the
//! per-column roots. The accessor is owned by the group's accessor cache;
//! it carries no back-pointers: inter-table link relations are resolved
//! through the group by table index, and the group re-publishes
//! `ndx_in_parent` on every refresh.

use smallvec::SmallVec;
use tracing::debug;
use tusk_alloc::node::{self, create_blob, read_blob};
use tusk_alloc::{Array, RefOrTagged, SlabAlloc};
use tusk_error::{Result, TuskError};

use crate::spec::{ColumnInfo, ColumnType, Spec};

const SLOT_SPEC: usize = 0;
const SLOT_COLUMNS: usize = 1;
const SLOT_ROW_COUNT: usize = 2;

/// In-memory accessor for one table.
#[derive(Debug, Default)]
pub struct Table {
    top: Array,
    spec: Spec,
    columns: Array,
    /// Column accessor slots, positionally aligned with the spec. `None`
    /// marks a slot whose accessor has not been (re)built yet.
    cols: SmallVec<[Option<ColumnType>; 8]>,
    ndx_in_parent: usize,
    marked: bool,
    complete: bool,
    version: u64,
}

impl Table {
    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Create the persistent tree of an empty table and return its top
    /// ref. No accessor is created.
    pub fn create_empty(alloc: &mut SlabAlloc) -> Result<u64> {
        let spec = Spec::create(alloc)?;
        let columns = Array::create(alloc, true)?;
        let mut top = Array::create(alloc, true)?;
        top.add_rt(alloc, RefOrTagged::make_ref(spec.top_ref()))?;
        top.add_rt(alloc, RefOrTagged::make_ref(columns.get_ref()))?;
        top.add_rt(alloc, RefOrTagged::make_tagged(0))?;
        Ok(top.get_ref())
    }

    /// Step 1 of the accessor-construction protocol: an accessor bound to
    /// the tree but with no column accessors yet.
    pub fn create_incomplete(alloc: &SlabAlloc, top_ref: u64, ndx_in_parent: usize) -> Result<Self> {
        let mut table = Self {
            ndx_in_parent,
            ..Self::default()
        };
        table.bind(alloc, top_ref)?;
        Ok(table)
    }

    fn bind(&mut self, alloc: &SlabAlloc, top_ref: u64) -> Result<()> {
        self.top.init_from_ref(top_ref);
        if self.top.size(alloc)? != 3 {
            return Err(TuskError::corrupt(format!(
                "table top at ref {top_ref} has wrong shape"
            )));
        }
        self.spec
            .init_from_ref(alloc, self.top.get_as_ref(alloc, SLOT_SPEC)?)?;
        self.columns
            .init_from_ref(self.top.get_as_ref(alloc, SLOT_COLUMNS)?);
        Ok(())
    }

    /// Step 4 of the accessor-construction protocol: build the column
    /// accessor slots.
    pub fn complete_accessor(&mut self, alloc: &SlabAlloc) -> Result<()> {
        let n = self.spec.column_count(alloc)?;
        self.cols.clear();
        for col in 0..n {
            self.cols.push(Some(self.spec.column_type(alloc, col)?));
        }
        self.complete = true;
        Ok(())
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn detach(&mut self) {
        self.top.detach();
        self.spec.detach();
        self.columns.detach();
        self.cols.clear();
        self.complete = false;
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.top.is_attached()
    }

    #[must_use]
    pub fn top_ref(&self) -> u64 {
        self.top.get_ref()
    }

    // -----------------------------------------------------------------------
    // Dirty marking and refresh
    // -----------------------------------------------------------------------

    pub fn mark(&mut self) {
        self.marked = true;
    }

    pub fn unmark(&mut self) {
        self.marked = false;
    }

    #[must_use]
    pub fn is_marked(&self) -> bool {
        self.marked
    }

    /// Mark this accessor and all subordinate accessors. There are no
    /// subtable accessors in this engine, so this coincides with `mark`.
    pub fn recursive_mark(&mut self) {
        self.mark();
    }

    #[must_use]
    pub fn ndx_in_parent(&self) -> usize {
        self.ndx_in_parent
    }

    pub fn set_ndx_in_parent(&mut self, ndx: usize) {
        self.ndx_in_parent = ndx;
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Rebind after a commit: the parent slot may name a relocated tree.
    pub fn update_from_parent(&mut self, alloc: &SlabAlloc, new_top_ref: u64) -> Result<()> {
        self.bind(alloc, new_top_ref)
    }

    /// Rebuild the accessor from the underlying node structure and clear
    /// the dirty mark.
    pub fn refresh_accessor_tree(&mut self, alloc: &SlabAlloc, top_ref: u64) -> Result<()> {
        self.bind(alloc, top_ref)?;
        if self.complete {
            self.complete_accessor(alloc)?;
        }
        self.unmark();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Structural adjustments driven by the transact advancer
    // -----------------------------------------------------------------------

    /// Insert a null column-accessor slot so positional indices line up;
    /// the real accessor is rebuilt during the final refresh.
    pub fn adj_insert_column(&mut self, col_ndx: usize) {
        if self.complete {
            let at = col_ndx.min(self.cols.len());
            self.cols.insert(at, None);
        }
    }

    pub fn adj_erase_column(&mut self, col_ndx: usize) {
        if self.complete && col_ndx < self.cols.len() {
            self.cols.remove(col_ndx);
        }
    }

    /// Number of column accessor slots (for advancer bookkeeping).
    #[must_use]
    pub fn accessor_column_count(&self) -> usize {
        self.cols.len()
    }

    // -----------------------------------------------------------------------
    // Schema access
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    /// Mutable spec access for group-level renumbering. The caller must
    /// follow up with [`Self::publish_after_spec_change`].
    pub fn spec_mut(&mut self) -> &mut Spec {
        &mut self.spec
    }

    /// Re-publish a relocated spec into the table top after external spec
    /// mutation.
    pub fn publish_after_spec_change(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.publish(alloc)
    }

    pub fn column_count(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.spec.public_column_count(alloc)
    }

    pub fn total_column_count(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.spec.column_count(alloc)
    }

    pub fn column_type(&self, alloc: &SlabAlloc, col_ndx: usize) -> Result<ColumnType> {
        self.spec.column_type(alloc, col_ndx)
    }

    pub fn column_name(&self, alloc: &SlabAlloc, col_ndx: usize) -> Result<String> {
        self.spec.column_name(alloc, col_ndx)
    }

    pub fn find_column(&self, alloc: &SlabAlloc, name: &str) -> Result<Option<usize>> {
        self.spec.find_column(alloc, name)
    }

    /// Opposite-table indices of every link-carrying column, with types.
    pub fn link_columns(&self, alloc: &SlabAlloc) -> Result<Vec<(usize, ColumnType, usize)>> {
        let mut out = Vec::new();
        let n = self.spec.column_count(alloc)?;
        for col in 0..n {
            let ty = self.spec.column_type(alloc, col)?;
            if ty.has_opposite_table() {
                out.push((col, ty, self.spec.opposite_table_ndx(alloc, col)?));
            }
        }
        Ok(out)
    }

    /// Whether this table (at group index `own_ndx`) is the target of a
    /// link column in another table.
    pub fn is_cross_table_link_target(&self, alloc: &SlabAlloc, own_ndx: usize) -> Result<bool> {
        let n = self.spec.column_count(alloc)?;
        for col in 0..n {
            if self.spec.column_type(alloc, col)? == ColumnType::BackLink
                && self.spec.opposite_table_ndx(alloc, col)? != own_ndx
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Schema mutation (invoked through the group, which owns replication
    // and parent-ref publication)
    // -----------------------------------------------------------------------

    fn publish(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.top.publish_child(alloc, SLOT_SPEC, self.spec.top_ref())?;
        self.top
            .publish_child(alloc, SLOT_COLUMNS, self.columns.get_ref())?;
        Ok(())
    }

    fn default_column_root(
        alloc: &mut SlabAlloc,
        ty: ColumnType,
        row_count: usize,
    ) -> Result<u64> {
        let root = if ty == ColumnType::String {
            let mut list = tusk_alloc::StringList::create(alloc)?;
            for _ in 0..row_count {
                list.add(alloc, "")?;
            }
            list.get_ref()
        } else {
            let mut leaf = Array::create(alloc, ty.is_ref_backed())?;
            for _ in 0..row_count {
                leaf.add(alloc, 0)?;
            }
            leaf.get_ref()
        };
        Ok(root)
    }

    /// Insert a column at an absolute spec position. Pre-existing rows get
    /// default values.
    pub fn insert_column_inner(
        &mut self,
        alloc: &mut SlabAlloc,
        col_ndx: usize,
        info: &ColumnInfo,
    ) -> Result<()> {
        let row_count = self.row_count(alloc)?;
        let root = Self::default_column_root(alloc, info.ty, row_count)?;
        self.spec.insert_column(alloc, col_ndx, info)?;
        #[allow(clippy::cast_possible_wrap)]
        self.columns.insert(alloc, col_ndx, root as i64)?;
        if self.complete {
            self.cols.insert(col_ndx.min(self.cols.len()), Some(info.ty));
        }
        self.publish(alloc)?;
        debug!(
            table = self.ndx_in_parent,
            col_ndx,
            ty = info.ty.name(),
            name = %info.name,
            "inserted column"
        );
        Ok(())
    }

    /// Remove a column at an absolute spec position and destroy its data.
    pub fn erase_column_inner(&mut self, alloc: &mut SlabAlloc, col_ndx: usize) -> Result<()> {
        let root = self.columns.get_as_ref(alloc, col_ndx)?;
        if root != 0 {
            node::destroy_node_deep(alloc, root)?;
        }
        self.spec.erase_column(alloc, col_ndx)?;
        self.columns.erase(alloc, col_ndx)?;
        if self.complete && col_ndx < self.cols.len() {
            self.cols.remove(col_ndx);
        }
        self.publish(alloc)
    }

    // -----------------------------------------------------------------------
    // Rows
    // -----------------------------------------------------------------------

    pub fn row_count(&self, alloc: &SlabAlloc) -> Result<usize> {
        let tagged = self.top.get_rt(alloc, SLOT_ROW_COUNT)?.get_as_int();
        usize::try_from(tagged).map_err(|_| TuskError::corrupt("negative row count"))
    }

    /// Alias matching the public surface.
    pub fn size(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.row_count(alloc)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn set_row_count(&mut self, alloc: &mut SlabAlloc, n: usize) -> Result<()> {
        self.top
            .set_rt(alloc, SLOT_ROW_COUNT, RefOrTagged::make_tagged(n as i64))?;
        Ok(())
    }

    /// Insert `num_rows` empty rows at `row_ndx`.
    pub fn insert_rows_inner(
        &mut self,
        alloc: &mut SlabAlloc,
        row_ndx: usize,
        num_rows: usize,
    ) -> Result<()> {
        let row_count = self.row_count(alloc)?;
        if row_ndx > row_count {
            return Err(TuskError::corrupt(format!(
                "row insert at {row_ndx} out of bounds (size {row_count})"
            )));
        }
        let n = self.spec.column_count(alloc)?;
        for col in 0..n {
            let ty = self.spec.column_type(alloc, col)?;
            if ty == ColumnType::String {
                let mut list =
                    tusk_alloc::StringList::from_ref(self.columns.get_as_ref(alloc, col)?);
                for _ in 0..num_rows {
                    list.insert(alloc, row_ndx, "")?;
                }
                self.columns.publish_child(alloc, col, list.get_ref())?;
            } else {
                let mut leaf = Array::from_ref(self.columns.get_as_ref(alloc, col)?);
                for _ in 0..num_rows {
                    leaf.insert(alloc, row_ndx, 0)?;
                }
                self.columns.publish_child(alloc, col, leaf.get_ref())?;
            }
        }
        self.set_row_count(alloc, row_count + num_rows)?;
        self.publish(alloc)
    }

    pub fn add_empty_rows(&mut self, alloc: &mut SlabAlloc, num_rows: usize) -> Result<usize> {
        let row_count = self.row_count(alloc)?;
        self.insert_rows_inner(alloc, row_count, num_rows)?;
        Ok(row_count)
    }

    fn destroy_ref_cell(&mut self, alloc: &mut SlabAlloc, col: usize, row: usize) -> Result<()> {
        let mut leaf = Array::from_ref(self.columns.get_as_ref(alloc, col)?);
        let child = leaf.get_as_ref(alloc, row)?;
        if child != 0 {
            node::destroy_node_deep(alloc, child)?;
            leaf.set(alloc, row, 0)?;
            self.columns.publish_child(alloc, col, leaf.get_ref())?;
        }
        Ok(())
    }

    /// Erase one row, shifting successors down (ordered erase).
    pub fn erase_row_inner(&mut self, alloc: &mut SlabAlloc, row_ndx: usize) -> Result<()> {
        let row_count = self.row_count(alloc)?;
        if row_ndx >= row_count {
            return Err(TuskError::corrupt(format!(
                "row erase at {row_ndx} out of bounds (size {row_count})"
            )));
        }
        let n = self.spec.column_count(alloc)?;
        for col in 0..n {
            let ty = self.spec.column_type(alloc, col)?;
            if ty == ColumnType::String {
                let mut list =
                    tusk_alloc::StringList::from_ref(self.columns.get_as_ref(alloc, col)?);
                list.erase(alloc, row_ndx)?;
                self.columns.publish_child(alloc, col, list.get_ref())?;
            } else {
                if ty.is_ref_backed() {
                    self.destroy_ref_cell(alloc, col, row_ndx)?;
                }
                let mut leaf = Array::from_ref(self.columns.get_as_ref(alloc, col)?);
                leaf.erase(alloc, row_ndx)?;
                self.columns.publish_child(alloc, col, leaf.get_ref())?;
            }
        }
        self.set_row_count(alloc, row_count - 1)?;
        self.publish(alloc)
    }

    /// Erase one row by moving the last row over it (unordered erase).
    pub fn move_last_over_inner(&mut self, alloc: &mut SlabAlloc, row_ndx: usize) -> Result<()> {
        let row_count = self.row_count(alloc)?;
        if row_ndx >= row_count {
            return Err(TuskError::corrupt(format!(
                "move-last-over at {row_ndx} out of bounds (size {row_count})"
            )));
        }
        let last = row_count - 1;
        if row_ndx == last {
            return self.erase_row_inner(alloc, row_ndx);
        }
        let n = self.spec.column_count(alloc)?;
        for col in 0..n {
            let ty = self.spec.column_type(alloc, col)?;
            if ty == ColumnType::String {
                let mut list =
                    tusk_alloc::StringList::from_ref(self.columns.get_as_ref(alloc, col)?);
                let moved = list.get(alloc, last)?;
                list.set(alloc, row_ndx, &moved)?;
                list.erase(alloc, last)?;
                self.columns.publish_child(alloc, col, list.get_ref())?;
            } else {
                if ty.is_ref_backed() {
                    self.destroy_ref_cell(alloc, col, row_ndx)?;
                }
                let mut leaf = Array::from_ref(self.columns.get_as_ref(alloc, col)?);
                let moved = leaf.get(alloc, last)?;
                leaf.set(alloc, row_ndx, moved)?;
                leaf.erase(alloc, last)?;
                self.columns.publish_child(alloc, col, leaf.get_ref())?;
            }
        }
        self.set_row_count(alloc, row_count - 1)?;
        self.publish(alloc)
    }

    /// Remove every row.
    pub fn clear_inner(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        let n = self.spec.column_count(alloc)?;
        let row_count = self.row_count(alloc)?;
        for col in 0..n {
            let ty = self.spec.column_type(alloc, col)?;
            if ty.is_ref_backed() {
                for row in 0..row_count {
                    self.destroy_ref_cell(alloc, col, row)?;
                }
            }
            if ty == ColumnType::String {
                let mut list =
                    tusk_alloc::StringList::from_ref(self.columns.get_as_ref(alloc, col)?);
                list.truncate(alloc, 0)?;
                self.columns.publish_child(alloc, col, list.get_ref())?;
            } else {
                let mut leaf = Array::from_ref(self.columns.get_as_ref(alloc, col)?);
                leaf.truncate(alloc, 0)?;
                self.columns.publish_child(alloc, col, leaf.get_ref())?;
            }
        }
        self.set_row_count(alloc, 0)?;
        self.publish(alloc)
    }

    // -----------------------------------------------------------------------
    // Typed cell access
    // -----------------------------------------------------------------------

    fn check_type(&self, alloc: &SlabAlloc, col: usize, expected: ColumnType) -> Result<()> {
        let actual = self.spec.column_type(alloc, col)?;
        if actual != expected {
            return Err(TuskError::TypeMismatch {
                expected: expected.name(),
                actual: actual.name(),
            });
        }
        Ok(())
    }

    fn int_cell(&self, alloc: &SlabAlloc, col: usize, row: usize) -> Result<i64> {
        let leaf = Array::from_ref(self.columns.get_as_ref(alloc, col)?);
        leaf.get(alloc, row)
    }

    fn set_int_cell(
        &mut self,
        alloc: &mut SlabAlloc,
        col: usize,
        row: usize,
        value: i64,
    ) -> Result<()> {
        let mut leaf = Array::from_ref(self.columns.get_as_ref(alloc, col)?);
        leaf.set(alloc, row, value)?;
        self.columns.publish_child(alloc, col, leaf.get_ref())?;
        self.publish(alloc)
    }

    pub fn get_int(&self, alloc: &SlabAlloc, col: usize, row: usize) -> Result<i64> {
        self.check_type(alloc, col, ColumnType::Int)?;
        self.int_cell(alloc, col, row)
    }

    pub fn set_int(&mut self, alloc: &mut SlabAlloc, col: usize, row: usize, value: i64) -> Result<()> {
        self.check_type(alloc, col, ColumnType::Int)?;
        self.set_int_cell(alloc, col, row, value)
    }

    pub fn get_bool(&self, alloc: &SlabAlloc, col: usize, row: usize) -> Result<bool> {
        self.check_type(alloc, col, ColumnType::Bool)?;
        Ok(self.int_cell(alloc, col, row)? != 0)
    }

    pub fn set_bool(&mut self, alloc: &mut SlabAlloc, col: usize, row: usize, value: bool) -> Result<()> {
        self.check_type(alloc, col, ColumnType::Bool)?;
        self.set_int_cell(alloc, col, row, i64::from(value))
    }

    pub fn get_timestamp(&self, alloc: &SlabAlloc, col: usize, row: usize) -> Result<i64> {
        self.check_type(alloc, col, ColumnType::Timestamp)?;
        self.int_cell(alloc, col, row)
    }

    pub fn set_timestamp(
        &mut self,
        alloc: &mut SlabAlloc,
        col: usize,
        row: usize,
        seconds: i64,
    ) -> Result<()> {
        self.check_type(alloc, col, ColumnType::Timestamp)?;
        self.set_int_cell(alloc, col, row, seconds)
    }

    pub fn get_olddatetime(&self, alloc: &SlabAlloc, col: usize, row: usize) -> Result<i64> {
        self.check_type(alloc, col, ColumnType::OldDateTime)?;
        self.int_cell(alloc, col, row)
    }

    pub fn set_olddatetime(
        &mut self,
        alloc: &mut SlabAlloc,
        col: usize,
        row: usize,
        value: i64,
    ) -> Result<()> {
        self.check_type(alloc, col, ColumnType::OldDateTime)?;
        self.set_int_cell(alloc, col, row, value)
    }

    pub fn get_double(&self, alloc: &SlabAlloc, col: usize, row: usize) -> Result<f64> {
        self.check_type(alloc, col, ColumnType::Double)?;
        #[allow(clippy::cast_sign_loss)]
        Ok(f64::from_bits(self.int_cell(alloc, col, row)? as u64))
    }

    pub fn set_double(
        &mut self,
        alloc: &mut SlabAlloc,
        col: usize,
        row: usize,
        value: f64,
    ) -> Result<()> {
        self.check_type(alloc, col, ColumnType::Double)?;
        #[allow(clippy::cast_possible_wrap)]
        self.set_int_cell(alloc, col, row, value.to_bits() as i64)
    }

    pub fn get_float(&self, alloc: &SlabAlloc, col: usize, row: usize) -> Result<f32> {
        self.check_type(alloc, col, ColumnType::Float)?;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        Ok(f32::from_bits(self.int_cell(alloc, col, row)? as u32))
    }

    pub fn set_float(
        &mut self,
        alloc: &mut SlabAlloc,
        col: usize,
        row: usize,
        value: f32,
    ) -> Result<()> {
        self.check_type(alloc, col, ColumnType::Float)?;
        self.set_int_cell(alloc, col, row, i64::from(value.to_bits()))
    }

    pub fn get_string(&self, alloc: &SlabAlloc, col: usize, row: usize) -> Result<String> {
        self.check_type(alloc, col, ColumnType::String)?;
        let list = tusk_alloc::StringList::from_ref(self.columns.get_as_ref(alloc, col)?);
        list.get(alloc, row)
    }

    pub fn set_string(
        &mut self,
        alloc: &mut SlabAlloc,
        col: usize,
        row: usize,
        value: &str,
    ) -> Result<()> {
        self.check_type(alloc, col, ColumnType::String)?;
        let mut list = tusk_alloc::StringList::from_ref(self.columns.get_as_ref(alloc, col)?);
        list.set(alloc, row, value)?;
        self.columns.publish_child(alloc, col, list.get_ref())?;
        self.publish(alloc)
    }

    pub fn get_binary(&self, alloc: &SlabAlloc, col: usize, row: usize) -> Result<Option<Vec<u8>>> {
        self.check_type(alloc, col, ColumnType::Binary)?;
        let leaf = Array::from_ref(self.columns.get_as_ref(alloc, col)?);
        let blob_ref = leaf.get_as_ref(alloc, row)?;
        if blob_ref == 0 {
            return Ok(None);
        }
        read_blob(alloc, blob_ref).map(Some)
    }

    pub fn set_binary(
        &mut self,
        alloc: &mut SlabAlloc,
        col: usize,
        row: usize,
        value: &[u8],
    ) -> Result<()> {
        self.check_type(alloc, col, ColumnType::Binary)?;
        self.destroy_ref_cell(alloc, col, row)?;
        let blob_ref = create_blob(alloc, value)?;
        let mut leaf = Array::from_ref(self.columns.get_as_ref(alloc, col)?);
        #[allow(clippy::cast_possible_wrap)]
        leaf.set(alloc, row, blob_ref as i64)?;
        self.columns.publish_child(alloc, col, leaf.get_ref())?;
        self.publish(alloc)
    }

    /// Link target row, or `None` for a null link.
    pub fn get_link(&self, alloc: &SlabAlloc, col: usize, row: usize) -> Result<Option<usize>> {
        self.check_type(alloc, col, ColumnType::Link)?;
        let stored = self.int_cell(alloc, col, row)?;
        let stored = usize::try_from(stored).map_err(|_| TuskError::corrupt("negative link"))?;
        Ok(stored.checked_sub(1))
    }

    /// Set or clear a link; the stored value is `target_row + 1`.
    pub fn set_link(
        &mut self,
        alloc: &mut SlabAlloc,
        col: usize,
        row: usize,
        target_row: Option<usize>,
    ) -> Result<()> {
        self.check_type(alloc, col, ColumnType::Link)?;
        #[allow(clippy::cast_possible_wrap)]
        let stored = target_row.map_or(0, |t| t as i64 + 1);
        self.set_int_cell(alloc, col, row, stored)
    }

    /// Target rows of a link-list cell.
    pub fn get_link_list(&self, alloc: &SlabAlloc, col: usize, row: usize) -> Result<Vec<usize>> {
        self.check_type(alloc, col, ColumnType::LinkList)?;
        let leaf = Array::from_ref(self.columns.get_as_ref(alloc, col)?);
        let list_ref = leaf.get_as_ref(alloc, row)?;
        if list_ref == 0 {
            return Ok(Vec::new());
        }
        let list = Array::from_ref(list_ref);
        list.values(alloc)?
            .into_iter()
            .map(|v| usize::try_from(v).map_err(|_| TuskError::corrupt("negative link target")))
            .collect()
    }

    /// Append a target row to a link-list cell, creating the list node on
    /// first use.
    pub fn link_list_add(
        &mut self,
        alloc: &mut SlabAlloc,
        col: usize,
        row: usize,
        target_row: usize,
    ) -> Result<()> {
        self.check_type(alloc, col, ColumnType::LinkList)?;
        let mut leaf = Array::from_ref(self.columns.get_as_ref(alloc, col)?);
        let list_ref = leaf.get_as_ref(alloc, row)?;
        let mut list = if list_ref == 0 {
            Array::create(alloc, false)?
        } else {
            Array::from_ref(list_ref)
        };
        #[allow(clippy::cast_possible_wrap)]
        list.add(alloc, target_row as i64)?;
        #[allow(clippy::cast_possible_wrap)]
        leaf.set(alloc, row, list.get_ref() as i64)?;
        self.columns.publish_child(alloc, col, leaf.get_ref())?;
        self.publish(alloc)
    }

    // -----------------------------------------------------------------------
    // Upgrades
    // -----------------------------------------------------------------------

    /// Convert every legacy datetime column to a timestamp column. The
    /// stored seconds are reinterpreted in place.
    pub fn upgrade_olddatetime(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        let n = self.spec.column_count(alloc)?;
        for col in 0..n {
            if self.spec.column_type(alloc, col)? == ColumnType::OldDateTime {
                self.spec.set_column_type(alloc, col, ColumnType::Timestamp)?;
                if self.complete {
                    self.cols[col] = Some(ColumnType::Timestamp);
                }
                debug!(table = self.ndx_in_parent, col, "upgraded olddatetime column");
            }
        }
        self.publish(alloc)
    }

    /// Rebuild search indices after a format change. Index payloads live
    /// outside this layer; only the attribute bookkeeping is touched.
    pub fn rebuild_search_index(&mut self, alloc: &mut SlabAlloc, from_version: u8) -> Result<()> {
        let n = self.spec.column_count(alloc)?;
        for col in 0..n {
            let attr = self.spec.column_attr(alloc, col)?;
            if attr.is_indexed() {
                self.spec.set_column_attr(alloc, col, attr)?;
                debug!(
                    table = self.ndx_in_parent,
                    col, from_version, "rebuilt string index"
                );
            }
        }
        self.publish(alloc)
    }

    // -----------------------------------------------------------------------
    // Equality and consistency
    // -----------------------------------------------------------------------

    /// Observational equality: same user-visible schema and same cell
    /// values, column by column.
    pub fn eq_table(
        &self,
        alloc: &SlabAlloc,
        other: &Self,
        other_alloc: &SlabAlloc,
    ) -> Result<bool> {
        if !self.spec.eq_public(alloc, &other.spec, other_alloc)? {
            return Ok(false);
        }
        let rows = self.row_count(alloc)?;
        if rows != other.row_count(other_alloc)? {
            return Ok(false);
        }
        let n = self.spec.public_column_count(alloc)?;
        for col in 0..n {
            let ty = self.spec.column_type(alloc, col)?;
            match ty {
                ColumnType::String => {
                    let a = tusk_alloc::StringList::from_ref(self.columns.get_as_ref(alloc, col)?);
                    let b = tusk_alloc::StringList::from_ref(
                        other.columns.get_as_ref(other_alloc, col)?,
                    );
                    if a.values(alloc)? != b.values(other_alloc)? {
                        return Ok(false);
                    }
                }
                ColumnType::Binary => {
                    for row in 0..rows {
                        if self.get_binary(alloc, col, row)?
                            != other.get_binary(other_alloc, col, row)?
                        {
                            return Ok(false);
                        }
                    }
                }
                ColumnType::LinkList => {
                    for row in 0..rows {
                        if self.get_link_list(alloc, col, row)?
                            != other.get_link_list(other_alloc, col, row)?
                        {
                            return Ok(false);
                        }
                    }
                }
                _ => {
                    let a = Array::from_ref(self.columns.get_as_ref(alloc, col)?);
                    let b = Array::from_ref(other.columns.get_as_ref(other_alloc, col)?);
                    if a.values(alloc)? != b.values(other_alloc)? {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Internal consistency checks used by the group's `verify`.
    pub fn verify(&self, alloc: &SlabAlloc) -> Result<()> {
        let n = self.spec.column_count(alloc)?;
        if self.columns.size(alloc)? != n {
            return Err(TuskError::corrupt(
                "column roots out of step with the spec",
            ));
        }
        let rows = self.row_count(alloc)?;
        let mut seen_backlink = false;
        for col in 0..n {
            let ty = self.spec.column_type(alloc, col)?;
            if ty == ColumnType::BackLink {
                seen_backlink = true;
            } else if seen_backlink {
                return Err(TuskError::corrupt(
                    "backlink columns must come after user columns",
                ));
            }
            let len = if ty == ColumnType::String {
                tusk_alloc::StringList::from_ref(self.columns.get_as_ref(alloc, col)?)
                    .size(alloc)?
            } else {
                Array::from_ref(self.columns.get_as_ref(alloc, col)?).size(alloc)?
            };
            if len != rows {
                return Err(TuskError::corrupt(format!(
                    "column {col} has {len} cells for {rows} rows"
                )));
            }
        }
        Ok(())
    }
}
