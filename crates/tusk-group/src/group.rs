//! Group state, attach/detach lifecycle, and the table registry.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;
use tusk_alloc::{node, AllocConfig, Array, RefOrTagged, SlabAlloc, StringList, FILE_HEADER_SIZE};
use tusk_error::{LogicErrorKind, Result, TuskError};
use tusk_table::spec::ColumnInfo;
use tusk_table::{ColumnAttr, ColumnType, Spec, Table, MAX_TABLE_NAME_LENGTH};
use tusk_translog::TransactLogEncoder;

use crate::top::{self, slot, validate_top_array, HistoryType};
use crate::upgrade::get_target_file_format_version_for_session;

/// How to open a database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    /// Read-write; a missing file is created.
    ReadWrite,
    /// Read-write; a missing file is an error.
    ReadWriteNoCreate,
}

/// Size-accounting selectors for
/// [`Group::compute_aggregated_byte_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeAggregateControl(pub u8);

impl SizeAggregateControl {
    pub const STATE: Self = Self(0x01);
    pub const FREELISTS: Self = Self(0x02);
    pub const HISTORY: Self = Self(0x04);
    pub const ALL: Self = Self(0x07);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

/// The root object of a database snapshot.
pub struct Group {
    pub(crate) alloc: SlabAlloc,
    pub(crate) top: Array,
    pub(crate) table_names: StringList,
    pub(crate) tables: Array,
    pub(crate) table_accessors: Vec<Option<Table>>,
    pub(crate) attached: bool,
    pub(crate) is_shared: bool,
    pub(crate) file_format_version: u8,
    pub(crate) repl: Option<TransactLogEncoder>,
    pub(crate) schema_change_listener: Option<Box<dyn FnMut()>>,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("attached", &self.attached)
            .field("is_shared", &self.is_shared)
            .field("file_format_version", &self.file_format_version)
            .field("num_tables", &self.size())
            .finish_non_exhaustive()
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::unattached()
    }
}

impl Group {
    // -----------------------------------------------------------------------
    // Construction and lifecycle
    // -----------------------------------------------------------------------

    /// A group with no attached state; use [`Self::open_path`] or
    /// [`Self::open_buffer`] to bind it.
    #[must_use]
    pub fn unattached() -> Self {
        Self {
            alloc: SlabAlloc::new(),
            top: Array::detached(),
            table_names: StringList::detached(),
            tables: Array::detached(),
            table_accessors: Vec::new(),
            attached: false,
            is_shared: false,
            file_format_version: 0,
            repl: None,
            schema_change_listener: None,
        }
    }

    /// A fresh, empty in-memory group.
    pub fn new() -> Result<Self> {
        let mut group = Self::unattached();
        group.alloc.attach_empty()?;
        group.file_format_version =
            get_target_file_format_version_for_session(0, HistoryType::None);
        group.attach(0, true)?;
        Ok(group)
    }

    /// Open a database file.
    pub fn open(path: impl AsRef<Path>, key: Option<&[u8]>, mode: OpenMode) -> Result<Self> {
        let mut group = Self::unattached();
        group.open_path(path.as_ref(), key, mode)?;
        Ok(group)
    }

    /// Open a database image held in memory.
    pub fn from_buffer(buffer: Vec<u8>) -> Result<Self> {
        let mut group = Self::unattached();
        group.open_buffer(buffer)?;
        Ok(group)
    }

    /// Bind this group to a database file. Opening an already-open group
    /// is a logic error.
    pub fn open_path(&mut self, path: &Path, key: Option<&[u8]>, mode: OpenMode) -> Result<()> {
        if self.attached || self.is_shared {
            return Err(TuskError::logic(LogicErrorKind::WrongGroupState));
        }
        if key.is_some() {
            return Err(TuskError::Unsupported("encryption"));
        }
        let cfg = AllocConfig {
            read_only: mode == OpenMode::ReadOnly,
            no_create: mode == OpenMode::ReadWriteNoCreate,
        };
        let top_ref = self.alloc.attach_file(path, cfg)?;
        self.open_from_ref(top_ref, path)
    }

    /// Bind this group to an in-memory database image.
    pub fn open_buffer(&mut self, buffer: Vec<u8>) -> Result<()> {
        if self.attached || self.is_shared {
            return Err(TuskError::logic(LogicErrorKind::WrongGroupState));
        }
        let top_ref = self.alloc.attach_buffer(buffer)?;
        self.open_from_ref(top_ref, Path::new(""))
    }

    /// Shared open body. The allocator is already attached; it is
    /// released again on any failure so the group stays unattached
    /// (scoped acquisition in place of the original's detach guard).
    fn open_from_ref(&mut self, top_ref: u64, path: &Path) -> Result<()> {
        let result = self.do_open(top_ref, path);
        if result.is_err() {
            self.top.detach();
            self.tables.detach();
            self.table_names.detach();
            self.attached = false;
            self.alloc.detach();
        }
        result
    }

    fn do_open(&mut self, top_ref: u64, path: &Path) -> Result<()> {
        let committed = self.alloc.get_committed_file_format_version();
        // A bare group can only read formats that need no upgrade; the
        // session layer is the only writer allowed to upgrade in place.
        let file_format_ok = match committed {
            0 => top_ref == 0,
            6..=9 => true,
            _ => false,
        };
        if !file_format_ok {
            return Err(TuskError::invalid_database(
                format!("Unsupported file format version {committed}"),
                path,
            ));
        }

        let target = get_target_file_format_version_for_session(committed, HistoryType::None);
        if committed == 0 {
            self.file_format_version = target;
        } else {
            // Upgrading in this mode is disallowed; the target must match.
            debug_assert_eq!(target, committed);
            self.file_format_version = committed;
        }

        // Everything beyond the attached file becomes available free
        // space.
        self.alloc.reset_free_space_tracking();

        self.attach(top_ref, true)?;
        debug!(
            path = %path.display(),
            top_ref,
            file_format = self.file_format_version,
            num_tables = self.size(),
            "opened group"
        );
        Ok(())
    }

    /// Bind the group's accessors to `top_ref`.
    ///
    /// With `top_ref == 0` and `create_when_missing`, the canonical empty
    /// tree is constructed; with `create_when_missing == false` the three
    /// child arrays stay detached (legal only inside a read transaction
    /// of the session layer). If this fails, the group is left in the
    /// unattached state.
    pub(crate) fn attach(&mut self, top_ref: u64, create_when_missing: bool) -> Result<()> {
        debug_assert!(!self.top.is_attached());

        self.tables.detach();
        self.table_names.detach();

        if top_ref != 0 {
            let bound = (|| -> Result<()> {
                self.top.init_from_ref(top_ref);
                let path = self.alloc.path().to_owned();
                validate_top_array(&self.top, &self.alloc, &path)?;
                self.table_names
                    .init_from_ref(self.top.get_as_ref(&self.alloc, slot::TABLE_NAMES)?);
                self.tables
                    .init_from_ref(self.top.get_as_ref(&self.alloc, slot::TABLES)?);
                let free = top::read_free_lists(&self.top, &self.alloc)?;
                self.alloc.set_read_only_free(free);
                Ok(())
            })();
            if let Err(err) = bound {
                self.top.detach();
                self.tables.detach();
                self.table_names.detach();
                self.attached = false;
                return Err(err);
            }
        } else if create_when_missing {
            self.create_empty_group()?;
        }

        self.attached = true;
        Ok(())
    }

    /// Construct the minimum empty tree: empty table names, empty tables,
    /// logical file size equal to the file header.
    pub(crate) fn create_empty_group(&mut self) -> Result<()> {
        self.table_names = StringList::create(&mut self.alloc)?;
        self.tables = Array::create(&mut self.alloc, true)?;
        let mut top = Array::create(&mut self.alloc, true)?;
        top.add_rt(
            &mut self.alloc,
            RefOrTagged::make_ref(self.table_names.get_ref()),
        )?;
        top.add_rt(&mut self.alloc, RefOrTagged::make_ref(self.tables.get_ref()))?;
        #[allow(clippy::cast_possible_wrap)]
        top.add_rt(
            &mut self.alloc,
            RefOrTagged::make_tagged(FILE_HEADER_SIZE as i64),
        )?;
        self.top = top;
        Ok(())
    }

    /// Detach every accessor and drop the accessor cache. Idempotent.
    pub fn detach(&mut self) {
        self.detach_table_accessors();
        self.table_accessors.clear();
        self.table_names.detach();
        self.tables.detach();
        self.top.detach();
        self.attached = false;
    }

    pub(crate) fn detach_table_accessors(&mut self) {
        for slot in &mut self.table_accessors {
            if let Some(table) = slot.as_mut() {
                table.detach();
            }
            *slot = None;
        }
    }

    /// Rebind to a new snapshot produced by the session layer.
    pub fn attach_shared(
        &mut self,
        new_top_ref: u64,
        new_file_size: u64,
        writable: bool,
    ) -> Result<()> {
        debug_assert!(new_top_ref < new_file_size);
        debug_assert!(!self.is_attached());

        self.alloc.reset_free_space_tracking();
        self.alloc.update_reader_view(new_file_size)?;

        // For a read transaction there is no node structure to attach an
        // empty group to; only a write transaction creates one.
        let create_group_when_missing = writable;
        self.attach(new_top_ref, create_group_when_missing)
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.is_shared
    }

    /// Hand ownership to a higher concurrency layer.
    pub fn set_shared(&mut self, shared: bool) {
        self.is_shared = shared;
    }

    #[must_use]
    pub fn get_file_format_version(&self) -> u8 {
        self.file_format_version
    }

    pub(crate) fn set_file_format_version(&mut self, version: u8) {
        self.file_format_version = version;
    }

    #[must_use]
    pub fn get_committed_file_format_version(&self) -> u8 {
        self.alloc.get_committed_file_format_version()
    }

    /// Logical file size recorded in the top array.
    pub fn logical_file_size(&self) -> Result<u64> {
        if !self.top.is_attached() {
            return Ok(FILE_HEADER_SIZE);
        }
        let tagged = self.top.get_rt(&self.alloc, slot::LOGICAL_SIZE)?.get_as_int();
        u64::try_from(tagged).map_err(|_| TuskError::corrupt("negative logical file size"))
    }

    /// Install the replication log collector.
    pub fn set_replication(&mut self, repl: Option<TransactLogEncoder>) {
        self.repl = repl;
    }

    /// Drain the collected transaction log, if replication is active.
    pub fn take_transact_log(&mut self) -> Option<Vec<u8>> {
        self.repl.as_mut().map(TransactLogEncoder::take_log)
    }

    /// Observer invoked after `advance_transact` replayed a schema
    /// change.
    pub fn set_schema_change_listener(&mut self, listener: Option<Box<dyn FnMut()>>) {
        self.schema_change_listener = listener;
    }

    // -----------------------------------------------------------------------
    // Table registry
    // -----------------------------------------------------------------------

    /// Number of tables.
    #[must_use]
    pub fn size(&self) -> usize {
        if !self.tables.is_attached() {
            return 0;
        }
        self.tables.size(&self.alloc).unwrap_or(0)
    }

    pub fn get_table_name(&self, table_ndx: usize) -> Result<String> {
        if !self.is_attached() {
            return Err(TuskError::logic(LogicErrorKind::DetachedAccessor));
        }
        if table_ndx >= self.size() {
            return Err(TuskError::logic(LogicErrorKind::TableIndexOutOfRange));
        }
        self.table_names.get(&self.alloc, table_ndx)
    }

    #[must_use]
    pub fn has_table(&self, name: &str) -> bool {
        self.find_table(name).is_some()
    }

    /// Index of the named table, if present.
    #[must_use]
    pub fn find_table(&self, name: &str) -> Option<usize> {
        if !self.table_names.is_attached() {
            return None;
        }
        self.table_names.find_first(&self.alloc, name).ok().flatten()
    }

    /// Get a table by index, lazily instantiating its accessor.
    pub fn get_table(&mut self, table_ndx: usize) -> Result<TableRef<'_>> {
        if table_ndx >= self.size() {
            return Err(TuskError::logic(LogicErrorKind::TableIndexOutOfRange));
        }
        self.ensure_accessor(table_ndx)?;
        Ok(TableRef {
            group: self,
            ndx: table_ndx,
        })
    }

    /// Get a table by name; `None` when no such table exists.
    pub fn get_table_by_name(&mut self, name: &str) -> Result<Option<TableRef<'_>>> {
        match self.find_table(name) {
            Some(ndx) => Ok(Some(self.get_table(ndx)?)),
            None => Ok(None),
        }
    }

    /// Append a new table.
    pub fn add_table(&mut self, name: &str, require_unique_name: bool) -> Result<TableRef<'_>> {
        let ndx = self.size();
        self.insert_table(ndx, name, require_unique_name)
    }

    /// Insert a new table at `table_ndx`, shifting successors.
    pub fn insert_table(
        &mut self,
        table_ndx: usize,
        name: &str,
        require_unique_name: bool,
    ) -> Result<TableRef<'_>> {
        if require_unique_name && self.has_table(name) {
            return Err(TuskError::TableNameInUse);
        }
        if table_ndx > self.size() {
            return Err(TuskError::logic(LogicErrorKind::TableIndexOutOfRange));
        }
        self.create_and_insert_table(table_ndx, name)?;
        self.get_table(table_ndx)
    }

    /// Get the named table, creating it if missing. The flag reports
    /// whether it was added.
    pub fn get_or_add_table(&mut self, name: &str) -> Result<(TableRef<'_>, bool)> {
        match self.find_table(name) {
            Some(ndx) => Ok((self.get_table(ndx)?, false)),
            None => {
                let table = self.add_table(name, false)?;
                Ok((table, true))
            }
        }
    }

    fn create_and_insert_table(&mut self, table_ndx: usize, name: &str) -> Result<()> {
        if name.len() > MAX_TABLE_NAME_LENGTH {
            return Err(TuskError::logic(LogicErrorKind::TableNameTooLong));
        }
        let table_ref = Table::create_empty(&mut self.alloc)?;
        debug_assert_eq!(
            self.tables.size(&self.alloc)?,
            self.table_names.size(&self.alloc)?
        );
        let prior_num_tables = self.size();
        #[allow(clippy::cast_possible_wrap)]
        self.tables.insert(&mut self.alloc, table_ndx, table_ref as i64)?;
        self.table_names.insert(&mut self.alloc, table_ndx, name)?;
        self.publish_top_children()?;

        // Need a slot for the table accessor.
        if !self.table_accessors.is_empty() {
            self.table_accessors.insert(table_ndx, None);
        }

        self.update_table_indices(&move |old_ndx| {
            if old_ndx >= table_ndx {
                old_ndx + 1
            } else {
                old_ndx
            }
        })?;

        if let Some(repl) = self.repl.as_mut() {
            repl.insert_group_level_table(table_ndx, prior_num_tables, name);
        }
        debug!(table_ndx, name, "inserted group-level table");
        Ok(())
    }

    /// Remove a table by name.
    pub fn remove_table_by_name(&mut self, name: &str) -> Result<()> {
        if !self.is_attached() {
            return Err(TuskError::logic(LogicErrorKind::DetachedAccessor));
        }
        let table_ndx = self.find_table(name).ok_or(TuskError::NoSuchTable)?;
        self.remove_table(table_ndx)
    }

    /// Remove a table by index.
    ///
    /// Fails with `CrossTableLinkTarget` if another table links to the
    /// victim. All of the victim's columns are removed first, in reverse
    /// order, so that every observer receives per-column instructions it
    /// can replay against its accessors.
    pub fn remove_table(&mut self, table_ndx: usize) -> Result<()> {
        if !self.is_attached() {
            return Err(TuskError::logic(LogicErrorKind::DetachedAccessor));
        }
        debug_assert_eq!(
            self.tables.size(&self.alloc)?,
            self.table_names.size(&self.alloc)?
        );
        if table_ndx >= self.size() {
            return Err(TuskError::logic(LogicErrorKind::TableIndexOutOfRange));
        }
        self.ensure_accessor(table_ndx)?;

        let is_target = {
            let table = self.table_accessors[table_ndx]
                .as_ref()
                .expect("accessor just ensured");
            table.is_cross_table_link_target(&self.alloc, table_ndx)?
        };
        if is_target {
            return Err(TuskError::CrossTableLinkTarget);
        }

        let num_cols = self
            .with_table(table_ndx, |table, alloc| table.column_count(alloc))?;
        for col in (0..num_cols).rev() {
            self.table_remove_column(table_ndx, col)?;
        }

        let prior_num_tables = self.size();
        if let Some(repl) = self.repl.as_mut() {
            repl.erase_group_level_table(table_ndx, prior_num_tables);
        }

        let victim_ref = self.tables.get_as_ref(&self.alloc, table_ndx)?;
        self.tables.erase(&mut self.alloc, table_ndx)?;
        self.table_names.erase(&mut self.alloc, table_ndx)?;
        self.publish_top_children()?;
        if !self.table_accessors.is_empty() {
            if let Some(mut table) = self.table_accessors.remove(table_ndx) {
                table.detach();
            }
        }

        // Unless the removed table was the last, renumber link columns
        // pointing past it.
        let last_table_removed = table_ndx == self.size();
        if !last_table_removed {
            self.update_table_indices(&move |old_ndx| {
                debug_assert_ne!(old_ndx, table_ndx);
                if old_ndx > table_ndx {
                    old_ndx - 1
                } else {
                    old_ndx
                }
            })?;
        }

        node::destroy_node_deep(&mut self.alloc, victim_ref)?;
        debug!(table_ndx, "removed group-level table");
        Ok(())
    }

    /// Rename a table by name.
    pub fn rename_table_by_name(
        &mut self,
        name: &str,
        new_name: &str,
        require_unique_name: bool,
    ) -> Result<()> {
        if !self.is_attached() {
            return Err(TuskError::logic(LogicErrorKind::DetachedAccessor));
        }
        let table_ndx = self.find_table(name).ok_or(TuskError::NoSuchTable)?;
        self.rename_table(table_ndx, new_name, require_unique_name)
    }

    /// Rename a table by index.
    pub fn rename_table(
        &mut self,
        table_ndx: usize,
        new_name: &str,
        require_unique_name: bool,
    ) -> Result<()> {
        if !self.is_attached() {
            return Err(TuskError::logic(LogicErrorKind::DetachedAccessor));
        }
        if table_ndx >= self.size() {
            return Err(TuskError::logic(LogicErrorKind::TableIndexOutOfRange));
        }
        if new_name.len() > MAX_TABLE_NAME_LENGTH {
            return Err(TuskError::logic(LogicErrorKind::TableNameTooLong));
        }
        if require_unique_name && self.has_table(new_name) {
            return Err(TuskError::TableNameInUse);
        }
        self.table_names.set(&mut self.alloc, table_ndx, new_name)?;
        self.publish_top_children()?;
        if let Some(repl) = self.repl.as_mut() {
            repl.rename_group_level_table(table_ndx, new_name);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessor management
    // -----------------------------------------------------------------------

    /// Create the table accessor at `table_ndx` if it does not exist.
    ///
    /// A table accessor whose table has link columns needs the opposite
    /// tables' accessors too, recursively, and the link graph may contain
    /// cycles. Construction therefore runs in five steps: (1) create the
    /// accessor in an incomplete state, (2) store it in the cache slot,
    /// pinning it against re-entry, (3) mark it as under construction,
    /// (4) complete it, which may recursively open peer accessors (the
    /// occupied cache slot short-circuits cycles), (5) unmark it.
    pub(crate) fn ensure_accessor(&mut self, table_ndx: usize) -> Result<()> {
        debug_assert!(
            self.table_accessors.is_empty() || self.table_accessors.len() == self.size()
        );
        if self.table_accessors.is_empty() {
            let n = self.size();
            self.table_accessors.resize_with(n, || None);
        }
        if table_ndx >= self.table_accessors.len() {
            return Err(TuskError::logic(LogicErrorKind::TableIndexOutOfRange));
        }
        if self.table_accessors[table_ndx].is_some() {
            return Ok(());
        }

        let table_ref = self.tables.get_as_ref(&self.alloc, table_ndx)?;
        let mut table = Table::create_incomplete(&self.alloc, table_ref, table_ndx)?;
        table.mark();
        self.table_accessors[table_ndx] = Some(table);

        let opposites: Vec<usize> = {
            let table = self.table_accessors[table_ndx]
                .as_ref()
                .expect("slot just filled");
            table
                .link_columns(&self.alloc)?
                .into_iter()
                .map(|(_, _, opposite)| opposite)
                .collect()
        };
        for opposite in opposites {
            if opposite < self.table_accessors.len()
                && self.table_accessors[opposite].is_none()
            {
                self.ensure_accessor(opposite)?;
            }
        }

        let mut table = self.table_accessors[table_ndx]
            .take()
            .expect("slot stays pinned during completion");
        let completed = table.complete_accessor(&self.alloc);
        table.unmark();
        self.table_accessors[table_ndx] = Some(table);
        completed
    }

    /// Run `f` against the accessor of `table_ndx`, then re-publish the
    /// (possibly relocated) table tree into the tables array.
    pub(crate) fn with_table<R>(
        &mut self,
        table_ndx: usize,
        f: impl FnOnce(&mut Table, &mut SlabAlloc) -> Result<R>,
    ) -> Result<R> {
        self.ensure_accessor(table_ndx)?;
        let mut table = self.table_accessors[table_ndx]
            .take()
            .expect("accessor just ensured");
        let result = f(&mut table, &mut self.alloc);
        let top_ref = table.top_ref();
        self.table_accessors[table_ndx] = Some(table);
        let result = result?;
        self.publish_table_ref(table_ndx, top_ref)?;
        Ok(result)
    }

    pub(crate) fn publish_table_ref(&mut self, table_ndx: usize, top_ref: u64) -> Result<()> {
        self.tables
            .publish_child(&mut self.alloc, table_ndx, top_ref)?;
        self.publish_top_children()
    }

    pub(crate) fn publish_top_children(&mut self) -> Result<()> {
        self.top.publish_child(
            &mut self.alloc,
            slot::TABLE_NAMES,
            self.table_names.get_ref(),
        )?;
        self.top
            .publish_child(&mut self.alloc, slot::TABLES, self.tables.get_ref())
    }

    /// Whether the accessor at `table_ndx` exists and is marked dirty.
    #[must_use]
    pub fn table_is_marked(&self, table_ndx: usize) -> bool {
        self.table_accessors
            .get(table_ndx)
            .and_then(Option::as_ref)
            .is_some_and(Table::is_marked)
    }

    /// Mark every cached table accessor, including subordinate ones.
    pub fn mark_all_table_accessors(&mut self) {
        for slot in self.table_accessors.iter_mut().flatten() {
            slot.recursive_mark();
        }
    }

    /// Build a transient accessor for read-only traversal (equality,
    /// verify, printing) without touching the cache.
    pub(crate) fn transient_accessor(&self, table_ndx: usize) -> Result<Table> {
        let table_ref = self.tables.get_as_ref(&self.alloc, table_ndx)?;
        let mut table = Table::create_incomplete(&self.alloc, table_ref, table_ndx)?;
        table.complete_accessor(&self.alloc)?;
        Ok(table)
    }

    /// Apply a spec transformation to every table, using the cached
    /// accessor's spec where one exists and a transient spec otherwise,
    /// and re-publishing relocated refs up the chain.
    pub(crate) fn update_table_specs(
        &mut self,
        update: &dyn Fn(&mut Spec, &mut SlabAlloc) -> Result<bool>,
    ) -> Result<()> {
        let n = self.tables.size(&self.alloc)?;
        for table_ndx in 0..n {
            let has_accessor = !self.table_accessors.is_empty()
                && self.table_accessors[table_ndx].is_some();
            if has_accessor {
                let mut table = self.table_accessors[table_ndx]
                    .take()
                    .expect("accessor present");
                table.set_ndx_in_parent(table_ndx);
                let outcome = update(table.spec_mut(), &mut self.alloc).and_then(|changed| {
                    if changed {
                        table.publish_after_spec_change(&mut self.alloc)?;
                        table.mark();
                    }
                    Ok(changed)
                });
                let top_ref = table.top_ref();
                self.table_accessors[table_ndx] = Some(table);
                if outcome? {
                    self.publish_table_ref(table_ndx, top_ref)?;
                }
            } else {
                let table_ref = self.tables.get_as_ref(&self.alloc, table_ndx)?;
                let mut table_top = Array::from_ref(table_ref);
                let spec_ref = table_top.get_as_ref(&self.alloc, 0)?;
                let mut spec = Spec::from_ref(&self.alloc, spec_ref)?;
                if update(&mut spec, &mut self.alloc)? {
                    table_top.publish_child(&mut self.alloc, 0, spec.top_ref())?;
                    self.tables
                        .publish_child(&mut self.alloc, table_ndx, table_top.get_ref())?;
                    self.publish_top_children()?;
                }
            }
        }
        Ok(())
    }

    /// Renumber the opposite-table index of every link column through
    /// `map`, then refresh the dirty accessors.
    pub(crate) fn update_table_indices(&mut self, map: &(dyn Fn(usize) -> usize)) -> Result<()> {
        self.update_table_specs(&|spec, alloc| spec.remap_opposite_indices(alloc, map))?;
        self.refresh_dirty_accessors()
    }

    /// After erasing column `erased_col` of table `origin`, decrement the
    /// origin-column index recorded by every paired backlink column.
    fn fix_backlink_pairs_after_origin_erase(
        &mut self,
        origin: usize,
        erased_col: usize,
    ) -> Result<()> {
        self.update_table_specs(&move |spec, alloc| {
            let mut changed = false;
            let n = spec.column_count(alloc)?;
            for col in 0..n {
                if spec.column_type(alloc, col)? == ColumnType::BackLink
                    && spec.opposite_table_ndx(alloc, col)? == origin
                {
                    let paired = spec.paired_col_ndx(alloc, col)?;
                    if paired > erased_col {
                        spec.set_paired_col_ndx(alloc, col, paired - 1)?;
                        changed = true;
                    }
                }
            }
            Ok(changed)
        })
    }

    // -----------------------------------------------------------------------
    // Table operations (invoked through `TableRef`)
    // -----------------------------------------------------------------------

    pub(crate) fn table_row_count(&self, table_ndx: usize) -> Result<usize> {
        let table_ref = self.tables.get_as_ref(&self.alloc, table_ndx)?;
        let top = Array::from_ref(table_ref);
        let tagged = top.get_rt(&self.alloc, 2)?.get_as_int();
        usize::try_from(tagged).map_err(|_| TuskError::corrupt("negative row count"))
    }

    pub(crate) fn table_add_column(
        &mut self,
        table_ndx: usize,
        ty: ColumnType,
        name: &str,
        nullable: bool,
    ) -> Result<usize> {
        if ty.has_opposite_table() {
            return Err(TuskError::Unsupported(
                "link columns are created with add_link_column",
            ));
        }
        let col_ndx = self.with_table(table_ndx, |table, alloc| table.column_count(alloc))?;
        if let Some(repl) = self.repl.as_mut() {
            repl.select_table(table_ndx);
            repl.select_descriptor(&[]);
            repl.insert_column(col_ndx, ty.code(), name, nullable);
        }
        let attr = if nullable {
            ColumnAttr::nullable()
        } else {
            ColumnAttr::none()
        };
        let info = ColumnInfo {
            ty,
            name: name.to_owned(),
            attr,
            opposite_table_ndx: 0,
            paired_col_ndx: 0,
        };
        self.with_table(table_ndx, |table, alloc| {
            table.insert_column_inner(alloc, col_ndx, &info)
        })?;
        Ok(col_ndx)
    }

    pub(crate) fn table_add_link_column(
        &mut self,
        table_ndx: usize,
        ty: ColumnType,
        name: &str,
        target_ndx: usize,
    ) -> Result<usize> {
        if !ty.is_link_type() {
            return Err(TuskError::Unsupported(
                "add_link_column requires a link column type",
            ));
        }
        if target_ndx >= self.size() {
            return Err(TuskError::logic(LogicErrorKind::TableIndexOutOfRange));
        }
        let col_ndx = self.with_table(table_ndx, |table, alloc| table.column_count(alloc))?;
        let backlink_col = if table_ndx == target_ndx {
            self.with_table(target_ndx, |table, alloc| table.total_column_count(alloc))? + 1
        } else {
            self.with_table(target_ndx, |table, alloc| table.total_column_count(alloc))?
        };
        if let Some(repl) = self.repl.as_mut() {
            repl.select_table(table_ndx);
            repl.select_descriptor(&[]);
            repl.insert_link_column(col_ndx, ty.code(), name, target_ndx, backlink_col);
        }

        let link_info = ColumnInfo {
            ty,
            name: name.to_owned(),
            attr: ColumnAttr::none(),
            opposite_table_ndx: target_ndx,
            paired_col_ndx: 0,
        };
        self.with_table(table_ndx, |table, alloc| {
            table.insert_column_inner(alloc, col_ndx, &link_info)
        })?;

        let backlink_info = ColumnInfo {
            ty: ColumnType::BackLink,
            name: String::new(),
            attr: ColumnAttr::none(),
            opposite_table_ndx: table_ndx,
            paired_col_ndx: col_ndx,
        };
        self.with_table(target_ndx, |table, alloc| {
            let at = table.total_column_count(alloc)?;
            debug_assert_eq!(at, backlink_col);
            table.insert_column_inner(alloc, at, &backlink_info)
        })?;
        Ok(col_ndx)
    }

    pub(crate) fn table_remove_column(&mut self, table_ndx: usize, col_ndx: usize) -> Result<()> {
        let public_count = self.with_table(table_ndx, |table, alloc| table.column_count(alloc))?;
        if col_ndx >= public_count {
            return Err(TuskError::logic(LogicErrorKind::TableIndexOutOfRange));
        }
        let ty = self.with_table(table_ndx, |table, alloc| table.column_type(alloc, col_ndx))?;
        if ty.is_link_type() {
            let target_ndx = self.with_table(table_ndx, |table, alloc| {
                table.spec().opposite_table_ndx(alloc, col_ndx)
            })?;
            let backlink_col = self
                .with_table(target_ndx, |table, alloc| {
                    table.spec().find_backlink_column(alloc, table_ndx, col_ndx)
                })?
                .ok_or_else(|| {
                    TuskError::corrupt("link column without a paired backlink column")
                })?;
            if let Some(repl) = self.repl.as_mut() {
                repl.select_table(table_ndx);
                repl.select_descriptor(&[]);
                repl.erase_link_column(col_ndx, target_ndx, backlink_col);
            }
            // Backlink side first: it sits after the user columns, so its
            // index is unaffected by the origin-side erase even when the
            // target is the origin itself.
            self.with_table(target_ndx, |table, alloc| {
                table.erase_column_inner(alloc, backlink_col)
            })?;
            self.with_table(table_ndx, |table, alloc| {
                table.erase_column_inner(alloc, col_ndx)
            })?;
        } else {
            if let Some(repl) = self.repl.as_mut() {
                repl.select_table(table_ndx);
                repl.select_descriptor(&[]);
                repl.erase_column(col_ndx);
            }
            self.with_table(table_ndx, |table, alloc| {
                table.erase_column_inner(alloc, col_ndx)
            })?;
        }
        self.fix_backlink_pairs_after_origin_erase(table_ndx, col_ndx)
    }

    pub(crate) fn table_insert_rows(
        &mut self,
        table_ndx: usize,
        row_ndx: usize,
        num_rows: usize,
    ) -> Result<()> {
        let prior = self.table_row_count(table_ndx)?;
        if let Some(repl) = self.repl.as_mut() {
            repl.select_table(table_ndx);
            repl.insert_empty_rows(row_ndx, num_rows, prior, false);
        }
        self.with_table(table_ndx, |table, alloc| {
            table.insert_rows_inner(alloc, row_ndx, num_rows)
        })
    }

    pub(crate) fn table_erase_rows(
        &mut self,
        table_ndx: usize,
        row_ndx: usize,
        num_rows: usize,
        unordered: bool,
    ) -> Result<()> {
        let prior = self.table_row_count(table_ndx)?;
        if unordered && num_rows > 1 {
            return Err(TuskError::Unsupported(
                "unordered erase supports at most one row",
            ));
        }
        if let Some(repl) = self.repl.as_mut() {
            repl.select_table(table_ndx);
            repl.erase_rows(row_ndx, num_rows, prior, unordered);
        }
        if unordered {
            if num_rows == 1 {
                self.with_table(table_ndx, |table, alloc| {
                    table.move_last_over_inner(alloc, row_ndx)
                })?;
            }
        } else {
            for _ in 0..num_rows {
                self.with_table(table_ndx, |table, alloc| {
                    table.erase_row_inner(alloc, row_ndx)
                })?;
            }
        }
        Ok(())
    }

    pub(crate) fn table_clear(&mut self, table_ndx: usize) -> Result<()> {
        let prior = self.table_row_count(table_ndx)?;
        if let Some(repl) = self.repl.as_mut() {
            repl.select_table(table_ndx);
            repl.clear_table(prior);
        }
        self.with_table(table_ndx, |table, alloc| table.clear_inner(alloc))
    }

    pub(crate) fn table_set_link(
        &mut self,
        table_ndx: usize,
        col_ndx: usize,
        row_ndx: usize,
        target_row: Option<usize>,
    ) -> Result<()> {
        let target_group_ndx = self.with_table(table_ndx, |table, alloc| {
            table.spec().opposite_table_ndx(alloc, col_ndx)
        })?;
        if let Some(repl) = self.repl.as_mut() {
            repl.select_table(table_ndx);
            repl.set_link(
                col_ndx,
                row_ndx,
                target_row.map_or(0, |t| t + 1),
                target_group_ndx,
            );
        }
        self.with_table(table_ndx, |table, alloc| {
            table.set_link(alloc, col_ndx, row_ndx, target_row)
        })
    }

    // -----------------------------------------------------------------------
    // Equality and printing
    // -----------------------------------------------------------------------

    /// Two groups compare equal iff they hold equally named tables in the
    /// same order whose contents compare equal.
    pub fn eq_groups(&self, other: &Self) -> Result<bool> {
        let n = self.size();
        if n != other.size() {
            return Ok(false);
        }
        for i in 0..n {
            if self.get_table_name(i)? != other.get_table_name(i)? {
                return Ok(false);
            }
            let table_1 = self.transient_accessor(i)?;
            let table_2 = other.transient_accessor(i)?;
            if !table_1.eq_table(&self.alloc, &table_2, &other.alloc)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Render the table listing.
    pub fn to_display_string(&self) -> Result<String> {
        use std::fmt::Write as _;

        let count = self.size();
        let mut name_width = 10;
        let mut rows_width = 6;
        for i in 0..count {
            let name = self.get_table_name(i)?;
            name_width = name_width.max(name.len());
            let row_count = self.table_row_count(i)?;
            rows_width = rows_width.max(row_count.to_string().len());
        }

        let index_width = 4;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<index_width$} {:<name_width$} {:<rows_width$}",
            "", "tables", "rows"
        );
        for i in 0..count {
            let name = self.get_table_name(i)?;
            let row_count = self.table_row_count(i)?;
            let _ = writeln!(
                out,
                "{i:>index_width$} {name:<name_width$} {row_count:<rows_width$}"
            );
        }
        Ok(out)
    }

    /// Bytes attributed to the selected portions of the snapshot.
    pub fn compute_aggregated_byte_size(&self, ctrl: SizeAggregateControl) -> Result<u64> {
        if !self.top.is_attached() {
            return Ok(0);
        }
        let mut used = 0;
        if ctrl.contains(SizeAggregateControl::STATE) {
            used += top::size_of_tree_from_ref(&self.alloc, self.table_names.get_ref())?;
            used += top::size_of_tree_from_ref(&self.alloc, self.tables.get_ref())?;
            used += self.top.byte_size(&self.alloc)?;
            used += FILE_HEADER_SIZE;
        }
        if ctrl.contains(SizeAggregateControl::FREELISTS) && self.top.size(&self.alloc)? >= 6 {
            for free_slot in [slot::FREE_POSITIONS, slot::FREE_SIZES, slot::FREE_VERSIONS] {
                let ref_ = self.top.get_rt(&self.alloc, free_slot)?.get_as_ref();
                used += top::size_of_tree_from_ref(&self.alloc, ref_)?;
            }
        }
        if ctrl.contains(SizeAggregateControl::HISTORY) && self.top.size(&self.alloc)? >= 9 {
            let ref_ = self.top.get_rt(&self.alloc, slot::HISTORY_REF)?.get_as_ref();
            used += top::size_of_tree_from_ref(&self.alloc, ref_)?;
        }
        Ok(used)
    }

    /// Logical file size minus the persisted free space.
    pub fn get_used_space(&self) -> Result<u64> {
        if !self.top.is_attached() {
            return Ok(0);
        }
        let mut used = self.logical_file_size()?;
        if self.top.size(&self.alloc)? > 4 {
            let len_ref = self.top.get_rt(&self.alloc, slot::FREE_SIZES)?.get_as_ref();
            if len_ref != 0 {
                let lengths = Array::from_ref(len_ref).values(&self.alloc)?;
                let total: i64 = lengths.iter().sum();
                used = used.saturating_sub(u64::try_from(total).unwrap_or(0));
            }
        }
        Ok(used)
    }

    /// Grow or patch the history slots of the top array so a history
    /// object can bind to slot 8.
    pub fn prepare_history_parent(
        &mut self,
        history_type: HistoryType,
        history_schema_version: i64,
    ) -> Result<()> {
        debug_assert!(self.file_format_version >= 7);
        let top_size = self.top.size(&self.alloc)?;
        if top_size < 10 {
            debug_assert!(top_size <= 7);
            while self.top.size(&self.alloc)? < 7 {
                self.top.add(&mut self.alloc, 0)?;
            }
            self.top
                .add_rt(&mut self.alloc, RefOrTagged::make_tagged(history_type.code()))?;
            self.top.add_rt(&mut self.alloc, RefOrTagged::make_ref(0))?;
            self.top.add_rt(
                &mut self.alloc,
                RefOrTagged::make_tagged(history_schema_version),
            )?;
        } else {
            let stored_type =
                HistoryType::from_code(self.top.get_rt(&self.alloc, slot::HISTORY_TYPE)?.get_as_int())?;
            if stored_type != HistoryType::None {
                debug_assert_eq!(stored_type, history_type);
            }
            self.top.set_rt(
                &mut self.alloc,
                slot::HISTORY_TYPE,
                RefOrTagged::make_tagged(history_type.code()),
            )?;
            self.top.set_rt(
                &mut self.alloc,
                slot::HISTORY_VERSION,
                RefOrTagged::make_tagged(history_schema_version),
            )?;
        }
        Ok(())
    }

    /// Path of the attached file, for diagnostics.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.alloc.path().to_owned()
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        self.eq_groups(other).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// TableRef
// ---------------------------------------------------------------------------

/// Handle to one table of a group.
///
/// The handle borrows the group mutably: the group is a single-owner
/// object and all table mutation flows through it (replication, parent
/// ref publication).
pub struct TableRef<'g> {
    group: &'g mut Group,
    ndx: usize,
}

impl std::fmt::Debug for TableRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableRef").field("ndx", &self.ndx).finish()
    }
}

impl TableRef<'_> {
    #[must_use]
    pub fn ndx(&self) -> usize {
        self.ndx
    }

    pub fn name(&self) -> Result<String> {
        self.group.get_table_name(self.ndx)
    }

    pub fn size(&self) -> Result<usize> {
        self.group.table_row_count(self.ndx)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Whether this table's accessor is marked dirty (observable by the
    /// session layer between log replay and accessor refresh).
    #[must_use]
    pub fn is_marked(&self) -> bool {
        self.group.table_is_marked(self.ndx)
    }

    pub fn column_count(&mut self) -> Result<usize> {
        self.group
            .with_table(self.ndx, |table, alloc| table.column_count(alloc))
    }

    pub fn column_name(&mut self, col_ndx: usize) -> Result<String> {
        self.group
            .with_table(self.ndx, |table, alloc| table.column_name(alloc, col_ndx))
    }

    pub fn column_type(&mut self, col_ndx: usize) -> Result<ColumnType> {
        self.group
            .with_table(self.ndx, |table, alloc| table.column_type(alloc, col_ndx))
    }

    pub fn find_column(&mut self, name: &str) -> Result<Option<usize>> {
        self.group
            .with_table(self.ndx, |table, alloc| table.find_column(alloc, name))
    }

    pub fn add_column(&mut self, ty: ColumnType, name: &str) -> Result<usize> {
        self.group.table_add_column(self.ndx, ty, name, false)
    }

    pub fn add_nullable_column(&mut self, ty: ColumnType, name: &str) -> Result<usize> {
        self.group.table_add_column(self.ndx, ty, name, true)
    }

    /// Add a link or link-list column targeting `target_ndx`, creating
    /// the reciprocal backlink column in the target table.
    pub fn add_link_column(
        &mut self,
        ty: ColumnType,
        name: &str,
        target_ndx: usize,
    ) -> Result<usize> {
        self.group
            .table_add_link_column(self.ndx, ty, name, target_ndx)
    }

    pub fn remove_column(&mut self, col_ndx: usize) -> Result<()> {
        self.group.table_remove_column(self.ndx, col_ndx)
    }

    /// Append `num_rows` empty rows; returns the index of the first.
    pub fn add_empty_rows(&mut self, num_rows: usize) -> Result<usize> {
        let row_ndx = self.size()?;
        self.group.table_insert_rows(self.ndx, row_ndx, num_rows)?;
        Ok(row_ndx)
    }

    pub fn add_empty_row(&mut self) -> Result<usize> {
        self.add_empty_rows(1)
    }

    pub fn insert_empty_rows(&mut self, row_ndx: usize, num_rows: usize) -> Result<()> {
        self.group.table_insert_rows(self.ndx, row_ndx, num_rows)
    }

    /// Erase rows; `unordered` moves the last row over the target and
    /// supports counts of 0 and 1 only.
    pub fn erase_rows(&mut self, row_ndx: usize, num_rows: usize, unordered: bool) -> Result<()> {
        self.group
            .table_erase_rows(self.ndx, row_ndx, num_rows, unordered)
    }

    pub fn erase_row(&mut self, row_ndx: usize) -> Result<()> {
        self.erase_rows(row_ndx, 1, false)
    }

    pub fn move_last_over(&mut self, row_ndx: usize) -> Result<()> {
        self.erase_rows(row_ndx, 1, true)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.group.table_clear(self.ndx)
    }

    pub fn get_int(&mut self, col_ndx: usize, row_ndx: usize) -> Result<i64> {
        self.group
            .with_table(self.ndx, |table, alloc| table.get_int(alloc, col_ndx, row_ndx))
    }

    pub fn set_int(&mut self, col_ndx: usize, row_ndx: usize, value: i64) -> Result<()> {
        if let Some(repl) = self.group.repl.as_mut() {
            repl.select_table(self.ndx);
            repl.set_int(col_ndx, row_ndx, value);
        }
        self.group.with_table(self.ndx, |table, alloc| {
            table.set_int(alloc, col_ndx, row_ndx, value)
        })
    }

    pub fn get_bool(&mut self, col_ndx: usize, row_ndx: usize) -> Result<bool> {
        self.group
            .with_table(self.ndx, |table, alloc| table.get_bool(alloc, col_ndx, row_ndx))
    }

    pub fn set_bool(&mut self, col_ndx: usize, row_ndx: usize, value: bool) -> Result<()> {
        if let Some(repl) = self.group.repl.as_mut() {
            repl.select_table(self.ndx);
            repl.set_bool(col_ndx, row_ndx, value);
        }
        self.group.with_table(self.ndx, |table, alloc| {
            table.set_bool(alloc, col_ndx, row_ndx, value)
        })
    }

    pub fn get_string(&mut self, col_ndx: usize, row_ndx: usize) -> Result<String> {
        self.group.with_table(self.ndx, |table, alloc| {
            table.get_string(alloc, col_ndx, row_ndx)
        })
    }

    pub fn set_string(&mut self, col_ndx: usize, row_ndx: usize, value: &str) -> Result<()> {
        if let Some(repl) = self.group.repl.as_mut() {
            repl.select_table(self.ndx);
            repl.set_string(col_ndx, row_ndx, value);
        }
        self.group.with_table(self.ndx, |table, alloc| {
            table.set_string(alloc, col_ndx, row_ndx, value)
        })
    }

    pub fn get_double(&mut self, col_ndx: usize, row_ndx: usize) -> Result<f64> {
        self.group.with_table(self.ndx, |table, alloc| {
            table.get_double(alloc, col_ndx, row_ndx)
        })
    }

    pub fn set_double(&mut self, col_ndx: usize, row_ndx: usize, value: f64) -> Result<()> {
        if let Some(repl) = self.group.repl.as_mut() {
            repl.select_table(self.ndx);
            repl.set_double(col_ndx, row_ndx, value);
        }
        self.group.with_table(self.ndx, |table, alloc| {
            table.set_double(alloc, col_ndx, row_ndx, value)
        })
    }

    pub fn get_timestamp(&mut self, col_ndx: usize, row_ndx: usize) -> Result<i64> {
        self.group.with_table(self.ndx, |table, alloc| {
            table.get_timestamp(alloc, col_ndx, row_ndx)
        })
    }

    pub fn set_timestamp(&mut self, col_ndx: usize, row_ndx: usize, seconds: i64) -> Result<()> {
        if let Some(repl) = self.group.repl.as_mut() {
            repl.select_table(self.ndx);
            repl.set_timestamp(col_ndx, row_ndx, seconds, 0);
        }
        self.group.with_table(self.ndx, |table, alloc| {
            table.set_timestamp(alloc, col_ndx, row_ndx, seconds)
        })
    }

    pub fn get_binary(&mut self, col_ndx: usize, row_ndx: usize) -> Result<Option<Vec<u8>>> {
        self.group.with_table(self.ndx, |table, alloc| {
            table.get_binary(alloc, col_ndx, row_ndx)
        })
    }

    pub fn set_binary(&mut self, col_ndx: usize, row_ndx: usize, value: &[u8]) -> Result<()> {
        if let Some(repl) = self.group.repl.as_mut() {
            repl.select_table(self.ndx);
            repl.set_binary(col_ndx, row_ndx, value);
        }
        self.group.with_table(self.ndx, |table, alloc| {
            table.set_binary(alloc, col_ndx, row_ndx, value)
        })
    }

    pub fn get_link(&mut self, col_ndx: usize, row_ndx: usize) -> Result<Option<usize>> {
        self.group
            .with_table(self.ndx, |table, alloc| table.get_link(alloc, col_ndx, row_ndx))
    }

    pub fn set_link(
        &mut self,
        col_ndx: usize,
        row_ndx: usize,
        target_row: Option<usize>,
    ) -> Result<()> {
        self.group
            .table_set_link(self.ndx, col_ndx, row_ndx, target_row)
    }

    /// Group index of the table a link column targets.
    pub fn get_link_target(&mut self, col_ndx: usize) -> Result<usize> {
        self.group.with_table(self.ndx, |table, alloc| {
            table.spec().opposite_table_ndx(alloc, col_ndx)
        })
    }

    pub fn get_link_list(&mut self, col_ndx: usize, row_ndx: usize) -> Result<Vec<usize>> {
        self.group.with_table(self.ndx, |table, alloc| {
            table.get_link_list(alloc, col_ndx, row_ndx)
        })
    }

    pub fn link_list_add(
        &mut self,
        col_ndx: usize,
        row_ndx: usize,
        target_row: usize,
    ) -> Result<()> {
        let (target_group_ndx, prior) = self.group.with_table(self.ndx, |table, alloc| {
            Ok((
                table.spec().opposite_table_ndx(alloc, col_ndx)?,
                table.get_link_list(alloc, col_ndx, row_ndx)?.len(),
            ))
        })?;
        if let Some(repl) = self.group.repl.as_mut() {
            repl.select_table(self.ndx);
            repl.select_link_list(col_ndx, row_ndx, target_group_ndx);
            repl.link_list_insert(prior, target_row, prior);
        }
        self.group.with_table(self.ndx, |table, alloc| {
            table.link_list_add(alloc, col_ndx, row_ndx, target_row)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_group_is_empty_and_attached() {
        let group = Group::new().unwrap();
        assert!(group.is_attached());
        assert_eq!(group.size(), 0);
        assert_eq!(group.get_file_format_version(), 9);
        assert_eq!(group.logical_file_size().unwrap(), FILE_HEADER_SIZE);
    }

    #[test]
    fn add_and_lookup_tables() {
        let mut group = Group::new().unwrap();
        group.add_table("alpha", true).unwrap();
        group.add_table("beta", true).unwrap();
        assert_eq!(group.size(), 2);
        assert!(group.has_table("alpha"));
        assert!(!group.has_table("gamma"));
        assert_eq!(group.find_table("beta"), Some(1));
        assert_eq!(group.get_table_name(0).unwrap(), "alpha");
        assert!(group.get_table_by_name("gamma").unwrap().is_none());
    }

    #[test]
    fn duplicate_name_rejected_when_unique_required() {
        let mut group = Group::new().unwrap();
        group.add_table("t", true).unwrap();
        let err = group.add_table("t", true).unwrap_err();
        assert!(matches!(err, TuskError::TableNameInUse));
        // Non-unique insertion is allowed.
        group.add_table("t", false).unwrap();
        assert_eq!(group.size(), 2);
    }

    #[test]
    fn table_name_length_capped() {
        let mut group = Group::new().unwrap();
        let long = "n".repeat(MAX_TABLE_NAME_LENGTH + 1);
        let err = group.add_table(&long, true).unwrap_err();
        assert!(matches!(
            err,
            TuskError::LogicError(LogicErrorKind::TableNameTooLong)
        ));
        let max = "n".repeat(MAX_TABLE_NAME_LENGTH);
        group.add_table(&max, true).unwrap();
    }

    #[test]
    fn insert_out_of_range_rejected() {
        let mut group = Group::new().unwrap();
        let err = group.insert_table(1, "t", true).unwrap_err();
        assert!(matches!(
            err,
            TuskError::LogicError(LogicErrorKind::TableIndexOutOfRange)
        ));
    }

    #[test]
    fn get_or_add_reports_was_added() {
        let mut group = Group::new().unwrap();
        let (_, added) = group.get_or_add_table("t").unwrap();
        assert!(added);
        let (_, added) = group.get_or_add_table("t").unwrap();
        assert!(!added);
        assert_eq!(group.size(), 1);
    }

    #[test]
    fn remove_table_shifts_names() {
        let mut group = Group::new().unwrap();
        group.add_table("A", true).unwrap();
        group.add_table("B", true).unwrap();
        group.add_table("C", true).unwrap();
        group.remove_table_by_name("B").unwrap();
        assert_eq!(group.size(), 2);
        assert_eq!(group.get_table_name(0).unwrap(), "A");
        assert_eq!(group.get_table_name(1).unwrap(), "C");
        assert!(matches!(
            group.remove_table_by_name("B").unwrap_err(),
            TuskError::NoSuchTable
        ));
    }

    #[test]
    fn rename_table_checks_uniqueness() {
        let mut group = Group::new().unwrap();
        group.add_table("a", true).unwrap();
        group.add_table("b", true).unwrap();
        let err = group.rename_table(0, "b", true).unwrap_err();
        assert!(matches!(err, TuskError::TableNameInUse));
        group.rename_table(0, "c", true).unwrap();
        assert_eq!(group.get_table_name(0).unwrap(), "c");
        // Rename by old name now misses.
        assert!(matches!(
            group.rename_table_by_name("a", "d", true).unwrap_err(),
            TuskError::NoSuchTable
        ));
    }

    #[test]
    fn rows_and_ints_round_trip() {
        let mut group = Group::new().unwrap();
        {
            let mut t = group.add_table("t", true).unwrap();
            t.add_column(ColumnType::Int, "x").unwrap();
            t.add_empty_rows(3).unwrap();
            t.set_int(0, 0, 1).unwrap();
            t.set_int(0, 1, 2).unwrap();
            t.set_int(0, 2, 3).unwrap();
        }
        let mut t = group.get_table_by_name("t").unwrap().unwrap();
        assert_eq!(t.size().unwrap(), 3);
        assert_eq!(t.get_int(0, 0).unwrap(), 1);
        assert_eq!(t.get_int(0, 2).unwrap(), 3);
    }

    #[test]
    fn link_renumbering_on_insert() {
        let mut group = Group::new().unwrap();
        group.add_table("T0", true).unwrap();
        group.add_table("T1", true).unwrap();
        group.add_table("T2", true).unwrap();
        {
            let mut t2 = group.get_table(2).unwrap();
            t2.add_link_column(ColumnType::Link, "to_t0", 0).unwrap();
        }
        // Insert a fresh table at index 1: T0 stays at 0, the link must
        // still point at it.
        group.insert_table(1, "fresh", true).unwrap();
        let opposite = group
            .with_table(3, |table, alloc| table.spec().opposite_table_ndx(alloc, 0))
            .unwrap();
        assert_eq!(opposite, 0);

        // And insert at 0: everything shifts, including the link target.
        group.insert_table(0, "front", true).unwrap();
        let opposite = group
            .with_table(4, |table, alloc| table.spec().opposite_table_ndx(alloc, 0))
            .unwrap();
        assert_eq!(opposite, 1);
    }

    #[test]
    fn cross_table_link_guard() {
        let mut group = Group::new().unwrap();
        group.add_table("A", true).unwrap();
        group.add_table("B", true).unwrap();
        {
            let mut a = group.get_table(0).unwrap();
            a.add_link_column(ColumnType::Link, "to_b", 1).unwrap();
        }
        let err = group.remove_table_by_name("B").unwrap_err();
        assert!(matches!(err, TuskError::CrossTableLinkTarget));
        assert_eq!(group.size(), 2);
        // Both tables still usable.
        assert_eq!(group.get_table(0).unwrap().column_count().unwrap(), 1);
        assert_eq!(group.get_table(1).unwrap().column_count().unwrap(), 0);
        // Removing the origin table first is fine, then the target.
        group.remove_table_by_name("A").unwrap();
        group.remove_table_by_name("B").unwrap();
        assert_eq!(group.size(), 0);
    }

    #[test]
    fn self_link_round_trip() {
        let mut group = Group::new().unwrap();
        {
            let mut a = group.add_table("A", true).unwrap();
            a.add_link_column(ColumnType::Link, "self", 0).unwrap();
            a.add_empty_row().unwrap();
            a.set_link(0, 0, Some(0)).unwrap();
            assert_eq!(a.get_link(0, 0).unwrap(), Some(0));
        }
        // A self-link does not make the table a cross-table link target.
        group.remove_table(0).unwrap();
        assert_eq!(group.size(), 0);
    }

    #[test]
    fn group_equality_by_structure() {
        let mut g1 = Group::new().unwrap();
        let mut g2 = Group::new().unwrap();
        assert!(g1 == g2);
        {
            let mut t = g1.add_table("t", true).unwrap();
            t.add_column(ColumnType::Int, "x").unwrap();
            t.add_empty_row().unwrap();
            t.set_int(0, 0, 42).unwrap();
        }
        assert!(g1 != g2);
        {
            let mut t = g2.add_table("t", true).unwrap();
            t.add_column(ColumnType::Int, "x").unwrap();
            t.add_empty_row().unwrap();
            t.set_int(0, 0, 42).unwrap();
        }
        assert!(g1 == g2);
        g2.get_table(0).unwrap().set_int(0, 0, 43).unwrap();
        assert!(g1 != g2);
    }

    #[test]
    fn double_open_is_logic_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.tusk");
        let mut group = Group::open(&path, None, OpenMode::ReadWrite).unwrap();
        let err = group
            .open_path(&path, None, OpenMode::ReadWrite)
            .unwrap_err();
        assert!(matches!(
            err,
            TuskError::LogicError(LogicErrorKind::WrongGroupState)
        ));
    }

    #[test]
    fn encryption_key_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.tusk");
        let err = Group::open(&path, Some(b"0123456789abcdef"), OpenMode::ReadWrite).unwrap_err();
        assert!(matches!(err, TuskError::Unsupported(_)));
    }

    #[test]
    fn display_string_lists_tables() {
        let mut group = Group::new().unwrap();
        {
            let mut t = group.add_table("people", true).unwrap();
            t.add_column(ColumnType::Int, "age").unwrap();
            t.add_empty_rows(2).unwrap();
        }
        let rendered = group.to_display_string().unwrap();
        assert!(rendered.contains("tables"));
        assert!(rendered.contains("people"));
        assert!(rendered.contains('2'));
    }

    #[test]
    fn name_index_bijection_over_mutations() {
        let mut group = Group::new().unwrap();
        let names = ["q", "w", "e", "r", "t", "y"];
        for name in names {
            group.add_table(name, true).unwrap();
        }
        group.remove_table_by_name("e").unwrap();
        group.rename_table_by_name("w", "wx", true).unwrap();
        group.insert_table(0, "front", true).unwrap();

        for i in 0..group.size() {
            let name = group.get_table_name(i).unwrap();
            assert!(group.has_table(&name));
            assert_eq!(group.find_table(&name), Some(i));
        }
        assert!(!group.has_table("e"));
        assert!(!group.has_table("w"));
    }
}
