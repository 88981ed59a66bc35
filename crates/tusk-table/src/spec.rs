//! Column schema (spec) accessor.

use tusk_alloc::{Array, RefOrTagged, SlabAlloc, StringList};
use tusk_error::{Result, TuskError};

/// Column data types. The numeric codes are part of the file format and
/// the transaction-log wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnType {
    Int = 0,
    Bool = 1,
    String = 2,
    Binary = 4,
    OldDateTime = 7,
    Timestamp = 8,
    Float = 9,
    Double = 10,
    Link = 12,
    LinkList = 13,
    BackLink = 14,
}

impl ColumnType {
    /// Decode a stored type code.
    pub fn from_code(code: i64) -> Result<Self> {
        Ok(match code {
            0 => Self::Int,
            1 => Self::Bool,
            2 => Self::String,
            4 => Self::Binary,
            7 => Self::OldDateTime,
            8 => Self::Timestamp,
            9 => Self::Float,
            10 => Self::Double,
            12 => Self::Link,
            13 => Self::LinkList,
            14 => Self::BackLink,
            other => {
                return Err(TuskError::corrupt(format!(
                    "invalid column type code {other}"
                )))
            }
        })
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Link or link-list column (user-facing link types).
    #[must_use]
    pub const fn is_link_type(self) -> bool {
        matches!(self, Self::Link | Self::LinkList)
    }

    /// Any column carrying an opposite-table index.
    #[must_use]
    pub const fn has_opposite_table(self) -> bool {
        matches!(self, Self::Link | Self::LinkList | Self::BackLink)
    }

    /// Columns whose payload is a single integer leaf.
    #[must_use]
    pub const fn is_int_backed(self) -> bool {
        matches!(
            self,
            Self::Int
                | Self::Bool
                | Self::OldDateTime
                | Self::Timestamp
                | Self::Float
                | Self::Double
                | Self::Link
        )
    }

    /// Columns whose payload is a ref-list of child nodes.
    #[must_use]
    pub const fn is_ref_backed(self) -> bool {
        matches!(self, Self::Binary | Self::LinkList | Self::BackLink)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int => "Int",
            Self::Bool => "Bool",
            Self::String => "String",
            Self::Binary => "Binary",
            Self::OldDateTime => "OldDateTime",
            Self::Timestamp => "Timestamp",
            Self::Float => "Float",
            Self::Double => "Double",
            Self::Link => "Link",
            Self::LinkList => "LinkList",
            Self::BackLink => "BackLink",
        }
    }
}

/// Column attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColumnAttr(pub i64);

impl ColumnAttr {
    pub const INDEXED: i64 = 0x01;
    pub const NULLABLE: i64 = 0x02;
    pub const PRIMARY_KEY: i64 = 0x04;

    #[must_use]
    pub const fn none() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn nullable() -> Self {
        Self(Self::NULLABLE)
    }

    #[must_use]
    pub const fn is_indexed(self) -> bool {
        self.0 & Self::INDEXED != 0
    }

    #[must_use]
    pub const fn is_nullable(self) -> bool {
        self.0 & Self::NULLABLE != 0
    }

    #[must_use]
    pub const fn with(self, bit: i64) -> Self {
        Self(self.0 | bit)
    }

    #[must_use]
    pub const fn without(self, bit: i64) -> Self {
        Self(self.0 & !bit)
    }
}

/// One decoded spec entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub ty: ColumnType,
    pub name: String,
    pub attr: ColumnAttr,
    /// Opposite-table index for link/backlink columns, 0 otherwise.
    pub opposite_table_ndx: usize,
    /// Paired column index on the opposite side, 0 otherwise.
    pub paired_col_ndx: usize,
}

/// Accessor over a table's column schema.
///
/// Holds five parallel child arrays under a spec top; every mutator
/// re-publishes relocated child refs bottom-up, and the caller
/// re-publishes the spec ref into the table top.
#[derive(Debug, Clone, Default)]
pub struct Spec {
    top: Array,
    types: Array,
    names: StringList,
    attrs: Array,
    opposites: Array,
    pairs: Array,
}

const SLOT_TYPES: usize = 0;
const SLOT_NAMES: usize = 1;
const SLOT_ATTRS: usize = 2;
const SLOT_OPPOSITES: usize = 3;
const SLOT_PAIRS: usize = 4;

impl Spec {
    /// Create an empty spec and return its accessor.
    pub fn create(alloc: &mut SlabAlloc) -> Result<Self> {
        let types = Array::create(alloc, false)?;
        let names = StringList::create(alloc)?;
        let attrs = Array::create(alloc, false)?;
        let opposites = Array::create(alloc, false)?;
        let pairs = Array::create(alloc, false)?;
        let mut top = Array::create(alloc, true)?;
        for ref_ in [
            types.get_ref(),
            names.get_ref(),
            attrs.get_ref(),
            opposites.get_ref(),
            pairs.get_ref(),
        ] {
            top.add_rt(alloc, RefOrTagged::make_ref(ref_))?;
        }
        Ok(Self {
            top,
            types,
            names,
            attrs,
            opposites,
            pairs,
        })
    }

    /// Attach to an existing spec node.
    pub fn from_ref(alloc: &SlabAlloc, ref_: u64) -> Result<Self> {
        let mut spec = Self::default();
        spec.init_from_ref(alloc, ref_)?;
        Ok(spec)
    }

    /// Re-attach to a (possibly relocated) spec node.
    pub fn init_from_ref(&mut self, alloc: &SlabAlloc, ref_: u64) -> Result<()> {
        self.top.init_from_ref(ref_);
        if self.top.size(alloc)? != 5 {
            return Err(TuskError::corrupt(format!(
                "spec node at ref {ref_} has wrong shape"
            )));
        }
        self.types.init_from_ref(self.top.get_as_ref(alloc, SLOT_TYPES)?);
        self.names.init_from_ref(self.top.get_as_ref(alloc, SLOT_NAMES)?);
        self.attrs.init_from_ref(self.top.get_as_ref(alloc, SLOT_ATTRS)?);
        self.opposites
            .init_from_ref(self.top.get_as_ref(alloc, SLOT_OPPOSITES)?);
        self.pairs.init_from_ref(self.top.get_as_ref(alloc, SLOT_PAIRS)?);
        Ok(())
    }

    pub fn detach(&mut self) {
        self.top.detach();
        self.types.detach();
        self.names.detach();
        self.attrs.detach();
        self.opposites.detach();
        self.pairs.detach();
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.top.is_attached()
    }

    #[must_use]
    pub fn top_ref(&self) -> u64 {
        self.top.get_ref()
    }

    fn publish(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.top.publish_child(alloc, SLOT_TYPES, self.types.get_ref())?;
        self.top.publish_child(alloc, SLOT_NAMES, self.names.get_ref())?;
        self.top.publish_child(alloc, SLOT_ATTRS, self.attrs.get_ref())?;
        self.top
            .publish_child(alloc, SLOT_OPPOSITES, self.opposites.get_ref())?;
        self.top.publish_child(alloc, SLOT_PAIRS, self.pairs.get_ref())?;
        Ok(())
    }

    pub fn column_count(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.types.size(alloc)
    }

    /// Number of user-visible columns (backlink columns excluded).
    pub fn public_column_count(&self, alloc: &SlabAlloc) -> Result<usize> {
        let mut n = 0;
        for code in self.types.values(alloc)? {
            if ColumnType::from_code(code)? == ColumnType::BackLink {
                break;
            }
            n += 1;
        }
        Ok(n)
    }

    pub fn column_type(&self, alloc: &SlabAlloc, col_ndx: usize) -> Result<ColumnType> {
        ColumnType::from_code(self.types.get(alloc, col_ndx)?)
    }

    pub fn column_name(&self, alloc: &SlabAlloc, col_ndx: usize) -> Result<String> {
        self.names.get(alloc, col_ndx)
    }

    pub fn column_attr(&self, alloc: &SlabAlloc, col_ndx: usize) -> Result<ColumnAttr> {
        Ok(ColumnAttr(self.attrs.get(alloc, col_ndx)?))
    }

    pub fn opposite_table_ndx(&self, alloc: &SlabAlloc, col_ndx: usize) -> Result<usize> {
        usize::try_from(self.opposites.get(alloc, col_ndx)?)
            .map_err(|_| TuskError::corrupt("negative opposite-table index"))
    }

    pub fn paired_col_ndx(&self, alloc: &SlabAlloc, col_ndx: usize) -> Result<usize> {
        usize::try_from(self.pairs.get(alloc, col_ndx)?)
            .map_err(|_| TuskError::corrupt("negative paired-column index"))
    }

    pub fn column_info(&self, alloc: &SlabAlloc, col_ndx: usize) -> Result<ColumnInfo> {
        Ok(ColumnInfo {
            ty: self.column_type(alloc, col_ndx)?,
            name: self.column_name(alloc, col_ndx)?,
            attr: self.column_attr(alloc, col_ndx)?,
            opposite_table_ndx: self.opposite_table_ndx(alloc, col_ndx)?,
            paired_col_ndx: self.paired_col_ndx(alloc, col_ndx)?,
        })
    }

    pub fn find_column(&self, alloc: &SlabAlloc, name: &str) -> Result<Option<usize>> {
        self.names.find_first(alloc, name)
    }

    /// Find the backlink column paired with `origin_col_ndx` of table
    /// `origin_table_ndx`.
    pub fn find_backlink_column(
        &self,
        alloc: &SlabAlloc,
        origin_table_ndx: usize,
        origin_col_ndx: usize,
    ) -> Result<Option<usize>> {
        let n = self.column_count(alloc)?;
        for col in 0..n {
            if self.column_type(alloc, col)? == ColumnType::BackLink
                && self.opposite_table_ndx(alloc, col)? == origin_table_ndx
                && self.paired_col_ndx(alloc, col)? == origin_col_ndx
            {
                return Ok(Some(col));
            }
        }
        Ok(None)
    }

    pub fn insert_column(
        &mut self,
        alloc: &mut SlabAlloc,
        col_ndx: usize,
        info: &ColumnInfo,
    ) -> Result<()> {
        #[allow(clippy::cast_possible_wrap)]
        {
            self.types.insert(alloc, col_ndx, i64::from(info.ty.code()))?;
            self.names.insert(alloc, col_ndx, &info.name)?;
            self.attrs.insert(alloc, col_ndx, info.attr.0)?;
            self.opposites
                .insert(alloc, col_ndx, info.opposite_table_ndx as i64)?;
            self.pairs.insert(alloc, col_ndx, info.paired_col_ndx as i64)?;
        }
        self.publish(alloc)
    }

    pub fn erase_column(&mut self, alloc: &mut SlabAlloc, col_ndx: usize) -> Result<()> {
        self.types.erase(alloc, col_ndx)?;
        self.names.erase(alloc, col_ndx)?;
        self.attrs.erase(alloc, col_ndx)?;
        self.opposites.erase(alloc, col_ndx)?;
        self.pairs.erase(alloc, col_ndx)?;
        self.publish(alloc)
    }

    pub fn set_column_type(
        &mut self,
        alloc: &mut SlabAlloc,
        col_ndx: usize,
        ty: ColumnType,
    ) -> Result<()> {
        self.types.set(alloc, col_ndx, i64::from(ty.code()))?;
        self.publish(alloc)
    }

    pub fn set_column_attr(
        &mut self,
        alloc: &mut SlabAlloc,
        col_ndx: usize,
        attr: ColumnAttr,
    ) -> Result<()> {
        self.attrs.set(alloc, col_ndx, attr.0)?;
        self.publish(alloc)
    }

    #[allow(clippy::cast_possible_wrap)]
    pub fn set_opposite_table_ndx(
        &mut self,
        alloc: &mut SlabAlloc,
        col_ndx: usize,
        table_ndx: usize,
    ) -> Result<()> {
        self.opposites.set(alloc, col_ndx, table_ndx as i64)?;
        self.publish(alloc)
    }

    #[allow(clippy::cast_possible_wrap)]
    pub fn set_paired_col_ndx(
        &mut self,
        alloc: &mut SlabAlloc,
        col_ndx: usize,
        paired: usize,
    ) -> Result<()> {
        self.pairs.set(alloc, col_ndx, paired as i64)?;
        self.publish(alloc)
    }

    /// Rewrite the opposite-table index of every link-type and backlink
    /// column through `map`. Returns whether anything changed.
    pub fn remap_opposite_indices(
        &mut self,
        alloc: &mut SlabAlloc,
        map: &dyn Fn(usize) -> usize,
    ) -> Result<bool> {
        let mut changed = false;
        let n = self.column_count(alloc)?;
        for col in 0..n {
            if self.column_type(alloc, col)?.has_opposite_table() {
                let old = self.opposite_table_ndx(alloc, col)?;
                let new = map(old);
                if new != old {
                    self.set_opposite_table_ndx(alloc, col, new)?;
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    /// Structural equality of the user-visible schema.
    pub fn eq_public(
        &self,
        alloc: &SlabAlloc,
        other: &Self,
        other_alloc: &SlabAlloc,
    ) -> Result<bool> {
        let n = self.public_column_count(alloc)?;
        if n != other.public_column_count(other_alloc)? {
            return Ok(false);
        }
        for col in 0..n {
            if self.column_info(alloc, col)? != other.column_info(other_alloc, col)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> SlabAlloc {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty().unwrap();
        alloc
    }

    fn int_col(name: &str) -> ColumnInfo {
        ColumnInfo {
            ty: ColumnType::Int,
            name: name.to_owned(),
            attr: ColumnAttr::none(),
            opposite_table_ndx: 0,
            paired_col_ndx: 0,
        }
    }

    #[test]
    fn column_type_codes_round_trip() {
        for ty in [
            ColumnType::Int,
            ColumnType::Bool,
            ColumnType::String,
            ColumnType::Binary,
            ColumnType::OldDateTime,
            ColumnType::Timestamp,
            ColumnType::Float,
            ColumnType::Double,
            ColumnType::Link,
            ColumnType::LinkList,
            ColumnType::BackLink,
        ] {
            assert_eq!(ColumnType::from_code(i64::from(ty.code())).unwrap(), ty);
        }
        assert!(ColumnType::from_code(3).is_err());
        assert!(ColumnType::from_code(99).is_err());
    }

    #[test]
    fn insert_and_read_columns() {
        let mut alloc = scratch();
        let mut spec = Spec::create(&mut alloc).unwrap();
        spec.insert_column(&mut alloc, 0, &int_col("age")).unwrap();
        spec.insert_column(
            &mut alloc,
            1,
            &ColumnInfo {
                ty: ColumnType::String,
                name: "name".to_owned(),
                attr: ColumnAttr::nullable(),
                opposite_table_ndx: 0,
                paired_col_ndx: 0,
            },
        )
        .unwrap();
        assert_eq!(spec.column_count(&alloc).unwrap(), 2);
        assert_eq!(spec.column_type(&alloc, 0).unwrap(), ColumnType::Int);
        assert_eq!(spec.column_name(&alloc, 1).unwrap(), "name");
        assert!(spec.column_attr(&alloc, 1).unwrap().is_nullable());
        assert_eq!(spec.find_column(&alloc, "age").unwrap(), Some(0));
        assert_eq!(spec.find_column(&alloc, "missing").unwrap(), None);
    }

    #[test]
    fn public_count_excludes_backlinks() {
        let mut alloc = scratch();
        let mut spec = Spec::create(&mut alloc).unwrap();
        spec.insert_column(&mut alloc, 0, &int_col("x")).unwrap();
        spec.insert_column(
            &mut alloc,
            1,
            &ColumnInfo {
                ty: ColumnType::BackLink,
                name: String::new(),
                attr: ColumnAttr::none(),
                opposite_table_ndx: 2,
                paired_col_ndx: 0,
            },
        )
        .unwrap();
        assert_eq!(spec.column_count(&alloc).unwrap(), 2);
        assert_eq!(spec.public_column_count(&alloc).unwrap(), 1);
        assert_eq!(
            spec.find_backlink_column(&alloc, 2, 0).unwrap(),
            Some(1)
        );
        assert_eq!(spec.find_backlink_column(&alloc, 1, 0).unwrap(), None);
    }

    #[test]
    fn remap_rewrites_link_columns_only() {
        let mut alloc = scratch();
        let mut spec = Spec::create(&mut alloc).unwrap();
        spec.insert_column(&mut alloc, 0, &int_col("x")).unwrap();
        spec.insert_column(
            &mut alloc,
            1,
            &ColumnInfo {
                ty: ColumnType::Link,
                name: "to_t0".to_owned(),
                attr: ColumnAttr::none(),
                opposite_table_ndx: 0,
                paired_col_ndx: 1,
            },
        )
        .unwrap();
        let changed = spec.remap_opposite_indices(&mut alloc, &|ndx| ndx + 1).unwrap();
        assert!(changed);
        assert_eq!(spec.opposite_table_ndx(&alloc, 1).unwrap(), 1);
        // Non-link column untouched.
        assert_eq!(spec.opposite_table_ndx(&alloc, 0).unwrap(), 0);

        let unchanged = spec.remap_opposite_indices(&mut alloc, &|ndx| ndx).unwrap();
        assert!(!unchanged);
    }

    #[test]
    fn reattach_after_mutation() {
        let mut alloc = scratch();
        let mut spec = Spec::create(&mut alloc).unwrap();
        spec.insert_column(&mut alloc, 0, &int_col("a")).unwrap();
        let ref_ = spec.top_ref();
        let reloaded = Spec::from_ref(&alloc, ref_).unwrap();
        assert_eq!(reloaded.column_name(&alloc, 0).unwrap(), "a");
    }
}
