//! Heap-node codec and array accessors.
//!
//! Every node is an 8-byte header followed by a payload padded to a
//! multiple of 8:
//!
//! ```text
//! [size: u32 LE][width: u8][flags: u8][reserved: u16]
//! [payload: size * width bytes, zero-padded to 8]
//! ```
//!
//! Integer nodes store signed little-endian elements of 1, 2, 4 or 8
//! bytes. String nodes store fixed-width slots whose final byte records
//! `width - 1 - len`, so a maximal string ends in a zero byte. Nodes with
//! the `HAS_REFS` flag treat every even, non-zero element as a child ref
//! for the deep operations (write, destroy, memory accounting).
//!
//! Accessors ([`Array`], [`StringList`]) hold only the current ref; all
//! reads and writes go through an explicit [`SlabAlloc`] argument, and a
//! mutation that relocates the node updates the accessor in place. The
//! caller is responsible for re-publishing the new ref into the parent
//! slot.

use std::io::Write;

use tusk_error::{Result, TuskError};

use crate::slab::SlabAlloc;
use crate::stream::OutputStream;

/// Byte size of a node header.
pub const NODE_HEADER_SIZE: u64 = 8;

/// Maximum string length a string slot can hold (width 128, final byte
/// reserved for the length).
pub const MAX_STRING_LEN: usize = 127;

const FLAG_HAS_REFS: u8 = 0x01;
const FLAG_STRINGS: u8 = 0x02;

const INT_WIDTHS: [u8; 4] = [1, 2, 4, 8];
const STRING_WIDTHS: [u8; 5] = [8, 16, 32, 64, 128];

/// Decoded node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub size: u32,
    pub width: u8,
    pub flags: u8,
}

impl NodeHeader {
    #[must_use]
    pub fn has_refs(&self) -> bool {
        self.flags & FLAG_HAS_REFS != 0
    }

    #[must_use]
    pub fn is_strings(&self) -> bool {
        self.flags & FLAG_STRINGS != 0
    }

    /// Total node byte size including header and padding.
    #[must_use]
    pub fn node_byte_size(&self) -> u64 {
        NODE_HEADER_SIZE + crate::round_up_8(u64::from(self.size) * u64::from(self.width))
    }

    fn encode(&self) -> [u8; NODE_HEADER_SIZE as usize] {
        let mut buf = [0u8; NODE_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4] = self.width;
        buf[5] = self.flags;
        buf
    }

    fn decode(bytes: &[u8], ref_: u64) -> Result<Self> {
        if bytes.len() < NODE_HEADER_SIZE as usize {
            return Err(TuskError::corrupt(format!(
                "truncated node header at ref {ref_}"
            )));
        }
        let header = Self {
            size: u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes")),
            width: bytes[4],
            flags: bytes[5],
        };
        let widths: &[u8] = if header.is_strings() {
            &STRING_WIDTHS
        } else {
            &INT_WIDTHS
        };
        if !widths.contains(&header.width) {
            return Err(TuskError::corrupt(format!(
                "invalid node width {} at ref {ref_}",
                header.width
            )));
        }
        if header.flags & !(FLAG_HAS_REFS | FLAG_STRINGS) != 0 {
            return Err(TuskError::corrupt(format!(
                "invalid node flags {:#x} at ref {ref_}",
                header.flags
            )));
        }
        Ok(header)
    }
}

/// A tagged top-array word: either a ref (bit 0 clear) or an integer
/// shifted left by one with bit 0 set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefOrTagged {
    Ref(u64),
    Tagged(i64),
}

impl RefOrTagged {
    #[must_use]
    pub fn make_ref(ref_: u64) -> Self {
        debug_assert_eq!(ref_ & 1, 0, "refs are 8-byte aligned");
        Self::Ref(ref_)
    }

    #[must_use]
    pub fn make_tagged(value: i64) -> Self {
        Self::Tagged(value)
    }

    /// Decode a raw stored word. Total: every `i64` decodes to one of the
    /// two cases.
    #[must_use]
    pub fn from_raw(raw: i64) -> Self {
        if raw & 1 == 1 {
            Self::Tagged(raw >> 1)
        } else {
            #[allow(clippy::cast_sign_loss)]
            Self::Ref(raw as u64)
        }
    }

    /// Encode to the raw stored word. Exact inverse of [`Self::from_raw`].
    #[must_use]
    pub fn to_raw(self) -> i64 {
        match self {
            #[allow(clippy::cast_possible_wrap)]
            Self::Ref(ref_) => ref_ as i64,
            Self::Tagged(value) => (value << 1) | 1,
        }
    }

    /// The ref, or 0 for a tagged value.
    #[must_use]
    pub fn get_as_ref(self) -> u64 {
        match self {
            Self::Ref(ref_) => ref_,
            Self::Tagged(_) => 0,
        }
    }

    /// The tagged integer, or 0 for a ref.
    #[must_use]
    pub fn get_as_int(self) -> i64 {
        match self {
            Self::Ref(_) => 0,
            Self::Tagged(value) => value,
        }
    }

    #[must_use]
    pub fn is_ref(self) -> bool {
        matches!(self, Self::Ref(_))
    }
}

// ---------------------------------------------------------------------------
// Free functions on raw refs
// ---------------------------------------------------------------------------

/// Read a node's header and payload slice.
pub fn read_node<'a>(alloc: &'a SlabAlloc, ref_: u64) -> Result<(NodeHeader, &'a [u8])> {
    let bytes = alloc.node_slice(ref_)?;
    let header = NodeHeader::decode(bytes, ref_)?;
    let payload_len = header.size as usize * header.width as usize;
    let end = NODE_HEADER_SIZE as usize + payload_len;
    if bytes.len() < end {
        return Err(TuskError::corrupt(format!(
            "truncated node payload at ref {ref_}: need {end}, have {}",
            bytes.len()
        )));
    }
    Ok((header, &bytes[NODE_HEADER_SIZE as usize..end]))
}

/// Total byte size of the node at `ref_`.
pub fn node_byte_size(alloc: &SlabAlloc, ref_: u64) -> Result<u64> {
    let (header, _) = read_node(alloc, ref_)?;
    Ok(header.node_byte_size())
}

fn decode_int(payload: &[u8], width: usize, idx: usize) -> i64 {
    let slot = &payload[idx * width..(idx + 1) * width];
    match width {
        1 => i64::from(slot[0] as i8),
        2 => i64::from(i16::from_le_bytes(slot.try_into().expect("2 bytes"))),
        4 => i64::from(i32::from_le_bytes(slot.try_into().expect("4 bytes"))),
        8 => i64::from_le_bytes(slot.try_into().expect("8 bytes")),
        _ => unreachable!("validated width"),
    }
}

fn encode_int(buf: &mut [u8], width: usize, idx: usize, value: i64) {
    let slot = &mut buf[idx * width..(idx + 1) * width];
    match width {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        1 => slot[0] = value as i8 as u8,
        #[allow(clippy::cast_possible_truncation)]
        2 => slot.copy_from_slice(&(value as i16).to_le_bytes()),
        #[allow(clippy::cast_possible_truncation)]
        4 => slot.copy_from_slice(&(value as i32).to_le_bytes()),
        8 => slot.copy_from_slice(&value.to_le_bytes()),
        _ => unreachable!("validated width"),
    }
}

/// Smallest integer width that can hold `value`.
#[must_use]
pub fn width_for(value: i64) -> u8 {
    if (-0x80..0x80).contains(&value) {
        1
    } else if (-0x8000..0x8000).contains(&value) {
        2
    } else if (-0x8000_0000..0x8000_0000).contains(&value) {
        4
    } else {
        8
    }
}

fn fits_width(value: i64, width: u8) -> bool {
    width_for(value) <= width
}

/// Read all integer elements of a node.
pub fn read_int_values(alloc: &SlabAlloc, ref_: u64) -> Result<(NodeHeader, Vec<i64>)> {
    let (header, payload) = read_node(alloc, ref_)?;
    if header.is_strings() {
        return Err(TuskError::corrupt(format!(
            "expected integer node at ref {ref_}, found string node"
        )));
    }
    let width = header.width as usize;
    let values = (0..header.size as usize)
        .map(|i| decode_int(payload, width, i))
        .collect();
    Ok((header, values))
}

/// Encode an integer node, choosing the smallest width not below
/// `min_width` that fits every value.
#[must_use]
pub fn encode_int_node(values: &[i64], has_refs: bool, min_width: u8) -> Vec<u8> {
    let width = values
        .iter()
        .map(|&v| width_for(v))
        .fold(min_width.max(1), u8::max);
    let header = NodeHeader {
        size: u32::try_from(values.len()).expect("node size fits u32"),
        width,
        flags: if has_refs { FLAG_HAS_REFS } else { 0 },
    };
    let mut buf = vec![0u8; header.node_byte_size() as usize];
    buf[..NODE_HEADER_SIZE as usize].copy_from_slice(&header.encode());
    let payload = &mut buf[NODE_HEADER_SIZE as usize..];
    for (i, &v) in values.iter().enumerate() {
        encode_int(payload, width as usize, i, v);
    }
    buf
}

/// Recursively release a subtree back to the allocator.
pub fn destroy_node_deep(alloc: &mut SlabAlloc, ref_: u64) -> Result<()> {
    let (header, _) = read_node(alloc, ref_)?;
    if header.has_refs() {
        let (_, values) = read_int_values(alloc, ref_)?;
        for v in values {
            if v > 0 && v & 1 == 0 {
                #[allow(clippy::cast_sign_loss)]
                destroy_node_deep(alloc, v as u64)?;
            }
        }
    }
    let byte_size = node_byte_size(alloc, ref_)?;
    alloc.free(ref_, byte_size);
    Ok(())
}

/// Report `(ref, byte_size)` for every node in the subtree rooted at
/// `ref_`, children before parents.
pub fn report_node_memory(
    alloc: &SlabAlloc,
    ref_: u64,
    handler: &mut impl FnMut(u64, u64),
) -> Result<()> {
    let (header, _) = read_node(alloc, ref_)?;
    if header.has_refs() {
        let (_, values) = read_int_values(alloc, ref_)?;
        for v in values {
            if v > 0 && v & 1 == 0 {
                #[allow(clippy::cast_sign_loss)]
                report_node_memory(alloc, v as u64, handler)?;
            }
        }
    }
    handler(ref_, header.node_byte_size());
    Ok(())
}

/// Serialize only the node itself; children must already be in the output.
pub fn write_node_shallow<W: Write>(
    alloc: &SlabAlloc,
    ref_: u64,
    out: &mut OutputStream<'_, W>,
) -> Result<u64> {
    let byte_size = node_byte_size(alloc, ref_)? as usize;
    let bytes = alloc.node_slice(ref_)?;
    if bytes.len() < byte_size {
        return Err(TuskError::corrupt(format!(
            "node at ref {ref_} is cut short by the end of the image"
        )));
    }
    out.write_node(&bytes[..byte_size])
}

/// Serialize the full subtree rooted at `ref_`: children first, then the
/// node itself re-encoded with the childrens' new refs.
pub fn write_node_deep<W: Write>(
    alloc: &SlabAlloc,
    ref_: u64,
    out: &mut OutputStream<'_, W>,
) -> Result<u64> {
    let (header, _) = read_node(alloc, ref_)?;
    if !header.has_refs() {
        return write_node_shallow(alloc, ref_, out);
    }
    let (_, mut values) = read_int_values(alloc, ref_)?;
    for v in values.iter_mut() {
        if *v > 0 && *v & 1 == 0 {
            #[allow(clippy::cast_sign_loss)]
            let new_child = write_node_deep(alloc, *v as u64, out)?;
            #[allow(clippy::cast_possible_wrap)]
            {
                *v = new_child as i64;
            }
        }
    }
    let bytes = encode_int_node(&values, true, 1);
    out.write_node(&bytes)
}

// ---------------------------------------------------------------------------
// Blob nodes (binary column payloads)
// ---------------------------------------------------------------------------

/// Store a byte blob as a width-1 leaf node.
pub fn create_blob(alloc: &mut SlabAlloc, bytes: &[u8]) -> Result<u64> {
    let header = NodeHeader {
        size: u32::try_from(bytes.len()).expect("blob size fits u32"),
        width: 1,
        flags: 0,
    };
    let mut buf = vec![0u8; header.node_byte_size() as usize];
    buf[..NODE_HEADER_SIZE as usize].copy_from_slice(&header.encode());
    buf[NODE_HEADER_SIZE as usize..NODE_HEADER_SIZE as usize + bytes.len()]
        .copy_from_slice(bytes);
    alloc.alloc_bytes(&buf)
}

/// Read a byte blob stored by [`create_blob`].
pub fn read_blob(alloc: &SlabAlloc, ref_: u64) -> Result<Vec<u8>> {
    let (header, payload) = read_node(alloc, ref_)?;
    if header.is_strings() || header.width != 1 {
        return Err(TuskError::corrupt(format!(
            "expected blob node at ref {ref_}"
        )));
    }
    Ok(payload.to_vec())
}

// ---------------------------------------------------------------------------
// Array accessor
// ---------------------------------------------------------------------------

/// Accessor over an integer node. Holds only the current ref; a mutation
/// that relocates the node updates the accessor, and the caller
/// re-publishes the ref into the parent slot.
#[derive(Debug, Clone, Default)]
pub struct Array {
    ref_: u64,
}

impl Array {
    /// A detached accessor.
    #[must_use]
    pub fn detached() -> Self {
        Self { ref_: 0 }
    }

    /// Attach to an existing node.
    #[must_use]
    pub fn from_ref(ref_: u64) -> Self {
        Self { ref_ }
    }

    /// Create a new empty node.
    pub fn create(alloc: &mut SlabAlloc, has_refs: bool) -> Result<Self> {
        let bytes = encode_int_node(&[], has_refs, 1);
        let ref_ = alloc.alloc_bytes(&bytes)?;
        Ok(Self { ref_ })
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.ref_ != 0
    }

    #[must_use]
    pub fn get_ref(&self) -> u64 {
        self.ref_
    }

    /// Soft-detach: forget the ref without touching the heap.
    pub fn detach(&mut self) {
        self.ref_ = 0;
    }

    /// Re-attach to a node (e.g. after the parent slot changed).
    pub fn init_from_ref(&mut self, ref_: u64) {
        self.ref_ = ref_;
    }

    pub fn size(&self, alloc: &SlabAlloc) -> Result<usize> {
        let (header, _) = read_node(alloc, self.ref_)?;
        Ok(header.size as usize)
    }

    pub fn is_empty(&self, alloc: &SlabAlloc) -> Result<bool> {
        Ok(self.size(alloc)? == 0)
    }

    pub fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<i64> {
        let (header, payload) = read_node(alloc, self.ref_)?;
        if idx >= header.size as usize {
            return Err(TuskError::corrupt(format!(
                "array index {idx} out of bounds (size {})",
                header.size
            )));
        }
        Ok(decode_int(payload, header.width as usize, idx))
    }

    pub fn get_rt(&self, alloc: &SlabAlloc, idx: usize) -> Result<RefOrTagged> {
        Ok(RefOrTagged::from_raw(self.get(alloc, idx)?))
    }

    /// The element interpreted as a ref (0 for tagged values).
    pub fn get_as_ref(&self, alloc: &SlabAlloc, idx: usize) -> Result<u64> {
        Ok(self.get_rt(alloc, idx)?.get_as_ref())
    }

    pub fn values(&self, alloc: &SlabAlloc) -> Result<Vec<i64>> {
        Ok(read_int_values(alloc, self.ref_)?.1)
    }

    #[must_use = "use the returned position"]
    pub fn find_first(&self, alloc: &SlabAlloc, value: i64) -> Result<Option<usize>> {
        Ok(self.values(alloc)?.iter().position(|&v| v == value))
    }

    pub fn byte_size(&self, alloc: &SlabAlloc) -> Result<u64> {
        node_byte_size(alloc, self.ref_)
    }

    fn rewrite(
        &mut self,
        alloc: &mut SlabAlloc,
        values: &[i64],
        has_refs: bool,
        min_width: u8,
    ) -> Result<()> {
        let bytes = encode_int_node(values, has_refs, min_width);
        let new_ref = alloc.alloc_bytes(&bytes)?;
        if self.ref_ != 0 {
            let byte_size = node_byte_size(alloc, self.ref_)?;
            alloc.free(self.ref_, byte_size);
        }
        self.ref_ = new_ref;
        Ok(())
    }

    /// Set one element. Stays in place when the node is already mutable
    /// and the value fits the current width; otherwise copies on write.
    pub fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: i64) -> Result<()> {
        let (header, _) = read_node(alloc, self.ref_)?;
        if idx >= header.size as usize {
            return Err(TuskError::corrupt(format!(
                "array index {idx} out of bounds (size {})",
                header.size
            )));
        }
        if alloc.is_mutable_ref(self.ref_) && fits_width(value, header.width) {
            let bytes = alloc.node_slice_mut(self.ref_)?;
            let payload = &mut bytes[NODE_HEADER_SIZE as usize..];
            encode_int(payload, header.width as usize, idx, value);
            return Ok(());
        }
        let (header, mut values) = read_int_values(alloc, self.ref_)?;
        values[idx] = value;
        self.rewrite(alloc, &values, header.has_refs(), header.width)
    }

    pub fn set_rt(&mut self, alloc: &mut SlabAlloc, idx: usize, rt: RefOrTagged) -> Result<()> {
        self.set(alloc, idx, rt.to_raw())
    }

    pub fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: i64) -> Result<()> {
        let (header, mut values) = read_int_values(alloc, self.ref_)?;
        if idx > values.len() {
            return Err(TuskError::corrupt(format!(
                "array insert at {idx} out of bounds (size {})",
                values.len()
            )));
        }
        values.insert(idx, value);
        self.rewrite(alloc, &values, header.has_refs(), 1)
    }

    pub fn add(&mut self, alloc: &mut SlabAlloc, value: i64) -> Result<()> {
        let len = self.size(alloc)?;
        self.insert(alloc, len, value)
    }

    pub fn add_rt(&mut self, alloc: &mut SlabAlloc, rt: RefOrTagged) -> Result<()> {
        self.add(alloc, rt.to_raw())
    }

    pub fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        let (header, mut values) = read_int_values(alloc, self.ref_)?;
        if idx >= values.len() {
            return Err(TuskError::corrupt(format!(
                "array erase at {idx} out of bounds (size {})",
                values.len()
            )));
        }
        values.remove(idx);
        self.rewrite(alloc, &values, header.has_refs(), 1)
    }

    pub fn truncate(&mut self, alloc: &mut SlabAlloc, new_size: usize) -> Result<()> {
        let (header, mut values) = read_int_values(alloc, self.ref_)?;
        values.truncate(new_size);
        self.rewrite(alloc, &values, header.has_refs(), 1)
    }

    /// Widen the representation so a later `set` of `raw` cannot relocate
    /// the node.
    pub fn ensure_minimum_width(&mut self, alloc: &mut SlabAlloc, raw: i64) -> Result<()> {
        let (header, values) = read_int_values(alloc, self.ref_)?;
        if fits_width(raw, header.width) {
            return Ok(());
        }
        self.rewrite(alloc, &values, header.has_refs(), width_for(raw))
    }

    /// Re-publish a child ref into a parent slot, copying on write only
    /// when the slot actually changed.
    pub fn publish_child(&mut self, alloc: &mut SlabAlloc, idx: usize, child_ref: u64) -> Result<()> {
        if self.get_as_ref(alloc, idx)? != child_ref {
            self.set_rt(alloc, idx, RefOrTagged::make_ref(child_ref))?;
        }
        Ok(())
    }

    /// Serialize the full subtree.
    pub fn write_deep<W: Write>(
        &self,
        alloc: &SlabAlloc,
        out: &mut OutputStream<'_, W>,
    ) -> Result<u64> {
        write_node_deep(alloc, self.ref_, out)
    }

    /// Serialize only this node; children must already be in the output.
    pub fn write_shallow<W: Write>(
        &self,
        alloc: &SlabAlloc,
        out: &mut OutputStream<'_, W>,
    ) -> Result<u64> {
        write_node_shallow(alloc, self.ref_, out)
    }

    /// Release the whole subtree and detach.
    pub fn destroy_deep(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        if self.ref_ != 0 {
            destroy_node_deep(alloc, self.ref_)?;
            self.ref_ = 0;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StringList accessor
// ---------------------------------------------------------------------------

fn string_width_for(len: usize) -> Result<u8> {
    STRING_WIDTHS
        .iter()
        .copied()
        .find(|&w| len < w as usize)
        .ok_or(TuskError::StringTooLong {
            len,
            max: MAX_STRING_LEN,
        })
}

fn encode_string_node(values: &[&str]) -> Result<Vec<u8>> {
    let mut width = STRING_WIDTHS[0];
    for s in values {
        width = width.max(string_width_for(s.len())?);
    }
    let header = NodeHeader {
        size: u32::try_from(values.len()).expect("node size fits u32"),
        width,
        flags: FLAG_STRINGS,
    };
    let mut buf = vec![0u8; header.node_byte_size() as usize];
    buf[..NODE_HEADER_SIZE as usize].copy_from_slice(&header.encode());
    let w = width as usize;
    let payload = &mut buf[NODE_HEADER_SIZE as usize..];
    for (i, s) in values.iter().enumerate() {
        let slot = &mut payload[i * w..(i + 1) * w];
        slot[..s.len()].copy_from_slice(s.as_bytes());
        slot[w - 1] = u8::try_from(w - 1 - s.len()).expect("fits slot width");
    }
    Ok(buf)
}

fn read_string_values(alloc: &SlabAlloc, ref_: u64) -> Result<Vec<String>> {
    let (header, payload) = read_node(alloc, ref_)?;
    if !header.is_strings() {
        return Err(TuskError::corrupt(format!(
            "expected string node at ref {ref_}"
        )));
    }
    let w = header.width as usize;
    let mut values = Vec::with_capacity(header.size as usize);
    for i in 0..header.size as usize {
        let slot = &payload[i * w..(i + 1) * w];
        let unused = slot[w - 1] as usize;
        if unused > w - 1 {
            return Err(TuskError::corrupt(format!(
                "invalid string slot at ref {ref_} index {i}"
            )));
        }
        let len = w - 1 - unused;
        let s = std::str::from_utf8(&slot[..len])
            .map_err(|_| TuskError::corrupt(format!("invalid UTF-8 at ref {ref_} index {i}")))?;
        values.push(s.to_owned());
    }
    Ok(values)
}

/// Accessor over a string-list node. Same ownership discipline as
/// [`Array`].
#[derive(Debug, Clone, Default)]
pub struct StringList {
    ref_: u64,
}

impl StringList {
    #[must_use]
    pub fn detached() -> Self {
        Self { ref_: 0 }
    }

    #[must_use]
    pub fn from_ref(ref_: u64) -> Self {
        Self { ref_ }
    }

    pub fn create(alloc: &mut SlabAlloc) -> Result<Self> {
        let bytes = encode_string_node(&[])?;
        let ref_ = alloc.alloc_bytes(&bytes)?;
        Ok(Self { ref_ })
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.ref_ != 0
    }

    #[must_use]
    pub fn get_ref(&self) -> u64 {
        self.ref_
    }

    pub fn detach(&mut self) {
        self.ref_ = 0;
    }

    pub fn init_from_ref(&mut self, ref_: u64) {
        self.ref_ = ref_;
    }

    pub fn size(&self, alloc: &SlabAlloc) -> Result<usize> {
        let (header, _) = read_node(alloc, self.ref_)?;
        Ok(header.size as usize)
    }

    pub fn is_empty(&self, alloc: &SlabAlloc) -> Result<bool> {
        Ok(self.size(alloc)? == 0)
    }

    pub fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<String> {
        let values = read_string_values(alloc, self.ref_)?;
        values.into_iter().nth(idx).ok_or_else(|| {
            TuskError::corrupt(format!("string index {idx} out of bounds"))
        })
    }

    pub fn values(&self, alloc: &SlabAlloc) -> Result<Vec<String>> {
        read_string_values(alloc, self.ref_)
    }

    #[must_use = "use the returned position"]
    pub fn find_first(&self, alloc: &SlabAlloc, value: &str) -> Result<Option<usize>> {
        Ok(self.values(alloc)?.iter().position(|v| v == value))
    }

    pub fn byte_size(&self, alloc: &SlabAlloc) -> Result<u64> {
        node_byte_size(alloc, self.ref_)
    }

    fn rewrite(&mut self, alloc: &mut SlabAlloc, values: &[&str]) -> Result<()> {
        let bytes = encode_string_node(values)?;
        let new_ref = alloc.alloc_bytes(&bytes)?;
        if self.ref_ != 0 {
            let byte_size = node_byte_size(alloc, self.ref_)?;
            alloc.free(self.ref_, byte_size);
        }
        self.ref_ = new_ref;
        Ok(())
    }

    pub fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &str) -> Result<()> {
        let mut values = read_string_values(alloc, self.ref_)?;
        if idx >= values.len() {
            return Err(TuskError::corrupt(format!(
                "string set at {idx} out of bounds (size {})",
                values.len()
            )));
        }
        values[idx] = value.to_owned();
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        self.rewrite(alloc, &refs)
    }

    pub fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &str) -> Result<()> {
        let mut values = read_string_values(alloc, self.ref_)?;
        if idx > values.len() {
            return Err(TuskError::corrupt(format!(
                "string insert at {idx} out of bounds (size {})",
                values.len()
            )));
        }
        values.insert(idx, value.to_owned());
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        self.rewrite(alloc, &refs)
    }

    pub fn add(&mut self, alloc: &mut SlabAlloc, value: &str) -> Result<()> {
        let len = self.size(alloc)?;
        self.insert(alloc, len, value)
    }

    pub fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        let mut values = read_string_values(alloc, self.ref_)?;
        if idx >= values.len() {
            return Err(TuskError::corrupt(format!(
                "string erase at {idx} out of bounds (size {})",
                values.len()
            )));
        }
        values.remove(idx);
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        self.rewrite(alloc, &refs)
    }

    pub fn truncate(&mut self, alloc: &mut SlabAlloc, new_size: usize) -> Result<()> {
        let mut values = read_string_values(alloc, self.ref_)?;
        values.truncate(new_size);
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        self.rewrite(alloc, &refs)
    }

    pub fn write_deep<W: Write>(
        &self,
        alloc: &SlabAlloc,
        out: &mut OutputStream<'_, W>,
    ) -> Result<u64> {
        // String leaves have no children; deep and shallow coincide.
        write_node_shallow(alloc, self.ref_, out)
    }

    pub fn destroy_deep(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        if self.ref_ != 0 {
            destroy_node_deep(alloc, self.ref_)?;
            self.ref_ = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scratch() -> SlabAlloc {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty().unwrap();
        alloc
    }

    #[test]
    fn ref_or_tagged_round_trip() {
        for raw in [0i64, 8, 16, 1, 3, -1 << 1 | 1, (1 << 40) | 1] {
            assert_eq!(RefOrTagged::from_raw(raw).to_raw(), raw);
        }
        assert_eq!(RefOrTagged::make_tagged(24).to_raw(), 49);
        assert_eq!(RefOrTagged::from_raw(49).get_as_int(), 24);
        assert_eq!(RefOrTagged::make_ref(24).to_raw(), 24);
        assert_eq!(RefOrTagged::from_raw(24).get_as_ref(), 24);
    }

    #[test]
    fn array_basic_ops() {
        let mut alloc = scratch();
        let mut arr = Array::create(&mut alloc, false).unwrap();
        assert_eq!(arr.size(&alloc).unwrap(), 0);
        arr.add(&mut alloc, 10).unwrap();
        arr.add(&mut alloc, -3).unwrap();
        arr.insert(&mut alloc, 1, 1000).unwrap();
        assert_eq!(arr.values(&alloc).unwrap(), vec![10, 1000, -3]);
        arr.set(&mut alloc, 0, 7).unwrap();
        arr.erase(&mut alloc, 2).unwrap();
        assert_eq!(arr.values(&alloc).unwrap(), vec![7, 1000]);
        assert_eq!(arr.find_first(&alloc, 1000).unwrap(), Some(1));
        assert_eq!(arr.find_first(&alloc, 42).unwrap(), None);
    }

    #[test]
    fn array_width_growth() {
        let mut alloc = scratch();
        let mut arr = Array::create(&mut alloc, false).unwrap();
        arr.add(&mut alloc, 1).unwrap();
        assert_eq!(arr.byte_size(&alloc).unwrap(), 16);
        arr.add(&mut alloc, i64::MAX / 2).unwrap();
        assert_eq!(arr.values(&alloc).unwrap(), vec![1, i64::MAX / 2]);
        assert_eq!(arr.byte_size(&alloc).unwrap(), 8 + 16);
    }

    #[test]
    fn ensure_minimum_width_keeps_set_in_place() {
        let mut alloc = scratch();
        let mut arr = Array::create(&mut alloc, false).unwrap();
        arr.add(&mut alloc, 0).unwrap();
        arr.ensure_minimum_width(&mut alloc, RefOrTagged::make_tagged(1 << 40).to_raw())
            .unwrap();
        let ref_before = arr.get_ref();
        arr.set(&mut alloc, 0, RefOrTagged::make_tagged(1 << 39).to_raw())
            .unwrap();
        assert_eq!(arr.get_ref(), ref_before);
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let mut alloc = scratch();
        let mut arr = Array::create(&mut alloc, false).unwrap();
        assert!(arr.get(&alloc, 0).is_err());
        assert!(arr.set(&mut alloc, 0, 1).is_err());
        assert!(arr.erase(&mut alloc, 0).is_err());
        assert!(arr.insert(&mut alloc, 1, 1).is_err());
    }

    #[test]
    fn string_list_ops() {
        let mut alloc = scratch();
        let mut names = StringList::create(&mut alloc).unwrap();
        names.add(&mut alloc, "alpha").unwrap();
        names.add(&mut alloc, "beta").unwrap();
        names.insert(&mut alloc, 1, "a-much-longer-table-name").unwrap();
        assert_eq!(
            names.values(&alloc).unwrap(),
            vec!["alpha", "a-much-longer-table-name", "beta"]
        );
        assert_eq!(names.find_first(&alloc, "beta").unwrap(), Some(2));
        names.erase(&mut alloc, 0).unwrap();
        assert_eq!(names.size(&alloc).unwrap(), 2);
        names.set(&mut alloc, 0, "gamma").unwrap();
        assert_eq!(names.get(&alloc, 0).unwrap(), "gamma");
    }

    #[test]
    fn string_too_long_rejected() {
        let mut alloc = scratch();
        let mut names = StringList::create(&mut alloc).unwrap();
        let long = "x".repeat(MAX_STRING_LEN + 1);
        let err = names.add(&mut alloc, &long).unwrap_err();
        assert!(matches!(err, TuskError::StringTooLong { .. }));
        let max = "y".repeat(MAX_STRING_LEN);
        names.add(&mut alloc, &max).unwrap();
        assert_eq!(names.get(&alloc, 0).unwrap(), max);
    }

    #[test]
    fn blob_round_trip() {
        let mut alloc = scratch();
        let ref_ = create_blob(&mut alloc, b"hello blob").unwrap();
        assert_eq!(read_blob(&alloc, ref_).unwrap(), b"hello blob");
        let empty = create_blob(&mut alloc, b"").unwrap();
        assert_eq!(read_blob(&alloc, empty).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn deep_write_rewrites_child_refs() {
        let mut alloc = scratch();
        let mut leaf = Array::create(&mut alloc, false).unwrap();
        leaf.add(&mut alloc, 42).unwrap();
        let mut parent = Array::create(&mut alloc, true).unwrap();
        #[allow(clippy::cast_possible_wrap)]
        parent.add(&mut alloc, leaf.get_ref() as i64).unwrap();
        parent.add(&mut alloc, RefOrTagged::make_tagged(7).to_raw()).unwrap();

        let mut buf = Vec::new();
        let mut out = OutputStream::new(&mut buf, 24);
        let new_ref = parent.write_deep(&alloc, &mut out).unwrap();
        // Leaf first at ref 24, parent after it.
        assert_eq!(new_ref, 24 + 16);
        assert_eq!(out.ref_of_next_array() as usize, 24 + buf.len());
    }

    #[test]
    fn destroy_deep_frees_subtree() {
        let mut alloc = scratch();
        let mut leaf = Array::create(&mut alloc, false).unwrap();
        leaf.add(&mut alloc, 1).unwrap();
        let mut parent = Array::create(&mut alloc, true).unwrap();
        #[allow(clippy::cast_possible_wrap)]
        parent.add(&mut alloc, leaf.get_ref() as i64).unwrap();
        parent.destroy_deep(&mut alloc).unwrap();
        assert!(!parent.is_attached());
        assert!(alloc.slab_is_empty());
    }

    proptest! {
        #[test]
        fn prop_tagged_word_round_trip(v in -(1i64 << 62)..(1i64 << 62)) {
            let rt = RefOrTagged::make_tagged(v);
            prop_assert_eq!(RefOrTagged::from_raw(rt.to_raw()), rt);
        }

        #[test]
        fn prop_int_node_round_trip(values in proptest::collection::vec(any::<i64>(), 0..64)) {
            let mut alloc = scratch();
            let mut arr = Array::create(&mut alloc, false).unwrap();
            for &v in &values {
                arr.add(&mut alloc, v).unwrap();
            }
            prop_assert_eq!(arr.values(&alloc).unwrap(), values);
        }

        #[test]
        fn prop_string_node_round_trip(
            values in proptest::collection::vec("[a-z0-9_]{0,40}", 0..16)
        ) {
            let mut alloc = scratch();
            let mut list = StringList::create(&mut alloc).unwrap();
            for v in &values {
                list.add(&mut alloc, v).unwrap();
            }
            prop_assert_eq!(list.values(&alloc).unwrap(), values);
        }
    }
}
