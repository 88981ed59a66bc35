//! Slab allocator and heap-node layer for TuskDB.
//!
//! A database file is a 24-byte header followed by a heap of immutable,
//! 8-byte-aligned nodes. This crate owns everything below the accessor
//! layer: the header/footer codec, the node (array) codec, the slab
//! allocator that layers mutable copy-on-write memory above the attached
//! image, and the append-only output stream used by the snapshot writers.

pub mod header;
pub mod node;
pub mod slab;
pub mod stream;

pub use header::{
    FileHeader, StreamingFooter, CURRENT_FILE_FORMAT, FILE_HEADER_SIZE, FOOTER_MAGIC_COOKIE,
    STREAMING_FOOTER_SIZE,
};
pub use node::{Array, RefOrTagged, StringList, MAX_STRING_LEN};
pub use slab::{AllocConfig, SlabAlloc};
pub use stream::OutputStream;

/// Round `n` up to the next multiple of 8.
#[inline]
#[must_use]
pub const fn round_up_8(n: u64) -> u64 {
    (n + 7) & !7
}

/// Page size used for encryption padding. Initialized lazily on first
/// use; this is the only process-wide state in the engine.
pub fn page_size() -> u64 {
    use std::sync::OnceLock;
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| 4096)
}

/// Round `n` up to the next multiple of the page size.
#[must_use]
pub fn round_up_to_page_size(n: u64) -> u64 {
    let page = page_size();
    n.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_8_values() {
        assert_eq!(round_up_8(0), 0);
        assert_eq!(round_up_8(1), 8);
        assert_eq!(round_up_8(8), 8);
        assert_eq!(round_up_8(9), 16);
        assert_eq!(round_up_8(24), 24);
    }

    #[test]
    fn page_rounding() {
        assert_eq!(round_up_to_page_size(0), 0);
        assert_eq!(round_up_to_page_size(1), page_size());
        assert_eq!(round_up_to_page_size(page_size()), page_size());
        assert_eq!(round_up_to_page_size(page_size() + 1), 2 * page_size());
    }
}
