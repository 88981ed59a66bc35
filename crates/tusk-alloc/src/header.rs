//! File header and streaming-footer codec.
//!
//! The on-disk layout is:
//! ```text
//! [FileHeader: 24 bytes]
//! [heap of 8-byte-aligned nodes]
//! [streaming form only: zero padding + StreamingFooter: 16 bytes]
//! ```
//!
//! An in-place file carries two top-ref slots in the header; the `flags`
//! selector bit names the active one, and a commit publishes by writing the
//! inactive slot and then flipping the selector. A streaming file stores a
//! sentinel in slot 0 and carries the real top-ref in the trailing footer.

use tusk_error::{Result, TuskError};

/// Byte size of [`FileHeader`].
pub const FILE_HEADER_SIZE: u64 = 24;

/// Byte size of [`StreamingFooter`].
pub const STREAMING_FOOTER_SIZE: u64 = 16;

/// File mnemonic at bytes 16..20.
pub const FILE_MAGIC: [u8; 4] = *b"TUSK";

/// Magic cookie terminating a streaming file.
pub const FOOTER_MAGIC_COOKIE: u64 = 0x3034_1269_5237_E526;

/// The file-format version written by this build.
pub const CURRENT_FILE_FORMAT: u8 = 9;

/// Sentinel stored in top-ref slot 0 of a streaming-form header.
const STREAMING_TOP_SENTINEL: u64 = u64::MAX;

/// `flags` bit naming the active top-ref slot.
pub const FLAGS_SELECT_BIT: u8 = 0x01;
/// `flags` bit marking the file as streaming form.
pub const FLAGS_STREAMING_BIT: u8 = 0x02;

/// The 24-byte header at offset 0 of every database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub top_ref: [u64; 2],
    pub magic: [u8; 4],
    pub file_format: [u8; 2],
    pub reserved: u8,
    pub flags: u8,
}

impl FileHeader {
    /// Header for a brand-new empty in-place file. The file format is left
    /// undecided (0) until the first commit.
    #[must_use]
    pub fn new_empty() -> Self {
        Self {
            top_ref: [0, 0],
            magic: FILE_MAGIC,
            file_format: [0, 0],
            reserved: 0,
            flags: 0,
        }
    }

    /// Header for a streaming-form file carrying `file_format`.
    #[must_use]
    pub fn new_streaming(file_format: u8) -> Self {
        Self {
            top_ref: [STREAMING_TOP_SENTINEL, 0],
            magic: FILE_MAGIC,
            file_format: [file_format, 0],
            reserved: 0,
            flags: FLAGS_STREAMING_BIT,
        }
    }

    /// Serialize to the on-disk form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE as usize] {
        let mut buf = [0u8; FILE_HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&self.top_ref[0].to_le_bytes());
        buf[8..16].copy_from_slice(&self.top_ref[1].to_le_bytes());
        buf[16..20].copy_from_slice(&self.magic);
        buf[20] = self.file_format[0];
        buf[21] = self.file_format[1];
        buf[22] = self.reserved;
        buf[23] = self.flags;
        buf
    }

    /// Parse the on-disk form. Fails if the mnemonic does not match.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_HEADER_SIZE as usize {
            return Err(TuskError::corrupt(format!(
                "file too small for header: {} of {FILE_HEADER_SIZE} bytes",
                buf.len()
            )));
        }
        let header = Self {
            top_ref: [
                u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes")),
                u64::from_le_bytes(buf[8..16].try_into().expect("8 bytes")),
            ],
            magic: buf[16..20].try_into().expect("4 bytes"),
            file_format: [buf[20], buf[21]],
            reserved: buf[22],
            flags: buf[23],
        };
        if header.magic != FILE_MAGIC {
            return Err(TuskError::corrupt("invalid file mnemonic".to_owned()));
        }
        Ok(header)
    }

    /// Whether the file is in streaming form (top-ref found via footer).
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.flags & FLAGS_STREAMING_BIT != 0 || self.top_ref[0] == STREAMING_TOP_SENTINEL
    }

    /// Index of the active top-ref slot.
    #[must_use]
    pub fn active_slot(&self) -> usize {
        usize::from(self.flags & FLAGS_SELECT_BIT)
    }

    /// Top-ref of the active slot (in-place form only).
    #[must_use]
    pub fn active_top_ref(&self) -> u64 {
        self.top_ref[self.active_slot()]
    }

    /// File-format version of the active slot (in-place form only).
    #[must_use]
    pub fn active_file_format(&self) -> u8 {
        self.file_format[self.active_slot()]
    }

    /// Return a copy with the inactive slot filled in and the selector
    /// flipped to it, converting to in-place form if necessary.
    #[must_use]
    pub fn with_published(&self, top_ref: u64, file_format: u8) -> Self {
        let mut next = *self;
        if next.is_streaming() {
            // First in-place commit on a streaming file rewrites both slots.
            next.top_ref = [0, 0];
            next.file_format = [0, 0];
            next.flags &= !(FLAGS_STREAMING_BIT | FLAGS_SELECT_BIT);
        }
        let inactive = 1 - next.active_slot();
        next.top_ref[inactive] = top_ref;
        next.file_format[inactive] = file_format;
        next.flags ^= FLAGS_SELECT_BIT;
        next
    }
}

/// The 16-byte trailer terminating a streaming-form file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingFooter {
    pub top_ref: u64,
    pub magic_cookie: u64,
}

impl StreamingFooter {
    #[must_use]
    pub fn new(top_ref: u64) -> Self {
        Self {
            top_ref,
            magic_cookie: FOOTER_MAGIC_COOKIE,
        }
    }

    /// Serialize to the on-disk form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; STREAMING_FOOTER_SIZE as usize] {
        let mut buf = [0u8; STREAMING_FOOTER_SIZE as usize];
        buf[0..8].copy_from_slice(&self.top_ref.to_le_bytes());
        buf[8..16].copy_from_slice(&self.magic_cookie.to_le_bytes());
        buf
    }

    /// Parse the trailing 16 bytes of a streaming file. Fails if the magic
    /// cookie does not match.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < STREAMING_FOOTER_SIZE as usize {
            return Err(TuskError::corrupt(format!(
                "file too small for streaming footer: {} of {STREAMING_FOOTER_SIZE} bytes",
                buf.len()
            )));
        }
        let footer = Self {
            top_ref: u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes")),
            magic_cookie: u64::from_le_bytes(buf[8..16].try_into().expect("8 bytes")),
        };
        if footer.magic_cookie != FOOTER_MAGIC_COOKIE {
            return Err(TuskError::corrupt(format!(
                "bad streaming footer cookie: {:#x}",
                footer.magic_cookie
            )));
        }
        Ok(footer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FileHeader {
            top_ref: [64, 1024],
            magic: FILE_MAGIC,
            file_format: [9, 9],
            reserved: 0,
            flags: FLAGS_SELECT_BIT,
        };
        let decoded = FileHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.active_slot(), 1);
        assert_eq!(decoded.active_top_ref(), 1024);
        assert_eq!(decoded.active_file_format(), 9);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut bytes = FileHeader::new_empty().to_bytes();
        bytes[16] = b'X';
        let err = FileHeader::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("mnemonic"));
    }

    #[test]
    fn header_rejects_short_input() {
        assert!(FileHeader::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn streaming_header_detected() {
        let header = FileHeader::new_streaming(9);
        assert!(header.is_streaming());
        assert_eq!(header.file_format[0], 9);
        let decoded = FileHeader::from_bytes(&header.to_bytes()).unwrap();
        assert!(decoded.is_streaming());
    }

    #[test]
    fn publish_flips_selector() {
        let header = FileHeader::new_empty();
        assert_eq!(header.active_slot(), 0);
        let next = header.with_published(128, 9);
        assert_eq!(next.active_slot(), 1);
        assert_eq!(next.active_top_ref(), 128);
        assert_eq!(next.active_file_format(), 9);
        // Slot 0 still holds the previous state.
        assert_eq!(next.top_ref[0], 0);

        let third = next.with_published(256, 9);
        assert_eq!(third.active_slot(), 0);
        assert_eq!(third.active_top_ref(), 256);
    }

    #[test]
    fn publish_converts_streaming_to_in_place() {
        let header = FileHeader::new_streaming(9);
        let next = header.with_published(512, 9);
        assert!(!next.is_streaming());
        assert_eq!(next.active_top_ref(), 512);
    }

    #[test]
    fn footer_round_trip() {
        let footer = StreamingFooter::new(4096);
        let decoded = StreamingFooter::from_bytes(&footer.to_bytes()).unwrap();
        assert_eq!(decoded, footer);
    }

    #[test]
    fn footer_rejects_bad_cookie() {
        let mut bytes = StreamingFooter::new(4096).to_bytes();
        bytes[8] ^= 0xFF;
        assert!(StreamingFooter::from_bytes(&bytes).is_err());
    }
}
