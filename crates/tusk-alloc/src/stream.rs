//! Append-only output stream for the snapshot writers.
//!
//! Tracks the ref that the next appended node will receive, so writers can
//! patch parent slots before emitting them and assert the projected layout.

use std::io::Write;

use tusk_error::Result;

/// An append-only stream assigning refs to nodes as they are written.
pub struct OutputStream<'a, W: Write> {
    out: &'a mut W,
    next_ref: u64,
}

impl<'a, W: Write> OutputStream<'a, W> {
    /// Create a stream whose first appended node receives `start_ref`.
    pub fn new(out: &'a mut W, start_ref: u64) -> Self {
        Self { out, next_ref: start_ref }
    }

    /// The ref the next appended node will receive.
    #[must_use]
    pub fn ref_of_next_array(&self) -> u64 {
        self.next_ref
    }

    /// Write raw bytes that are not heap nodes (header, padding, footer).
    /// Does not advance the node ref.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes)?;
        Ok(())
    }

    /// Append one node and return its assigned ref. `bytes` must already be
    /// padded to a multiple of 8.
    pub fn write_node(&mut self, bytes: &[u8]) -> Result<u64> {
        debug_assert_eq!(bytes.len() % 8, 0, "node bytes must be 8-byte padded");
        let ref_ = self.next_ref;
        self.out.write_all(bytes)?;
        self.next_ref += bytes.len() as u64;
        Ok(ref_)
    }
}
