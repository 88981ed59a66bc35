//! The slab allocator.
//!
//! `SlabAlloc` owns the attached file image (bytes `[0, baseline)`) plus
//! mutable slab chunks layered above the baseline. Refs below the baseline
//! resolve into the immutable image; refs at or above resolve into slab
//! chunks. Mutating a node below the baseline copies it into the slab
//! (copy-on-write by node replacement) and records the old location as
//! read-only free space.
//!
//! Slab allocation is bump-only: freed slab chunks are dropped but their
//! ranges stay on the mutable free list so memory accounting can prove
//! total coverage.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use tusk_error::{LogicErrorKind, Result, TuskError};

use crate::header::{FileHeader, StreamingFooter, FILE_HEADER_SIZE, STREAMING_FOOTER_SIZE};
use crate::round_up_8;

/// Options for [`SlabAlloc::attach_file`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocConfig {
    pub read_only: bool,
    pub no_create: bool,
}

enum Backing {
    Detached,
    Empty,
    Buffer,
    File {
        file: File,
        path: PathBuf,
        read_only: bool,
    },
}

/// The slab allocator: attached image plus copy-on-write slab memory.
pub struct SlabAlloc {
    image: Vec<u8>,
    baseline: u64,
    slabs: BTreeMap<u64, Vec<u8>>,
    next_ref: u64,
    free_slab: Vec<(u64, u64)>,
    free_read_only: Vec<(u64, u64)>,
    backing: Backing,
    header: Option<FileHeader>,
    committed_file_format: u8,
    streaming_form: bool,
    global_version: u64,
}

impl Default for SlabAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabAlloc {
    /// A detached allocator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            image: Vec::new(),
            baseline: 0,
            slabs: BTreeMap::new(),
            next_ref: 0,
            free_slab: Vec::new(),
            free_read_only: Vec::new(),
            backing: Backing::Detached,
            header: None,
            committed_file_format: 0,
            streaming_form: false,
            global_version: 0,
        }
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        !matches!(self.backing, Backing::Detached)
    }

    /// Attach with no backing store: a zeroed header-sized image whose
    /// entire tree lives in the slab.
    pub fn attach_empty(&mut self) -> Result<()> {
        debug_assert!(!self.is_attached());
        self.image = vec![0u8; FILE_HEADER_SIZE as usize];
        self.baseline = FILE_HEADER_SIZE;
        self.next_ref = FILE_HEADER_SIZE;
        self.backing = Backing::Empty;
        self.committed_file_format = 0;
        self.streaming_form = false;
        Ok(())
    }

    /// Attach a database file and return its top-ref (0 for an empty
    /// image).
    pub fn attach_file(&mut self, path: &Path, cfg: AllocConfig) -> Result<u64> {
        debug_assert!(!self.is_attached());

        let mut options = OpenOptions::new();
        options.read(true);
        if !cfg.read_only {
            options.write(true).create(!cfg.no_create);
        }
        let mut file = options.open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if bytes.is_empty() {
            if cfg.read_only {
                return Err(TuskError::invalid_database("file is empty", path));
            }
            // Brand-new file: lay down an empty in-place header with the
            // format left undecided.
            let header = FileHeader::new_empty();
            file.write_all(&header.to_bytes())?;
            file.sync_all()?;
            bytes = header.to_bytes().to_vec();
        }

        let top_ref = self.attach_image(bytes, path)?;
        self.backing = Backing::File {
            file,
            path: path.to_owned(),
            read_only: cfg.read_only,
        };
        debug!(
            path = %path.display(),
            top_ref,
            baseline = self.baseline,
            file_format = self.committed_file_format,
            streaming = self.streaming_form,
            "attached database file"
        );
        Ok(top_ref)
    }

    /// Attach an in-memory database image and return its top-ref.
    pub fn attach_buffer(&mut self, buffer: Vec<u8>) -> Result<u64> {
        debug_assert!(!self.is_attached());
        let top_ref = self.attach_image(buffer, Path::new(""))?;
        self.backing = Backing::Buffer;
        Ok(top_ref)
    }

    fn attach_image(&mut self, bytes: Vec<u8>, path: &Path) -> Result<u64> {
        let at = |err: TuskError| match err {
            TuskError::DatabaseCorrupt { detail } => TuskError::invalid_database(detail, path),
            other => other,
        };

        let header = FileHeader::from_bytes(&bytes).map_err(at)?;
        let size = bytes.len() as u64;

        let (top_ref, file_format) = if header.is_streaming() {
            if size < FILE_HEADER_SIZE + STREAMING_FOOTER_SIZE {
                return Err(TuskError::invalid_database(
                    "streaming file too small for footer",
                    path,
                ));
            }
            let footer_at = (size - STREAMING_FOOTER_SIZE) as usize;
            let footer = StreamingFooter::from_bytes(&bytes[footer_at..]).map_err(at)?;
            if footer.top_ref >= size - STREAMING_FOOTER_SIZE || footer.top_ref % 8 != 0 {
                return Err(TuskError::invalid_database(
                    format!("bad streaming top-ref: {}", footer.top_ref),
                    path,
                ));
            }
            (footer.top_ref, header.file_format[0])
        } else {
            let top_ref = header.active_top_ref();
            if top_ref % 8 != 0 || (top_ref != 0 && top_ref >= size) {
                return Err(TuskError::invalid_database(
                    format!("bad top-ref: {top_ref} (file size {size})"),
                    path,
                ));
            }
            (top_ref, header.active_file_format())
        };

        self.streaming_form = header.is_streaming();
        self.header = Some(header);
        self.committed_file_format = file_format;
        self.baseline = size;
        self.next_ref = round_up_8(size);
        self.image = bytes;
        Ok(top_ref)
    }

    /// Release the image, all slab memory and all bookkeeping in one step.
    /// Idempotent.
    pub fn detach(&mut self) {
        let global_version = self.global_version;
        *self = Self::new();
        self.global_version = global_version;
    }

    // -----------------------------------------------------------------------
    // Ref translation
    // -----------------------------------------------------------------------

    /// Bytes of the node at `ref_` (header onward, to the end of the image
    /// region or the slab chunk).
    pub fn node_slice(&self, ref_: u64) -> Result<&[u8]> {
        if ref_ == 0 {
            return Err(TuskError::corrupt("null ref dereferenced"));
        }
        if ref_ % 8 != 0 {
            return Err(TuskError::corrupt(format!("misaligned ref {ref_}")));
        }
        if ref_ < self.baseline {
            if ref_ < FILE_HEADER_SIZE {
                return Err(TuskError::corrupt(format!(
                    "ref {ref_} points inside the file header"
                )));
            }
            return Ok(&self.image[ref_ as usize..]);
        }
        self.slabs
            .get(&ref_)
            .map(Vec::as_slice)
            .ok_or_else(|| TuskError::corrupt(format!("stale slab ref {ref_}")))
    }

    /// Mutable bytes of a slab node.
    pub fn node_slice_mut(&mut self, ref_: u64) -> Result<&mut [u8]> {
        self.slabs
            .get_mut(&ref_)
            .map(Vec::as_mut_slice)
            .ok_or_else(|| TuskError::corrupt(format!("stale slab ref {ref_}")))
    }

    /// Whether the node at `ref_` is in mutable slab memory.
    #[must_use]
    pub fn is_mutable_ref(&self, ref_: u64) -> bool {
        ref_ >= self.baseline && self.slabs.contains_key(&ref_)
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Store a fully-encoded node in the slab and return its ref.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<u64> {
        debug_assert_eq!(bytes.len() % 8, 0, "node bytes must be 8-byte padded");
        let ref_ = self.next_ref;
        self.slabs.insert(ref_, bytes.to_vec());
        self.next_ref += bytes.len() as u64;
        Ok(ref_)
    }

    /// Release one node. Image refs go on the read-only free list; slab
    /// refs are dropped and recorded on the mutable free list.
    pub fn free(&mut self, ref_: u64, byte_size: u64) {
        if ref_ < self.baseline {
            self.free_read_only.push((ref_, byte_size));
        } else if self.slabs.remove(&ref_).is_some() {
            self.free_slab.push((ref_, byte_size));
        }
    }

    /// Drop all slab memory and mutable free-space bookkeeping: everything
    /// beyond the attached image becomes available again.
    pub fn reset_free_space_tracking(&mut self) {
        self.slabs.clear();
        self.free_slab.clear();
        self.next_ref = round_up_8(self.baseline);
    }

    #[must_use]
    pub fn is_free_space_clean(&self) -> bool {
        self.free_slab.is_empty() && self.free_read_only.is_empty()
    }

    /// Freed ranges inside the immutable image.
    #[must_use]
    pub fn read_only_free(&self) -> &[(u64, u64)] {
        &self.free_read_only
    }

    /// Take the read-only free list (the commit writer persists it).
    pub fn take_read_only_free(&mut self) -> Vec<(u64, u64)> {
        std::mem::take(&mut self.free_read_only)
    }

    /// Seed the read-only free list (from the free-list arrays of an
    /// attached top).
    pub fn set_read_only_free(&mut self, entries: Vec<(u64, u64)>) {
        self.free_read_only = entries;
    }

    /// Visit every mutable free entry.
    pub fn for_all_free_entries(&self, mut f: impl FnMut(u64, u64)) {
        for &(ref_, size) in &self.free_slab {
            f(ref_, size);
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn slab_is_empty(&self) -> bool {
        self.slabs.is_empty()
    }

    // -----------------------------------------------------------------------
    // Sizes and versions
    // -----------------------------------------------------------------------

    /// Physical size of the attached image.
    #[must_use]
    pub fn get_baseline(&self) -> u64 {
        self.baseline
    }

    /// Upper bound of allocated ref space (image plus slab).
    #[must_use]
    pub fn get_total_size(&self) -> u64 {
        self.next_ref
    }

    /// File-format version recorded by the last commit (0 = undecided).
    #[must_use]
    pub fn get_committed_file_format_version(&self) -> u8 {
        self.committed_file_format
    }

    #[must_use]
    pub fn is_file_on_streaming_form(&self) -> bool {
        self.streaming_form
    }

    #[must_use]
    pub fn get_global_version(&self) -> u64 {
        self.global_version
    }

    pub fn bump_global_version(&mut self) {
        self.global_version += 1;
    }

    /// Path of the attached file (empty for buffers).
    #[must_use]
    pub fn path(&self) -> &Path {
        match &self.backing {
            Backing::File { path, .. } => path,
            _ => Path::new(""),
        }
    }

    // -----------------------------------------------------------------------
    // Reader view
    // -----------------------------------------------------------------------

    /// Extend the attached image to `new_file_size`, re-reading the grown
    /// tail from the backing file.
    pub fn update_reader_view(&mut self, new_file_size: u64) -> Result<()> {
        if new_file_size <= self.baseline {
            return Ok(());
        }
        match &mut self.backing {
            Backing::File { file, .. } => {
                debug_assert!(
                    self.slabs
                        .keys()
                        .next()
                        .map_or(true, |&first| first >= round_up_8(new_file_size)),
                    "slab refs would collide with the grown image"
                );
                let old = self.image.len();
                self.image.resize(new_file_size as usize, 0);
                file.seek(SeekFrom::Start(old as u64))?;
                file.read_exact(&mut self.image[old..])?;
                self.baseline = new_file_size;
                self.next_ref = self.next_ref.max(round_up_8(new_file_size));
                Ok(())
            }
            _ => Err(TuskError::logic(LogicErrorKind::WrongGroupState)),
        }
    }

    // -----------------------------------------------------------------------
    // Commit plumbing
    // -----------------------------------------------------------------------

    /// Whether an in-place commit is possible on this backing.
    #[must_use]
    pub fn is_file_backed_writable(&self) -> bool {
        matches!(self.backing, Backing::File { read_only: false, .. })
    }

    /// Write raw bytes at a file offset (commit tail append).
    pub fn write_file_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        match &mut self.backing {
            Backing::File { file, read_only: false, .. } => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(bytes)?;
                Ok(())
            }
            _ => Err(TuskError::logic(LogicErrorKind::WrongGroupState)),
        }
    }

    /// Flush file contents to stable storage.
    pub fn sync_file(&mut self) -> Result<()> {
        match &mut self.backing {
            Backing::File { file, .. } => {
                file.sync_all()?;
                Ok(())
            }
            _ => Err(TuskError::logic(LogicErrorKind::WrongGroupState)),
        }
    }

    /// Publish a new top-ref: write the inactive header slot, flip the
    /// selector, and sync. Converts a streaming file to in-place form.
    pub fn commit_top_ref(&mut self, top_ref: u64, file_format: u8) -> Result<()> {
        let header = self
            .header
            .ok_or(TuskError::logic(LogicErrorKind::WrongGroupState))?;
        let next = header.with_published(top_ref, file_format);
        let bytes = next.to_bytes();
        self.write_file_at(0, &bytes)?;
        self.sync_file()?;
        self.image[..FILE_HEADER_SIZE as usize].copy_from_slice(&bytes);
        self.header = Some(next);
        self.committed_file_format = file_format;
        self.streaming_form = false;
        debug!(top_ref, file_format, "published top-ref");
        Ok(())
    }
}
