//! Read-only access to the captured address space.

use std::collections::HashMap;
use std::path::Path;

use memmap2::Mmap;

use super::candidate::{Bitness, ProcessId};
use crate::{Error, Result};

/// Read-only byte access into a process address space of the captured image.
///
/// Implementations must fail with [`Error::Unreadable`] if *any* requested byte is not
/// resident. The image is immutable for the duration of an analysis, so implementations
/// must be safe for concurrent read-only access: multiple candidate sessions may fault
/// pages in parallel.
pub trait AddressSpaceReader: Send + Sync {
    /// Reads `buf.len()` bytes at `address` in the given process's address space.
    ///
    /// # Errors
    ///
    /// [`Error::Unreadable`] if any byte in the range is not resident.
    fn read(&self, process: ProcessId, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Reads `len` bytes into a freshly allocated buffer.
    ///
    /// # Errors
    ///
    /// [`Error::Unreadable`] if any byte in the range is not resident.
    fn read_vec(&self, process: ProcessId, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(process, address, &mut buf)?;
        Ok(buf)
    }

    /// Reads a little-endian `u32`.
    ///
    /// # Errors
    ///
    /// [`Error::Unreadable`] if the four bytes are not resident.
    fn read_u32(&self, process: ProcessId, address: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(process, address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a little-endian `u64`.
    ///
    /// # Errors
    ///
    /// [`Error::Unreadable`] if the eight bytes are not resident.
    fn read_u64(&self, process: ProcessId, address: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(process, address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a pointer-sized little-endian value, zero-extended to `u64`.
    ///
    /// # Errors
    ///
    /// [`Error::Unreadable`] if the bytes are not resident.
    fn read_pointer(&self, process: ProcessId, address: u64, bitness: Bitness) -> Result<u64> {
        match bitness {
            Bitness::X86 => Ok(u64::from(self.read_u32(process, address)?)),
            Bitness::X64 => self.read_u64(process, address),
        }
    }
}

/// In-memory address space built from explicit regions.
///
/// Primarily a test and fixture vehicle: synthetic targets are assembled by placing code
/// and data regions at chosen addresses. Reads may span adjacent regions; any gap fails
/// with [`Error::Unreadable`].
///
/// # Example
///
/// ```rust
/// use stonegaze::target::{AddressSpaceReader, ProcessId, SliceImage};
///
/// let pid = ProcessId(4);
/// let mut image = SliceImage::new();
/// image.add_region(pid, 0x1000, vec![0x90, 0xc3]);
///
/// let bytes = image.read_vec(pid, 0x1000, 2).unwrap();
/// assert_eq!(bytes, [0x90, 0xc3]);
/// assert!(image.read_vec(pid, 0x3000, 1).is_err());
/// ```
#[derive(Debug, Default)]
pub struct SliceImage {
    /// Sorted region list per process: (base, bytes).
    regions: HashMap<ProcessId, Vec<(u64, Vec<u8>)>>,
}

impl SliceImage {
    /// Creates an empty image with no resident memory.
    #[must_use]
    pub fn new() -> Self {
        SliceImage {
            regions: HashMap::new(),
        }
    }

    /// Places a region of resident bytes at `base` in `process`'s address space.
    ///
    /// Regions are kept sorted by base address. Overlapping regions are not merged; the
    /// first region containing an address wins.
    pub fn add_region(&mut self, process: ProcessId, base: u64, data: Vec<u8>) {
        let list = self.regions.entry(process).or_default();
        list.push((base, data));
        list.sort_by_key(|(b, _)| *b);
    }

    fn region_at(&self, process: ProcessId, address: u64) -> Option<(&[u8], usize)> {
        let list = self.regions.get(&process)?;
        for (base, data) in list {
            if address >= *base && address < *base + data.len() as u64 {
                #[allow(clippy::cast_possible_truncation)] // Offset bounded by region size
                let offset = (address - base) as usize;
                return Some((data.as_slice(), offset));
            }
        }
        None
    }
}

impl AddressSpaceReader for SliceImage {
    fn read(&self, process: ProcessId, address: u64, buf: &mut [u8]) -> Result<()> {
        let mut cursor = address;
        let mut written = 0usize;

        while written < buf.len() {
            let (data, offset) = self
                .region_at(process, cursor)
                .ok_or_else(|| Error::unreadable(address, buf.len()))?;
            let available = data.len() - offset;
            let take = available.min(buf.len() - written);
            buf[written..written + take].copy_from_slice(&data[offset..offset + take]);
            written += take;
            cursor += take as u64;
        }
        Ok(())
    }
}

/// A memory-mapped flat dump serving a single contiguous address range.
///
/// Useful for benches and tooling that operate on a raw region dump: the file's bytes are
/// exposed at `[base, base + len)` for every process id. Backed by `memmap2`, so large
/// dumps are paged in by the OS on demand.
#[derive(Debug)]
pub struct FileImage {
    map: Mmap,
    base: u64,
}

impl FileImage {
    /// Memory-maps `path` and exposes its contents at `base`.
    ///
    /// # Errors
    ///
    /// [`Error::FileError`] if the file cannot be opened or mapped.
    pub fn open(path: &Path, base: u64) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        // SAFETY: the mapping is read-only and the analysis treats the file as immutable.
        let map = unsafe { Mmap::map(&file)? };
        Ok(FileImage { map, base })
    }

    /// Base address the dump is exposed at.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length of the mapped range in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the mapped file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl AddressSpaceReader for FileImage {
    fn read(&self, _process: ProcessId, address: u64, buf: &mut [u8]) -> Result<()> {
        let offset = address
            .checked_sub(self.base)
            .ok_or_else(|| Error::unreadable(address, buf.len()))?;
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|end| *end <= self.map.len() as u64)
            .ok_or_else(|| Error::unreadable(address, buf.len()))?;
        #[allow(clippy::cast_possible_truncation)] // Bounds checked against map length
        buf.copy_from_slice(&self.map[offset as usize..end as usize]);
        Ok(())
    }
}
