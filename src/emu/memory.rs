//! Fault-driven session memory: the bridge between the emulator and the captured image.
//!
//! The emulator never sees the target image directly. All of a session's memory lives in
//! a private page table; whenever an access touches a page that is not yet present, the
//! access *faults* and [`SessionMemory::resolve_fault`] copies the containing 4096-byte
//! page out of the [`AddressSpaceReader`](crate::target::AddressSpaceReader) before the
//! access is retried. Fault resolution is an explicit, synchronous call with no
//! interrupt model, which keeps the session state machine deterministic and testable.
//!
//! Pages are mapped at most once per session: a resident page is never re-read from the
//! image, and emulated writes only ever land in the private copy. A page the image cannot
//! supply (paged out at capture time, or outside every region) fails the access with
//! [`Error::Unreadable`], which terminates the owning session and nothing else.

use std::collections::HashMap;

use crate::target::{AddressSpaceReader, ProcessId};
use crate::{Error, Result};

/// Size of an emulated page in bytes.
pub const PAGE_SIZE: u64 = 0x1000;

/// Base address of the page containing `address`.
#[inline]
#[must_use]
pub fn page_base(address: u64) -> u64 {
    address & !(PAGE_SIZE - 1)
}

/// Per-session page table backed by the captured image.
///
/// Owned exclusively by one emulation session and discarded with it; mapped pages are
/// never shared across candidates.
pub struct SessionMemory<'a> {
    reader: &'a dyn AddressSpaceReader,
    process: ProcessId,
    /// Resident pages, keyed by page base. Append-only within a session.
    pages: HashMap<u64, Box<[u8]>>,
    /// Number of pages faulted in from the image (not counting synthetic regions).
    faulted_pages: usize,
}

impl<'a> SessionMemory<'a> {
    /// Creates an empty page table over the given process's address space.
    #[must_use]
    pub fn new(reader: &'a dyn AddressSpaceReader, process: ProcessId) -> Self {
        SessionMemory {
            reader,
            process,
            pages: HashMap::new(),
            faulted_pages: 0,
        }
    }

    /// Pre-maps `len` bytes of zeroed pages at `base` without consulting the image.
    ///
    /// Used for the session's private stack region. `base` must be page-aligned; `len`
    /// is rounded up to whole pages. Already-resident pages are left untouched.
    pub fn map_zeroed(&mut self, base: u64, len: u64) {
        debug_assert_eq!(base, page_base(base));
        let mut page = base;
        let end = base + len;
        while page < end {
            self.pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            page += PAGE_SIZE;
        }
    }

    /// Resolves a fault on the page containing `address`.
    ///
    /// Reads the full page from the target image and installs it. Idempotent in effect:
    /// accesses only fault on non-resident pages, so a page is read at most once.
    ///
    /// # Errors
    ///
    /// [`Error::Unreadable`] if the image has no resident byte at that page.
    pub fn resolve_fault(&mut self, address: u64) -> Result<()> {
        let base = page_base(address);
        if self.pages.contains_key(&base) {
            return Ok(());
        }
        let mut page = vec![0u8; PAGE_SIZE as usize].into_boxed_slice();
        self.reader
            .read(self.process, base, &mut page)
            .map_err(|_| Error::unreadable(base, PAGE_SIZE as usize))?;
        log::debug!("mapped page {base:#x} from target image");
        self.pages.insert(base, page);
        self.faulted_pages += 1;
        Ok(())
    }

    /// Returns `true` if the page containing `address` is resident.
    #[must_use]
    pub fn is_resident(&self, address: u64) -> bool {
        self.pages.contains_key(&page_base(address))
    }

    /// Number of pages faulted in from the image so far.
    #[must_use]
    pub fn faulted_pages(&self) -> usize {
        self.faulted_pages
    }

    /// Reads `buf.len()` bytes at `address`, faulting pages in as needed.
    ///
    /// # Errors
    ///
    /// [`Error::Unreadable`] if any touched page cannot be supplied by the image.
    pub fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        let mut cursor = address;
        let mut written = 0usize;
        while written < buf.len() {
            self.resolve_fault(cursor)?;
            let base = page_base(cursor);
            #[allow(clippy::cast_possible_truncation)] // Offset bounded by page size
            let offset = (cursor - base) as usize;
            let take = (PAGE_SIZE as usize - offset).min(buf.len() - written);
            let page = &self.pages[&base];
            buf[written..written + take].copy_from_slice(&page[offset..offset + take]);
            written += take;
            cursor += take as u64;
        }
        Ok(())
    }

    /// Writes `data` at `address` into the private page copies, faulting pages in first.
    ///
    /// Writes never propagate back to the target image.
    ///
    /// # Errors
    ///
    /// [`Error::Unreadable`] if a touched page is neither resident nor suppliable.
    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let mut cursor = address;
        let mut consumed = 0usize;
        while consumed < data.len() {
            self.resolve_fault(cursor)?;
            let base = page_base(cursor);
            #[allow(clippy::cast_possible_truncation)] // Offset bounded by page size
            let offset = (cursor - base) as usize;
            let take = (PAGE_SIZE as usize - offset).min(data.len() - consumed);
            let page = self.pages.get_mut(&base).expect("page resolved above");
            page[offset..offset + take].copy_from_slice(&data[consumed..consumed + take]);
            consumed += take;
            cursor += take as u64;
        }
        Ok(())
    }

    /// Reads a little-endian integer of `size` bytes (1, 2, 4 or 8), zero-extended.
    ///
    /// # Errors
    ///
    /// [`Error::Unreadable`] on a fault the image cannot satisfy.
    pub fn read_int(&mut self, address: u64, size: usize) -> Result<u64> {
        debug_assert!(matches!(size, 1 | 2 | 4 | 8));
        let mut buf = [0u8; 8];
        self.read(address, &mut buf[..size])?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes the low `size` bytes (1, 2, 4 or 8) of `value` little-endian.
    ///
    /// # Errors
    ///
    /// [`Error::Unreadable`] on a fault the image cannot satisfy.
    pub fn write_int(&mut self, address: u64, value: u64, size: usize) -> Result<()> {
        debug_assert!(matches!(size, 1 | 2 | 4 | 8));
        self.write(address, &value.to_le_bytes()[..size])
    }

    /// Peeks at bytes without treating a missing page as a session failure.
    ///
    /// Used for opcode probes (syscall trampoline detection) where an unreadable page
    /// just means "not a match".
    pub fn try_read(&mut self, address: u64, buf: &mut [u8]) -> bool {
        self.read(address, buf).is_ok()
    }
}
