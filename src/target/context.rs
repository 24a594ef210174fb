//! Saved thread contexts captured at APC queue time.
//!
//! A Gargoyle chain ends with `NtContinue`, which hands the kernel a `_CONTEXT` holding
//! the register state to resume with. During emulation the detector recognizes the
//! syscall trampoline and re-applies that context itself; this module defines the
//! register block and the contract for reading it out of the captured image.

use super::candidate::ProcessId;
use crate::{Error, Result};

/// A saved general-purpose register block, as captured in an x64 `_CONTEXT`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SavedContext {
    /// Saved rax.
    pub rax: u64,
    /// Saved rcx.
    pub rcx: u64,
    /// Saved rdx.
    pub rdx: u64,
    /// Saved rbx.
    pub rbx: u64,
    /// Saved rsp.
    pub rsp: u64,
    /// Saved rbp.
    pub rbp: u64,
    /// Saved rsi.
    pub rsi: u64,
    /// Saved rdi.
    pub rdi: u64,
    /// Saved r8.
    pub r8: u64,
    /// Saved r9.
    pub r9: u64,
    /// Saved r10.
    pub r10: u64,
    /// Saved r11.
    pub r11: u64,
    /// Saved r12.
    pub r12: u64,
    /// Saved r13.
    pub r13: u64,
    /// Saved r14.
    pub r14: u64,
    /// Saved r15.
    pub r15: u64,
    /// Saved instruction pointer.
    pub rip: u64,
}

/// Resolves typed structures of the captured image at a given address.
///
/// Only the saved-context register block is needed by this crate; richer typed access
/// (APC records, timer objects) stays with the surrounding framework.
pub trait TypedObjectReader: Send + Sync {
    /// Reads the saved `_CONTEXT` register block at `address` in `process`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Unreadable`] if the structure is not resident.
    fn saved_context(&self, process: ProcessId, address: u64) -> Result<SavedContext>;
}

/// Field offsets inside an x64 `_CONTEXT`.
///
/// The integer register block starts at 0x78 (Rax) and runs through Rip at 0xf8.
const CONTEXT_RAX: usize = 0x78;
const CONTEXT_RIP: usize = 0xf8;
const CONTEXT_READ_LEN: usize = 0x100;

/// Default [`TypedObjectReader`] decoding the raw x64 `_CONTEXT` layout.
///
/// Reads the 0x100-byte prefix of the structure straight out of the address space and
/// slices the integer register block out of it. Sufficient for every Windows build this
/// layout has been stable on; images with a diverging layout need a framework-provided
/// reader instead.
pub struct WindowsContextReader<'a> {
    reader: &'a dyn super::AddressSpaceReader,
}

impl<'a> WindowsContextReader<'a> {
    /// Creates a context reader over the given address space.
    #[must_use]
    pub fn new(reader: &'a dyn super::AddressSpaceReader) -> Self {
        WindowsContextReader { reader }
    }
}

impl TypedObjectReader for WindowsContextReader<'_> {
    fn saved_context(&self, process: ProcessId, address: u64) -> Result<SavedContext> {
        let raw = self
            .reader
            .read_vec(process, address, CONTEXT_READ_LEN)
            .map_err(|_| Error::unreadable(address, CONTEXT_READ_LEN))?;

        let qword = |offset: usize| -> u64 {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&raw[offset..offset + 8]);
            u64::from_le_bytes(buf)
        };

        Ok(SavedContext {
            rax: qword(CONTEXT_RAX),
            rcx: qword(CONTEXT_RAX + 0x08),
            rdx: qword(CONTEXT_RAX + 0x10),
            rbx: qword(CONTEXT_RAX + 0x18),
            rsp: qword(CONTEXT_RAX + 0x20),
            rbp: qword(CONTEXT_RAX + 0x28),
            rsi: qword(CONTEXT_RAX + 0x30),
            rdi: qword(CONTEXT_RAX + 0x38),
            r8: qword(CONTEXT_RAX + 0x40),
            r9: qword(CONTEXT_RAX + 0x48),
            r10: qword(CONTEXT_RAX + 0x50),
            r11: qword(CONTEXT_RAX + 0x58),
            r12: qword(CONTEXT_RAX + 0x60),
            r13: qword(CONTEXT_RAX + 0x68),
            r14: qword(CONTEXT_RAX + 0x70),
            r15: qword(CONTEXT_RAX + 0x78),
            rip: qword(CONTEXT_RIP),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{ProcessId, SliceImage};

    #[test]
    fn test_context_field_offsets() {
        let pid = ProcessId(1);
        let mut raw = vec![0u8; CONTEXT_READ_LEN];
        raw[CONTEXT_RAX..CONTEXT_RAX + 8].copy_from_slice(&0x1111u64.to_le_bytes());
        raw[CONTEXT_RAX + 0x20..CONTEXT_RAX + 0x28].copy_from_slice(&0x2222u64.to_le_bytes());
        raw[CONTEXT_RIP..CONTEXT_RIP + 8].copy_from_slice(&0xdead_beefu64.to_le_bytes());

        let mut image = SliceImage::new();
        image.add_region(pid, 0x5000, raw);

        let ctx = WindowsContextReader::new(&image)
            .saved_context(pid, 0x5000)
            .unwrap();
        assert_eq!(ctx.rax, 0x1111);
        assert_eq!(ctx.rsp, 0x2222);
        assert_eq!(ctx.rip, 0xdead_beef);
    }

    #[test]
    fn test_context_not_resident() {
        let image = SliceImage::new();
        let result = WindowsContextReader::new(&image).saved_context(ProcessId(1), 0x5000);
        assert!(matches!(result, Err(Error::Unreadable { .. })));
    }
}
