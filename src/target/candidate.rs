//! The candidate data model: one entry per kernel timer with a user-mode APC routine.

use crate::Result;

/// Identifier of a process inside the captured image.
///
/// Opaque to this crate; it is only ever handed back to the collaborator traits that
/// produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pointer width of the code being emulated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bitness {
    /// 32-bit protected mode.
    X86,
    /// 64-bit long mode.
    X64,
}

impl Bitness {
    /// Pointer size in bytes.
    #[must_use]
    pub fn pointer_size(self) -> u64 {
        match self {
            Bitness::X86 => 4,
            Bitness::X64 => 8,
        }
    }

    /// Bitness value expected by the iced-x86 decoder (32 or 64).
    #[must_use]
    pub fn decoder_bitness(self) -> u32 {
        match self {
            Bitness::X86 => 32,
            Bitness::X64 => 64,
        }
    }

    /// The canonical user/kernel address split for this width.
    ///
    /// Addresses at or above the split belong to kernel space. The 32-bit value assumes
    /// the default 2GB/2GB layout; /3GB installs are not special-cased.
    #[must_use]
    pub fn kernel_split(self) -> u64 {
        match self {
            Bitness::X86 => 0x8000_0000,
            Bitness::X64 => 0x8000_0000_0000_0000,
        }
    }

    /// Mask truncating a value to this pointer width.
    #[must_use]
    pub fn pointer_mask(self) -> u64 {
        match self {
            Bitness::X86 => 0xffff_ffff,
            Bitness::X64 => u64::MAX,
        }
    }
}

/// One detection candidate: a kernel timer whose APC carries a user-mode routine.
///
/// Produced by a [`CandidateEnumerator`], which is also responsible for WoW64
/// routine-address decoding and for filtering out APCs with no user-mode routine or an
/// invalid owning process. A `Candidate` is immutable for its lifetime and nothing in the
/// emulation of one candidate is visible to another.
#[derive(Clone, Debug)]
pub struct Candidate {
    /// Owning process of the APC's target thread.
    pub process_id: ProcessId,
    /// Image name of the owning process, for reporting.
    pub process_name: String,
    /// Thread the APC was queued to.
    pub thread_id: u32,
    /// Entry point of the APC's user-mode (normal) routine.
    pub routine: u64,
    /// Raw value of the APC's context pointer argument.
    ///
    /// This is both the single argument handed to the routine and, for Gargoyle-style
    /// chains, the address of a saved `_CONTEXT` the routine pivots its stack onto.
    pub apc_context: u64,
    /// Pointer width of the owning process.
    pub bitness: Bitness,
    /// `true` when the owning process runs 32-bit code under a 64-bit kernel.
    ///
    /// Such candidates are carried through enumeration but export resolution declines
    /// them, so they can never produce a positive detection.
    pub wow64: bool,
}

/// Produces the finite sequence of candidates found in a captured image.
///
/// Kernel timer/APC discovery is the enumerator's concern; this crate only consumes its
/// output, in order, exactly once per run.
pub trait CandidateEnumerator {
    /// Enumerates all timer/APC candidates in the image.
    fn candidates(&self) -> Result<Vec<Candidate>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_widths() {
        assert_eq!(Bitness::X86.pointer_size(), 4);
        assert_eq!(Bitness::X64.pointer_size(), 8);
        assert_eq!(Bitness::X86.decoder_bitness(), 32);
        assert_eq!(Bitness::X64.decoder_bitness(), 64);
    }

    #[test]
    fn test_kernel_split() {
        assert!(0x7fff_0000 < Bitness::X86.kernel_split());
        assert!(0xffff_8000_0000_0000u64 >= Bitness::X64.kernel_split());
    }
}
