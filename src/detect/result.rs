//! Per-candidate detection results.

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};

use crate::emu::SessionOutcome;
use crate::target::{Bitness, ProcessId};

/// One range whose protection an intercepted call adjusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdjustedRange {
    /// Start of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub length: u64,
}

impl AdjustedRange {
    /// Returns `true` if `address` lies inside the range.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.base.wrapping_add(self.length)
    }
}

/// The first bytes of a candidate routine, captured for presentation.
///
/// Capture happens once, directly from the image, independent of emulation. An empty
/// byte vector means the entry page was not resident.
#[derive(Clone, Debug)]
pub struct Prologue {
    /// Address the bytes were read from (the routine entry).
    pub address: u64,
    /// Raw instruction bytes, possibly truncated at a page boundary.
    pub bytes: Vec<u8>,
    /// Architecture to decode the bytes under.
    pub bitness: Bitness,
}

impl Prologue {
    /// Renders the prologue as one Intel-syntax instruction per line.
    ///
    /// Trailing bytes that do not decode are listed as `(bad)`.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut decoder = Decoder::with_ip(
            self.bitness.decoder_bitness(),
            &self.bytes,
            self.address,
            DecoderOptions::NONE,
        );
        let mut formatter = IntelFormatter::new();
        let mut instruction = Instruction::default();
        let mut line = String::new();
        let mut out = String::new();
        while decoder.can_decode() {
            decoder.decode_out(&mut instruction);
            line.clear();
            if instruction.is_invalid() {
                line.push_str("(bad)");
            } else {
                formatter.format(&instruction, &mut line);
            }
            out.push_str(&format!("{:#010x}  {line}\n", instruction.ip()));
        }
        out
    }
}

/// Everything the detector learned about one candidate.
///
/// Only results with [`is_positive`](Detection::is_positive) true are surfaced by the
/// detector's scanning entry points; the rest exist for diagnostics via
/// [`GargoyleDetector::evaluate`](crate::detect::GargoyleDetector::evaluate).
#[derive(Clone, Debug)]
pub struct Detection {
    /// Owning process of the timer APC.
    pub process_id: ProcessId,
    /// Image name of the owning process.
    pub process_name: String,
    /// Thread the APC was queued to.
    pub thread_id: u32,
    /// Entry address of the emulated APC routine.
    pub routine: u64,
    /// The stack pointer matched the APC context pointer at some step.
    pub stack_pivot_detected: bool,
    /// At least one protection call was intercepted.
    pub permissions_adjusted: bool,
    /// Execution entered a range a prior interception had adjusted.
    pub jumped_to_adjusted: bool,
    /// Adjusted ranges in interception order.
    pub adjusted_ranges: Vec<AdjustedRange>,
    /// Address inside an adjusted range that execution jumped to, or 0.
    pub probable_payload: u64,
    /// Entry bytes of the routine for presentation.
    pub prologue: Prologue,
    /// Instructions executed before the session terminated.
    pub steps: usize,
    /// How the underlying session ended.
    pub outcome: SessionOutcome,
}

impl Detection {
    /// `true` when the full pivot-adjust-jump chain was proven.
    ///
    /// Partial observations (a pivot alone, an adjustment never jumped into) stay
    /// negative.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.jumped_to_adjusted && self.probable_payload != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_membership() {
        let range = AdjustedRange {
            base: 0x2000,
            length: 0x1000,
        };
        assert!(range.contains(0x2000));
        assert!(range.contains(0x2fff));
        assert!(!range.contains(0x3000));
        assert!(!range.contains(0x1fff));
    }

    #[test]
    fn test_prologue_disassembles() {
        let prologue = Prologue {
            address: 0x40_1000,
            bytes: vec![0x55, 0x8b, 0xec], // push ebp; mov ebp, esp
            bitness: Bitness::X86,
        };
        let text = prologue.disassemble();
        assert!(text.contains("push"));
        assert!(text.contains("ebp"));
        assert!(text.starts_with("0x00401000"));
    }

    #[test]
    fn test_empty_prologue_renders_nothing() {
        let prologue = Prologue {
            address: 0x40_1000,
            bytes: Vec::new(),
            bitness: Bitness::X64,
        };
        assert!(prologue.disassemble().is_empty());
    }
}
