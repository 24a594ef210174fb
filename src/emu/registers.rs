//! Concrete general-purpose register file with x86/x64 sub-register semantics.

use bitflags::bitflags;
use iced_x86::{ConditionCode, Register};

use crate::target::Bitness;

bitflags! {
    /// The modeled subset of RFLAGS, at their architectural bit positions.
    ///
    /// Parity and auxiliary-carry are not modeled; branches conditioned on them are
    /// reported as unsupported instructions by the CPU core.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Flags: u32 {
        /// Carry flag.
        const CF = 0x0001;
        /// Zero flag.
        const ZF = 0x0040;
        /// Sign flag.
        const SF = 0x0080;
        /// Overflow flag.
        const OF = 0x0800;
    }
}

impl Flags {
    /// Evaluates a decoded condition code against the modeled flags.
    ///
    /// Returns `None` for conditions that depend on unmodeled flags (parity).
    #[must_use]
    pub fn condition(self, cc: ConditionCode) -> Option<bool> {
        let cf = self.contains(Flags::CF);
        let zf = self.contains(Flags::ZF);
        let sf = self.contains(Flags::SF);
        let of = self.contains(Flags::OF);
        match cc {
            ConditionCode::e => Some(zf),
            ConditionCode::ne => Some(!zf),
            ConditionCode::b => Some(cf),
            ConditionCode::ae => Some(!cf),
            ConditionCode::be => Some(cf || zf),
            ConditionCode::a => Some(!cf && !zf),
            ConditionCode::s => Some(sf),
            ConditionCode::ns => Some(!sf),
            ConditionCode::l => Some(sf != of),
            ConditionCode::ge => Some(sf == of),
            ConditionCode::le => Some(zf || sf != of),
            ConditionCode::g => Some(!zf && sf == of),
            ConditionCode::o => Some(of),
            ConditionCode::no => Some(!of),
            _ => None,
        }
    }
}

/// The sixteen general-purpose registers plus instruction pointer and status flags.
///
/// Values are always held zero-extended to 64 bits; sub-register writes follow the
/// architecture (8/16-bit writes merge, 32-bit writes zero-extend the upper half). In
/// 32-bit sessions the upper halves are simply never populated and the instruction
/// pointer is truncated on write.
#[derive(Clone, Debug)]
pub struct RegisterFile {
    gpr: [u64; 16],
    rip: u64,
    /// Status flags produced by the modeled arithmetic/logic instructions.
    pub flags: Flags,
    bitness: Bitness,
}

/// Index of rsp within the GPR block (architectural encoding order).
const RSP_INDEX: usize = 4;

impl RegisterFile {
    /// Creates a zeroed register file for the given width.
    #[must_use]
    pub fn new(bitness: Bitness) -> Self {
        RegisterFile {
            gpr: [0; 16],
            rip: 0,
            flags: Flags::empty(),
            bitness,
        }
    }

    /// Pointer width this file was created for.
    #[must_use]
    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    /// Current instruction pointer.
    #[must_use]
    pub fn rip(&self) -> u64 {
        self.rip
    }

    /// Sets the instruction pointer, truncated to the session's pointer width.
    pub fn set_rip(&mut self, value: u64) {
        self.rip = value & self.bitness.pointer_mask();
    }

    /// Current stack pointer.
    #[must_use]
    pub fn sp(&self) -> u64 {
        self.gpr[RSP_INDEX] & self.bitness.pointer_mask()
    }

    /// Sets the stack pointer, truncated to the session's pointer width.
    pub fn set_sp(&mut self, value: u64) {
        self.gpr[RSP_INDEX] = value & self.bitness.pointer_mask();
    }

    /// Maps a register to its GPR slot index, if it is a general-purpose register.
    fn slot(reg: Register) -> Option<usize> {
        let full = reg.full_register();
        if (Register::RAX..=Register::R15).contains(&full) {
            Some(full as usize - Register::RAX as usize)
        } else {
            None
        }
    }

    fn is_high_byte(reg: Register) -> bool {
        matches!(
            reg,
            Register::AH | Register::CH | Register::DH | Register::BH
        )
    }

    /// Reads a general-purpose register (any width), zero-extended to 64 bits.
    ///
    /// Returns `None` for non-GPR registers; the CPU core turns that into an
    /// unsupported-instruction abort.
    #[must_use]
    pub fn read(&self, reg: Register) -> Option<u64> {
        let slot = Self::slot(reg)?;
        let full = self.gpr[slot];
        Some(match reg.size() {
            1 if Self::is_high_byte(reg) => (full >> 8) & 0xff,
            1 => full & 0xff,
            2 => full & 0xffff,
            4 => full & 0xffff_ffff,
            _ => full,
        })
    }

    /// Writes a general-purpose register with architectural sub-register semantics.
    ///
    /// Returns `false` if the register is not a modeled GPR.
    pub fn write(&mut self, reg: Register, value: u64) -> bool {
        let Some(slot) = Self::slot(reg) else {
            return false;
        };
        let full = &mut self.gpr[slot];
        match reg.size() {
            1 if Self::is_high_byte(reg) => {
                *full = (*full & !0xff00) | ((value & 0xff) << 8);
            }
            1 => *full = (*full & !0xff) | (value & 0xff),
            2 => *full = (*full & !0xffff) | (value & 0xffff),
            4 => *full = value & 0xffff_ffff,
            _ => *full = value,
        }
        true
    }

    /// Bulk-applies a saved context (syscall-return path).
    pub fn apply_saved_context(&mut self, ctx: &crate::target::SavedContext) {
        self.write(Register::RAX, ctx.rax);
        self.write(Register::RCX, ctx.rcx);
        self.write(Register::RDX, ctx.rdx);
        self.write(Register::RBX, ctx.rbx);
        self.write(Register::RSP, ctx.rsp);
        self.write(Register::RBP, ctx.rbp);
        self.write(Register::RSI, ctx.rsi);
        self.write(Register::RDI, ctx.rdi);
        self.write(Register::R8, ctx.r8);
        self.write(Register::R9, ctx.r9);
        self.write(Register::R10, ctx.r10);
        self.write(Register::R11, ctx.r11);
        self.write(Register::R12, ctx.r12);
        self.write(Register::R13, ctx.r13);
        self.write(Register::R14, ctx.r14);
        self.write(Register::R15, ctx.r15);
        self.set_rip(ctx.rip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dword_write_zero_extends() {
        let mut regs = RegisterFile::new(Bitness::X64);
        regs.write(Register::RAX, 0xffff_ffff_ffff_ffff);
        regs.write(Register::EAX, 0x1234_5678);
        assert_eq!(regs.read(Register::RAX), Some(0x1234_5678));
    }

    #[test]
    fn test_subregister_writes_merge() {
        let mut regs = RegisterFile::new(Bitness::X64);
        regs.write(Register::RAX, 0x1111_2222_3333_4444);
        regs.write(Register::AX, 0xbeef);
        assert_eq!(regs.read(Register::RAX), Some(0x1111_2222_3333_beef));
        regs.write(Register::AH, 0x77);
        assert_eq!(regs.read(Register::RAX), Some(0x1111_2222_3333_77ef));
        assert_eq!(regs.read(Register::AH), Some(0x77));
        regs.write(Register::AL, 0x55);
        assert_eq!(regs.read(Register::AL), Some(0x55));
        assert_eq!(regs.read(Register::RAX), Some(0x1111_2222_3333_7755));
    }

    #[test]
    fn test_rip_truncated_in_32bit_mode() {
        let mut regs = RegisterFile::new(Bitness::X86);
        regs.set_rip(0x1_2345_6789);
        assert_eq!(regs.rip(), 0x2345_6789);
    }

    #[test]
    fn test_non_gpr_rejected() {
        let mut regs = RegisterFile::new(Bitness::X64);
        assert_eq!(regs.read(Register::XMM0), None);
        assert!(!regs.write(Register::FS, 0));
    }

    #[test]
    fn test_condition_codes() {
        let flags = Flags::ZF;
        assert_eq!(flags.condition(ConditionCode::e), Some(true));
        assert_eq!(flags.condition(ConditionCode::ne), Some(false));
        assert_eq!(flags.condition(ConditionCode::a), Some(false));
        assert_eq!((Flags::SF | Flags::OF).condition(ConditionCode::ge), Some(true));
        assert_eq!(Flags::SF.condition(ConditionCode::l), Some(true));
        assert_eq!(Flags::empty().condition(ConditionCode::p), None);
    }
}
