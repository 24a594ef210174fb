//! Bounded concrete single-step x86/x64 execution core.
//!
//! This is deliberately *not* a general-purpose emulator. It models exactly the subset of
//! the architecture that timer-APC ROP chains and API-call stubs are built from: data
//! movement, stack manipulation, control flow, and the flag-producing arithmetic/logic
//! instructions the conditional branches between them depend on. Decoding is done by
//! iced-x86, one instruction at a time, from pages faulted in on demand.
//!
//! Anything outside the subset (privileged instructions, SIMD, string operations,
//! fs/gs-segment-prefixed addressing as used by 32-bit-on-64-bit thunks) fails the step
//! with [`Error::UnsupportedInstruction`]. The session driver treats that as a recoverable
//! per-candidate abort, never as a crash: candidate code is untrusted and frequently
//! hostile, and refusing to guess is what keeps detections trustworthy.

use iced_x86::{Decoder, DecoderError, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

use super::memory::{page_base, SessionMemory, PAGE_SIZE};
use super::registers::{Flags, RegisterFile};
use crate::target::Bitness;
use crate::{Error, Result};

/// Longest x86 instruction encoding.
const MAX_INSTR_LEN: usize = 16;

/// A minimal x86/x64 CPU: register file plus per-instruction execution.
///
/// Memory is not owned here; every step borrows the session's page table so that fault
/// resolution stays an explicit, observable call.
pub struct Cpu {
    /// Architectural register state.
    pub regs: RegisterFile,
    bitness: Bitness,
}

impl Cpu {
    /// Creates a zeroed CPU for the given width.
    #[must_use]
    pub fn new(bitness: Bitness) -> Self {
        Cpu {
            regs: RegisterFile::new(bitness),
            bitness,
        }
    }

    /// Pointer size in bytes for the current mode.
    fn ptr_size(&self) -> usize {
        self.bitness.pointer_size() as usize
    }

    fn unsupported(&self, instr: &Instruction) -> Error {
        Error::UnsupportedInstruction {
            address: instr.ip(),
            mnemonic: format!("{:?}", instr.mnemonic()).to_lowercase(),
        }
    }

    /// Fetches and decodes the instruction at the current instruction pointer.
    ///
    /// The fetch faults in the containing page; if the encoding straddles a page
    /// boundary the next page is probed as well, tolerating its absence. An encoding
    /// that actually needed the absent bytes fails with [`Error::Unreadable`].
    pub fn decode_current(&self, mem: &mut SessionMemory<'_>) -> Result<Instruction> {
        let rip = self.regs.rip();
        let mut buf = [0u8; MAX_INSTR_LEN];
        #[allow(clippy::cast_possible_truncation)] // Bounded by page size
        let first = ((page_base(rip) + PAGE_SIZE - rip) as usize).min(MAX_INSTR_LEN);
        mem.read(rip, &mut buf[..first])?;
        let mut len = first;
        if first < MAX_INSTR_LEN && mem.try_read(rip + first as u64, &mut buf[first..]) {
            len = MAX_INSTR_LEN;
        }

        let mut decoder =
            Decoder::with_ip(self.bitness.decoder_bitness(), &buf[..len], rip, DecoderOptions::NONE);
        let mut instr = Instruction::default();
        decoder.decode_out(&mut instr);
        if instr.is_invalid() {
            // An encoding that ran out of truncated bytes straddles into the absent
            // page: that is a residency problem, not a malformed encoding.
            if decoder.last_error() == DecoderError::NoMoreBytes && len < MAX_INSTR_LEN {
                return Err(Error::unreadable(rip + len as u64, MAX_INSTR_LEN - len));
            }
            return Err(Error::InvalidInstruction { address: rip });
        }
        Ok(instr)
    }

    /// Executes exactly one instruction.
    ///
    /// # Errors
    ///
    /// [`Error::Unreadable`] when a touched page cannot be supplied,
    /// [`Error::InvalidInstruction`] when the bytes do not decode,
    /// [`Error::UnsupportedInstruction`] for anything outside the modeled subset.
    pub fn step(&mut self, mem: &mut SessionMemory<'_>) -> Result<()> {
        let instr = self.decode_current(mem)?;
        self.execute(&instr, mem)
    }

    /// Executes an already-decoded instruction.
    fn execute(&mut self, instr: &Instruction, mem: &mut SessionMemory<'_>) -> Result<()> {
        // Populated by control-flow instructions; everything else falls through to the
        // sequential successor.
        let mut flow: Option<u64> = None;

        match instr.mnemonic() {
            Mnemonic::Nop | Mnemonic::Endbr32 | Mnemonic::Endbr64 | Mnemonic::Cld => {}

            Mnemonic::Mov | Mnemonic::Movzx => {
                let value = self.read_operand(instr, 1, mem)?;
                self.write_operand(instr, 0, value, mem)?;
            }
            Mnemonic::Movsx | Mnemonic::Movsxd => {
                let value = self.read_operand(instr, 1, mem)?;
                let extended = sign_extend(value, self.op_size(instr, 1));
                self.write_operand(instr, 0, extended, mem)?;
            }
            Mnemonic::Lea => {
                let addr = self.effective_address(instr, 1)?;
                self.write_operand(instr, 0, addr, mem)?;
            }
            Mnemonic::Xchg => {
                let a = self.read_operand(instr, 0, mem)?;
                let b = self.read_operand(instr, 1, mem)?;
                self.write_operand(instr, 0, b, mem)?;
                self.write_operand(instr, 1, a, mem)?;
            }

            Mnemonic::Push => {
                // Resolve the value before moving the stack pointer (`push rsp`).
                let value = self.read_operand(instr, 0, mem)?;
                let value = sign_extend(value, self.op_size(instr, 0));
                let sp = self
                    .regs
                    .sp()
                    .wrapping_add_signed(i64::from(instr.stack_pointer_increment()));
                self.regs.set_sp(sp);
                mem.write_int(sp, value, self.ptr_size())?;
            }
            Mnemonic::Pop => {
                let value = mem.read_int(self.regs.sp(), self.ptr_size())?;
                // Adjust before the operand write so `pop rsp` takes the popped value.
                let sp = self
                    .regs
                    .sp()
                    .wrapping_add_signed(i64::from(instr.stack_pointer_increment()));
                self.regs.set_sp(sp);
                self.write_operand(instr, 0, value, mem)?;
            }
            Mnemonic::Leave => {
                let bp = self
                    .regs
                    .read(Register::RBP)
                    .ok_or_else(|| self.unsupported(instr))?;
                self.regs.set_sp(bp);
                let value = mem.read_int(self.regs.sp(), self.ptr_size())?;
                self.regs.set_sp(self.regs.sp() + self.ptr_size() as u64);
                self.regs.write(Register::RBP, value);
            }

            Mnemonic::Call => {
                if instr.op0_kind() == OpKind::FarBranch16 || instr.op0_kind() == OpKind::FarBranch32 {
                    return Err(self.unsupported(instr));
                }
                let target = self.read_operand(instr, 0, mem)?;
                let sp = self
                    .regs
                    .sp()
                    .wrapping_add_signed(i64::from(instr.stack_pointer_increment()));
                self.regs.set_sp(sp);
                mem.write_int(sp, instr.next_ip(), self.ptr_size())?;
                flow = Some(target);
            }
            Mnemonic::Ret => {
                let target = mem.read_int(self.regs.sp(), self.ptr_size())?;
                let sp = self
                    .regs
                    .sp()
                    .wrapping_add_signed(i64::from(instr.stack_pointer_increment()));
                self.regs.set_sp(sp);
                flow = Some(target);
            }
            Mnemonic::Jmp => {
                if instr.op0_kind() == OpKind::FarBranch16 || instr.op0_kind() == OpKind::FarBranch32 {
                    return Err(self.unsupported(instr));
                }
                flow = Some(self.read_operand(instr, 0, mem)?);
            }

            m if is_jcc(m) => {
                let taken = self
                    .regs
                    .flags
                    .condition(instr.condition_code())
                    .ok_or_else(|| self.unsupported(instr))?;
                if taken {
                    flow = Some(instr.near_branch_target());
                }
            }
            m if is_cmov(m) => {
                let taken = self
                    .regs
                    .flags
                    .condition(instr.condition_code())
                    .ok_or_else(|| self.unsupported(instr))?;
                if taken {
                    let value = self.read_operand(instr, 1, mem)?;
                    self.write_operand(instr, 0, value, mem)?;
                }
            }

            Mnemonic::Add => self.arith(instr, mem, ArithOp::Add, true)?,
            Mnemonic::Sub => self.arith(instr, mem, ArithOp::Sub, true)?,
            Mnemonic::Cmp => self.arith(instr, mem, ArithOp::Sub, false)?,
            Mnemonic::And => self.arith(instr, mem, ArithOp::And, true)?,
            Mnemonic::Test => self.arith(instr, mem, ArithOp::And, false)?,
            Mnemonic::Or => self.arith(instr, mem, ArithOp::Or, true)?,
            Mnemonic::Xor => self.arith(instr, mem, ArithOp::Xor, true)?,

            Mnemonic::Inc | Mnemonic::Dec => {
                let size = self.op_size(instr, 0);
                let lhs = self.read_operand(instr, 0, mem)?;
                let (result, is_sub) = if instr.mnemonic() == Mnemonic::Inc {
                    (lhs.wrapping_add(1), false)
                } else {
                    (lhs.wrapping_sub(1), true)
                };
                // inc/dec preserve CF.
                let cf = self.regs.flags.contains(Flags::CF);
                self.set_arith_flags(lhs, 1, result, size, is_sub);
                self.regs.flags.set(Flags::CF, cf);
                self.write_operand(instr, 0, result, mem)?;
            }
            Mnemonic::Neg => {
                let size = self.op_size(instr, 0);
                let value = self.read_operand(instr, 0, mem)?;
                let result = 0u64.wrapping_sub(value);
                self.set_arith_flags(0, value, result, size, true);
                self.regs
                    .flags
                    .set(Flags::CF, value & size_mask(size) != 0);
                self.write_operand(instr, 0, result, mem)?;
            }
            Mnemonic::Not => {
                let value = self.read_operand(instr, 0, mem)?;
                self.write_operand(instr, 0, !value, mem)?;
            }

            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => self.shift(instr, mem)?,

            _ => return Err(self.unsupported(instr)),
        }

        match flow {
            Some(target) => self.regs.set_rip(target),
            None => self.regs.set_rip(instr.next_ip()),
        }
        Ok(())
    }

    /// Two-operand arithmetic/logic with flag updates; `store` distinguishes
    /// `add`/`cmp`-style pairs.
    fn arith(
        &mut self,
        instr: &Instruction,
        mem: &mut SessionMemory<'_>,
        op: ArithOp,
        store: bool,
    ) -> Result<()> {
        let size = self.op_size(instr, 0);
        let lhs = self.read_operand(instr, 0, mem)?;
        let rhs = self.read_operand(instr, 1, mem)?;
        // Immediates narrower than the destination are sign-extended.
        let rhs = sign_extend(rhs, self.op_size(instr, 1));

        let result = match op {
            ArithOp::Add => lhs.wrapping_add(rhs),
            ArithOp::Sub => lhs.wrapping_sub(rhs),
            ArithOp::And => lhs & rhs,
            ArithOp::Or => lhs | rhs,
            ArithOp::Xor => lhs ^ rhs,
        };

        match op {
            ArithOp::Add => self.set_arith_flags(lhs, rhs, result, size, false),
            ArithOp::Sub => self.set_arith_flags(lhs, rhs, result, size, true),
            _ => self.set_logic_flags(result, size),
        }

        if store {
            self.write_operand(instr, 0, result, mem)?;
        }
        Ok(())
    }

    fn shift(&mut self, instr: &Instruction, mem: &mut SessionMemory<'_>) -> Result<()> {
        let size = self.op_size(instr, 0);
        let bits = size as u32 * 8;
        let count_mask = if bits == 64 { 0x3f } else { 0x1f };
        let value = self.read_operand(instr, 0, mem)? & size_mask(size);
        #[allow(clippy::cast_possible_truncation)] // Masked to at most 6 bits
        let count = (self.read_operand(instr, 1, mem)? & count_mask) as u32;
        if count == 0 {
            self.regs.set_rip(instr.next_ip());
            return Ok(());
        }

        let (result, carry) = match instr.mnemonic() {
            Mnemonic::Shl => {
                // A count past the operand width shifts everything out; no carry.
                let carry = count <= bits && (value >> (bits - count)) & 1 != 0;
                (value.wrapping_shl(count), carry)
            }
            Mnemonic::Shr => {
                let carry = (value >> (count - 1)) & 1 != 0;
                (value.wrapping_shr(count), carry)
            }
            _ => {
                let carry = (value >> (count - 1)) & 1 != 0;
                let signed = sign_extend(value, size) as i64;
                (signed.wrapping_shr(count) as u64, carry)
            }
        };

        self.set_logic_flags(result, size);
        self.regs.flags.set(Flags::CF, carry);
        self.write_operand(instr, 0, result, mem)
    }

    fn set_logic_flags(&mut self, result: u64, size: usize) {
        let mask = size_mask(size);
        let sign = sign_bit(size);
        let flags = &mut self.regs.flags;
        flags.set(Flags::ZF, result & mask == 0);
        flags.set(Flags::SF, result & sign != 0);
        flags.set(Flags::CF, false);
        flags.set(Flags::OF, false);
    }

    fn set_arith_flags(&mut self, lhs: u64, rhs: u64, result: u64, size: usize, is_sub: bool) {
        let mask = size_mask(size);
        let sign = sign_bit(size);
        let (lhs, rhs, result) = (lhs & mask, rhs & mask, result & mask);
        let overflow = if is_sub {
            (lhs ^ rhs) & (lhs ^ result) & sign != 0
        } else {
            (lhs ^ result) & (rhs ^ result) & sign != 0
        };
        let carry = if is_sub { lhs < rhs } else { result < lhs };
        let flags = &mut self.regs.flags;
        flags.set(Flags::ZF, result == 0);
        flags.set(Flags::SF, result & sign != 0);
        flags.set(Flags::CF, carry);
        flags.set(Flags::OF, overflow);
    }

    /// Width in bytes of the given operand.
    fn op_size(&self, instr: &Instruction, op: u32) -> usize {
        match instr.op_kind(op) {
            OpKind::Register => instr.op_register(op).size(),
            OpKind::Memory => instr.memory_size().size(),
            OpKind::Immediate8 | OpKind::Immediate8_2nd => 1,
            OpKind::Immediate16 => 2,
            OpKind::Immediate32 | OpKind::Immediate8to32 => 4,
            OpKind::Immediate64 | OpKind::Immediate8to64 | OpKind::Immediate32to64 => 8,
            OpKind::Immediate8to16 => 2,
            _ => self.ptr_size(),
        }
    }

    /// Computes the virtual address of a memory operand.
    ///
    /// fs/gs-based addressing (TEB access, WoW64 thunks) is outside the model and fails
    /// as unsupported rather than being silently misread.
    fn effective_address(&self, instr: &Instruction, op: u32) -> Result<u64> {
        instr
            .virtual_address(op, 0, |reg, _, _| match reg {
                Register::CS | Register::DS | Register::ES | Register::SS => Some(0),
                Register::FS | Register::GS => None,
                r => self.regs.read(r),
            })
            .ok_or_else(|| self.unsupported(instr))
    }

    fn read_operand(
        &self,
        instr: &Instruction,
        op: u32,
        mem: &mut SessionMemory<'_>,
    ) -> Result<u64> {
        match instr.op_kind(op) {
            OpKind::Register => self
                .regs
                .read(instr.op_register(op))
                .ok_or_else(|| self.unsupported(instr)),
            OpKind::Memory => {
                let addr = self.effective_address(instr, op)?;
                mem.read_int(addr, instr.memory_size().size())
            }
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Ok(instr.near_branch_target())
            }
            _ => instr
                .try_immediate(op)
                .map_err(|_| self.unsupported(instr)),
        }
    }

    fn write_operand(
        &mut self,
        instr: &Instruction,
        op: u32,
        value: u64,
        mem: &mut SessionMemory<'_>,
    ) -> Result<()> {
        match instr.op_kind(op) {
            OpKind::Register => {
                if self.regs.write(instr.op_register(op), value) {
                    Ok(())
                } else {
                    Err(self.unsupported(instr))
                }
            }
            OpKind::Memory => {
                let addr = self.effective_address(instr, op)?;
                mem.write_int(addr, value, instr.memory_size().size())
            }
            _ => Err(self.unsupported(instr)),
        }
    }
}

/// Operation selector for [`Cpu::arith`].
#[derive(Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

/// Sign-extends the low `size` bytes of `value` to 64 bits.
fn sign_extend(value: u64, size: usize) -> u64 {
    match size {
        1 => value as u8 as i8 as i64 as u64,
        2 => value as u16 as i16 as i64 as u64,
        4 => value as u32 as i32 as i64 as u64,
        _ => value,
    }
}

fn size_mask(size: usize) -> u64 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

fn sign_bit(size: usize) -> u64 {
    1u64 << (size * 8 - 1)
}

fn is_jcc(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Ja
            | Mnemonic::Jae
            | Mnemonic::Jb
            | Mnemonic::Jbe
            | Mnemonic::Je
            | Mnemonic::Jne
            | Mnemonic::Jg
            | Mnemonic::Jge
            | Mnemonic::Jl
            | Mnemonic::Jle
            | Mnemonic::Jo
            | Mnemonic::Jno
            | Mnemonic::Jp
            | Mnemonic::Jnp
            | Mnemonic::Js
            | Mnemonic::Jns
    )
}

fn is_cmov(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Cmova
            | Mnemonic::Cmovae
            | Mnemonic::Cmovb
            | Mnemonic::Cmovbe
            | Mnemonic::Cmove
            | Mnemonic::Cmovne
            | Mnemonic::Cmovg
            | Mnemonic::Cmovge
            | Mnemonic::Cmovl
            | Mnemonic::Cmovle
            | Mnemonic::Cmovo
            | Mnemonic::Cmovno
            | Mnemonic::Cmovp
            | Mnemonic::Cmovnp
            | Mnemonic::Cmovs
            | Mnemonic::Cmovns
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{ProcessId, SliceImage};

    const PID: ProcessId = ProcessId(1);
    const CODE_BASE: u64 = 0x40_1000;

    fn assemble64(build: impl FnOnce(&mut iced_x86::code_asm::CodeAssembler)) -> Vec<u8> {
        let mut asm = iced_x86::code_asm::CodeAssembler::new(64).unwrap();
        build(&mut asm);
        asm.assemble(CODE_BASE).unwrap()
    }

    fn run(code: Vec<u8>, steps: usize) -> (Cpu, SliceImage) {
        let mut image = SliceImage::new();
        image.add_region(PID, CODE_BASE, code);
        image.add_region(PID, 0x7000, vec![0u8; 0x1000]); // scratch stack
        let mut cpu = Cpu::new(Bitness::X64);
        cpu.regs.set_rip(CODE_BASE);
        cpu.regs.set_sp(0x7800);
        {
            let mut mem = SessionMemory::new(&image, PID);
            for _ in 0..steps {
                cpu.step(&mut mem).unwrap();
            }
        }
        (cpu, image)
    }

    #[test]
    fn test_mov_add_sub() {
        use iced_x86::code_asm::*;
        let code = assemble64(|asm| {
            asm.mov(rax, 0x10u64).unwrap();
            asm.add(rax, 0x32).unwrap();
            asm.sub(rax, 2).unwrap();
        });
        let (cpu, _) = run(code, 3);
        assert_eq!(cpu.regs.read(Register::RAX), Some(0x40));
    }

    #[test]
    fn test_push_pop_roundtrip() {
        use iced_x86::code_asm::*;
        let code = assemble64(|asm| {
            asm.mov(rcx, 0xdead_beefu64).unwrap();
            asm.push(rcx).unwrap();
            asm.pop(rdx).unwrap();
        });
        let (cpu, _) = run(code, 3);
        assert_eq!(cpu.regs.read(Register::RDX), Some(0xdead_beef));
        assert_eq!(cpu.regs.sp(), 0x7800);
    }

    #[test]
    fn test_call_ret() {
        use iced_x86::code_asm::*;
        let code = assemble64(|asm| {
            let mut callee = asm.create_label();
            asm.call(callee).unwrap();
            asm.nop().unwrap();
            asm.set_label(&mut callee).unwrap();
            asm.ret().unwrap();
        });
        let (cpu, _) = run(code, 2); // call + ret
        assert_eq!(cpu.regs.rip(), CODE_BASE + 5); // back at the nop
        assert_eq!(cpu.regs.sp(), 0x7800);
    }

    #[test]
    fn test_conditional_branch_taken() {
        use iced_x86::code_asm::*;
        let code = assemble64(|asm| {
            let mut skip = asm.create_label();
            asm.xor(rax, rax).unwrap();
            asm.je(skip).unwrap();
            asm.mov(rbx, 1u64).unwrap();
            asm.set_label(&mut skip).unwrap();
            asm.mov(rcx, 2u64).unwrap();
        });
        let (cpu, _) = run(code, 3); // xor, je (taken), mov rcx
        assert_eq!(cpu.regs.read(Register::RBX), Some(0));
        assert_eq!(cpu.regs.read(Register::RCX), Some(2));
    }

    #[test]
    fn test_cmp_sets_flags() {
        use iced_x86::code_asm::*;
        let code = assemble64(|asm| {
            asm.mov(rax, 5u64).unwrap();
            asm.cmp(rax, 9).unwrap();
        });
        let (cpu, _) = run(code, 2);
        assert!(cpu.regs.flags.contains(Flags::CF)); // 5 - 9 borrows
        assert!(!cpu.regs.flags.contains(Flags::ZF));
    }

    #[test]
    fn test_memory_operand_faults_page_in() {
        use iced_x86::code_asm::*;
        let code = assemble64(|asm| {
            asm.mov(rax, 0x7000u64).unwrap();
            asm.mov(qword_ptr(rax), 0x55).unwrap();
            asm.mov(rbx, qword_ptr(rax)).unwrap();
        });
        let (cpu, _) = run(code, 3);
        assert_eq!(cpu.regs.read(Register::RBX), Some(0x55));
    }

    #[test]
    fn test_unsupported_instruction_reported() {
        // cpuid is far outside the modeled subset
        let mut image = SliceImage::new();
        image.add_region(PID, CODE_BASE, vec![0x0f, 0xa2]);
        let mut cpu = Cpu::new(Bitness::X64);
        cpu.regs.set_rip(CODE_BASE);
        let mut mem = SessionMemory::new(&image, PID);
        assert!(matches!(
            cpu.step(&mut mem),
            Err(Error::UnsupportedInstruction { .. })
        ));
    }

    #[test]
    fn test_fetch_straddling_absent_page_is_unreadable() {
        // mov eax, imm32 starting at the last byte of the only resident page: the
        // immediate lives in the absent page, so the encoding cannot be completed.
        let mut page = vec![0x90u8; PAGE_SIZE as usize];
        page[PAGE_SIZE as usize - 1] = 0xb8;
        let mut image = SliceImage::new();
        image.add_region(PID, 0x40_0000, page);

        let mut cpu = Cpu::new(Bitness::X64);
        cpu.regs.set_rip(0x40_0000 + PAGE_SIZE - 1);
        let mut mem = SessionMemory::new(&image, PID);
        assert!(matches!(cpu.step(&mut mem), Err(Error::Unreadable { .. })));
    }

    #[test]
    fn test_unmapped_fetch_is_unreadable() {
        let image = SliceImage::new();
        let mut cpu = Cpu::new(Bitness::X64);
        cpu.regs.set_rip(0x1234_0000);
        let mut mem = SessionMemory::new(&image, PID);
        assert!(matches!(cpu.step(&mut mem), Err(Error::Unreadable { .. })));
    }

    #[test]
    fn test_32bit_stack_width() {
        use iced_x86::code_asm::*;
        let mut asm = CodeAssembler::new(32).unwrap();
        asm.push(ebx).unwrap();
        asm.pop(esi).unwrap();
        let code = asm.assemble(CODE_BASE).unwrap();

        let mut image = SliceImage::new();
        image.add_region(PID, CODE_BASE, code);
        image.add_region(PID, 0x7000, vec![0u8; 0x1000]);
        let mut cpu = Cpu::new(Bitness::X86);
        cpu.regs.set_rip(CODE_BASE);
        cpu.regs.set_sp(0x7800);
        cpu.regs.write(Register::EBX, 0xcafe_f00d);
        let mut mem = SessionMemory::new(&image, PID);
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.regs.sp(), 0x77fc); // 4-byte slot
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.regs.read(Register::ESI), Some(0xcafe_f00d));
    }
}
