//! Calling-convention knowledge for the intercepted protection APIs.
//!
//! Interception happens at the *entry* of `VirtualProtect`/`VirtualProtectEx`: the
//! session never executes the API body. That makes this module responsible for the two
//! ABI-sensitive halves of the interception: reading the arguments the chain staged
//! (stdcall stack slots in 32-bit code, rcx/rdx/r8 in 64-bit code) and synthesizing the
//! return the real API would have performed, including the callee-side stack cleanup
//! stdcall mandates. Getting either half wrong desynchronizes the ROP chain and turns a
//! true positive into a budget abort, so both are pinned down by tests per convention.
//!
//! The module also recognizes the `NtContinue` syscall trampoline that legitimate APC
//! epilogues and Gargoyle chains alike end with.

use iced_x86::Register;
use strum::{AsRefStr, Display, EnumIter};

use super::memory::SessionMemory;
use super::registers::RegisterFile;
use crate::target::Bitness;
use crate::Result;

/// Encoding of the `syscall` instruction.
pub const SYSCALL_OPCODE: [u8; 2] = [0x0f, 0x05];

/// Service number of `NtContinue` on the supported Windows builds.
pub const NT_CONTINUE_SERVICE: u64 = 0x43;

/// Value the synthesized return reports: the BOOL success both APIs document.
const PROTECT_SUCCESS: u64 = 1;

/// The closed set of memory-protection APIs the session intercepts.
///
/// Interception is keyed on resolved export addresses, so only APIs that can be named
/// here and resolved out of the image are ever candidates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
pub enum ProtectApi {
    /// `VirtualProtect(lpAddress, dwSize, flNewProtect, lpflOldProtect)`.
    VirtualProtect,
    /// `VirtualProtectEx(hProcess, lpAddress, dwSize, flNewProtect, lpflOldProtect)`.
    VirtualProtectEx,
}

impl ProtectApi {
    /// Total argument count, which fixes the stdcall cleanup size.
    #[must_use]
    pub fn arg_count(self) -> usize {
        match self {
            ProtectApi::VirtualProtect => 4,
            ProtectApi::VirtualProtectEx => 5,
        }
    }

    /// Position of the region-address argument (`VirtualProtectEx` leads with a handle).
    fn address_arg(self) -> usize {
        match self {
            ProtectApi::VirtualProtect => 0,
            ProtectApi::VirtualProtectEx => 1,
        }
    }
}

/// Arguments recovered from an intercepted protection call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtectCall {
    /// Which API was entered.
    pub api: ProtectApi,
    /// Base of the region whose protection is changing.
    pub base: u64,
    /// Length of the region in bytes.
    pub length: u64,
}

/// Reads argument `index` (zero-based) per the convention of the session's width.
///
/// 32-bit stdcall keeps everything on the stack above the return address; the Microsoft
/// x64 convention passes the first four arguments in rcx, rdx, r8 and r9.
fn argument(
    regs: &RegisterFile,
    mem: &mut SessionMemory<'_>,
    bitness: Bitness,
    index: usize,
) -> Result<u64> {
    match bitness {
        Bitness::X86 => mem.read_int(regs.sp() + 4 * (index as u64 + 1), 4),
        Bitness::X64 => match index {
            0 => Ok(regs.read(Register::RCX).unwrap_or(0)),
            1 => Ok(regs.read(Register::RDX).unwrap_or(0)),
            2 => Ok(regs.read(Register::R8).unwrap_or(0)),
            3 => Ok(regs.read(Register::R9).unwrap_or(0)),
            // Fifth and later arguments sit above the 32-byte shadow space.
            n => mem.read_int(regs.sp() + 8 * (n as u64 + 1), 8),
        },
    }
}

/// Recovers the (base, length) pair from an intercepted call at API entry.
///
/// # Errors
///
/// [`crate::Error::Unreadable`](crate::Error) if a stack-passed argument's slot cannot
/// be supplied by the image.
pub fn read_protect_call(
    api: ProtectApi,
    regs: &RegisterFile,
    mem: &mut SessionMemory<'_>,
) -> Result<ProtectCall> {
    let at = api.address_arg();
    let base = argument(regs, mem, regs.bitness(), at)?;
    let length = argument(regs, mem, regs.bitness(), at + 1)?;
    Ok(ProtectCall { api, base, length })
}

/// Performs the return the skipped API body would have performed.
///
/// Pops the return address, applies stdcall callee cleanup of all argument slots in
/// 32-bit sessions (the x64 convention is caller-clean, so only the return address
/// comes off), and reports success in the return register.
///
/// # Errors
///
/// [`crate::Error::Unreadable`](crate::Error) if the return-address slot is not
/// resident.
pub fn synthesize_return(
    api: ProtectApi,
    regs: &mut RegisterFile,
    mem: &mut SessionMemory<'_>,
) -> Result<()> {
    let ptr = u64::from(regs.bitness().pointer_size());
    let return_address = mem.read_int(regs.sp(), ptr as usize)?;
    let cleanup = match regs.bitness() {
        Bitness::X86 => ptr * (api.arg_count() as u64 + 1),
        Bitness::X64 => ptr,
    };
    regs.set_sp(regs.sp() + cleanup);
    regs.set_rip(return_address);
    regs.write(Register::RAX, PROTECT_SUCCESS);
    Ok(())
}

/// Checks whether execution is parked on an `NtContinue` syscall trampoline.
///
/// True when the bytes at the instruction pointer encode `syscall` and the service
/// number register holds [`NT_CONTINUE_SERVICE`]. The opcode probe tolerates missing
/// pages: an unreadable instruction pointer is simply not a trampoline.
///
/// The trampoline and the saved-context layout behind it are 64-bit constructs, so
/// 32-bit sessions are always declined; stray `0f 05` bytes in 32-bit code reach the
/// CPU core instead and abort as unsupported.
#[must_use]
pub fn at_nt_continue(regs: &RegisterFile, mem: &mut SessionMemory<'_>) -> bool {
    if regs.bitness() != Bitness::X64 {
        return false;
    }
    let mut opcode = [0u8; 2];
    if !mem.try_read(regs.rip(), &mut opcode) || opcode != SYSCALL_OPCODE {
        return false;
    }
    regs.read(Register::RAX) == Some(NT_CONTINUE_SERVICE)
}
