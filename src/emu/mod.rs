//! Bounded single-step emulation of candidate APC routines.
//!
//! The emulation stack has four layers, leaves first:
//!
//! - [`memory`] — the fault-driven page table bridging the emulator to the captured
//!   image.
//! - [`registers`] — the concrete register file with architectural sub-register
//!   semantics and the modeled flags subset.
//! - [`cpu`] — fetch/decode/execute for the modeled x86/x64 instruction subset.
//! - [`abi`] — calling-convention knowledge for the intercepted protection APIs and the
//!   `NtContinue` trampoline.
//! - [`session`] — the per-candidate state machine that drives all of the above to a
//!   terminal condition under a hard step budget.
//!
//! Sessions are fully isolated: each owns its pages and registers, so candidates can be
//! emulated concurrently without coordination beyond the shared read-only image.

pub mod abi;
pub mod cpu;
pub mod memory;
pub mod registers;
pub mod session;

pub use abi::{ProtectApi, ProtectCall, NT_CONTINUE_SERVICE, SYSCALL_OPCODE};
pub use cpu::Cpu;
pub use memory::{page_base, SessionMemory, PAGE_SIZE};
pub use registers::{Flags, RegisterFile};
pub use session::{AbortReason, EmulationLimits, EmulationSession, SessionOutcome, SessionReport};
