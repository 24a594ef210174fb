//! The bounded per-candidate emulation loop.
//!
//! One [`EmulationSession`] runs one candidate routine from entry to a terminal
//! condition, wiring together the page-fault bridge, the CPU core and the ABI adapter.
//! Faults are not an interrupt model here: memory accesses resolve missing pages
//! synchronously inside the access, so the loop itself only ever sees "step succeeded"
//! or "step failed with a classified error". That keeps the state machine deterministic
//! and directly testable.
//!
//! After every successful step the session inspects the new machine state, in this
//! order: sentinel return, `NtContinue` trampoline, stack pivot, protection-API
//! interception, jump into an adjusted range. The ordering matters: a chain that
//! pivots and calls `VirtualProtect` in the same gadget must record the pivot before
//! the interception rewrites the stack pointer.

use std::collections::HashMap;

use strum::Display;

use super::abi::{self, ProtectApi};
use super::cpu::Cpu;
use super::memory::SessionMemory;
use crate::target::{AddressSpaceReader, Bitness, Candidate, TypedObjectReader};
use crate::{Error, Result};

/// Tunable bounds for a single emulation session.
#[derive(Clone, Copy, Debug)]
pub struct EmulationLimits {
    /// Hard per-session instruction budget; guarantees termination on hostile code.
    pub max_steps: usize,
    /// Base of the private stack region mapped for the session.
    pub stack_base: u64,
    /// Size of the private stack region in bytes.
    pub stack_size: u64,
    /// Magic value standing in for the "APC handler returned" address. Must not
    /// collide with any real mapping.
    pub sentinel: u64,
    /// Offset into the stack region where the initial stack pointer is placed.
    pub entry_offset: u64,
}

impl Default for EmulationLimits {
    fn default() -> Self {
        EmulationLimits {
            max_steps: 10_000,
            stack_base: 0xf000_0000,
            stack_size: 2 * 1024 * 1024,
            sentinel: 0xc0de_babe,
            entry_offset: 0x100,
        }
    }
}

/// Why a session ended without a positive signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum AbortReason {
    /// A touched page was not resident in the captured image.
    #[strum(serialize = "unreadable memory")]
    UnreadableMemory,
    /// Bytes at the instruction pointer did not decode.
    #[strum(serialize = "invalid instruction")]
    InvalidInstruction,
    /// A decoded instruction fell outside the modeled subset.
    #[strum(serialize = "unsupported instruction")]
    UnsupportedInstruction,
    /// The step budget ran out before a terminal condition.
    #[strum(serialize = "step budget exhausted")]
    StepBudget,
    /// A stack pivot was seen but no protection export resolved, so intent can never
    /// be corroborated.
    #[strum(serialize = "stack pivot with no resolvable protection export")]
    NoProtectExport,
}

/// Terminal condition of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The routine returned through the sentinel without a positive jump.
    Completed,
    /// The routine jumped into a range it had itself made executable.
    PositiveJump,
    /// The session was cut short; the reason says why.
    Aborted(AbortReason),
}

/// Everything one session observed, positive or not.
#[derive(Clone, Debug)]
pub struct SessionReport {
    /// How the session ended.
    pub outcome: SessionOutcome,
    /// Stack pointer matched the candidate's APC context pointer at least once.
    pub stack_pivot: bool,
    /// At least one protection call was intercepted.
    pub permissions_adjusted: bool,
    /// Execution entered a previously adjusted range.
    pub jumped_to_adjusted: bool,
    /// Every (base, length) pair captured from intercepted protection calls, in call
    /// order.
    pub adjusted_ranges: Vec<(u64, u64)>,
    /// Address execution jumped to inside an adjusted range, or 0.
    pub probable_payload: u64,
    /// Instructions actually executed.
    pub steps: usize,
}

/// Single-candidate emulation driver.
///
/// Owns its CPU and page table exclusively; nothing observed here is visible to any
/// other candidate's session.
pub struct EmulationSession<'a> {
    cpu: Cpu,
    mem: SessionMemory<'a>,
    contexts: &'a dyn TypedObjectReader,
    limits: EmulationLimits,
    /// Resolved protection-export addresses to intercept at.
    intercepts: HashMap<u64, ProtectApi>,
    process: crate::target::ProcessId,
    bitness: Bitness,
    routine: u64,
    apc_context: u64,
}

impl<'a> EmulationSession<'a> {
    /// Prepares a session for one candidate.
    ///
    /// `intercepts` maps resolved export addresses to the API each one is; an empty
    /// map is legal and means a later stack pivot cannot be corroborated.
    #[must_use]
    pub fn new(
        reader: &'a dyn AddressSpaceReader,
        contexts: &'a dyn TypedObjectReader,
        candidate: &Candidate,
        intercepts: HashMap<u64, ProtectApi>,
        limits: EmulationLimits,
    ) -> Self {
        EmulationSession {
            cpu: Cpu::new(candidate.bitness),
            mem: SessionMemory::new(reader, candidate.process_id),
            contexts,
            limits,
            intercepts,
            process: candidate.process_id,
            bitness: candidate.bitness,
            routine: candidate.routine,
            apc_context: candidate.apc_context,
        }
    }

    /// Sets up the initial machine state: private stack, sentinel return address, the
    /// APC context as the routine's single explicit argument, entry at the routine.
    fn init(&mut self) {
        self.mem
            .map_zeroed(self.limits.stack_base, self.limits.stack_size);

        let sp = self.limits.stack_base + self.limits.entry_offset;
        let ptr = self.bitness.pointer_size() as usize;
        // The stack region is private and pre-mapped, so these writes cannot fail.
        let _ = self.mem.write_int(sp, self.limits.sentinel, ptr);
        match self.bitness {
            Bitness::X86 => {
                let _ = self.mem.write_int(sp + 4, self.apc_context, 4);
            }
            Bitness::X64 => {
                self.cpu
                    .regs
                    .write(iced_x86::Register::RCX, self.apc_context);
            }
        }
        self.cpu.regs.set_sp(sp);
        self.cpu.regs.set_rip(self.routine);
    }

    /// Applies the saved context an `NtContinue` trampoline points at.
    ///
    /// Only reachable on x64; the trampoline probe declines 32-bit sessions.
    fn restore_syscall_context(&mut self) -> Result<()> {
        let context_ptr = self.cpu.regs.read(iced_x86::Register::RCX).unwrap_or(0);
        let saved = self.contexts.saved_context(self.process, context_ptr)?;
        self.cpu.regs.apply_saved_context(&saved);
        Ok(())
    }

    fn classify(error: &Error) -> AbortReason {
        match error {
            Error::InvalidInstruction { .. } => AbortReason::InvalidInstruction,
            Error::UnsupportedInstruction { .. } => AbortReason::UnsupportedInstruction,
            _ => AbortReason::UnreadableMemory,
        }
    }

    /// Runs the session to a terminal condition and reports everything observed.
    #[must_use]
    pub fn run(mut self) -> SessionReport {
        self.init();

        let mut report = SessionReport {
            outcome: SessionOutcome::Aborted(AbortReason::StepBudget),
            stack_pivot: false,
            permissions_adjusted: false,
            jumped_to_adjusted: false,
            adjusted_ranges: Vec::new(),
            probable_payload: 0,
            steps: 0,
        };

        while report.steps < self.limits.max_steps {
            if let Err(error) = self.cpu.step(&mut self.mem) {
                log::debug!(
                    "session for routine {:#x} aborted at step {}: {error}",
                    self.routine,
                    report.steps
                );
                report.outcome = SessionOutcome::Aborted(Self::classify(&error));
                return report;
            }
            report.steps += 1;

            // NtContinue trampoline: resume from the staged context. The restored state
            // goes through the same inspections below; a context may resume straight
            // onto the sentinel or into an adjusted range.
            if abi::at_nt_continue(&self.cpu.regs, &mut self.mem) {
                if let Err(error) = self.restore_syscall_context() {
                    log::debug!("saved-context restore failed: {error}");
                    report.outcome = SessionOutcome::Aborted(Self::classify(&error));
                    return report;
                }
            }

            let rip = self.cpu.regs.rip();

            // Natural return through the sentinel: the handler finished politely.
            if rip == self.limits.sentinel {
                report.outcome = SessionOutcome::Completed;
                return report;
            }

            if !report.stack_pivot && self.cpu.regs.sp() == self.apc_context {
                report.stack_pivot = true;
                log::debug!(
                    "stack pivot onto APC context {:#x} at step {}",
                    self.apc_context,
                    report.steps
                );
                if self.intercepts.is_empty() {
                    report.outcome = SessionOutcome::Aborted(AbortReason::NoProtectExport);
                    return report;
                }
            }

            if let Some(&api) = self.intercepts.get(&rip) {
                let intercepted = abi::read_protect_call(api, &self.cpu.regs, &mut self.mem)
                    .and_then(|call| {
                        abi::synthesize_return(api, &mut self.cpu.regs, &mut self.mem)?;
                        Ok(call)
                    });
                match intercepted {
                    Ok(call) => {
                        log::debug!(
                            "intercepted {api} for range {:#x}+{:#x}",
                            call.base,
                            call.length
                        );
                        report.adjusted_ranges.push((call.base, call.length));
                        report.permissions_adjusted = true;
                    }
                    Err(error) => {
                        log::debug!("interception of {api} failed: {error}");
                        report.outcome = SessionOutcome::Aborted(Self::classify(&error));
                        return report;
                    }
                }
            }

            // Terminal positive signal: execution entered memory this routine made
            // executable. The interception above may have changed rip, so re-read it.
            let rip = self.cpu.regs.rip();
            if report
                .adjusted_ranges
                .iter()
                .any(|&(base, length)| rip >= base && rip < base.wrapping_add(length))
            {
                report.jumped_to_adjusted = true;
                report.probable_payload = rip;
                report.outcome = SessionOutcome::PositiveJump;
                return report;
            }
        }

        // Budget exhausted; the default outcome already says so.
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{ProcessId, SavedContext, SliceImage};

    const PID: ProcessId = ProcessId(3);

    struct NoContexts;
    impl TypedObjectReader for NoContexts {
        fn saved_context(&self, _: ProcessId, address: u64) -> crate::Result<SavedContext> {
            Err(Error::unreadable(address, 0x100))
        }
    }

    fn candidate(routine: u64, apc_context: u64, bitness: Bitness) -> Candidate {
        Candidate {
            process_id: PID,
            process_name: "victim.exe".into(),
            thread_id: 0x100,
            routine,
            apc_context,
            bitness,
            wow64: false,
        }
    }

    #[test]
    fn test_plain_return_completes_via_sentinel() {
        let mut image = SliceImage::new();
        image.add_region(PID, 0x40_0000, vec![0xc3]); // ret
        let session = EmulationSession::new(
            &image,
            &NoContexts,
            &candidate(0x40_0000, 0x9999, Bitness::X86),
            HashMap::new(),
            EmulationLimits::default(),
        );
        let report = session.run();
        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.steps, 1);
        assert!(!report.stack_pivot);
    }

    #[test]
    fn test_tight_loop_exhausts_exact_budget() {
        let mut image = SliceImage::new();
        image.add_region(PID, 0x40_0000, vec![0xeb, 0xfe]); // jmp $
        let limits = EmulationLimits {
            max_steps: 64,
            ..EmulationLimits::default()
        };
        let session = EmulationSession::new(
            &image,
            &NoContexts,
            &candidate(0x40_0000, 0x9999, Bitness::X86),
            HashMap::new(),
            limits,
        );
        let report = session.run();
        assert_eq!(report.outcome, SessionOutcome::Aborted(AbortReason::StepBudget));
        assert_eq!(report.steps, 64);
    }

    #[test]
    fn test_unmapped_routine_aborts_unreadable() {
        let image = SliceImage::new();
        let session = EmulationSession::new(
            &image,
            &NoContexts,
            &candidate(0x40_0000, 0x9999, Bitness::X86),
            HashMap::new(),
            EmulationLimits::default(),
        );
        let report = session.run();
        assert_eq!(
            report.outcome,
            SessionOutcome::Aborted(AbortReason::UnreadableMemory)
        );
    }

    #[test]
    fn test_pivot_without_exports_aborts() {
        // mov esp, imm32; nop
        let apc_context = 0x0060_0000u64;
        let mut code = vec![0xbc];
        code.extend_from_slice(&(apc_context as u32).to_le_bytes());
        code.push(0x90);
        let mut image = SliceImage::new();
        image.add_region(PID, 0x40_0000, code);

        let session = EmulationSession::new(
            &image,
            &NoContexts,
            &candidate(0x40_0000, apc_context, Bitness::X86),
            HashMap::new(),
            EmulationLimits::default(),
        );
        let report = session.run();
        assert!(report.stack_pivot);
        assert_eq!(
            report.outcome,
            SessionOutcome::Aborted(AbortReason::NoProtectExport)
        );
    }

    #[test]
    fn test_syscall_bytes_in_32_bit_code_are_not_a_trampoline() {
        // mov eax, 0x43 followed by syscall encoding bytes. A 64-bit session would
        // treat this as NtContinue and restore a saved context; a 32-bit session must
        // instead hit the unmodeled syscall instruction and abort there. NoContexts
        // errors on every lookup, so a restore attempt would surface as
        // UnreadableMemory rather than UnsupportedInstruction.
        let mut image = SliceImage::new();
        image.add_region(PID, 0x40_0000, vec![0xb8, 0x43, 0x00, 0x00, 0x00, 0x0f, 0x05]);
        let session = EmulationSession::new(
            &image,
            &NoContexts,
            &candidate(0x40_0000, 0x9999, Bitness::X86),
            HashMap::new(),
            EmulationLimits::default(),
        );
        let report = session.run();
        assert_eq!(
            report.outcome,
            SessionOutcome::Aborted(AbortReason::UnsupportedInstruction)
        );
        assert_eq!(report.steps, 1);
    }
}
