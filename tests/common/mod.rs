//! Shared fixtures for the detector integration tests.
//!
//! Synthetic targets are assembled from three pieces: a [`SliceImage`] holding code and
//! data regions at chosen addresses, fixed module/export collaborators standing in for
//! the loader-walking framework, and candidates pointing at assembled routines.

use std::sync::atomic::{AtomicUsize, Ordering};

use stonegaze::prelude::*;

pub const PID: ProcessId = ProcessId(0x1c8);
pub const ROUTINE: u64 = 0x40_1000;

/// Routes `log` output through the test harness; safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fixed module list, independent of process.
pub struct FixedModules(pub Vec<ModuleInfo>);

impl ModuleEnumerator for FixedModules {
    fn modules(&self, _: ProcessId) -> Result<Vec<ModuleInfo>> {
        Ok(self.0.clone())
    }
}

/// Fixed export list that counts how often the directory is scanned.
pub struct CountingExports {
    entries: Vec<ExportEntry>,
    scans: AtomicUsize,
}

impl CountingExports {
    pub fn new(entries: &[(&str, u64)]) -> Self {
        CountingExports {
            entries: entries
                .iter()
                .map(|(name, address)| ExportEntry {
                    name: (*name).into(),
                    address: *address,
                })
                .collect(),
            scans: AtomicUsize::new(0),
        }
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl ExportDirectoryReader for CountingExports {
    fn exports(&self, _: ProcessId, _: &ModuleInfo) -> Result<Vec<ExportEntry>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.clone())
    }
}

/// Context reader for targets that never reach a syscall trampoline.
pub struct NoContexts;

impl TypedObjectReader for NoContexts {
    fn saved_context(&self, _: ProcessId, address: u64) -> Result<SavedContext> {
        Err(Error::Unreadable { address, size: 0x100 })
    }
}

/// A kernel32 module covering the given export addresses.
pub fn kernel32(base: u64) -> ModuleInfo {
    ModuleInfo {
        name: "KERNEL32.DLL".into(),
        base,
        size: 0x10_0000,
    }
}

pub fn candidate(bitness: Bitness, apc_context: u64) -> Candidate {
    Candidate {
        process_id: PID,
        process_name: "victim.exe".into(),
        thread_id: 0x75c,
        routine: ROUTINE,
        apc_context,
        bitness,
        wow64: false,
    }
}

/// Assembles a routine at [`ROUTINE`] for the given mode.
pub fn assemble(
    bitness: u32,
    build: impl FnOnce(&mut iced_x86::code_asm::CodeAssembler),
) -> Vec<u8> {
    let mut asm = iced_x86::code_asm::CodeAssembler::new(bitness).unwrap();
    build(&mut asm);
    asm.assemble(ROUTINE).unwrap()
}
