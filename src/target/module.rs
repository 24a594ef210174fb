//! Loaded-module and export-directory contracts.

use super::candidate::ProcessId;
use crate::Result;

/// One loaded module of a process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Base file name of the module (e.g. `KERNEL32.DLL`), as recorded in the loader list.
    pub name: String,
    /// Load base inside the owning process.
    pub base: u64,
    /// Mapped size in bytes, when known. Zero if the enumerator could not determine it.
    pub size: u64,
}

/// Lists a process's loaded modules, in memory order.
///
/// Walking the loader structures (PEB/LDR lists, or their kernel-side equivalents) is the
/// enumerator's concern.
pub trait ModuleEnumerator: Send + Sync {
    /// Enumerates the modules loaded in `process`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Unreadable`] if the loader structures are not resident.
    fn modules(&self, process: ProcessId) -> Result<Vec<ModuleInfo>>;
}

/// One named export of a module, with its resolved virtual address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportEntry {
    /// Export name as found in the export name table.
    pub name: String,
    /// Absolute address (module base + export RVA).
    pub address: u64,
}

/// Parses a module's export name table from its reconstructed in-memory headers.
///
/// [`crate::pe::PeExportReader`] is the bundled implementation; tests substitute counting
/// mocks to observe cache behavior.
pub trait ExportDirectoryReader: Send + Sync {
    /// Returns all named exports of `module` inside `process`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Unreadable`] if the headers are paged out,
    /// [`crate::Error::MalformedModule`] if they do not parse.
    fn exports(&self, process: ProcessId, module: &ModuleInfo) -> Result<Vec<ExportEntry>>;
}
