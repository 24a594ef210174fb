//! Named-export resolution with a process-aware cache.
//!
//! The session's interception map is keyed on concrete addresses, so
//! before any emulation the detector must turn `"KERNEL32.DLL" / "VirtualProtect"` into
//! an address inside the candidate's process. Resolution walks the process's module
//! list for a case-insensitive name match and scans that module's export directory,
//! both supplied by collaborator traits, and caches the result for the lifetime of
//! the analysis run.
//!
//! Cache keys carry a scope: a module mapped in kernel space has the same export
//! addresses in every process, so its entries are shared run-wide, while a user-mode
//! DLL may be rebased per process and is keyed by its observed load base. Entries are
//! never invalidated; a captured image does not change under analysis.
//!
//! Resolution failures (module absent, header paged out, export not present) are
//! reported as `None` and logged, never as errors. Whether a missing export matters is
//! the caller's judgement (a stack pivot with nothing to intercept cannot be
//! corroborated), not the resolver's.

use dashmap::DashMap;

use crate::target::{Bitness, ExportDirectoryReader, ModuleEnumerator, ProcessId};

/// Scope half of a cache key.
///
/// Kernel-space modules resolve identically in every process; user modules are pinned
/// to the load base they were seen at.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Scope {
    Kernel,
    UserBase(u64),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    module: String,
    export: String,
    scope: Scope,
}

impl CacheKey {
    fn new(module: &str, export: &str, base: u64, bitness: Bitness) -> Self {
        let scope = if base >= bitness.kernel_split() {
            Scope::Kernel
        } else {
            Scope::UserBase(base)
        };
        CacheKey {
            module: module.to_ascii_lowercase(),
            export: export.to_ascii_lowercase(),
            scope,
        }
    }
}

/// Concurrent resolved-export cache, shared across all sessions of a run.
///
/// Concurrent inserts of the same key are benign: both writers computed the same
/// address from the same immutable image, so last-writer-wins is correct.
#[derive(Debug, Default)]
pub struct ExportCache {
    entries: DashMap<CacheKey, u64>,
}

impl ExportCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        ExportCache::default()
    }

    /// Number of cached resolutions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been resolved yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves named exports inside a process, against the shared cache.
pub struct ExportResolver<'a> {
    modules: &'a dyn ModuleEnumerator,
    exports: &'a dyn ExportDirectoryReader,
    cache: &'a ExportCache,
}

impl<'a> ExportResolver<'a> {
    /// Creates a resolver over the given collaborators and cache.
    #[must_use]
    pub fn new(
        modules: &'a dyn ModuleEnumerator,
        exports: &'a dyn ExportDirectoryReader,
        cache: &'a ExportCache,
    ) -> Self {
        ExportResolver {
            modules,
            exports,
            cache,
        }
    }

    /// Resolves `module_name!export_name` in `process`.
    ///
    /// Returns `None` for every failure mode (module not loaded, module header not
    /// resident, export absent) after logging the cause. A cache hit skips the
    /// export-table scan entirely.
    #[must_use]
    pub fn resolve(
        &self,
        process: ProcessId,
        bitness: Bitness,
        module_name: &str,
        export_name: &str,
    ) -> Option<u64> {
        let modules = match self.modules.modules(process) {
            Ok(modules) => modules,
            Err(error) => {
                log::debug!("module enumeration failed for {process}: {error}");
                return None;
            }
        };
        let module = modules
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(module_name))?;

        let key = CacheKey::new(module_name, export_name, module.base, bitness);
        if let Some(address) = self.cache.entries.get(&key) {
            return Some(*address);
        }

        let entries = match self.exports.exports(process, module) {
            Ok(entries) => entries,
            Err(error) => {
                log::debug!("export walk of {} failed: {error}", module.name);
                return None;
            }
        };
        let address = entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(export_name))
            .map(|e| e.address)?;

        self.cache.entries.insert(key, address);
        Some(address)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::target::{ExportEntry, ModuleInfo};
    use crate::Result;

    struct FixedModules(Vec<ModuleInfo>);
    impl ModuleEnumerator for FixedModules {
        fn modules(&self, _: ProcessId) -> Result<Vec<ModuleInfo>> {
            Ok(self.0.clone())
        }
    }

    struct CountingExports {
        entries: Vec<ExportEntry>,
        scans: AtomicUsize,
    }
    impl CountingExports {
        fn new(entries: Vec<(&str, u64)>) -> Self {
            CountingExports {
                entries: entries
                    .into_iter()
                    .map(|(name, address)| ExportEntry {
                        name: name.into(),
                        address,
                    })
                    .collect(),
                scans: AtomicUsize::new(0),
            }
        }
    }
    impl ExportDirectoryReader for CountingExports {
        fn exports(&self, _: ProcessId, _: &ModuleInfo) -> Result<Vec<ExportEntry>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            Ok(self.entries.clone())
        }
    }

    fn kernel32(base: u64) -> ModuleInfo {
        ModuleInfo {
            name: "KERNEL32.DLL".into(),
            base,
            size: 0x10_0000,
        }
    }

    #[test]
    fn test_resolve_case_insensitive() {
        let modules = FixedModules(vec![kernel32(0x7510_0000)]);
        let exports = CountingExports::new(vec![("VirtualProtect", 0x7510_4000)]);
        let cache = ExportCache::new();
        let resolver = ExportResolver::new(&modules, &exports, &cache);

        let address = resolver.resolve(ProcessId(4), Bitness::X86, "kernel32.dll", "virtualprotect");
        assert_eq!(address, Some(0x7510_4000));
    }

    #[test]
    fn test_cache_hit_skips_export_scan() {
        let modules = FixedModules(vec![kernel32(0x7510_0000)]);
        let exports = CountingExports::new(vec![("VirtualProtect", 0x7510_4000)]);
        let cache = ExportCache::new();
        let resolver = ExportResolver::new(&modules, &exports, &cache);

        let first = resolver.resolve(ProcessId(4), Bitness::X86, "KERNEL32.DLL", "VirtualProtect");
        let second = resolver.resolve(ProcessId(4), Bitness::X86, "KERNEL32.DLL", "VirtualProtect");
        assert_eq!(first, second);
        assert_eq!(exports.scans.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_kernel_scope_shared_across_processes() {
        // A module mapped above the user/kernel split caches process-independently.
        let base = 0xffff_f800_0100_0000;
        let modules = FixedModules(vec![ModuleInfo {
            name: "ntoskrnl.exe".into(),
            base,
            size: 0x80_0000,
        }]);
        let exports = CountingExports::new(vec![("KeSetTimer", base + 0x5000)]);
        let cache = ExportCache::new();
        let resolver = ExportResolver::new(&modules, &exports, &cache);

        resolver.resolve(ProcessId(4), Bitness::X64, "ntoskrnl.exe", "KeSetTimer");
        resolver.resolve(ProcessId(8), Bitness::X64, "ntoskrnl.exe", "KeSetTimer");
        assert_eq!(exports.scans.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_user_scope_keyed_by_base() {
        // The same DLL rebased in another process is a distinct cache entry.
        struct RebasedModules;
        impl ModuleEnumerator for RebasedModules {
            fn modules(&self, process: ProcessId) -> Result<Vec<ModuleInfo>> {
                let base = if process.0 == 4 { 0x7510_0000 } else { 0x7520_0000 };
                Ok(vec![kernel32(base)])
            }
        }
        let exports = CountingExports::new(vec![("VirtualProtect", 0x4000)]);
        let cache = ExportCache::new();
        let resolver = ExportResolver::new(&RebasedModules, &exports, &cache);

        resolver.resolve(ProcessId(4), Bitness::X86, "KERNEL32.DLL", "VirtualProtect");
        resolver.resolve(ProcessId(8), Bitness::X86, "KERNEL32.DLL", "VirtualProtect");
        assert_eq!(exports.scans.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_missing_module_and_export_are_none() {
        let modules = FixedModules(vec![kernel32(0x7510_0000)]);
        let exports = CountingExports::new(vec![("VirtualProtect", 0x7510_4000)]);
        let cache = ExportCache::new();
        let resolver = ExportResolver::new(&modules, &exports, &cache);

        assert_eq!(
            resolver.resolve(ProcessId(4), Bitness::X86, "user32.dll", "VirtualProtect"),
            None
        );
        assert_eq!(
            resolver.resolve(ProcessId(4), Bitness::X86, "KERNEL32.DLL", "LoadLibraryA"),
            None
        );
        assert!(cache.is_empty());
    }
}
