//! Candidate orchestration and result surfacing.

use std::collections::HashMap;

use rayon::prelude::*;
use strum::IntoEnumIterator;

use super::result::{AdjustedRange, Detection, Prologue};
use crate::emu::{
    page_base, AbortReason, EmulationLimits, EmulationSession, ProtectApi, SessionOutcome,
    SessionReport, PAGE_SIZE,
};
use crate::resolve::{ExportCache, ExportResolver};
use crate::target::{
    AddressSpaceReader, Candidate, ExportDirectoryReader, ModuleEnumerator, TypedObjectReader,
};

/// Module the protection APIs live in.
const PROTECT_MODULE: &str = "KERNEL32.DLL";

/// Bytes of the routine entry captured for presentation.
const PROLOGUE_LEN: usize = 16;

/// Emulation-driven Gargoyle detector.
///
/// One detector serves a whole analysis run: it owns the shared export cache and the
/// session limits, while the captured image and the structure-level collaborators are
/// borrowed. Candidates are independent, so the scanning entry points come in both a
/// lazy sequential flavor ([`scan`](Self::scan)) and an order-preserving parallel one
/// ([`scan_parallel`](Self::scan_parallel)).
pub struct GargoyleDetector<'a> {
    reader: &'a dyn AddressSpaceReader,
    modules: &'a dyn ModuleEnumerator,
    exports: &'a dyn ExportDirectoryReader,
    contexts: &'a dyn TypedObjectReader,
    cache: ExportCache,
    limits: EmulationLimits,
}

impl<'a> GargoyleDetector<'a> {
    /// Creates a detector with default session limits.
    #[must_use]
    pub fn new(
        reader: &'a dyn AddressSpaceReader,
        modules: &'a dyn ModuleEnumerator,
        exports: &'a dyn ExportDirectoryReader,
        contexts: &'a dyn TypedObjectReader,
    ) -> Self {
        Self::with_limits(reader, modules, exports, contexts, EmulationLimits::default())
    }

    /// Creates a detector with explicit session limits.
    #[must_use]
    pub fn with_limits(
        reader: &'a dyn AddressSpaceReader,
        modules: &'a dyn ModuleEnumerator,
        exports: &'a dyn ExportDirectoryReader,
        contexts: &'a dyn TypedObjectReader,
        limits: EmulationLimits,
    ) -> Self {
        GargoyleDetector {
            reader,
            modules,
            exports,
            contexts,
            cache: ExportCache::new(),
            limits,
        }
    }

    /// Resolves every interceptable protection API in the candidate's process.
    fn resolve_intercepts(&self, candidate: &Candidate) -> HashMap<u64, ProtectApi> {
        let resolver = ExportResolver::new(self.modules, self.exports, &self.cache);
        let mut intercepts = HashMap::new();
        for api in ProtectApi::iter() {
            match resolver.resolve(
                candidate.process_id,
                candidate.bitness,
                PROTECT_MODULE,
                api.as_ref(),
            ) {
                Some(address) => {
                    intercepts.insert(address, api);
                }
                None => log::debug!(
                    "{api} not resolvable in {} ({})",
                    candidate.process_name,
                    candidate.process_id
                ),
            }
        }
        intercepts
    }

    /// Captures the routine's entry bytes directly from the image.
    ///
    /// Falls back to the readable remainder of the entry page when the full window
    /// crosses into a missing page, and to an empty prologue when even the entry page
    /// is gone; prologue capture never fails a candidate.
    fn capture_prologue(&self, candidate: &Candidate) -> Prologue {
        let routine = candidate.routine;
        #[allow(clippy::cast_possible_truncation)] // Bounded by page size
        let in_page = ((page_base(routine) + PAGE_SIZE - routine) as usize).min(PROLOGUE_LEN);
        let bytes = self
            .reader
            .read_vec(candidate.process_id, routine, PROLOGUE_LEN)
            .or_else(|_| self.reader.read_vec(candidate.process_id, routine, in_page))
            .unwrap_or_else(|error| {
                log::debug!("prologue at {routine:#x} unreadable: {error}");
                Vec::new()
            });
        Prologue {
            address: routine,
            bytes,
            bitness: candidate.bitness,
        }
    }

    fn build(candidate: &Candidate, prologue: Prologue, report: SessionReport) -> Detection {
        Detection {
            process_id: candidate.process_id,
            process_name: candidate.process_name.clone(),
            thread_id: candidate.thread_id,
            routine: candidate.routine,
            stack_pivot_detected: report.stack_pivot,
            permissions_adjusted: report.permissions_adjusted,
            jumped_to_adjusted: report.jumped_to_adjusted,
            adjusted_ranges: report
                .adjusted_ranges
                .into_iter()
                .map(|(base, length)| AdjustedRange { base, length })
                .collect(),
            probable_payload: report.probable_payload,
            prologue,
            steps: report.steps,
            outcome: report.outcome,
        }
    }

    /// Runs one candidate end to end and reports everything observed, positive or not.
    ///
    /// This is the diagnostic entry point; the surfacing rule (only proven chains are
    /// reported) is applied by [`examine`](Self::examine) and the scanners, not here.
    ///
    /// WoW64 processes are an explicit capability gap: their export resolution is not
    /// supported, so their candidates are reported without emulation.
    #[must_use]
    pub fn evaluate(&self, candidate: &Candidate) -> Detection {
        let prologue = self.capture_prologue(candidate);

        if candidate.wow64 {
            log::warn!(
                "skipping WoW64 process {} ({}): export resolution unsupported",
                candidate.process_name,
                candidate.process_id
            );
            let report = SessionReport {
                outcome: SessionOutcome::Aborted(AbortReason::NoProtectExport),
                stack_pivot: false,
                permissions_adjusted: false,
                jumped_to_adjusted: false,
                adjusted_ranges: Vec::new(),
                probable_payload: 0,
                steps: 0,
            };
            return Self::build(candidate, prologue, report);
        }

        let intercepts = self.resolve_intercepts(candidate);
        let session = EmulationSession::new(
            self.reader,
            self.contexts,
            candidate,
            intercepts,
            self.limits,
        );
        let report = session.run();

        if report.jumped_to_adjusted {
            log::info!(
                "gargoyle chain in {} ({}): routine {:#x} jumped to payload {:#x} after {} steps",
                candidate.process_name,
                candidate.process_id,
                candidate.routine,
                report.probable_payload,
                report.steps
            );
        } else {
            log::debug!(
                "candidate routine {:#x} in {}: {:?} after {} steps, not reported",
                candidate.routine,
                candidate.process_name,
                report.outcome,
                report.steps
            );
        }

        Self::build(candidate, prologue, report)
    }

    /// Runs one candidate and keeps only a proven detection.
    ///
    /// Partial observations (a pivot alone, an adjustment never jumped into, any
    /// abort) are discarded here, not reported.
    #[must_use]
    pub fn examine(&self, candidate: &Candidate) -> Option<Detection> {
        let detection = self.evaluate(candidate);
        detection.is_positive().then_some(detection)
    }

    /// Lazily scans candidates in order, yielding only proven detections.
    ///
    /// One emulation attempt per candidate; the iterator is finite and not
    /// restartable.
    pub fn scan<'c, I>(&'c self, candidates: I) -> impl Iterator<Item = Detection> + 'c
    where
        I: IntoIterator<Item = Candidate>,
        I::IntoIter: 'c,
    {
        candidates
            .into_iter()
            .filter_map(move |candidate| self.examine(&candidate))
    }

    /// Scans candidates on the rayon pool, preserving candidate order in the output.
    ///
    /// Sessions share nothing but the read-only image and the export cache, so this is
    /// safe whenever the collaborators are.
    #[must_use]
    pub fn scan_parallel(&self, candidates: Vec<Candidate>) -> Vec<Detection> {
        candidates
            .into_par_iter()
            .filter_map(|candidate| self.examine(&candidate))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{ExportEntry, ModuleInfo, ProcessId, SavedContext, SliceImage};
    use crate::{Error, Result};

    struct NoModules;
    impl ModuleEnumerator for NoModules {
        fn modules(&self, _: ProcessId) -> Result<Vec<ModuleInfo>> {
            Ok(Vec::new())
        }
    }

    struct NoExports;
    impl ExportDirectoryReader for NoExports {
        fn exports(&self, _: ProcessId, _: &ModuleInfo) -> Result<Vec<ExportEntry>> {
            Ok(Vec::new())
        }
    }

    struct NoContexts;
    impl TypedObjectReader for NoContexts {
        fn saved_context(&self, _: ProcessId, address: u64) -> Result<SavedContext> {
            Err(Error::unreadable(address, 0x100))
        }
    }

    fn candidate(wow64: bool) -> Candidate {
        Candidate {
            process_id: ProcessId(9),
            process_name: "victim.exe".into(),
            thread_id: 0x200,
            routine: 0x40_1000,
            apc_context: 0x60_0000,
            bitness: crate::target::Bitness::X86,
            wow64,
        }
    }

    #[test]
    fn test_wow64_candidate_skipped_without_emulation() {
        let mut image = SliceImage::new();
        image.add_region(ProcessId(9), 0x40_1000, vec![0xc3]);
        let detector = GargoyleDetector::new(&image, &NoModules, &NoExports, &NoContexts);

        let detection = detector.evaluate(&candidate(true));
        assert_eq!(detection.steps, 0);
        assert!(!detection.is_positive());
        assert_eq!(
            detection.outcome,
            SessionOutcome::Aborted(AbortReason::NoProtectExport)
        );
        // The prologue is still captured for presentation.
        assert_eq!(detection.prologue.bytes, vec![0xc3]);
    }

    #[test]
    fn test_plain_return_not_surfaced() {
        let mut image = SliceImage::new();
        image.add_region(ProcessId(9), 0x40_1000, vec![0xc3]);
        let detector = GargoyleDetector::new(&image, &NoModules, &NoExports, &NoContexts);

        assert!(detector.examine(&candidate(false)).is_none());
        let detection = detector.evaluate(&candidate(false));
        assert_eq!(detection.outcome, SessionOutcome::Completed);
    }

    #[test]
    fn test_prologue_truncates_at_missing_page() {
        // Routine 9 bytes from the end of its only resident page.
        let mut image = SliceImage::new();
        image.add_region(ProcessId(9), 0x40_1000, vec![0x90; 0x1000]);
        let detector = GargoyleDetector::new(&image, &NoModules, &NoExports, &NoContexts);

        let mut c = candidate(false);
        c.routine = 0x40_1ff7;
        let detection = detector.evaluate(&c);
        assert_eq!(detection.prologue.bytes.len(), 9);
        assert_eq!(detection.prologue.address, 0x40_1ff7);
    }
}
