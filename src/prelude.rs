//! Convenient re-exports of the most commonly used types and traits.
//!
//! # Example
//!
//! ```rust,no_run
//! use stonegaze::prelude::*;
//!
//! # fn wire(reader: &dyn AddressSpaceReader, modules: &dyn ModuleEnumerator,
//! #         exports: &dyn ExportDirectoryReader, contexts: &dyn TypedObjectReader) {
//! let detector = GargoyleDetector::new(reader, modules, exports, contexts);
//! # let _ = detector;
//! # }
//! ```

pub use crate::detect::{Detection, GargoyleDetector, Prologue};
pub use crate::emu::{AbortReason, EmulationLimits, SessionOutcome};
pub use crate::pe::PeExportReader;
pub use crate::resolve::{ExportCache, ExportResolver};
pub use crate::target::{
    AddressSpaceReader, Bitness, Candidate, CandidateEnumerator, ExportDirectoryReader,
    ExportEntry, FileImage, ModuleEnumerator, ModuleInfo, ProcessId, SavedContext, SliceImage,
    TypedObjectReader, WindowsContextReader,
};
pub use crate::{Error, Result};
