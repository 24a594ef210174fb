//! Contracts for the captured target image.
//!
//! The detector core never touches a memory image directly. Everything it needs from the
//! capture (raw address-space reads, per-process module lists, export directories, saved
//! thread contexts, and the timer/APC candidates themselves) arrives through the traits
//! in this module. The heavy lifting behind them (kernel timer enumeration, typed kernel
//! object parsing, VAD bookkeeping) belongs to the surrounding forensic framework and is
//! deliberately outside this crate.
//!
//! Two ready-made [`AddressSpaceReader`] implementations are bundled:
//!
//! - [`SliceImage`] — an in-memory region list, used heavily by the test suite to build
//!   synthetic targets.
//! - [`FileImage`] — a memory-mapped flat dump for tooling and benches.

mod candidate;
mod context;
mod module;
mod reader;

pub use candidate::{Bitness, Candidate, CandidateEnumerator, ProcessId};
pub use context::{SavedContext, TypedObjectReader, WindowsContextReader};
pub use module::{ExportDirectoryReader, ExportEntry, ModuleEnumerator, ModuleInfo};
pub use reader::{AddressSpaceReader, FileImage, SliceImage};
