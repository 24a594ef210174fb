#![doc(html_no_source)]
#![deny(missing_docs)]

//! # stonegaze
//!
//! An emulation-driven detector for the **Gargoyle** memory-evasion technique, operating on
//! captured memory images of a running Windows system.
//!
//! Gargoyle-style malware keeps its payload pages non-executable while dormant. A kernel
//! timer periodically queues an APC whose user-mode routine walks a small ROP chain, calls
//! `VirtualProtect` to make the payload executable, jumps into it, and flips the protection
//! back afterwards. At rest, nothing in the image looks executable; the technique is
//! invisible to scanners that only inspect page permissions.
//!
//! `stonegaze` proves the behavior instead of pattern-matching it: for every timer/APC
//! candidate it single-steps the APC routine in a small, bounded x86/x64 emulator whose
//! memory is faulted in on demand from the captured image. A candidate is only reported
//! when the emulated routine was observed to (1) adjust page permissions through a resolved
//! `VirtualProtect`/`VirtualProtectEx` export and then (2) branch into the range it had just
//! adjusted.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stonegaze::prelude::*;
//!
//! # fn scan(reader: &dyn AddressSpaceReader, modules: &dyn ModuleEnumerator,
//! #         exports: &dyn ExportDirectoryReader, contexts: &dyn TypedObjectReader,
//! #         candidates: Vec<Candidate>) {
//! let detector = GargoyleDetector::new(reader, modules, exports, contexts);
//! for detection in detector.scan(candidates) {
//!     println!(
//!         "pid {} routine {:#x} payload {:#x}",
//!         detection.process_id.0,
//!         detection.routine,
//!         detection.probable_payload,
//!     );
//! }
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`target`] — contracts for the captured image: address-space reads, module lists,
//!   export directories, saved thread contexts, and the [`target::Candidate`] data model.
//!   Everything that enumerates kernel timers or parses typed kernel objects lives on the
//!   far side of these traits; this crate only consumes them.
//! - [`pe`] — a default [`target::ExportDirectoryReader`] that reconstructs a module's
//!   in-memory PE headers and walks its export tables.
//! - [`resolve`] — the cached export resolver mapping `module!export` to an address inside
//!   a given process.
//! - [`emu`] — the bounded single-step emulation core: register file, fault-driven session
//!   memory, calling-convention adapter, and the per-candidate session driver.
//! - [`detect`] — the detector itself and its [`detect::Detection`] results.
//!
//! ## Containment
//!
//! Every failure mode short of engine construction is scoped to one candidate: unreadable
//! pages, undecodable or unmodeled instructions, and budget exhaustion abort the current
//! session and the detector continues with the next candidate. See [`Error`] for the
//! taxonomy.
//!
//! ## Known capability gap
//!
//! WoW64 processes (32-bit code under a 64-bit kernel) are recognized but not analyzed:
//! export resolution declines them, so their candidates can never produce a positive
//! detection. This mirrors the capability of the analysis this crate was derived from and
//! is reported through logging rather than silently guessed around.

pub(crate) mod error;

pub mod detect;
pub mod emu;
pub mod pe;
pub mod prelude;
pub mod resolve;
pub mod target;

/// Convenience `Result` type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

pub use error::Error;

pub use detect::{Detection, GargoyleDetector, Prologue};
pub use emu::{AbortReason, EmulationLimits, SessionOutcome};
pub use resolve::{ExportCache, ExportResolver};
pub use target::{Bitness, Candidate, ProcessId};
