//! Gargoyle detection: per-candidate evaluation and result surfacing.
//!
//! [`GargoyleDetector`] drives one emulation session per candidate and applies the
//! surfacing invariant: a candidate is only ever reported when its routine demonstrably
//! jumped into memory it had itself made executable. Everything short of that
//! (pivot-only chains, adjustments never entered, aborts of any kind) stays available
//! through [`GargoyleDetector::evaluate`] for diagnostics but is never yielded by the
//! scanning entry points.

pub mod gargoyle;
pub mod result;

pub use gargoyle::GargoyleDetector;
pub use result::{AdjustedRange, Detection, Prologue};
