//! The implemented vulnerability detectors.
//! See their module descriptions for detailed information about each detector.
//!
//! All detectors are pure functions over the [`AnalysisResults`](crate::AnalysisResults)
//! of the earlier stages, they never rescan machine code.
//! They are heuristics that favor recall over precision:
//! false positives are expected and a finding is never suppressed
//! only because a guard looks unfamiliar.

pub mod smm_callout;
pub mod variable_overflow;
