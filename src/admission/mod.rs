//! Admission control: per-opportunity scoring and classification.
//!
//! Every opportunity is scored against the run's `Policy` and classified as
//! AUTO_SUBMIT, REQUEST_APPROVAL, or SKIP. The daily quota check happens here
//! too: once the cap is reached every decision is a SKIP.

pub mod engine;
pub mod policy;
pub mod types;

pub use engine::{analyze, classify, decide};
pub use policy::{Policy, PolicyOverrides, QuotaConsumption, RiskTolerance};
pub use types::{Action, Analysis, Decision, SubScores};
