//! Draft composer: pattern mining, prompt construction, and draft scoring.

pub mod draft;
pub mod patterns;
pub mod prompt;

pub use draft::{ComposedDraft, DraftComposer, MAX_DRAFT_CHARS};
pub use patterns::{MarkerStructureClassifier, Pattern, PatternMiner, StructureClassifier};
