//! Shared data model and pure policy for the event decision engine.
//!
//! Everything here is free of image and device dependencies: catalog rows,
//! user preferences, reward analysis, text scoring and the decision record
//! handed back to callers.

pub mod catalog;
pub mod decision;
pub mod prefs;
pub mod rewards;
pub mod text;
pub mod trace;
pub mod tuning;

pub use catalog::{Catalog, CatalogError, EventRecord, Outcome, RecordType};
pub use decision::{BoundingBox, Detection, EventDecision};
pub use prefs::{EventPolicy, PrefsError, UserPrefs};
pub use rewards::RewardCategory;
pub use tuning::{DecisionTuning, ScoreWeights};
