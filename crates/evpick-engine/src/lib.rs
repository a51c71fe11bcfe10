//! Image-aware half of the event decision engine: catalog building,
//! portrait matching, retrieval and the per-screen decision policy.

pub mod builder;
pub mod imaging;
pub mod policy;
pub mod retrieval;

pub use builder::{BuildReport, CatalogBuilder};
pub use policy::{Controller, Detector, EventFlow, LastClick, OcrEngine};
pub use retrieval::{MatchResult, Query, Retriever};
