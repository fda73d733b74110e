//! Core primitives for incremental analysis: text ranges, document
//! identity and versioning, and edit deltas.

/// Document identity and version types.
pub mod doc;
/// Async future helpers.
pub mod future;
/// Text range types and edit-delta mapping.
pub mod range;

pub use doc::{DocVersion, DocumentId, EditDelta};
pub use future::poll_once;
pub use range::{CharIdx, CharLen, TextRange};
pub use ropey::{Rope, RopeSlice};
