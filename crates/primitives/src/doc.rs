//! Document identity, versioning, and edit deltas.
//!
//! The document buffer itself is owned by the editor subsystem; the
//! analysis core only needs a stable identity, a monotonic version to
//! detect staleness, and the shape of an edit notification.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::range::TextRange;

/// Counter for generating unique document IDs.
static NEXT_DOCUMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentId(pub u64);

impl DocumentId {
	/// Generates a new unique document ID.
	pub fn next() -> Self {
		Self(NEXT_DOCUMENT_ID.fetch_add(1, Ordering::Relaxed))
	}
}

impl std::fmt::Display for DocumentId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "doc#{}", self.0)
	}
}

/// Document version, incremented on every committed edit.
///
/// Used to discard analysis results computed against stale snapshots.
pub type DocVersion = u64;

/// The shape of an edit notification: the replaced range in the old
/// coordinate space and the replacement range in the new one.
///
/// `before.start == after.start` for ordinary edits; a pure insertion
/// has an empty `before`, a pure deletion an empty `after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditDelta {
	/// Replaced range, in pre-edit coordinates.
	pub before: TextRange,
	/// Replacement range, in post-edit coordinates.
	pub after: TextRange,
}

impl EditDelta {
	/// Creates a new edit delta.
	pub fn new(before: TextRange, after: TextRange) -> Self {
		debug_assert_eq!(
			before.start, after.start,
			"EditDelta: before and after must share an anchor"
		);
		Self { before, after }
	}

	/// Insertion of `len` characters at `pos`.
	pub fn insert(pos: usize, len: usize) -> Self {
		Self::new(TextRange::empty_at(pos), TextRange::new(pos, pos + len))
	}

	/// Deletion of the given range.
	pub fn delete(range: TextRange) -> Self {
		Self::new(range, TextRange::empty_at(range.start))
	}

	/// The region damaged by this edit, in post-edit coordinates.
	///
	/// This is the minimal range a re-analysis must consider; callers
	/// typically union it with previously analyzed scopes it touches.
	pub fn damage(&self) -> TextRange {
		self.after
	}

	/// Signed length change of the document.
	pub fn len_delta(&self) -> isize {
		self.after.len() as isize - self.before.len() as isize
	}
}
