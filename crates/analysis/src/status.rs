//! Per-document dirty-scope ledger.
//!
//! Tracks, for every open document and every registered pass, which
//! text range is stale and needs re-analysis. Ranges only grow (by
//! union) under edits and only shrink under an explicit "pass
//! completed over exactly this scope" event. A document with no ledger
//! entry is fully dirty; entries are created lazily on first query and
//! removed explicitly when the document session closes.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use vigil_primitives::{CharLen, DocumentId, EditDelta, TextRange};

use crate::registry::{PassId, PassRegistry};

/// Per-pass slice of the ledger.
#[derive(Debug, Default, Clone)]
struct PassStatus {
	/// Range still needing re-analysis; [`None`] means up to date.
	dirty: Option<TextRange>,
	/// Scope most recently marked up to date. An edit touching this
	/// range re-dirties the union of both, so a marker at the edge of
	/// a completed scope is re-examined rather than left stale.
	completed: Option<TextRange>,
}

/// Ledger entry for one document.
#[derive(Debug, Default)]
struct DocStatus {
	scopes: FxHashMap<PassId, PassStatus>,
	/// Structural change of unknown blast radius occurred; promoted to
	/// a whole-document dirty range on the next scope query.
	defensively_marked: bool,
	/// Sticky per-cycle flag: an earlier pass found at least one error.
	error_found: bool,
}

/// Per-document, per-pass dirty-scope tracker.
///
/// The outer map lock is held only for entry lookup; all range work
/// happens under the per-document mutex, so different documents never
/// contend.
pub struct StatusMap {
	registry: Arc<PassRegistry>,
	docs: Mutex<FxHashMap<DocumentId, Arc<Mutex<DocStatus>>>>,
}

impl StatusMap {
	/// Creates a tracker over the given registry.
	pub fn new(registry: Arc<PassRegistry>) -> Self {
		Self {
			registry,
			docs: Mutex::new(FxHashMap::default()),
		}
	}

	fn entry(&self, doc: DocumentId) -> Option<Arc<Mutex<DocStatus>>> {
		self.docs.lock().get(&doc).cloned()
	}

	fn entry_or_create(&self, doc: DocumentId) -> Arc<Mutex<DocStatus>> {
		Arc::clone(self.docs.lock().entry(doc).or_insert_with(|| {
			let scopes = self
				.registry
				.ids()
				.map(|id| (id, PassStatus { dirty: None, completed: None }))
				.collect();
			// A fresh entry starts defensively marked: the first query
			// resolves it to "everything dirty" against the then-current
			// document length.
			Arc::new(Mutex::new(DocStatus {
				scopes,
				defensively_marked: true,
				error_found: false,
			}))
		}))
	}

	/// Drops the whole ledger: every document becomes fully dirty.
	///
	/// Used on global events (inspection profile change, color scheme
	/// change, dumb-mode transitions).
	pub fn mark_all_dirty(&self, reason: &str) {
		let mut docs = self.docs.lock();
		tracing::info!(reason, documents = docs.len(), "status.mark_all_dirty");
		docs.clear();
	}

	/// Unions `range` into every pass's dirty scope for `doc`.
	///
	/// No-op when the document has no ledger entry (already fully
	/// dirty). Clears the defensive flag: a concrete range means the
	/// blast radius is known.
	pub fn mark_dirty(&self, doc: DocumentId, range: TextRange) {
		let Some(entry) = self.entry(doc) else { return };
		let mut st = entry.lock();
		st.defensively_marked = false;
		for status in st.scopes.values_mut() {
			dirty_union(status, range);
		}
	}

	/// Records an edit: maps stored scopes through the delta, then
	/// unions the damaged region into every pass's dirty scope.
	pub fn note_edit(&self, doc: DocumentId, delta: &EditDelta) {
		let Some(entry) = self.entry(doc) else { return };
		let mut st = entry.lock();
		st.defensively_marked = false;
		for status in st.scopes.values_mut() {
			status.dirty = status.dirty.map(|r| r.map_through(delta));
			status.completed = status.completed.map(|r| r.map_through(delta));
			dirty_union(status, delta.damage());
		}
	}

	/// Flags the document as possibly-fully-dirty without computing a
	/// range. O(1); called on every structural pre-change notification.
	pub fn mark_defensively_dirty(&self, doc: DocumentId) {
		let Some(entry) = self.entry(doc) else { return };
		entry.lock().defensively_marked = true;
	}

	/// Marks `pass` up to date over exactly `covered`.
	///
	/// If `covered` only partially overlaps the dirty range, the
	/// uncovered remainder stays dirty; a scope is never marked wider
	/// clean than was actually analyzed.
	pub fn mark_up_to_date(&self, doc: DocumentId, pass: PassId, covered: TextRange) {
		let Some(entry) = self.entry(doc) else {
			tracing::debug!(doc = %doc, pass = %pass, "status.mark_up_to_date on untracked document");
			return;
		};
		let mut st = entry.lock();
		if st.defensively_marked {
			// Unresolved structural change: whatever the pass covered,
			// the real blast radius is unknown, so nothing becomes clean.
			return;
		}
		let Some(status) = st.scopes.get_mut(&pass) else {
			debug_assert!(false, "mark_up_to_date: unknown {pass}");
			tracing::error!(doc = %doc, pass = %pass, "status.mark_up_to_date: unknown pass id");
			return;
		};
		status.dirty = match status.dirty {
			None => None,
			Some(dirty) if covered.contains_range(dirty) => None,
			Some(dirty) => match covered.intersect(dirty) {
				// Covered a prefix or suffix: retain the remainder.
				Some(_) if covered.start <= dirty.start && covered.end < dirty.end => {
					Some(TextRange::new(covered.end, dirty.end))
				}
				Some(_) if covered.start > dirty.start && covered.end >= dirty.end => {
					Some(TextRange::new(dirty.start, covered.start))
				}
				// Covered a middle slice or nothing: keep the whole
				// range dirty rather than track two fragments.
				_ => Some(dirty),
			},
		};
		if status.dirty.is_none() {
			status.completed = Some(covered);
		}
		tracing::trace!(doc = %doc, pass = %pass, covered = %covered, clean = status.dirty.is_none(), "status.mark_up_to_date");
	}

	/// Returns the range `pass` must re-analyze, or [`None`] when it is
	/// fully up to date.
	///
	/// Resolves a pending defensive mark to a whole-document range
	/// first (lazily, exactly once). A document with no ledger entry
	/// gets one, fully dirty.
	pub fn query_dirty_scope(&self, doc: DocumentId, pass: PassId, doc_len: CharLen) -> Option<TextRange> {
		if !self.registry.contains(pass) {
			debug_assert!(false, "query_dirty_scope: unknown {pass}");
			tracing::error!(doc = %doc, pass = %pass, "status.query_dirty_scope: unknown pass id");
			return Some(TextRange::of_len(doc_len));
		}
		let entry = self.entry_or_create(doc);
		let mut st = entry.lock();
		if st.defensively_marked {
			let full = TextRange::of_len(doc_len);
			for status in st.scopes.values_mut() {
				status.dirty = Some(full);
			}
			st.defensively_marked = false;
		}
		let status = st.scopes.entry(pass).or_insert_with(|| PassStatus {
			dirty: Some(TextRange::of_len(doc_len)),
			completed: None,
		});
		match status.dirty.map(|r| r.clamp_to(doc_len)) {
			Some(clamped) if clamped.is_empty() => {
				// The dirty text no longer exists (deleted past EOF).
				status.dirty = None;
				None
			}
			clamped => {
				status.dirty = clamped;
				clamped
			}
		}
	}

	/// True only if a ledger entry exists, every registered pass is up
	/// to date, and no defensive mark is pending.
	pub fn is_fully_clean(&self, doc: DocumentId) -> bool {
		let Some(entry) = self.entry(doc) else { return false };
		let st = entry.lock();
		if st.defensively_marked {
			return false;
		}
		// The key set derives from the live registry, not from whatever
		// happens to be in the map.
		self.registry.ids().all(|id| {
			st.scopes
				.get(&id)
				.is_some_and(|status| status.dirty.is_none())
		})
	}

	/// Sets the sticky "an error was found this cycle" flag.
	pub fn set_error_found(&self, doc: DocumentId) {
		if let Some(entry) = self.entry(doc) {
			entry.lock().error_found = true;
		}
	}

	/// Reads the sticky error flag.
	pub fn error_found(&self, doc: DocumentId) -> bool {
		self.entry(doc).is_some_and(|entry| entry.lock().error_found)
	}

	/// Clears the sticky error flag at the start of a whole-file cycle.
	pub fn clear_error_found(&self, doc: DocumentId) {
		if let Some(entry) = self.entry(doc) {
			entry.lock().error_found = false;
		}
	}

	/// Drops one document's ledger entry, making it fully dirty.
	pub fn mark_document_dirty(&self, doc: DocumentId) {
		self.docs.lock().remove(&doc);
	}

	/// Removes the ledger entry for a closed document.
	pub fn on_document_closed(&self, doc: DocumentId) {
		self.docs.lock().remove(&doc);
	}

	/// Returns true if the document currently has a ledger entry.
	pub fn has_record(&self, doc: DocumentId) -> bool {
		self.docs.lock().contains_key(&doc)
	}
}

impl std::fmt::Debug for StatusMap {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StatusMap")
			.field("documents", &self.docs.lock().len())
			.finish()
	}
}

/// Unions `range` into the dirty scope, pulling in the previously
/// completed scope when the edit touches it.
fn dirty_union(status: &mut PassStatus, range: TextRange) {
	let mut dirty = match status.dirty {
		Some(d) => d.union(range),
		None => range,
	};
	if let Some(completed) = status.completed
		&& completed.touches(range)
	{
		dirty = dirty.union(completed);
	}
	status.dirty = Some(dirty);
}
