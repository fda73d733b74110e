//! Marker reconciliation: merging freshly computed findings into the
//! displayed marker set.
//!
//! The marker set is the authoritative "what the user currently sees".
//! It is mutated only on the owner thread, inside apply phases. A pass
//! apply replaces exactly the markers it previously owned within the
//! range it analyzed; other passes' markers are never touched.

use rustc_hash::FxHashMap;
use vigil_primitives::{CharIdx, DocumentId, EditDelta, TextRange};

use crate::pass::{Finding, Severity};
use crate::registry::PassId;
use crate::status::StatusMap;

/// Rendering collaborator boundary: the reconciler's sole output.
pub trait RenderSink: Send + Sync {
	/// The marker set for `doc` changed; repaint.
	fn publish(&self, doc: DocumentId, snapshot: &MarkerSnapshot);

	/// Progress feedback for an in-flight pass.
	fn pass_progress(&self, doc: DocumentId, pass: PassId, fraction: Option<f64>);
}

/// Immutable view of the displayed markers, handed to the render sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerSnapshot {
	/// Position-anchored markers, ordered by offset then severity.
	pub markers: Vec<Finding>,
	/// File-level annotations, not anchored to a position.
	pub file_level: Vec<Finding>,
}

/// One displayed marker: a finding plus anchor validity.
#[derive(Debug, Clone)]
struct Marker {
	finding: Finding,
	/// Cleared when intervening edits invalidate the anchor; such
	/// markers are dropped at the owning group's next reconciliation.
	valid: bool,
}

/// The currently-rendered collection of findings for one document.
#[derive(Debug, Default)]
pub struct MarkerSet {
	markers: Vec<Marker>,
	file_level: FxHashMap<PassId, Vec<Finding>>,
	/// Sticky: an edit landed inside an existing marker's range since
	/// the set was last rebuilt. While set, the whitespace-shift
	/// optimization is disabled.
	edited_inside_marker: bool,
}

impl MarkerSet {
	/// Creates an empty marker set.
	pub fn new() -> Self {
		Self::default()
	}

	/// Applies one pass's findings over one analyzed range.
	pub fn apply_findings(
		&mut self,
		doc: DocumentId,
		range: TextRange,
		group: PassId,
		findings: Vec<Finding>,
		status: &StatusMap,
		sink: &dyn RenderSink,
	) {
		self.apply_batch(doc, group, vec![(range, findings)], status, sink);
	}

	/// Applies one pass's findings arriving as several `(range,
	/// findings)` chunks in a single batch.
	///
	/// Overlapping or adjacent chunk ranges are merged first so the
	/// remove-then-add runs once against a consistent view.
	pub fn apply_batch(
		&mut self,
		doc: DocumentId,
		group: PassId,
		chunks: Vec<(TextRange, Vec<Finding>)>,
		status: &StatusMap,
		sink: &dyn RenderSink,
	) {
		let ranges = merge_ranges(chunks.iter().map(|(r, _)| *r));
		if ranges.is_empty() {
			return;
		}

		// 1) Remove this group's markers within the analyzed ranges,
		// plus its markers whose anchors were invalidated by edits.
		let before = self.markers.len();
		self.markers.retain(|m| {
			if m.finding.group != group {
				return true;
			}
			if !m.valid {
				return false;
			}
			!ranges.iter().any(|r| r.intersect(m.finding.range).is_some())
		});
		let removed = before - self.markers.len();

		// 2) Insert new markers; file-level findings replace the
		// group's per-view annotation list instead.
		self.file_level.remove(&group);
		let mut added = 0usize;
		let mut error_found = false;
		for (_, findings) in chunks {
			for finding in findings {
				debug_assert_eq!(finding.group, group, "finding group does not match applying pass");
				error_found |= finding.severity == Severity::Error;
				if finding.file_level {
					self.file_level.entry(group).or_default().push(finding);
					continue;
				}
				if !ranges.iter().any(|r| r.contains_range(finding.range)) {
					tracing::debug!(doc = %doc, pass = %group, range = %finding.range, "reconcile.drop_out_of_range_finding");
					continue;
				}
				self.markers.push(Marker { finding, valid: true });
				added += 1;
			}
		}

		// 3) Deterministic layering: offset order, then severity
		// (error above warning above the rest) for same-offset ties.
		self.markers.sort_by(|a, b| {
			a.finding
				.range
				.start
				.cmp(&b.finding.range.start)
				.then(b.finding.severity.cmp(&a.finding.severity))
				.then(a.finding.range.end.cmp(&b.finding.range.end))
		});

		// The set was rebuilt; whitespace shifting becomes safe again.
		self.edited_inside_marker = false;

		if error_found {
			status.set_error_found(doc);
		}
		for range in &ranges {
			status.mark_up_to_date(doc, group, *range);
		}
		tracing::debug!(doc = %doc, pass = %group, removed, added, "reconcile.apply");
		sink.publish(doc, &self.snapshot());
	}

	/// Records an edit against the displayed markers.
	///
	/// A pure-whitespace (or pure-comment) edit that does not land
	/// inside a marker and does not cross a marker boundary shifts
	/// marker positions instead of invalidating them. Every other edit
	/// shifts positions and invalidates the markers it touched; those
	/// linger until their group's next reconciliation drops them.
	pub fn note_edit(&mut self, delta: &EditDelta, shiftable_only: bool) {
		if self
			.markers
			.iter()
			.any(|m| edit_inside(m.finding.range, delta.before))
		{
			self.edited_inside_marker = true;
		}
		let shift_only = shiftable_only
			&& !self.edited_inside_marker
			&& !self
				.markers
				.iter()
				.any(|m| edit_crosses(m.finding.range, delta.before));

		for m in &mut self.markers {
			let old = m.finding.range;
			m.finding.range = map_marker_range(old, delta);
			if !shift_only && edit_touches_marker(old, delta.before) {
				m.valid = false;
			}
		}
	}

	/// Highest-severity valid marker containing `offset`.
	pub fn find_marker_at(&self, offset: CharIdx) -> Option<&Finding> {
		self.markers
			.iter()
			.filter(|m| m.valid && m.finding.range.contains(offset))
			.max_by_key(|m| m.finding.severity)
			.map(|m| &m.finding)
	}

	/// Walks valid markers of at least `min_severity` intersecting
	/// `range`, in display order, until `f` returns false. Returns
	/// true if the walk ran to completion.
	pub fn process_markers(
		&self,
		min_severity: Severity,
		range: TextRange,
		mut f: impl FnMut(&Finding) -> bool,
	) -> bool {
		self.markers
			.iter()
			.filter(|m| {
				m.valid
					&& m.finding.severity >= min_severity
					&& range.intersect(m.finding.range).is_some()
			})
			.all(|m| f(&m.finding))
	}

	/// True if any displayed finding has [`Severity::Error`].
	pub fn has_errors(&self) -> bool {
		self.markers
			.iter()
			.any(|m| m.valid && m.finding.severity == Severity::Error)
			|| self
				.file_level
				.values()
				.flatten()
				.any(|f| f.severity == Severity::Error)
	}

	/// File-level annotations for one group.
	pub fn file_level_for(&self, group: PassId) -> &[Finding] {
		self.file_level.get(&group).map_or(&[], Vec::as_slice)
	}

	/// Number of valid displayed markers.
	pub fn len(&self) -> usize {
		self.markers.iter().filter(|m| m.valid).count()
	}

	/// Returns true if nothing is displayed.
	pub fn is_empty(&self) -> bool {
		self.len() == 0 && self.file_level.values().all(Vec::is_empty)
	}

	/// Clones the displayed state for publication.
	pub fn snapshot(&self) -> MarkerSnapshot {
		MarkerSnapshot {
			markers: self
				.markers
				.iter()
				.filter(|m| m.valid)
				.map(|m| m.finding.clone())
				.collect(),
			file_level: self.file_level.values().flatten().cloned().collect(),
		}
	}
}

/// Merges overlapping or adjacent ranges into a minimal sorted set.
///
/// Ties where one range contains the other collapse into the outer
/// range, so remove-then-add never runs twice over the same markers.
fn merge_ranges(ranges: impl Iterator<Item = TextRange>) -> Vec<TextRange> {
	let mut sorted: Vec<TextRange> = ranges.collect();
	sorted.sort_by_key(|r| (r.start, r.end));
	let mut merged: Vec<TextRange> = Vec::with_capacity(sorted.len());
	for range in sorted {
		match merged.last_mut() {
			Some(last) if last.touches(range) => *last = last.union(range),
			_ => merged.push(range),
		}
	}
	merged
}

/// The edit landed strictly inside the marker's range.
fn edit_inside(marker: TextRange, before: TextRange) -> bool {
	if marker.is_empty() {
		return false;
	}
	if before.is_empty() {
		marker.start < before.start && before.start < marker.end
	} else {
		marker.contains_range(before)
	}
}

/// The edit straddles one of the marker's boundaries (or swallows the
/// marker entirely) without being contained in it.
fn edit_crosses(marker: TextRange, before: TextRange) -> bool {
	!before.is_empty() && before.intersects(marker) && !edit_inside(marker, before)
}

/// Whether the edit disturbs the marker's anchored text at all.
fn edit_touches_marker(marker: TextRange, before: TextRange) -> bool {
	if before.is_empty() {
		edit_inside(marker, before)
	} else {
		before.intersects(marker)
	}
}

/// Maps a marker range through an edit with anchor bias: the start
/// moves past insertions at its position, the end stays before them.
fn map_marker_range(range: TextRange, delta: &EditDelta) -> TextRange {
	let start = map_pos(range.start, delta, false);
	let end = map_pos(range.end, delta, true);
	TextRange::new(start, end.max(start))
}

fn map_pos(pos: CharIdx, delta: &EditDelta, stick_left: bool) -> CharIdx {
	let before = delta.before;
	let after = delta.after;
	if pos < before.start {
		return pos;
	}
	if pos == before.start {
		return if stick_left || !before.is_empty() {
			pos
		} else {
			after.end
		};
	}
	if pos >= before.end {
		return (pos + after.end).saturating_sub(before.end);
	}
	// Inside the replaced region: collapse to the nearest surviving edge.
	if stick_left { after.start } else { after.end }
}
