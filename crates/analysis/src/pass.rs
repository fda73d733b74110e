//! The two-phase analysis pass contract.
//!
//! A pass collects findings off the owner thread, then has them
//! applied on the owner thread by the plan executor. The split is an
//! explicit state machine plus one trait; shared scaffolding (progress
//! counting, cancellation) is composed into the collect context rather
//! than inherited.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use vigil_primitives::{DocVersion, DocumentId, RopeSlice, TextRange};
use vigil_worker::CancelToken;

use crate::registry::PassId;

/// Severity of a finding. Orders low to high; `Error` wins layering
/// conflicts at the same offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
	Hint,
	Info,
	Warning,
	Error,
}

/// An action offered to the user to fix a finding. Opaque to the core;
/// the rendering collaborator decides how to present and invoke it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixAction {
	/// Label shown in the fix popup.
	pub label: String,
}

impl FixAction {
	/// Creates a fix action with the given label.
	pub fn new(label: impl Into<String>) -> Self {
		Self { label: label.into() }
	}
}

/// A single reported problem: range, severity, optional message and
/// fixes. Immutable after creation; ownership moves to the reconciler
/// when the producing pass is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
	/// The text range the finding covers.
	pub range: TextRange,
	/// Visual/layering severity.
	pub severity: Severity,
	/// Optional human-readable message.
	pub message: Option<String>,
	/// Offered quick fixes.
	pub quick_fixes: Vec<FixAction>,
	/// The pass that produced this finding.
	pub group: PassId,
	/// File-level findings are listed per view instead of anchored to
	/// a position.
	pub file_level: bool,
}

impl Finding {
	/// Creates a finding with no message or fixes.
	pub fn new(group: PassId, range: TextRange, severity: Severity) -> Self {
		Self {
			range,
			severity,
			message: None,
			quick_fixes: Vec::new(),
			group,
			file_level: false,
		}
	}

	/// Attaches a message.
	pub fn with_message(mut self, message: impl Into<String>) -> Self {
		self.message = Some(message.into());
		self
	}

	/// Attaches a quick fix.
	pub fn with_fix(mut self, fix: FixAction) -> Self {
		self.quick_fixes.push(fix);
		self
	}

	/// Marks the finding as file-level.
	pub fn file_level(mut self) -> Self {
		self.file_level = true;
		self
	}
}

/// Lifecycle of one pass instance within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
	/// Instantiated, background phase not yet submitted.
	Created,
	/// Background phase running on the worker pool.
	Collecting,
	/// Background phase finished; apply pending on the owner thread.
	AwaitingApply,
	/// Apply phase ran; terminal.
	Applied,
	/// Cancelled or aborted; terminal, reachable from any non-terminal
	/// state.
	Cancelled,
}

impl PassState {
	/// Returns true for terminal states.
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Applied | Self::Cancelled)
	}
}

/// Result of a background collection.
///
/// Cancellation is a distinct outcome, not an error: the pass observed
/// its token and stopped early, and whatever it produced is discarded.
#[derive(Debug)]
pub enum PassOutcome {
	/// Collection ran to completion over the requested range.
	Completed(Vec<Finding>),
	/// The pass observed cancellation and stopped.
	Cancelled,
}

/// Failure of a pass's background phase. Treated as a defect in the
/// pass: the dirty scope is retained so a later cycle retries.
#[derive(Debug, Clone, Error)]
pub enum PassError {
	/// The pass returned an error from `collect`.
	#[error("pass failed: {0}")]
	Failed(String),
	/// The background task panicked.
	#[error("pass panicked: {0}")]
	Panicked(String),
}

/// Monotonic progress counter for one pass instance.
///
/// Purely informational; has no effect on scheduling or correctness.
#[derive(Debug, Default)]
pub struct Progress {
	done: AtomicU64,
	limit: AtomicU64,
}

impl Progress {
	/// Creates an indeterminate progress counter.
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets the precomputed work limit. Zero means indeterminate.
	pub fn set_limit(&self, limit: u64) {
		self.limit.store(limit, Ordering::Relaxed);
	}

	/// Advances the counter by `n` completed units.
	pub fn advance(&self, n: u64) {
		self.done.fetch_add(n, Ordering::Relaxed);
	}

	/// Completed fraction in `[0, 1]`, or [`None`] while indeterminate.
	pub fn fraction(&self) -> Option<f64> {
		let limit = self.limit.load(Ordering::Relaxed);
		if limit == 0 {
			return None;
		}
		let done = self.done.load(Ordering::Relaxed).min(limit);
		Some(done as f64 / limit as f64)
	}
}

/// Everything a background phase may look at.
///
/// Deliberately excludes the displayed marker set and the status map:
/// those are owner-thread state a background phase must never touch.
pub struct CollectContext<'a> {
	/// Document under analysis.
	pub doc_id: DocumentId,
	/// Version of the snapshot being analyzed.
	pub doc_version: DocVersion,
	/// Immutable text snapshot.
	pub text: RopeSlice<'a>,
	/// The range this instance is asked to analyze.
	pub range: TextRange,
	/// Whether an earlier pass in this cycle already found an error.
	pub error_found: bool,
	/// Progress reporting handle.
	pub progress: &'a Progress,
}

/// One independent analysis stage.
///
/// `collect` runs off the owner thread, possibly concurrently with
/// other passes, and must poll `cancel` between discrete units of work
/// (per element, per line, per chunk). It must not block on other
/// passes; ordering constraints are declared on the descriptor and
/// enforced by the plan, never by waiting inside `collect`.
pub trait AnalysisPass: Send + Sync {
	/// Stable identity; must match the registered descriptor.
	fn id(&self) -> PassId;

	/// Background phase: analyze `ctx.range` and report findings.
	fn collect(&self, ctx: &CollectContext<'_>, cancel: &CancelToken) -> Result<PassOutcome, PassError>;
}
