//! The owning controller of the analysis pipeline.
//!
//! Tracks per-document sessions (text snapshot, marker set, live
//! plan), turns edit notifications into dirty scopes and debounced
//! restarts, supersedes stale plans, and fans daemon lifecycle events
//! out to listeners. All methods run on the owner thread; background
//! work only ever happens inside plan executors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Semaphore;
use vigil_primitives::{DocVersion, DocumentId, EditDelta, Rope, TextRange};

use crate::pass::PassError;
use crate::plan::{ExecutorCfg, PassEvent, PassPlan, PlanExecutor, PlanSpec, Trigger};
use crate::reconcile::{MarkerSet, RenderSink};
use crate::registry::{LanguageTag, PassId, PassRegistry, ProviderTable};
use crate::status::StatusMap;

/// Daemon configuration.
#[derive(Debug, Clone, Copy)]
pub struct DaemonCfg {
	/// Background execution limits.
	pub executor: ExecutorCfg,
	/// Quiet period between an edit and the restart it schedules.
	pub restart_delay: Duration,
}

impl Default for DaemonCfg {
	fn default() -> Self {
		Self {
			executor: ExecutorCfg::default(),
			restart_delay: Duration::from_millis(100),
		}
	}
}

/// Daemon lifecycle events, published to registered listeners.
#[derive(Debug)]
pub enum DaemonEvent {
	/// An analysis cycle started for the document.
	Starting {
		/// The document.
		doc: DocumentId,
	},
	/// An analysis cycle ran to completion.
	Finished {
		/// The document.
		doc: DocumentId,
	},
	/// The in-flight cycle was cancelled.
	Cancelled {
		/// The document.
		doc: DocumentId,
		/// Why the cycle stopped.
		reason: String,
	},
	/// A pass's background phase failed; its scope stays dirty and the
	/// next cycle retries.
	PassFailed {
		/// The document.
		doc: DocumentId,
		/// The failing pass.
		pass: PassId,
		/// What went wrong.
		error: PassError,
	},
}

/// Listener seam for daemon lifecycle events.
pub trait DaemonListener: Send + Sync {
	/// Called on the owner thread for every daemon event.
	fn on_event(&self, event: &DaemonEvent);
}

/// One-way aggregate problem signal, pushed once per finished cycle.
/// Consumed by unrelated subsystems such as file-tree error badges.
pub trait ProblemSink: Send + Sync {
	/// The document's "has any error" state after a finished cycle.
	fn file_problems_changed(&self, doc: DocumentId, has_errors: bool);
}

/// Per-document session state, created on open and removed on close.
struct DocSession {
	text: Rope,
	version: DocVersion,
	language: LanguageTag,
	viewport: TextRange,
	markers: MarkerSet,
	running: Option<PlanExecutor>,
	/// Deadline of the next scheduled restart, if any.
	restart_at: Option<Instant>,
	pending_trigger: Trigger,
	next_generation: u64,
}

/// The incremental analysis daemon.
///
/// Not `Sync` by design: the daemon lives on the owner thread and its
/// `tick` is the only place apply phases, marker mutation, and
/// up-to-date transitions happen.
pub struct Daemon {
	registry: Arc<PassRegistry>,
	providers: Arc<ProviderTable>,
	status: StatusMap,
	cfg: DaemonCfg,
	permits: Arc<Semaphore>,
	sessions: FxHashMap<DocumentId, DocSession>,
	render: Arc<dyn RenderSink>,
	problems: Arc<dyn ProblemSink>,
	listeners: Vec<Arc<dyn DaemonListener>>,
	/// Nested update-by-timer disables; restarts only run at zero.
	disable_count: u32,
	power_save: bool,
}

impl Daemon {
	/// Creates a daemon over an initialized registry and provider
	/// table. Both are read-only from here on.
	pub fn new(
		registry: Arc<PassRegistry>,
		providers: Arc<ProviderTable>,
		render: Arc<dyn RenderSink>,
		problems: Arc<dyn ProblemSink>,
		cfg: DaemonCfg,
	) -> Self {
		let max_concurrency = cfg.executor.max_concurrency.max(1);
		Self {
			status: StatusMap::new(Arc::clone(&registry)),
			registry,
			providers,
			cfg,
			permits: Arc::new(Semaphore::new(max_concurrency)),
			sessions: FxHashMap::default(),
			render,
			problems,
			listeners: Vec::new(),
			disable_count: 0,
			power_save: false,
		}
	}

	/// Registers a lifecycle listener.
	pub fn add_listener(&mut self, listener: Arc<dyn DaemonListener>) {
		self.listeners.push(listener);
	}

	/// The dirty-scope tracker, for queries.
	pub fn status(&self) -> &StatusMap {
		&self.status
	}

	/// The displayed marker set for a document, for queries.
	pub fn marker_set(&self, doc: DocumentId) -> Option<&MarkerSet> {
		self.sessions.get(&doc).map(|s| &s.markers)
	}

	/// Opens a document session and schedules its first cycle.
	pub fn open_document(
		&mut self,
		doc: DocumentId,
		text: Rope,
		language: LanguageTag,
		viewport: TextRange,
	) {
		tracing::debug!(doc = %doc, language = %language, "daemon.open_document");
		self.sessions.insert(
			doc,
			DocSession {
				text,
				version: 1,
				language,
				viewport,
				markers: MarkerSet::new(),
				running: None,
				restart_at: Some(Instant::now()),
				pending_trigger: Trigger::Open,
				next_generation: 0,
			},
		);
	}

	/// Closes a document session: cancels the in-flight plan and drops
	/// the ledger entry and markers.
	pub fn close_document(&mut self, doc: DocumentId) {
		let Some(session) = self.sessions.remove(&doc) else { return };
		if let Some(executor) = session.running {
			executor.cancel("document closed");
			self.emit(DaemonEvent::Cancelled {
				doc,
				reason: "document closed".into(),
			});
		}
		self.status.on_document_closed(doc);
		tracing::debug!(doc = %doc, "daemon.close_document");
	}

	/// Structural pre-change notification: the blast radius is not
	/// known yet, so flag everything as possibly dirty. O(1).
	pub fn before_structural_change(&mut self, doc: DocumentId) {
		self.status.mark_defensively_dirty(doc);
	}

	/// Records a committed edit: updates the snapshot, grows dirty
	/// scopes, shifts or invalidates markers, supersedes the in-flight
	/// plan, and schedules a debounced restart.
	pub fn document_edited(&mut self, doc: DocumentId, delta: EditDelta, new_text: Rope) {
		let Some(session) = self.sessions.get_mut(&doc) else { return };
		let shiftable = whitespace_only(&session.text, delta.before) && whitespace_only(&new_text, delta.after);
		session.text = new_text;
		session.version += 1;
		session.markers.note_edit(&delta, shiftable);
		session.restart_at = Some(Instant::now() + self.cfg.restart_delay);
		session.pending_trigger = Trigger::Edit;
		let superseded = session.running.take();
		self.status.note_edit(doc, &delta);
		if let Some(executor) = superseded {
			executor.cancel("document changed");
			self.emit(DaemonEvent::Cancelled {
				doc,
				reason: "document changed".into(),
			});
		}
	}

	/// Updates the visible region and schedules a cycle to cover any
	/// dirty text that scrolled into view.
	pub fn set_viewport(&mut self, doc: DocumentId, viewport: TextRange) {
		let Some(session) = self.sessions.get_mut(&doc) else { return };
		if session.viewport == viewport {
			return;
		}
		session.viewport = viewport;
		// Do not cancel the current plan for a scroll; a follow-up
		// cycle covers whatever dirty text came into view.
		if session.restart_at.is_none() {
			session.restart_at = Some(Instant::now());
			session.pending_trigger = Trigger::ViewportChange;
		}
	}

	/// Explicitly re-analyzes everything: drops every ledger entry and
	/// supersedes all in-flight plans.
	pub fn restart(&mut self, reason: &str) {
		self.status.mark_all_dirty(reason);
		let docs: Vec<_> = self.sessions.keys().copied().collect();
		for doc in docs {
			self.supersede(doc, reason, Trigger::Explicit);
		}
	}

	/// Explicitly re-analyzes one document from scratch.
	pub fn restart_document(&mut self, doc: DocumentId, reason: &str) {
		self.status.mark_document_dirty(doc);
		self.supersede(doc, reason, Trigger::Explicit);
	}

	fn supersede(&mut self, doc: DocumentId, reason: &str, trigger: Trigger) {
		let Some(session) = self.sessions.get_mut(&doc) else { return };
		session.restart_at = Some(Instant::now());
		session.pending_trigger = trigger;
		if let Some(executor) = session.running.take() {
			executor.cancel(reason);
			self.emit(DaemonEvent::Cancelled {
				doc,
				reason: reason.into(),
			});
		}
	}

	/// Enables or disables update-by-timer. Disables nest; analysis
	/// resumes when the last disable is released. Edits made while
	/// disabled still grow dirty scopes.
	pub fn set_update_enabled(&mut self, enabled: bool) {
		if enabled {
			self.disable_count = self.disable_count.saturating_sub(1);
			if self.disable_count == 0 {
				let docs: Vec<_> = self.sessions.keys().copied().collect();
				for doc in docs {
					if !self.status.is_fully_clean(doc)
						&& let Some(session) = self.sessions.get_mut(&doc)
						&& session.restart_at.is_none()
					{
						session.restart_at = Some(Instant::now());
						session.pending_trigger = Trigger::Explicit;
					}
				}
			}
		} else {
			self.disable_count += 1;
		}
	}

	/// Returns true while update-by-timer is enabled.
	pub fn update_enabled(&self) -> bool {
		self.disable_count == 0
	}

	/// Toggles power-save mode. Leaving it schedules cycles so the
	/// skipped non-essential passes catch up.
	pub fn set_power_save(&mut self, on: bool) {
		if self.power_save == on {
			return;
		}
		self.power_save = on;
		if !on {
			let docs: Vec<_> = self.sessions.keys().copied().collect();
			for doc in docs {
				if let Some(session) = self.sessions.get_mut(&doc)
					&& session.restart_at.is_none()
					&& session.running.is_none()
				{
					session.restart_at = Some(Instant::now());
					session.pending_trigger = Trigger::Explicit;
				}
			}
		}
	}

	/// True once the document has no live plan, no scheduled restart,
	/// and every registered pass is up to date.
	pub fn is_all_analysis_finished(&self, doc: DocumentId) -> bool {
		self.sessions.get(&doc).is_some_and(|session| {
			session.running.is_none() && session.restart_at.is_none()
		}) && self.status.is_fully_clean(doc)
	}

	/// Aggregate progress of the document's live plan.
	pub fn progress_of(&self, doc: DocumentId) -> Option<f64> {
		self.sessions
			.get(&doc)
			.and_then(|s| s.running.as_ref())
			.and_then(PlanExecutor::progress)
	}

	/// True if any session has a live plan or a scheduled restart.
	pub fn has_pending_work(&self) -> bool {
		self.sessions
			.values()
			.any(|s| s.running.is_some() || s.restart_at.is_some())
	}

	/// Owner-loop pump: drains completed background phases into apply
	/// phases, retires finished plans, and starts due cycles.
	pub fn tick(&mut self) {
		let docs: Vec<_> = self.sessions.keys().copied().collect();
		for doc in docs {
			self.pump_running(doc);
			self.start_due_cycle(doc);
		}
	}

	fn pump_running(&mut self, doc: DocumentId) {
		let mut events = Vec::new();
		let mut finished = false;
		if let Some(session) = self.sessions.get_mut(&doc)
			&& let Some(executor) = session.running.as_mut()
		{
			executor.pump(&self.status);
			executor.publish_progress(self.render.as_ref());
			for event in executor.drain_completed(&mut session.markers, &self.status, self.render.as_ref()) {
				match event {
					PassEvent::Applied { .. } => {}
					PassEvent::Failed { pass, error } => {
						events.push(DaemonEvent::PassFailed { doc, pass, error });
					}
				}
			}
			if executor.is_finished() {
				let cancelled = executor.is_cancelled();
				session.running = None;
				if !cancelled {
					finished = true;
					events.push(DaemonEvent::Finished { doc });
				}
			}
		}
		let has_errors = finished
			&& self
				.sessions
				.get(&doc)
				.is_some_and(|s| s.markers.has_errors());
		for event in events {
			self.emit(event);
		}
		if finished {
			self.problems.file_problems_changed(doc, has_errors);
			self.schedule_singleton_retry(doc);
		}
	}

	/// A per-project singleton pass skipped because it was live in
	/// another document's plan leaves its scope dirty here; keep a
	/// paced retry scheduled until the other plan retires.
	fn schedule_singleton_retry(&mut self, doc: DocumentId) {
		let busy = self.busy_singletons();
		if busy.is_empty() {
			return;
		}
		let Some(doc_len) = self.sessions.get(&doc).map(|s| s.text.len_chars()) else {
			return;
		};
		let blocked = busy
			.iter()
			.any(|&id| self.status.query_dirty_scope(doc, id, doc_len).is_some());
		if blocked
			&& let Some(session) = self.sessions.get_mut(&doc)
			&& session.running.is_none()
			&& session.restart_at.is_none()
		{
			session.restart_at = Some(Instant::now() + self.cfg.restart_delay);
			session.pending_trigger = Trigger::Explicit;
		}
	}

	fn start_due_cycle(&mut self, doc: DocumentId) {
		if self.disable_count > 0 {
			return;
		}
		let due = self.sessions.get(&doc).is_some_and(|session| {
			session.running.is_none()
				&& session.restart_at.is_some_and(|at| at <= Instant::now())
		});
		if !due {
			return;
		}
		let busy_singletons = self.busy_singletons();
		let registry = Arc::clone(&self.registry);
		let providers = Arc::clone(&self.providers);
		let power_save = self.power_save;
		let Some(session) = self.sessions.get_mut(&doc) else { return };
		session.restart_at = None;
		self.status.clear_error_found(doc);
		let generation = session.next_generation;
		session.next_generation += 1;
		let spec = PlanSpec {
			doc_id: doc,
			doc_version: session.version,
			language: &session.language,
			text: &session.text,
			viewport: session.viewport,
			trigger: session.pending_trigger,
			generation,
			power_save,
			busy_singletons: &busy_singletons,
		};
		match PassPlan::build(&registry, &providers, &self.status, &spec) {
			Ok(Some(plan)) => {
				session.running = Some(PlanExecutor::new(
					plan,
					Arc::clone(&self.permits),
					&self.cfg.executor,
				));
				self.emit(DaemonEvent::Starting { doc });
				// Kick roots immediately rather than waiting a tick.
				self.pump_running(doc);
			}
			Ok(None) => {
				self.schedule_singleton_retry(doc);
			}
			Err(error) => {
				// Registration bug; do not retry.
				tracing::error!(doc = %doc, error = %error, "daemon.plan_build_failed");
			}
		}
	}

	/// Per-project singleton passes live in some other document's plan.
	fn busy_singletons(&self) -> FxHashSet<PassId> {
		let mut busy = FxHashSet::default();
		for session in self.sessions.values() {
			if let Some(executor) = &session.running {
				if executor.is_cancelled() {
					continue;
				}
				for id in executor.plan_pass_ids() {
					if self
						.registry
						.get(id)
						.is_some_and(|d| d.per_project_singleton)
					{
						busy.insert(id);
					}
				}
			}
		}
		busy
	}

	fn emit(&self, event: DaemonEvent) {
		tracing::trace!(event = ?event, "daemon.event");
		for listener in &self.listeners {
			listener.on_event(&event);
		}
	}
}

impl std::fmt::Debug for Daemon {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Daemon")
			.field("sessions", &self.sessions.len())
			.field("disable_count", &self.disable_count)
			.field("power_save", &self.power_save)
			.finish()
	}
}

/// True if the slice of `text` covered by `range` is all whitespace.
/// Empty ranges count as whitespace (a pure insertion or deletion side).
fn whitespace_only(text: &Rope, range: TextRange) -> bool {
	let range = range.clamp_to(text.len_chars());
	text.slice(range.start..range.end)
		.chars()
		.all(char::is_whitespace)
}
