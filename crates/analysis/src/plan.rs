//! Pass plan construction and cancellable execution.
//!
//! Goals:
//! - build a fresh, acyclic plan per analysis cycle from the registry
//!   and the current dirty scopes (never reuse plans)
//! - run background phases in parallel under a global concurrency cap
//! - defer submission of a pass until its ordering edges are met, as
//!   opposed to blocking inside a worker
//! - cancel the whole plan as a unit and never apply stale results

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use vigil_primitives::{DocVersion, DocumentId, Rope, TextRange, poll_once};
use vigil_worker::{CancelToken, TaskClass, spawn_blocking};

use crate::pass::{
	AnalysisPass, CollectContext, PassError, PassOutcome, PassState, Progress,
};
use crate::registry::{LanguageTag, PassId, PassRegistry, PassScope, ProviderTable};
use crate::reconcile::{MarkerSet, RenderSink};
use crate::status::StatusMap;

/// Why an analysis cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
	/// The document changed.
	Edit,
	/// The visible region changed.
	ViewportChange,
	/// The user (or a collaborator) explicitly requested re-analysis.
	Explicit,
	/// A document was opened.
	Open,
}

/// Plan-build-time configuration error. Should never occur with a
/// correctly configured registry; not retried.
#[derive(Debug, Error)]
pub enum PlanError {
	/// The dependency edges between the plan's passes form a cycle.
	#[error("pass dependency cycle involving {0}")]
	DependencyCycle(PassId),
	/// A descriptor references a pass id that was never registered.
	#[error("{pass} depends on unregistered {missing}")]
	UnknownPass {
		/// The pass declaring the edge.
		pass: PassId,
		/// The missing edge target.
		missing: PassId,
	},
}

/// Executor configuration.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorCfg {
	/// Global cap on concurrently collecting passes.
	pub max_concurrency: usize,
	/// Debug mode: run background phases strictly one at a time.
	pub serialize_passes: bool,
}

impl Default for ExecutorCfg {
	fn default() -> Self {
		Self {
			max_concurrency: 2,
			serialize_passes: false,
		}
	}
}

/// One pass instance in a plan.
struct PassNode {
	id: PassId,
	name: &'static str,
	pass: Arc<dyn AnalysisPass>,
	range: TextRange,
	state: PassState,
	/// Unmet ordering edges; the node is eligible at zero.
	unmet: usize,
	weak_successors: Vec<usize>,
	strong_successors: Vec<usize>,
	/// Set once this node's weak successors were released.
	weak_released: bool,
	progress: Arc<Progress>,
}

/// Inputs to a plan build for one document snapshot.
pub struct PlanSpec<'a> {
	/// Document under analysis.
	pub doc_id: DocumentId,
	/// Snapshot version the plan is valid against.
	pub doc_version: DocVersion,
	/// Language tag used to resolve pass providers.
	pub language: &'a LanguageTag,
	/// Immutable text snapshot.
	pub text: &'a Rope,
	/// Currently visible region.
	pub viewport: TextRange,
	/// Why this cycle runs.
	pub trigger: Trigger,
	/// Plan generation; newer generations supersede older ones.
	pub generation: u64,
	/// Skip non-essential passes.
	pub power_save: bool,
	/// Per-project singleton passes currently live in another plan.
	pub busy_singletons: &'a FxHashSet<PassId>,
}

/// A topologically ordered, cancellable execution plan for one
/// document snapshot. Built fresh for every cycle and discarded when
/// the cycle finishes or is superseded.
pub struct PassPlan {
	doc_id: DocumentId,
	doc_version: DocVersion,
	generation: u64,
	trigger: Trigger,
	cancel: CancelToken,
	text: Rope,
	nodes: Vec<PassNode>,
}

impl PassPlan {
	/// Builds a plan, intersecting each registered pass's
	/// applicability with its current dirty scope.
	///
	/// Returns `Ok(None)` when nothing needs analysis. A dependency
	/// cycle or an edge to an unregistered pass is a fatal
	/// configuration error.
	pub fn build(
		registry: &PassRegistry,
		providers: &ProviderTable,
		status: &StatusMap,
		spec: &PlanSpec<'_>,
	) -> Result<Option<Self>, PlanError> {
		let doc_len = spec.text.len_chars();
		let mut nodes = Vec::new();
		let mut index: FxHashMap<PassId, usize> = FxHashMap::default();

		for descriptor in registry.descriptors() {
			if spec.power_save && !descriptor.essential {
				continue;
			}
			if descriptor.per_project_singleton && spec.busy_singletons.contains(&descriptor.id) {
				tracing::trace!(pass = %descriptor.id, "plan.skip_busy_singleton");
				continue;
			}
			let Some(dirty) = status.query_dirty_scope(spec.doc_id, descriptor.id, doc_len) else {
				continue;
			};
			let applicability = match descriptor.scope {
				PassScope::WholeFile => TextRange::of_len(doc_len),
				PassScope::VisibleRegion => spec.viewport.clamp_to(doc_len),
			};
			let Some(range) = dirty.intersect(applicability) else {
				continue;
			};
			let Some(provider) = providers.provider_for(spec.language, descriptor.id) else {
				tracing::trace!(pass = %descriptor.id, language = %spec.language, "plan.no_provider");
				continue;
			};
			index.insert(descriptor.id, nodes.len());
			nodes.push(PassNode {
				id: descriptor.id,
				name: descriptor.name,
				pass: provider.create(spec.doc_id),
				range,
				state: PassState::Created,
				unmet: 0,
				weak_successors: Vec::new(),
				strong_successors: Vec::new(),
				weak_released: false,
				progress: Arc::new(Progress::new()),
			});
		}

		// Edges. A target registered but absent from this plan has no
		// pending instance and nothing left to apply, so the edge is
		// satisfied trivially.
		for descriptor in registry.descriptors() {
			let Some(&node) = index.get(&descriptor.id) else { continue };
			for (targets, strong) in [
				(&descriptor.runs_after, false),
				(&descriptor.completion_of, true),
			] {
				for target in targets {
					let Some(&pred) = index.get(target) else {
						if !registry.contains(*target) {
							return Err(PlanError::UnknownPass {
								pass: descriptor.id,
								missing: *target,
							});
						}
						continue;
					};
					if strong {
						nodes[pred].strong_successors.push(node);
					} else {
						nodes[pred].weak_successors.push(node);
					}
					nodes[node].unmet += 1;
				}
			}
		}

		detect_cycle(&nodes)?;

		if nodes.is_empty() {
			return Ok(None);
		}
		tracing::debug!(
			doc = %spec.doc_id,
			generation = spec.generation,
			trigger = ?spec.trigger,
			passes = nodes.len(),
			"plan.build"
		);
		Ok(Some(Self {
			doc_id: spec.doc_id,
			doc_version: spec.doc_version,
			generation: spec.generation,
			trigger: spec.trigger,
			cancel: CancelToken::new(spec.generation),
			text: spec.text.clone(),
			nodes,
		}))
	}

	/// The document this plan analyzes.
	pub fn doc_id(&self) -> DocumentId {
		self.doc_id
	}

	/// Snapshot version the plan was built against.
	pub fn doc_version(&self) -> DocVersion {
		self.doc_version
	}

	/// Plan generation.
	pub fn generation(&self) -> u64 {
		self.generation
	}

	/// Why this plan was built.
	pub fn trigger(&self) -> Trigger {
		self.trigger
	}

	/// Pass ids included in this plan, in registry order.
	pub fn pass_ids(&self) -> impl Iterator<Item = PassId> + '_ {
		self.nodes.iter().map(|n| n.id)
	}
}

/// Kahn's algorithm over both edge kinds; leftover nodes mean a cycle.
fn detect_cycle(nodes: &[PassNode]) -> Result<(), PlanError> {
	let mut unmet: Vec<usize> = nodes.iter().map(|n| n.unmet).collect();
	let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| unmet[i] == 0).collect();
	let mut processed = 0usize;
	while let Some(i) = queue.pop_front() {
		processed += 1;
		for &s in nodes[i].weak_successors.iter().chain(&nodes[i].strong_successors) {
			unmet[s] -= 1;
			if unmet[s] == 0 {
				queue.push_back(s);
			}
		}
	}
	if processed < nodes.len() {
		let stuck = (0..nodes.len())
			.find(|&i| unmet[i] > 0)
			.map(|i| nodes[i].id)
			.unwrap_or(PassId(0));
		return Err(PlanError::DependencyCycle(stuck));
	}
	Ok(())
}

/// Owner-thread observable result of one drained pass.
#[derive(Debug)]
pub enum PassEvent {
	/// The pass's findings were applied.
	Applied {
		/// The applied pass.
		pass: PassId,
	},
	/// The pass's background phase failed; its dirty scope is retained
	/// so a later cycle retries.
	Failed {
		/// The failing pass.
		pass: PassId,
		/// What went wrong.
		error: PassError,
	},
}

struct Inflight {
	node: usize,
	task: JoinHandle<Result<PassOutcome, PassError>>,
}

/// Drives one plan: submits eligible background phases to the worker
/// pool and drains their completions into apply phases.
///
/// All mutation of the marker set and the status map happens inside
/// [`PlanExecutor::drain_completed`], which the owning controller calls
/// from its event loop; that confinement is what serializes apply
/// phases with each other and with user input.
pub struct PlanExecutor {
	plan: PassPlan,
	permits: Arc<Semaphore>,
	serialize: bool,
	inflight: Vec<Inflight>,
	completed: VecDeque<(usize, Result<PassOutcome, PassError>)>,
}

impl PlanExecutor {
	/// Creates an executor over a built plan. `permits` is shared
	/// across documents to bound total background parallelism.
	pub fn new(plan: PassPlan, permits: Arc<Semaphore>, cfg: &ExecutorCfg) -> Self {
		Self {
			plan,
			permits,
			serialize: cfg.serialize_passes,
			inflight: Vec::new(),
			completed: VecDeque::new(),
		}
	}

	/// The document this executor analyzes.
	pub fn doc_id(&self) -> DocumentId {
		self.plan.doc_id
	}

	/// The underlying plan's generation.
	pub fn generation(&self) -> u64 {
		self.plan.generation
	}

	/// Cancels the whole plan. Level-triggered: in-flight collects
	/// observe the token and stop; nothing from this plan applies
	/// afterwards.
	pub fn cancel(&self, reason: &str) {
		if !self.plan.cancel.is_cancelled() {
			tracing::debug!(
				doc = %self.plan.doc_id,
				generation = self.plan.generation,
				reason,
				"plan.cancel"
			);
			self.plan.cancel.cancel();
		}
	}

	/// Returns true once the plan has been cancelled.
	pub fn is_cancelled(&self) -> bool {
		self.plan.cancel.is_cancelled()
	}

	/// Polls in-flight background phases and submits newly eligible
	/// ones. Non-blocking; call from the owner loop.
	pub fn pump(&mut self, status: &StatusMap) {
		// Drain finished tasks first so their permits are back before
		// submission.
		let mut i = 0;
		while i < self.inflight.len() {
			match poll_once(&mut self.inflight[i].task) {
				None => i += 1,
				Some(join) => {
					let inflight = self.inflight.swap_remove(i);
					let result = match join {
						Ok(result) => result,
						Err(e) if e.is_panic() => Err(PassError::Panicked(format!("{e}"))),
						Err(_) => Ok(PassOutcome::Cancelled),
					};
					self.completed.push_back((inflight.node, result));
				}
			}
		}

		if self.plan.cancel.is_cancelled() {
			return;
		}

		let error_found = status.error_found(self.plan.doc_id);
		for idx in 0..self.plan.nodes.len() {
			let node = &self.plan.nodes[idx];
			if node.state != PassState::Created || node.unmet > 0 {
				continue;
			}
			if self.serialize && !self.inflight.is_empty() {
				break;
			}
			let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
				// Throttled; retry on the next pump.
				break;
			};

			let pass = Arc::clone(&node.pass);
			let token = self.plan.cancel.child();
			let text = self.plan.text.clone();
			let range = node.range;
			let progress = Arc::clone(&node.progress);
			let doc_id = self.plan.doc_id;
			let doc_version = self.plan.doc_version;
			tracing::trace!(doc = %doc_id, pass = %node.id, name = node.name, range = %range, "plan.submit");
			let task = spawn_blocking(TaskClass::CpuBlocking, move || {
				let _permit = permit;
				if token.is_cancelled() {
					return Ok(PassOutcome::Cancelled);
				}
				let ctx = CollectContext {
					doc_id,
					doc_version,
					text: text.slice(..),
					range,
					error_found,
					progress: &progress,
				};
				pass.collect(&ctx, &token)
			});
			self.plan.nodes[idx].state = PassState::Collecting;
			self.inflight.push(Inflight { node: idx, task });
		}
	}

	/// Applies completed background phases on the calling (owner)
	/// thread and releases ordering edges.
	///
	/// The plan token is checked immediately before every apply, so a
	/// cancelled plan never mutates the marker set, even if its
	/// background phase finished with results in hand.
	pub fn drain_completed(
		&mut self,
		markers: &mut MarkerSet,
		status: &StatusMap,
		sink: &dyn RenderSink,
	) -> Vec<PassEvent> {
		let mut events = Vec::new();
		while let Some((idx, result)) = self.completed.pop_front() {
			self.release_weak(idx);
			if self.plan.nodes[idx].state.is_terminal() {
				continue;
			}
			if self.plan.cancel.is_cancelled() {
				self.cancel_node(idx);
				continue;
			}
			match result {
				Ok(PassOutcome::Completed(findings)) => {
					let node = &mut self.plan.nodes[idx];
					node.state = PassState::AwaitingApply;
					let (id, range) = (node.id, node.range);
					markers.apply_findings(self.plan.doc_id, range, id, findings, status, sink);
					self.plan.nodes[idx].state = PassState::Applied;
					self.release_strong(idx);
					events.push(PassEvent::Applied { pass: id });
				}
				Ok(PassOutcome::Cancelled) => {
					self.cancel_node(idx);
				}
				Err(error) => {
					let node = &self.plan.nodes[idx];
					tracing::warn!(
						doc = %self.plan.doc_id,
						pass = %node.id,
						name = node.name,
						error = %error,
						"pass background phase failed; dirty scope retained"
					);
					events.push(PassEvent::Failed { pass: node.id, error });
					self.cancel_node(idx);
				}
			}
		}
		events
	}

	/// Releases weak edges: the node has no pending background work.
	fn release_weak(&mut self, idx: usize) {
		if self.plan.nodes[idx].weak_released {
			return;
		}
		self.plan.nodes[idx].weak_released = true;
		let successors = self.plan.nodes[idx].weak_successors.clone();
		for s in successors {
			self.plan.nodes[s].unmet -= 1;
		}
	}

	/// Releases strong edges: the node's apply phase fully ran.
	fn release_strong(&mut self, idx: usize) {
		let successors = self.plan.nodes[idx].strong_successors.clone();
		for s in successors {
			self.plan.nodes[s].unmet -= 1;
		}
	}

	/// Terminally cancels a node and cascades to successors whose
	/// correctness depends on it.
	fn cancel_node(&mut self, idx: usize) {
		let mut stack = vec![idx];
		while let Some(i) = stack.pop() {
			if self.plan.nodes[i].state.is_terminal() {
				continue;
			}
			self.plan.nodes[i].state = PassState::Cancelled;
			self.release_weak(i);
			// Strong successors can never be satisfied now.
			stack.extend(self.plan.nodes[i].strong_successors.iter().copied());
		}
	}

	/// True once nothing remains to run, drain, or apply.
	pub fn is_finished(&self) -> bool {
		if !self.inflight.is_empty() || !self.completed.is_empty() {
			return false;
		}
		if self.plan.cancel.is_cancelled() {
			return true;
		}
		self.plan.nodes.iter().all(|n| n.state.is_terminal())
	}

	/// Aggregate completed fraction across the plan's passes, or
	/// [`None`] when every live pass is indeterminate.
	pub fn progress(&self) -> Option<f64> {
		if self.plan.nodes.is_empty() {
			return None;
		}
		let mut sum = 0.0;
		let mut known = false;
		for node in &self.plan.nodes {
			match node.state {
				PassState::Applied | PassState::Cancelled => {
					sum += 1.0;
					known = true;
				}
				_ => {
					if let Some(f) = node.progress.fraction() {
						sum += f;
						known = true;
					}
				}
			}
		}
		known.then(|| sum / self.plan.nodes.len() as f64)
	}

	/// Reports per-pass progress to the render sink.
	pub fn publish_progress(&self, sink: &dyn RenderSink) {
		for node in &self.plan.nodes {
			if node.state == PassState::Collecting {
				sink.pass_progress(self.plan.doc_id, node.id, node.progress.fraction());
			}
		}
	}

	/// Pass ids in the underlying plan.
	pub fn plan_pass_ids(&self) -> impl Iterator<Item = PassId> + '_ {
		self.plan.pass_ids()
	}

	/// Number of passes not yet terminal.
	pub fn pending_count(&self) -> usize {
		self.plan
			.nodes
			.iter()
			.filter(|n| !n.state.is_terminal())
			.count()
	}

	pub(crate) fn state_of(&self, id: PassId) -> Option<PassState> {
		self.plan.nodes.iter().find(|n| n.id == id).map(|n| n.state)
	}

	#[cfg(test)]
	pub(crate) fn completed_count(&self) -> usize {
		self.completed.len()
	}

	#[cfg(test)]
	pub(crate) fn inflight_count(&self) -> usize {
		self.inflight.len()
	}
}
