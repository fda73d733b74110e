//! Shared test scaffolding plus plan/executor edge-case coverage.
//!
//! The scripted passes here stand in for real analysis: they find
//! nothing interesting, but they can be gated, fail on demand, and
//! record what the scheduler did to them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use vigil_primitives::{DocumentId, Rope, TextRange};
use vigil_worker::CancelToken;

use crate::daemon::{Daemon, DaemonCfg, DaemonEvent, DaemonListener, ProblemSink};
use crate::pass::{
	AnalysisPass, CollectContext, Finding, PassError, PassOutcome, PassState, Severity,
};
use crate::plan::{ExecutorCfg, PassEvent, PassPlan, PlanError, PlanExecutor, PlanSpec, Trigger};
use crate::reconcile::{MarkerSet, MarkerSnapshot, RenderSink};
use crate::registry::{
	LanguageTag, PassDescriptor, PassId, PassProvider, PassRegistry, PassScope, ProviderTable,
};
use crate::status::StatusMap;

/// Blocking gate: `collect` parks on it until `proceed` is called or
/// cancellation is observed.
pub(crate) struct Gate {
	released: Mutex<bool>,
	cond: Condvar,
}

impl Gate {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Self {
			released: Mutex::new(false),
			cond: Condvar::new(),
		})
	}

	pub(crate) fn proceed(&self) {
		*self.released.lock() = true;
		self.cond.notify_all();
	}

	/// Returns false if cancellation was observed before release.
	pub(crate) fn wait(&self, cancel: &CancelToken) -> bool {
		let mut released = self.released.lock();
		loop {
			if *released {
				return true;
			}
			if cancel.is_cancelled() {
				return false;
			}
			self.cond.wait_for(&mut released, Duration::from_millis(1));
		}
	}
}

/// Append-only log shared between passes, sinks, and assertions.
#[derive(Default)]
pub(crate) struct EventLog(Mutex<Vec<String>>);

impl EventLog {
	pub(crate) fn push(&self, entry: impl Into<String>) {
		self.0.lock().push(entry.into());
	}

	pub(crate) fn entries(&self) -> Vec<String> {
		self.0.lock().clone()
	}

	pub(crate) fn index_of(&self, entry: &str) -> Option<usize> {
		self.0.lock().iter().position(|e| e == entry)
	}
}

type CollectFn =
	dyn Fn(&CollectContext<'_>, &CancelToken) -> Result<PassOutcome, PassError> + Send + Sync;

struct ScriptedPass {
	id: PassId,
	collect: Box<CollectFn>,
}

impl AnalysisPass for ScriptedPass {
	fn id(&self) -> PassId {
		self.id
	}

	fn collect(
		&self,
		ctx: &CollectContext<'_>,
		cancel: &CancelToken,
	) -> Result<PassOutcome, PassError> {
		(self.collect)(ctx, cancel)
	}
}

struct ScriptedProvider {
	pass: Arc<ScriptedPass>,
}

impl PassProvider for ScriptedProvider {
	fn pass_id(&self) -> PassId {
		self.pass.id
	}

	fn create(&self, _doc: DocumentId) -> Arc<dyn AnalysisPass> {
		Arc::clone(&self.pass) as _
	}
}

/// Provider whose pass runs the given closure.
pub(crate) fn provider(
	id: PassId,
	collect: impl Fn(&CollectContext<'_>, &CancelToken) -> Result<PassOutcome, PassError>
	+ Send
	+ Sync
	+ 'static,
) -> Arc<dyn PassProvider> {
	Arc::new(ScriptedProvider {
		pass: Arc::new(ScriptedPass {
			id,
			collect: Box::new(collect),
		}),
	})
}

/// Provider whose pass flags every occurrence of `needle` within the
/// requested range.
pub(crate) fn needle_provider(
	id: PassId,
	needle: &'static str,
	severity: Severity,
) -> Arc<dyn PassProvider> {
	provider(id, move |ctx, cancel| {
		let text: String = ctx.text.chars().collect();
		let mut findings = Vec::new();
		let mut from = 0;
		while let Some(at) = text[from..].find(needle) {
			if cancel.is_cancelled() {
				return Ok(PassOutcome::Cancelled);
			}
			let start = from + at;
			let range = TextRange::new(start, start + needle.len());
			if ctx.range.contains_range(range) {
				findings.push(Finding::new(id, range, severity));
			}
			from = start + 1;
		}
		Ok(PassOutcome::Completed(findings))
	})
}

/// Provider whose pass flags the whole document when its content
/// equals `content` exactly.
pub(crate) fn content_eq_provider(
	id: PassId,
	content: &'static str,
	severity: Severity,
) -> Arc<dyn PassProvider> {
	provider(id, move |ctx, _cancel| {
		let text: String = ctx.text.chars().collect();
		let findings = if text == content {
			vec![Finding::new(id, TextRange::of_len(text.chars().count()), severity)]
		} else {
			Vec::new()
		};
		Ok(PassOutcome::Completed(findings))
	})
}

/// Render sink recording snapshots, progress, and publish ordering.
pub(crate) struct TestSink {
	pub(crate) snapshots: Mutex<Vec<MarkerSnapshot>>,
	pub(crate) progress: Mutex<Vec<(PassId, Option<f64>)>>,
	pub(crate) log: Arc<EventLog>,
}

impl TestSink {
	pub(crate) fn with_log(log: Arc<EventLog>) -> Self {
		Self {
			snapshots: Mutex::new(Vec::new()),
			progress: Mutex::new(Vec::new()),
			log,
		}
	}

	pub(crate) fn last(&self) -> Option<MarkerSnapshot> {
		self.snapshots.lock().last().cloned()
	}
}

impl RenderSink for TestSink {
	fn publish(&self, _doc: DocumentId, snapshot: &MarkerSnapshot) {
		self.log.push("publish");
		self.snapshots.lock().push(snapshot.clone());
	}

	fn pass_progress(&self, _doc: DocumentId, pass: PassId, fraction: Option<f64>) {
		self.progress.lock().push((pass, fraction));
	}
}

/// Listener recording daemon events as compact strings.
#[derive(Default)]
pub(crate) struct TestListener {
	pub(crate) events: Mutex<Vec<String>>,
}

impl TestListener {
	pub(crate) fn count_of(&self, prefix: &str) -> usize {
		self.events
			.lock()
			.iter()
			.filter(|e| e.starts_with(prefix))
			.count()
	}
}

impl DaemonListener for TestListener {
	fn on_event(&self, event: &DaemonEvent) {
		let entry = match event {
			DaemonEvent::Starting { .. } => "starting".to_string(),
			DaemonEvent::Finished { .. } => "finished".to_string(),
			DaemonEvent::Cancelled { reason, .. } => format!("cancelled:{reason}"),
			DaemonEvent::PassFailed { pass, .. } => format!("failed:{pass}"),
		};
		self.events.lock().push(entry);
	}
}

/// Problem sink recording pushed error states.
#[derive(Default)]
pub(crate) struct TestProblems {
	pub(crate) pushes: Mutex<Vec<bool>>,
}

impl ProblemSink for TestProblems {
	fn file_problems_changed(&self, _doc: DocumentId, has_errors: bool) {
		self.pushes.lock().push(has_errors);
	}
}

/// A daemon with recording collaborators wired in.
pub(crate) struct Fixture {
	pub(crate) daemon: Daemon,
	pub(crate) sink: Arc<TestSink>,
	pub(crate) problems: Arc<TestProblems>,
	pub(crate) listener: Arc<TestListener>,
	pub(crate) log: Arc<EventLog>,
}

pub(crate) fn fixture(
	descriptors: Vec<PassDescriptor>,
	providers: Vec<Arc<dyn PassProvider>>,
	cfg: DaemonCfg,
) -> Fixture {
	fixture_with_log(descriptors, providers, cfg, Arc::new(EventLog::default()))
}

/// Like [`fixture`], but publishes and scripted passes share the given
/// log, so cross-thread ordering is observable.
pub(crate) fn fixture_with_log(
	descriptors: Vec<PassDescriptor>,
	providers: Vec<Arc<dyn PassProvider>>,
	cfg: DaemonCfg,
	log: Arc<EventLog>,
) -> Fixture {
	let mut registry = PassRegistry::new();
	for descriptor in descriptors {
		registry.register(descriptor).unwrap();
	}
	let mut table = ProviderTable::new();
	for provider in providers {
		table.register(provider);
	}
	let sink = Arc::new(TestSink::with_log(Arc::clone(&log)));
	let problems = Arc::new(TestProblems::default());
	let listener = Arc::new(TestListener::default());
	let render: Arc<dyn RenderSink> = sink.clone();
	let problem_sink: Arc<dyn ProblemSink> = problems.clone();
	let mut daemon = Daemon::new(
		Arc::new(registry),
		Arc::new(table),
		render,
		problem_sink,
		cfg,
	);
	daemon.add_listener(listener.clone());
	Fixture {
		daemon,
		sink,
		problems,
		listener,
		log,
	}
}

/// Daemon config with no restart debounce, for tests.
pub(crate) fn quick_cfg() -> DaemonCfg {
	DaemonCfg {
		restart_delay: Duration::ZERO,
		..Default::default()
	}
}

/// Ticks the daemon until it has no live plan and no scheduled
/// restart.
pub(crate) async fn drive(daemon: &mut Daemon) {
	let mut iters = 0;
	while daemon.has_pending_work() && iters < 2000 {
		daemon.tick();
		sleep(Duration::from_millis(1)).await;
		iters += 1;
	}
	assert!(!daemon.has_pending_work(), "daemon did not quiesce");
}

// Plan/executor-level harness.

struct Harness {
	registry: Arc<PassRegistry>,
	table: ProviderTable,
	status: StatusMap,
	doc: DocumentId,
	text: Rope,
	markers: MarkerSet,
	sink: TestSink,
}

impl Harness {
	fn new(
		descriptors: Vec<PassDescriptor>,
		providers: Vec<Arc<dyn PassProvider>>,
		text: &str,
	) -> Self {
		let mut registry = PassRegistry::new();
		for descriptor in descriptors {
			registry.register(descriptor).unwrap();
		}
		let registry = Arc::new(registry);
		let mut table = ProviderTable::new();
		for provider in providers {
			table.register(provider);
		}
		Self {
			status: StatusMap::new(Arc::clone(&registry)),
			registry,
			table,
			doc: DocumentId::next(),
			text: Rope::from(text),
			markers: MarkerSet::new(),
			sink: TestSink::with_log(Arc::new(EventLog::default())),
		}
	}

	fn build(&self, generation: u64) -> Result<Option<PassPlan>, PlanError> {
		PassPlan::build(
			&self.registry,
			&self.table,
			&self.status,
			&PlanSpec {
				doc_id: self.doc,
				doc_version: 1,
				language: &LanguageTag::new("rust"),
				text: &self.text,
				viewport: TextRange::of_len(self.text.len_chars()),
				trigger: Trigger::Open,
				generation,
				power_save: false,
				busy_singletons: &FxHashSet::default(),
			},
		)
	}

	fn executor(&self, generation: u64, cfg: ExecutorCfg) -> PlanExecutor {
		let plan = self.build(generation).unwrap().expect("plan expected");
		PlanExecutor::new(
			plan,
			Arc::new(Semaphore::new(cfg.max_concurrency)),
			&cfg,
		)
	}

	async fn run(&mut self, executor: &mut PlanExecutor) -> Vec<PassEvent> {
		let mut events = Vec::new();
		let mut iters = 0;
		while !executor.is_finished() && iters < 2000 {
			executor.pump(&self.status);
			events.extend(executor.drain_completed(&mut self.markers, &self.status, &self.sink));
			sleep(Duration::from_millis(1)).await;
			iters += 1;
		}
		assert!(executor.is_finished(), "executor did not finish");
		events
	}
}

fn descriptor(id: u16) -> PassDescriptor {
	PassDescriptor::new(PassId(id), "test", PassScope::WholeFile)
}

#[test]
fn test_dependency_cycle_detected_at_plan_build() {
	let harness = Harness::new(
		vec![
			descriptor(1).runs_after([PassId(2)]),
			descriptor(2).runs_after([PassId(1)]),
		],
		vec![
			needle_provider(PassId(1), "x", Severity::Warning),
			needle_provider(PassId(2), "x", Severity::Warning),
		],
		"x",
	);
	assert!(matches!(
		harness.build(0),
		Err(PlanError::DependencyCycle(_))
	));
}

#[test]
fn test_edge_to_unregistered_pass_is_fatal() {
	let harness = Harness::new(
		vec![descriptor(1).completion_of([PassId(99)])],
		vec![needle_provider(PassId(1), "x", Severity::Warning)],
		"x",
	);
	assert!(matches!(
		harness.build(0),
		Err(PlanError::UnknownPass {
			pass: PassId(1),
			missing: PassId(99),
		})
	));
}

#[tokio::test]
async fn test_edge_to_clean_pass_is_satisfied_trivially() {
	let mut harness = Harness::new(
		vec![descriptor(1), descriptor(2).completion_of([PassId(1)])],
		vec![
			needle_provider(PassId(1), "x", Severity::Warning),
			needle_provider(PassId(2), "y", Severity::Warning),
		],
		"xy",
	);
	// Pass 1 is fully up to date: it is omitted from the plan, and the
	// strong edge dissolves.
	harness.status.query_dirty_scope(harness.doc, PassId(1), 2);
	harness.status.mark_up_to_date(harness.doc, PassId(1), TextRange::new(0, 2));

	let mut executor = harness.executor(0, ExecutorCfg::default());
	assert_eq!(executor.state_of(PassId(1)), None);
	harness.run(&mut executor).await;
	assert_eq!(executor.state_of(PassId(2)), Some(PassState::Applied));
}

#[tokio::test]
async fn test_strong_edge_waits_for_apply() {
	let gate = Gate::new();
	let gate_in_pass = Arc::clone(&gate);
	let mut harness = Harness::new(
		vec![descriptor(1), descriptor(2).completion_of([PassId(1)])],
		vec![
			provider(PassId(1), move |ctx, cancel| {
				if !gate_in_pass.wait(cancel) {
					return Ok(PassOutcome::Cancelled);
				}
				Ok(PassOutcome::Completed(vec![Finding::new(
					PassId(1),
					ctx.range,
					Severity::Warning,
				)]))
			}),
			needle_provider(PassId(2), "x", Severity::Warning),
		],
		"x",
	);
	let mut executor = harness.executor(0, ExecutorCfg::default());
	executor.pump(&harness.status);
	assert_eq!(executor.state_of(PassId(1)), Some(PassState::Collecting));
	assert_eq!(executor.state_of(PassId(2)), Some(PassState::Created));

	gate.proceed();
	let mut iters = 0;
	while executor.completed_count() == 0 && iters < 2000 {
		executor.pump(&harness.status);
		sleep(Duration::from_millis(1)).await;
		iters += 1;
	}
	// Background done but not applied: the successor must not start.
	executor.pump(&harness.status);
	assert_eq!(executor.state_of(PassId(2)), Some(PassState::Created));

	executor.drain_completed(&mut harness.markers, &harness.status, &harness.sink);
	assert_eq!(executor.state_of(PassId(1)), Some(PassState::Applied));
	harness.run(&mut executor).await;
	assert_eq!(executor.state_of(PassId(2)), Some(PassState::Applied));
}

#[tokio::test]
async fn test_cancelled_plan_never_applies_completed_results() {
	let gate = Gate::new();
	let gate_in_pass = Arc::clone(&gate);
	let mut harness = Harness::new(
		vec![descriptor(1)],
		vec![provider(PassId(1), move |ctx, _cancel| {
			// Deliberately ignores the token: simulates results already
			// in hand when cancellation lands.
			gate_in_pass.wait(&CancelToken::new(0));
			Ok(PassOutcome::Completed(vec![Finding::new(
				PassId(1),
				ctx.range,
				Severity::Error,
			)]))
		})],
		"x",
	);
	let mut executor = harness.executor(0, ExecutorCfg::default());
	executor.pump(&harness.status);
	executor.cancel("superseded by newer edit");
	gate.proceed();

	let mut iters = 0;
	while !executor.is_finished() && iters < 2000 {
		executor.pump(&harness.status);
		executor.drain_completed(&mut harness.markers, &harness.status, &harness.sink);
		sleep(Duration::from_millis(1)).await;
		iters += 1;
	}
	assert!(executor.is_finished());
	assert!(harness.markers.is_empty());
	assert!(harness.sink.snapshots.lock().is_empty());
	// The dirty scope survives for the next cycle.
	assert_eq!(
		harness.status.query_dirty_scope(harness.doc, PassId(1), 1),
		Some(TextRange::new(0, 1))
	);
}

#[tokio::test]
async fn test_pass_failure_retains_dirty_and_spares_siblings() {
	let mut harness = Harness::new(
		vec![descriptor(1), descriptor(2)],
		vec![
			provider(PassId(1), |_ctx, _cancel| {
				Err(PassError::Failed("inspection bug".into()))
			}),
			needle_provider(PassId(2), "x", Severity::Warning),
		],
		"x",
	);
	let mut executor = harness.executor(0, ExecutorCfg::default());
	let events = harness.run(&mut executor).await;

	assert!(events
		.iter()
		.any(|e| matches!(e, PassEvent::Failed { pass: PassId(1), .. })));
	assert_eq!(executor.state_of(PassId(1)), Some(PassState::Cancelled));
	assert_eq!(executor.state_of(PassId(2)), Some(PassState::Applied));
	// Failed pass stays dirty; the sibling's scope is clean.
	assert!(harness.status.query_dirty_scope(harness.doc, PassId(1), 1).is_some());
	assert!(harness.status.query_dirty_scope(harness.doc, PassId(2), 1).is_none());
	assert_eq!(harness.markers.len(), 1);
}

#[tokio::test]
async fn test_failure_cascades_to_strong_successors() {
	let mut harness = Harness::new(
		vec![descriptor(1), descriptor(2).completion_of([PassId(1)])],
		vec![
			provider(PassId(1), |_ctx, _cancel| {
				Err(PassError::Failed("broken".into()))
			}),
			needle_provider(PassId(2), "x", Severity::Warning),
		],
		"x",
	);
	let mut executor = harness.executor(0, ExecutorCfg::default());
	harness.run(&mut executor).await;
	assert_eq!(executor.state_of(PassId(2)), Some(PassState::Cancelled));
	assert!(harness.status.query_dirty_scope(harness.doc, PassId(2), 1).is_some());
}

#[tokio::test]
async fn test_concurrency_cap_respected() {
	use std::sync::atomic::{AtomicUsize, Ordering};

	let current = Arc::new(AtomicUsize::new(0));
	let peak = Arc::new(AtomicUsize::new(0));
	let mk = |id: u16| {
		let current = Arc::clone(&current);
		let peak = Arc::clone(&peak);
		provider(PassId(id), move |_ctx, _cancel| {
			let now = current.fetch_add(1, Ordering::SeqCst) + 1;
			peak.fetch_max(now, Ordering::SeqCst);
			std::thread::sleep(Duration::from_millis(5));
			current.fetch_sub(1, Ordering::SeqCst);
			Ok(PassOutcome::Completed(Vec::new()))
		})
	};
	let mut harness = Harness::new(
		vec![descriptor(1), descriptor(2), descriptor(3), descriptor(4)],
		vec![mk(1), mk(2), mk(3), mk(4)],
		"x",
	);
	let cfg = ExecutorCfg {
		max_concurrency: 2,
		serialize_passes: false,
	};
	let mut executor = harness.executor(0, cfg);
	harness.run(&mut executor).await;
	assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_serialized_mode_runs_one_at_a_time() {
	use std::sync::atomic::{AtomicUsize, Ordering};

	let current = Arc::new(AtomicUsize::new(0));
	let peak = Arc::new(AtomicUsize::new(0));
	let mk = |id: u16| {
		let current = Arc::clone(&current);
		let peak = Arc::clone(&peak);
		provider(PassId(id), move |_ctx, _cancel| {
			let now = current.fetch_add(1, Ordering::SeqCst) + 1;
			peak.fetch_max(now, Ordering::SeqCst);
			std::thread::sleep(Duration::from_millis(3));
			current.fetch_sub(1, Ordering::SeqCst);
			Ok(PassOutcome::Completed(Vec::new()))
		})
	};
	let mut harness = Harness::new(
		vec![descriptor(1), descriptor(2), descriptor(3)],
		vec![mk(1), mk(2), mk(3)],
		"x",
	);
	let cfg = ExecutorCfg {
		max_concurrency: 4,
		serialize_passes: true,
	};
	let mut executor = harness.executor(0, cfg);
	harness.run(&mut executor).await;
	assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_inflight_drains_before_new_submissions() {
	let gate = Gate::new();
	let gate_in_pass = Arc::clone(&gate);
	let mut harness = Harness::new(
		vec![descriptor(1), descriptor(2).runs_after([PassId(1)])],
		vec![
			provider(PassId(1), move |_ctx, cancel| {
				if !gate_in_pass.wait(cancel) {
					return Ok(PassOutcome::Cancelled);
				}
				Ok(PassOutcome::Completed(Vec::new()))
			}),
			needle_provider(PassId(2), "x", Severity::Warning),
		],
		"x",
	);
	let cfg = ExecutorCfg {
		max_concurrency: 1,
		serialize_passes: false,
	};
	let mut executor = harness.executor(0, cfg);
	executor.pump(&harness.status);
	assert_eq!(executor.inflight_count(), 1);
	// The weak successor cannot be submitted while its predecessor is
	// still pending, regardless of permits.
	executor.pump(&harness.status);
	assert_eq!(executor.state_of(PassId(2)), Some(PassState::Created));
	gate.proceed();
	harness.run(&mut executor).await;
	assert_eq!(executor.state_of(PassId(2)), Some(PassState::Applied));
}
