//! Incremental background analysis scheduling.
//!
//! Vigil decides, for an open document, which regions of text are
//! stale for which analysis pass, runs the passes' background phases
//! on a bounded worker pool in dependency order, and reconciles their
//! findings into the displayed marker set without flicker, without
//! re-analyzing unchanged text, and without blocking the owner thread.
//!
//! The pipeline, leaves first:
//! - [`status::StatusMap`] tracks per-document, per-pass dirty ranges
//! - [`registry::PassRegistry`] holds the declarative pass graph
//! - [`plan`] turns registry + dirty scopes into cancellable plans
//! - [`pass`] defines the two-phase collect/apply pass contract
//! - [`reconcile::MarkerSet`] merges findings into the displayed state
//! - [`daemon::Daemon`] owns sessions, debounce, and supersession

/// Document sessions, edit intake, restarts, and lifecycle events.
pub mod daemon;
/// The two-phase pass contract: findings, progress, cancellation.
pub mod pass;
/// Plan construction and cancellable execution.
pub mod plan;
/// Marker reconciliation and the displayed marker set.
pub mod reconcile;
/// Pass identity, descriptors, and provider strategy tables.
pub mod registry;
/// Per-document dirty-scope ledger.
pub mod status;

#[cfg(test)]
mod invariants;

pub use daemon::{Daemon, DaemonCfg, DaemonEvent, DaemonListener, ProblemSink};
pub use pass::{
	AnalysisPass, CollectContext, Finding, FixAction, PassError, PassOutcome, PassState,
	Progress, Severity,
};
pub use plan::{ExecutorCfg, PassEvent, PassPlan, PlanError, PlanExecutor, PlanSpec, Trigger};
pub use reconcile::{MarkerSet, MarkerSnapshot, RenderSink};
pub use registry::{
	LanguageTag, PassDescriptor, PassId, PassProvider, PassRegistry, PassScope, ProviderTable,
	RegistryError,
};
pub use status::StatusMap;
