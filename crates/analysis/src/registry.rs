//! Pass identity, descriptors, and the startup-time pass registry.
//!
//! The registry is built once at startup (feature/plugin load), is
//! read-only thereafter, and is threaded through the scheduler by
//! handle rather than reached through an ambient static. Dependency
//! edges between passes are declared here but validated at plan-build
//! time, since registration order is arbitrary.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;
use vigil_primitives::DocumentId;

use crate::pass::AnalysisPass;

/// Unique identifier of an analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub u16);

impl std::fmt::Display for PassId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "pass#{}", self.0)
	}
}

/// What portion of a document a pass wants to analyze.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassScope {
	/// The whole file, regardless of what is on screen.
	WholeFile,
	/// Only the currently visible region.
	VisibleRegion,
}

/// Static description of one analysis pass: identity, applicability,
/// and ordering edges against other passes.
#[derive(Debug, Clone)]
pub struct PassDescriptor {
	/// Stable pass identity.
	pub id: PassId,
	/// Human-readable name for logs and progress UI.
	pub name: &'static str,
	/// Whole-file vs. visible-region applicability.
	pub scope: PassScope,
	/// Weak edges: this pass may start only once these ids have no
	/// pending node upstream in the current plan.
	pub runs_after: Vec<PassId>,
	/// Strong edges: this pass may start only once these ids' apply
	/// phases have fully finished for the relevant scope.
	pub completion_of: Vec<PassId>,
	/// Whether the pass still runs in power-save mode.
	pub essential: bool,
	/// At most one live instance across all documents.
	pub per_project_singleton: bool,
}

impl PassDescriptor {
	/// Creates a descriptor with no ordering edges.
	pub fn new(id: PassId, name: &'static str, scope: PassScope) -> Self {
		Self {
			id,
			name,
			scope,
			runs_after: Vec::new(),
			completion_of: Vec::new(),
			essential: false,
			per_project_singleton: false,
		}
	}

	/// Adds weak ordering edges.
	pub fn runs_after(mut self, ids: impl IntoIterator<Item = PassId>) -> Self {
		self.runs_after.extend(ids);
		self
	}

	/// Adds strong completion edges.
	pub fn completion_of(mut self, ids: impl IntoIterator<Item = PassId>) -> Self {
		self.completion_of.extend(ids);
		self
	}

	/// Marks the pass as essential (still runs in power-save mode).
	pub fn essential(mut self) -> Self {
		self.essential = true;
		self
	}

	/// Marks the pass as a per-project singleton.
	pub fn per_project_singleton(mut self) -> Self {
		self.per_project_singleton = true;
		self
	}
}

/// Registration-time configuration error.
#[derive(Debug, Error)]
pub enum RegistryError {
	/// The same pass id was registered twice.
	#[error("{0} registered twice")]
	DuplicateId(PassId),
}

/// Process-wide table of registered passes.
///
/// Mutated only during startup; safe for concurrent read afterwards
/// (callers share it via `Arc`).
#[derive(Debug, Default)]
pub struct PassRegistry {
	descriptors: Vec<PassDescriptor>,
	by_id: FxHashMap<PassId, usize>,
}

impl PassRegistry {
	/// Creates an empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a pass descriptor.
	pub fn register(&mut self, descriptor: PassDescriptor) -> Result<(), RegistryError> {
		if self.by_id.contains_key(&descriptor.id) {
			return Err(RegistryError::DuplicateId(descriptor.id));
		}
		tracing::debug!(pass = %descriptor.id, name = descriptor.name, "registry.register");
		self.by_id.insert(descriptor.id, self.descriptors.len());
		self.descriptors.push(descriptor);
		Ok(())
	}

	/// All descriptors, in registration order.
	pub fn descriptors(&self) -> &[PassDescriptor] {
		&self.descriptors
	}

	/// Looks up a descriptor by id.
	pub fn get(&self, id: PassId) -> Option<&PassDescriptor> {
		self.by_id.get(&id).map(|&i| &self.descriptors[i])
	}

	/// Returns true if the id is registered.
	pub fn contains(&self, id: PassId) -> bool {
		self.by_id.contains_key(&id)
	}

	/// All registered pass ids, in registration order.
	pub fn ids(&self) -> impl Iterator<Item = PassId> + '_ {
		self.descriptors.iter().map(|d| d.id)
	}

	/// Number of registered passes.
	pub fn len(&self) -> usize {
		self.descriptors.len()
	}

	/// Returns true if no passes are registered.
	pub fn is_empty(&self) -> bool {
		self.descriptors.is_empty()
	}
}

/// Language tag identifying which strategy set applies to a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LanguageTag(String);

impl LanguageTag {
	/// Creates a tag from a language name, e.g. `"rust"`.
	pub fn new(name: impl Into<String>) -> Self {
		Self(name.into())
	}

	/// The tag's name.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for LanguageTag {
	fn from(name: &str) -> Self {
		Self::new(name)
	}
}

impl std::fmt::Display for LanguageTag {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

/// Factory for pass instances, keyed by language.
///
/// Providers are the pluggable seam: the core never knows what a pass
/// does, only how to instantiate it for a document.
pub trait PassProvider: Send + Sync {
	/// The pass id this provider instantiates.
	fn pass_id(&self) -> PassId;

	/// Creates a pass instance for the given document.
	fn create(&self, doc: DocumentId) -> Arc<dyn AnalysisPass>;
}

/// Table from language tag to an ordered list of pass providers.
///
/// Resolved once per plan build. Unknown tags fall back to the global
/// provider list, which may be empty; there is no reflective discovery.
#[derive(Default)]
pub struct ProviderTable {
	global: Vec<Arc<dyn PassProvider>>,
	by_language: FxHashMap<LanguageTag, Vec<Arc<dyn PassProvider>>>,
}

impl ProviderTable {
	/// Creates an empty table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a provider that applies to every language.
	pub fn register(&mut self, provider: Arc<dyn PassProvider>) {
		self.global.push(provider);
	}

	/// Registers a provider for one language tag.
	pub fn register_for(&mut self, tag: LanguageTag, provider: Arc<dyn PassProvider>) {
		self.by_language.entry(tag).or_default().push(provider);
	}

	/// All providers applicable to `tag`, global first, in
	/// registration order.
	pub fn resolve(&self, tag: &LanguageTag) -> Vec<Arc<dyn PassProvider>> {
		let mut out = self.global.clone();
		if let Some(specific) = self.by_language.get(tag) {
			out.extend(specific.iter().cloned());
		}
		out
	}

	/// First provider for `(tag, pass_id)` in resolve order.
	pub fn provider_for(&self, tag: &LanguageTag, pass_id: PassId) -> Option<Arc<dyn PassProvider>> {
		self.global
			.iter()
			.chain(self.by_language.get(tag).into_iter().flatten())
			.find(|p| p.pass_id() == pass_id)
			.cloned()
	}
}

impl std::fmt::Debug for ProviderTable {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProviderTable")
			.field("global", &self.global.len())
			.field("languages", &self.by_language.len())
			.finish()
	}
}
