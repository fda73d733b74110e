use tokio_util::sync::CancellationToken;

/// Generation-scoped, level-triggered cancellation token.
///
/// A token belongs to one scheduling generation (one execution plan,
/// one supervised task window). Once cancelled it stays cancelled for
/// the rest of that generation's life; supersession creates a fresh
/// token under the next generation instead of resetting this one.
#[derive(Debug, Clone)]
pub struct CancelToken {
	generation: u64,
	cancel: CancellationToken,
}

impl CancelToken {
	/// Creates a new token for the given generation.
	pub fn new(generation: u64) -> Self {
		Self {
			generation,
			cancel: CancellationToken::new(),
		}
	}

	/// Returns the generation this token belongs to.
	pub const fn generation(&self) -> u64 {
		self.generation
	}

	/// Returns true when cancellation is requested.
	///
	/// Cooperative workers poll this at bounded intervals between
	/// discrete units of work.
	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Requests cancellation.
	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	/// Future resolving when cancellation is requested.
	pub async fn cancelled(&self) {
		self.cancel.cancelled().await;
	}

	/// Creates a child token in the same generation.
	///
	/// Cancelling the parent cancels the child; cancelling the child
	/// leaves the parent live.
	pub fn child(&self) -> Self {
		Self {
			generation: self.generation,
			cancel: self.cancel.child_token(),
		}
	}
}
