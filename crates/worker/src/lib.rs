//! Shared worker runtime primitives for background analysis.
//!
//! Provides task classification metadata for spawned work, thin spawn
//! wrappers over tokio that tag tasks for tracing, and the
//! generation-scoped cancellation token used to supersede stale work.

mod class;
mod spawn;
mod token;

pub use class::TaskClass;
pub use spawn::{spawn, spawn_blocking};
pub use token::CancelToken;
