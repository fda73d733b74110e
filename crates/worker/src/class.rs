/// Shared execution classes used for worker scheduling and observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Latency-sensitive work that directly affects interactive UX.
	Interactive,
	/// Background async work that can be delayed or dropped under pressure.
	Background,
	/// CPU-intensive blocking work executed on blocking pools.
	CpuBlocking,
}

impl TaskClass {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Interactive => "interactive",
			Self::Background => "background",
			Self::CpuBlocking => "cpu_blocking",
		}
	}
}
