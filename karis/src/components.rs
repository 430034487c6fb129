/// Components that exercise the relay board and measure how it behaves.
pub mod benchmark {
    /// Matches status reports from the board against the commands
    /// that are still waiting for an acknowledgment.
    pub mod correlator;
    /// Round trip latency benchmark, one batch of commands at a time.
    pub mod latency;
    /// Fire and forget stress test of the control topic.
    pub mod stress;
}

/// Helpful prelude when working with components.
pub mod prelude {
    pub use crate::components::benchmark::correlator::*;
    pub use crate::components::benchmark::latency::*;
    pub use crate::components::benchmark::stress::*;
}
