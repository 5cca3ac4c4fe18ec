//! Downlink pipeline.
//!
//! PIT entries are validated and fed through [`Reassembly`]; finished
//! packets optionally pass through TCP aggregation before they reach the
//! network stack. Buffers come from the queue's two [`BatPool`]s.
//!
//! [`BatPool`]: crate::bat::BatPool

#[cfg(feature = "aggregation")]
pub mod aggregate;
pub mod queue;
pub mod reassembly;

#[cfg(feature = "aggregation")]
pub use aggregate::Aggregator;
pub use queue::{DlConfig, DlQueue};
pub use reassembly::{Outcome, Phase, Reassembly};
