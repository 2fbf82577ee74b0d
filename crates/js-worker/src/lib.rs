//! Worker side of the jsbox execution engine.
//!
//! A worker evaluates submitted JavaScript inside a fresh QuickJS runtime
//! per request, captures console output through a restricted `console`
//! object, optionally records a line-level execution timeline, and encodes
//! the outcome for transport back to the host.

pub mod codec;
pub mod console;
pub mod evaluator;
pub mod instrument;
pub mod serve;
pub mod timeline;

pub use evaluator::Evaluator;
pub use serve::serve;
