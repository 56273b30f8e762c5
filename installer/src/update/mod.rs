// Self-update
//
// Checks the distribution endpoint, stages and verifies a new executable, and swaps it in with a
// verified backup. Shares the progress event sink with the install orchestrator.

pub mod descriptor;
pub mod engine;
pub mod files;
pub mod marker;
pub mod validate;

pub use descriptor::{HttpUpdateSource, UpdateDescriptor, UpdateSource};
pub use engine::{UpdateEngine, UpdatePaths};
pub use validate::{ExecutableValidator, SelfCheckValidator};
