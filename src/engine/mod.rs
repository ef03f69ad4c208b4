pub mod orchestrator;
pub mod types;

pub use orchestrator::{Orchestrator, RunSettings};
