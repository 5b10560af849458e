pub mod evaluator;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;

pub use orchestrator::{Collaborators, Halt, Orchestrator, Settings};
