pub mod graph;
pub mod listener;
pub mod orchestrator;

pub use graph::ServiceGraph;
pub use listener::{ListenerError, ManagedListener};
pub use orchestrator::{Orchestrator, ServiceState};
