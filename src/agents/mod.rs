pub mod descriptor;
pub mod orchestrator;

#[cfg(test)]
pub(crate) mod tests;


pub use descriptor::{AgentDescriptor, LaunchSpec};
pub use orchestrator::{
    AgentSummary, Collaborators, CycleReport, OrchestratorStatus, RecoveryEvent, RecoveryOrchestrator,
};
