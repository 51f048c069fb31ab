pub mod agents;
pub mod api;
pub mod chaos;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod maintenance;
pub mod rca;
pub mod recovery;
pub mod storage;
pub mod webhooks;

pub use agents::{Collaborators, RecoveryEvent, RecoveryOrchestrator};
pub use config::Config;
pub use error::{OrchestratorError, Result};
