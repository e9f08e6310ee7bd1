//! Core library for the Capsule test network tool.
//!
//! The crate generates node homes and a shared genesis for a multi-node
//! blockchain network, runs every node as a Nomad job, and manages the
//! network afterwards: stop, grow, shrink, stream logs, and execute commands
//! inside node allocations. The persisted [`NetworkState`] ties the phases
//! together.

pub mod aggregate;
pub mod config;
pub mod exec;
pub mod files;
pub mod generator;
pub mod genesis;
pub mod jobspec;
pub mod logs;
pub mod network;
pub mod orchestrator;
pub mod overlay;
pub mod probes;
pub mod provisioner;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod template;
pub mod test_support;
pub mod types;

pub use aggregate::MultiError;
pub use config::{CapsuleSettings, ConfigError, NetworkConfig};
pub use exec::{ExecError, RemoteExecutor};
pub use generator::{GenerateError, Generator};
pub use logs::{LogAggregator, LogError, LogOptions, LogStream};
pub use network::{Network, NetworkError};
pub use orchestrator::{
    JobOrchestrator, NetworkPlan, OrchestratorError, Registrations, StopOutcome,
};
pub use provisioner::{ProcessProvisioner, ProvisionError, Provisioner};
pub use runner::{CommandRunner, ProcessCommandRunner};
pub use scheduler::{NomadClient, Scheduler, SchedulerError};
pub use state::{NetworkPhase, NetworkState, StateError, StateStore};
pub use types::{GeneratedServices, NetworkJobs, NodeMode, NodeSet};
