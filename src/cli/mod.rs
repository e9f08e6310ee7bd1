//! Command-line interface definitions for the `capsule` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

/// Top-level CLI for the `capsule` binary.
#[derive(Debug, Parser)]
#[command(
    name = "capsule",
    about = "Bootstrap, run, and tear down multi-node blockchain test networks on Nomad",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Directory holding the network state and generated node homes.
    ///
    /// Overrides `CAPSULE_HOME_PATH` and `home_path` in `capsule.toml`.
    #[arg(long, global = true, value_name = "PATH")]
    pub(crate) home_path: Option<String>,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Top-level command groups.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Manage the whole network.
    #[command(subcommand)]
    Network(NetworkCommand),
    /// Manage individual node sets.
    #[command(subcommand)]
    Nodes(NodesCommand),
    /// Manage arbitrary scheduler jobs.
    #[command(subcommand)]
    Jobs(JobsCommand),
    /// Inspect the persisted network state.
    #[command(subcommand)]
    State(StateCommand),
    /// Print the version.
    Version,
}

/// `capsule network` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum NetworkCommand {
    /// Generate node homes and genesis from a network configuration file.
    Generate(GenerateArgs),
    /// Generate the network and start it.
    Bootstrap(GenerateArgs),
    /// Start every job of a generated network.
    Start,
    /// Stop the running network.
    Stop(StopArgs),
    /// Stop the network and remove its home directory.
    Destroy,
    /// Stream logs of running jobs.
    Logs(LogsArgs),
}

/// Arguments for `capsule network generate` and `bootstrap`.
#[derive(Debug, Args)]
pub(crate) struct GenerateArgs {
    /// Network configuration file (TOML).
    #[arg(long, value_name = "PATH")]
    pub(crate) config: String,
    /// Remove previously generated output first.
    #[arg(long)]
    pub(crate) force: bool,
}

/// Arguments for `capsule network stop`.
#[derive(Debug, Args)]
pub(crate) struct StopArgs {
    /// Stop node set jobs only, keeping services and pre-start jobs.
    #[arg(long)]
    pub(crate) nodes_only: bool,
}

/// Where log offsets are counted from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum LogOriginArg {
    /// Offsets count from the beginning of the log.
    #[default]
    Start,
    /// Offsets count back from the end of the log.
    End,
}

/// Arguments for `capsule network logs`.
#[derive(Debug, Args)]
pub(crate) struct LogsArgs {
    /// Stream one job instead of every running job.
    #[arg(long, value_name = "ID")]
    pub(crate) job_id: Option<String>,
    /// Keep following new output.
    #[arg(long)]
    pub(crate) follow: bool,
    /// Reference point for `--offset`.
    #[arg(long, value_enum, default_value_t = LogOriginArg::Start)]
    pub(crate) origin: LogOriginArg,
    /// Byte offset relative to `--origin`.
    #[arg(long, default_value_t = 0)]
    pub(crate) offset: u64,
    /// Stop after this many seconds without new output.
    #[arg(long, value_name = "SECS")]
    pub(crate) idle_timeout_secs: Option<u64>,
}

/// `capsule nodes` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum NodesCommand {
    /// Add node sets based on an existing group.
    Add(AddNodesArgs),
    /// Stop and delete one node set.
    Remove(NodeNameArgs),
    /// Start node set jobs.
    Start(NodeNamesArgs),
    /// Stop node set jobs.
    Stop(NodeNamesArgs),
    /// List every node set as JSON.
    Ls,
    /// List validator node sets with their consensus identities.
    LsValidators,
    /// Wipe consensus and application state on running nodes.
    UnsafeResetAll(NodeNamesArgs),
    /// Wipe node state and restore it from a checkpoint file.
    RestoreCheckpoint(RestoreCheckpointArgs),
}

/// Arguments for `capsule nodes restore-checkpoint`.
#[derive(Debug, Args)]
pub(crate) struct RestoreCheckpointArgs {
    /// Checkpoint file, as seen from inside the node's allocation.
    #[arg(long, value_name = "PATH")]
    pub(crate) checkpoint_file: String,
    /// Nodes to restore; every node set when omitted.
    #[command(flatten)]
    pub(crate) nodes: NodeNamesArgs,
}

/// Arguments for `capsule nodes add`.
#[derive(Debug, Args)]
pub(crate) struct AddNodesArgs {
    /// Group whose declaration the new node sets copy.
    #[arg(long, value_name = "GROUP")]
    pub(crate) base_on: String,
    /// Number of node sets to add.
    #[arg(long, default_value_t = 1)]
    pub(crate) count: usize,
    /// Start the new node sets once generated.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub(crate) start: bool,
}

/// Arguments naming exactly one node set.
#[derive(Debug, Args)]
pub(crate) struct NodeNameArgs {
    /// Node set name.
    #[arg(long, value_name = "NAME")]
    pub(crate) name: String,
}

/// Arguments naming node sets; every node set when omitted.
#[derive(Debug, Args)]
pub(crate) struct NodeNamesArgs {
    /// Node set name; repeat for several.
    #[arg(long = "name", value_name = "NAME")]
    pub(crate) names: Vec<String>,
}

/// `capsule jobs` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum JobsCommand {
    /// Start a job from a raw JSON definition.
    Start(JobStartArgs),
    /// Stop tracked jobs.
    Stop(JobStopArgs),
}

/// Arguments for `capsule jobs start`.
#[derive(Debug, Args)]
pub(crate) struct JobStartArgs {
    /// JSON job definition.
    #[arg(long, value_name = "PATH")]
    pub(crate) job_file: String,
    /// Job ID; defaults to the file stem.
    #[arg(long, value_name = "ID")]
    pub(crate) job_id: Option<String>,
}

/// Arguments for `capsule jobs stop`.
#[derive(Debug, Args)]
pub(crate) struct JobStopArgs {
    /// Job ID; repeat for several.
    #[arg(long = "job-id", value_name = "ID", required = true)]
    pub(crate) job_ids: Vec<String>,
}

/// `capsule state` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum StateCommand {
    /// Print the persisted network state as JSON.
    Get,
}
