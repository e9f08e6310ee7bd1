//! Command handlers behind the `capsule` binary.
//!
//! Each handler receives its own parsed argument struct and writes command
//! results to the supplied output handle. Diagnostics go through `tracing`.

use std::io::{self, Write};
use std::time::Duration;

use camino::Utf8Path;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use capsule::scheduler::LogOrigin;
use capsule::{
    CapsuleSettings, ConfigError, JobOrchestrator, LogAggregator, LogOptions, Network,
    NetworkConfig, NetworkError, NetworkPhase, NomadClient, ProcessCommandRunner,
    ProcessProvisioner, RemoteExecutor, SchedulerError, StateStore,
};

use crate::cli::{
    AddNodesArgs, Cli, Command, GenerateArgs, JobsCommand, LogOriginArg, LogsArgs,
    NetworkCommand, NodesCommand, StateCommand,
};

/// Errors surfaced to the operator before exiting with status 1.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("failed to write output: {0}")]
    Output(String),
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        Self::Output(value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::Output(value.to_string())
    }
}

/// Installs the stderr log subscriber, filtered by `RUST_LOG` (default
/// `info`).
pub(crate) fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .ok();
}

/// Runs `cli`, writing results to `out`.
pub(crate) async fn dispatch<W: Write>(cli: Cli, out: &mut W) -> Result<(), CliError> {
    if matches!(cli.command, Command::Version) {
        writeln!(out, "capsule {}", env!("CARGO_PKG_VERSION"))?;
        return Ok(());
    }

    let mut settings = CapsuleSettings::load_without_cli_args()?;
    if let Some(home_path) = cli.home_path {
        settings.home_path = home_path;
    }
    settings.validate()?;
    let context = Context {
        network: Network::new(StateStore::new(&settings.home_dir())),
        settings,
        cancel: cancel_on_ctrl_c(),
    };

    match cli.command {
        Command::Version => Ok(()),
        Command::State(StateCommand::Get) => write_json(out, &context.network.state()?),
        Command::Network(command) => context.network_command(command, out).await,
        Command::Nodes(command) => context.nodes_command(command, out).await,
        Command::Jobs(command) => context.jobs_command(command, out).await,
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling pending waits");
            trigger.cancel();
        }
    });
    token
}

fn write_json<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> Result<(), CliError> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

fn write_lines<W: Write>(out: &mut W, lines: &[String]) -> Result<(), CliError> {
    for line in lines {
        writeln!(out, "{line}")?;
    }
    Ok(())
}

/// Converts `capsule network logs` flags into aggregator options.
pub(crate) fn log_options(args: &LogsArgs) -> LogOptions {
    LogOptions {
        follow: args.follow,
        origin: match args.origin {
            LogOriginArg::Start => LogOrigin::Start,
            LogOriginArg::End => LogOrigin::End,
        },
        offset: args.offset,
        idle_timeout: args.idle_timeout_secs.map(Duration::from_secs),
    }
}

struct Context {
    settings: CapsuleSettings,
    network: Network,
    cancel: CancellationToken,
}

impl Context {
    async fn connect(&self) -> Result<NomadClient, CliError> {
        Ok(NomadClient::connect(
            &self.settings.nomad_address,
            self.settings.nomad_token.clone(),
            &self.settings.nomad_bin,
        )
        .await?)
    }

    fn orchestrator<'a>(&self, client: &'a NomadClient) -> JobOrchestrator<'a, NomadClient> {
        JobOrchestrator::new(client)
            .with_poll_interval(self.settings.deployment_poll_interval())
            .with_liveness_interval(self.settings.liveness_check_interval())
            .with_cancellation(self.cancel.clone())
    }

    fn generate(&self, args: &GenerateArgs) -> Result<(), CliError> {
        let config = NetworkConfig::load(Utf8Path::new(&args.config))?;
        let provisioner = ProcessProvisioner::new(ProcessCommandRunner);
        self.network.generate(config, &provisioner, args.force)?;
        Ok(())
    }

    async fn start<W: Write>(&self, out: &mut W) -> Result<(), CliError> {
        let client = self.connect().await?;
        let jobs = self.network.start(&self.orchestrator(&client)).await?;
        write_lines(out, &jobs.all_job_ids())
    }

    async fn network_command<W: Write>(
        &self,
        command: NetworkCommand,
        out: &mut W,
    ) -> Result<(), CliError> {
        match command {
            NetworkCommand::Generate(args) => self.generate(&args),
            NetworkCommand::Bootstrap(args) => {
                self.generate(&args)?;
                self.start(out).await
            }
            NetworkCommand::Start => self.start(out).await,
            NetworkCommand::Stop(args) => {
                let client = self.connect().await?;
                self.network
                    .stop(&self.orchestrator(&client), args.nodes_only)
                    .await?;
                Ok(())
            }
            NetworkCommand::Destroy => {
                let running = self
                    .network
                    .store()
                    .load()
                    .map_err(NetworkError::from)?
                    .is_some_and(|state| state.phase() == NetworkPhase::Running);
                if running {
                    let client = self.connect().await?;
                    self.network.destroy(&self.orchestrator(&client)).await?;
                } else {
                    self.network.store().destroy().map_err(NetworkError::from)?;
                }
                Ok(())
            }
            NetworkCommand::Logs(args) => {
                let client = self.connect().await?;
                let mut stream = self
                    .network
                    .logs(
                        &LogAggregator::new(&client),
                        args.job_id.as_deref(),
                        log_options(&args),
                    )
                    .await?;
                let copied = stream
                    .copy_to(out)
                    .await
                    .map_err(NetworkError::from);
                stream.close();
                copied?;
                Ok(())
            }
        }
    }

    async fn nodes_command<W: Write>(
        &self,
        command: NodesCommand,
        out: &mut W,
    ) -> Result<(), CliError> {
        match command {
            NodesCommand::Add(args) => self.add_nodes(&args, out).await,
            NodesCommand::Remove(args) => {
                let client = self.connect().await?;
                let node = self
                    .network
                    .remove_node(&self.orchestrator(&client), &args.name)
                    .await?;
                writeln!(out, "{}", node.name)?;
                Ok(())
            }
            NodesCommand::Start(args) => {
                let client = self.connect().await?;
                let job_ids = self
                    .network
                    .start_nodes(&self.orchestrator(&client), &args.names)
                    .await?;
                write_lines(out, &job_ids)
            }
            NodesCommand::Stop(args) => {
                let client = self.connect().await?;
                self.network
                    .stop_nodes(&self.orchestrator(&client), &args.names)
                    .await?;
                Ok(())
            }
            NodesCommand::Ls => {
                let state = self.network.state()?;
                let services = state.require_services().map_err(NetworkError::from)?;
                write_json(out, &services.by_index())
            }
            NodesCommand::LsValidators => {
                let state = self.network.state()?;
                let services = state.require_services().map_err(NetworkError::from)?;
                let validators: Vec<_> = services
                    .validators()
                    .into_iter()
                    .map(|node| {
                        json!({
                            "name": node.name,
                            "index": node.index,
                            "group_name": node.group_name,
                            "node_id": node.consensus.node_id,
                            "validator_pub_key": node.consensus.validator_pub_key,
                            "app_pub_key": node
                                .app
                                .node_wallet_info
                                .as_ref()
                                .map(|wallet| wallet.app_pub_key.as_str()),
                        })
                    })
                    .collect();
                write_json(out, &validators)
            }
            NodesCommand::UnsafeResetAll(args) => {
                let client = self.connect().await?;
                let output = self
                    .network
                    .unsafe_reset_all(&RemoteExecutor::new(&client), &args.names)
                    .await?;
                write!(out, "{output}")?;
                Ok(())
            }
            NodesCommand::RestoreCheckpoint(args) => {
                let client = self.connect().await?;
                let output = self
                    .network
                    .restore_checkpoint(
                        &RemoteExecutor::new(&client),
                        Utf8Path::new(&args.checkpoint_file),
                        &args.nodes.names,
                    )
                    .await?;
                write!(out, "{output}")?;
                Ok(())
            }
        }
    }

    async fn add_nodes<W: Write>(&self, args: &AddNodesArgs, out: &mut W) -> Result<(), CliError> {
        let provisioner = ProcessProvisioner::new(ProcessCommandRunner);
        let added = self
            .network
            .add_nodes(&provisioner, &args.base_on, args.count)?;
        let names: Vec<String> = added.into_iter().map(|node| node.name).collect();
        if args.start {
            let client = self.connect().await?;
            self.network
                .start_nodes(&self.orchestrator(&client), &names)
                .await?;
        }
        write_lines(out, &names)
    }

    async fn jobs_command<W: Write>(
        &self,
        command: JobsCommand,
        out: &mut W,
    ) -> Result<(), CliError> {
        let client = self.connect().await?;
        let orchestrator = self.orchestrator(&client);
        match command {
            JobsCommand::Start(args) => {
                let job_id = self
                    .network
                    .start_job_file(
                        &orchestrator,
                        Utf8Path::new(&args.job_file),
                        args.job_id.as_deref(),
                    )
                    .await?;
                writeln!(out, "{job_id}")?;
                Ok(())
            }
            JobsCommand::Stop(args) => {
                self.network.stop_jobs(&orchestrator, &args.job_ids).await?;
                Ok(())
            }
        }
    }
}
