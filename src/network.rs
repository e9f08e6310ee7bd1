//! Network operations over the persisted state.
//!
//! Each operation loads the [`NetworkState`], drives the generator,
//! orchestrator, log aggregator, or remote executor, and writes the state
//! back when it changed.

use camino::Utf8Path;
use futures::future::try_join_all;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::exec::{ExecError, RemoteExecutor};
use crate::files::{self, FileError};
use crate::generator::{GenerateError, Generator};
use crate::jobspec::{JobBuilder, JobSpecError, parse_raw_job};
use crate::logs::{LogAggregator, LogError, LogOptions, LogStream};
use crate::orchestrator::{JobOrchestrator, NetworkPlan, OrchestratorError, Registrations};
use crate::provisioner::Provisioner;
use crate::scheduler::Scheduler;
use crate::state::{NetworkPhase, NetworkState, StateError, StateStore};
use crate::types::{GeneratedServices, NetworkJobs, NodeSet};

/// Errors raised by network operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Raised when the state cannot be loaded or saved.
    #[error(transparent)]
    State(#[from] StateError),
    /// Raised when generation fails.
    #[error(transparent)]
    Generate(#[from] GenerateError),
    /// Raised when jobs cannot be started or stopped.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    /// Raised when a job definition is unusable.
    #[error(transparent)]
    Spec(#[from] JobSpecError),
    /// Raised when logs cannot be streamed.
    #[error(transparent)]
    Logs(#[from] LogError),
    /// Raised when a remote command fails.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// Raised when node homes or job files cannot be accessed.
    #[error(transparent)]
    File(#[from] FileError),
    /// Raised when an operation needs a stopped network.
    #[error("network {network} is running; stop it first")]
    Running {
        /// Network name.
        network: String,
    },
    /// Raised when an operation needs running jobs.
    #[error("network {network} has no running jobs")]
    NotRunning {
        /// Network name.
        network: String,
    },
    /// Raised when a node set name is not part of the network.
    #[error("unknown node set '{name}'")]
    UnknownNode {
        /// Requested name.
        name: String,
    },
}

/// Entry point for every network operation of one network home.
#[derive(Clone, Debug)]
pub struct Network {
    store: StateStore,
}

impl Network {
    /// Operates on the network persisted in `store`.
    #[must_use]
    pub const fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Underlying state store.
    #[must_use]
    pub const fn store(&self) -> &StateStore {
        &self.store
    }

    /// Current persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::State`] when no network exists.
    pub fn state(&self) -> Result<NetworkState, NetworkError> {
        Ok(self.store.require()?)
    }

    /// Generates node sets, services, and genesis for `config` and records
    /// them as a fresh state.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Running`] when the existing network is
    /// running, and [`NetworkError::Generate`] when the output exists
    /// without `force` or generation fails.
    pub fn generate<P: Provisioner>(
        &self,
        config: NetworkConfig,
        provisioner: &P,
        force: bool,
    ) -> Result<NetworkState, NetworkError> {
        if let Some(existing) = self.store.load()?
            && existing.phase() == NetworkPhase::Running
        {
            return Err(NetworkError::Running {
                network: existing.config.network_name,
            });
        }

        let output_dir = self.store.output_dir();
        let services = Generator::new(&config, provisioner, &output_dir).generate(force)?;
        info!(
            network = %config.network_name,
            nodes = services.node_sets.len(),
            "network generated"
        );
        let mut state = NetworkState::new(config);
        state.generated_services = Some(services);
        self.store.save(&state)?;
        Ok(state)
    }

    /// Starts every job of the network.
    ///
    /// When any phase fails, the jobs this call planned that were not
    /// already tracked are stopped again and the state is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] when the network is not generated or a job
    /// fails to start.
    pub async fn start<S: Scheduler + ?Sized>(
        &self,
        orchestrator: &JobOrchestrator<'_, S>,
    ) -> Result<NetworkJobs, NetworkError> {
        let mut state = self.store.require()?;
        let plan = NetworkPlan::build(&state.config, state.require_services()?)?;
        let registrations = Registrations::default();

        if let Err(err) = orchestrator
            .run_plan(&state.config, &plan, &registrations)
            .await
        {
            let started = registrations.job_ids();
            warn!(jobs = started.len(), error = %err, "start failed, stopping started jobs");
            if let Err(stop_err) = orchestrator.stop_jobs(&started).await.into_result() {
                warn!(error = %stop_err, "rollback left jobs behind");
            }
            return Err(err.into());
        }

        let running = state.running_jobs_mut();
        running.merge(plan.jobs());
        let tracked = running.clone();
        self.store.save(&state)?;
        Ok(tracked)
    }

    /// Stops the network. Job IDs that were stopped are untracked even
    /// when others fail.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] when the state is missing or any job fails
    /// to stop.
    pub async fn stop<S: Scheduler + ?Sized>(
        &self,
        orchestrator: &JobOrchestrator<'_, S>,
        nodes_only: bool,
    ) -> Result<(), NetworkError> {
        let mut state = self.store.require()?;
        let outcome = orchestrator
            .stop_network(state.running_jobs.as_ref(), nodes_only)
            .await;
        if let Some(jobs) = state.running_jobs.as_mut() {
            jobs.remove_job_ids(&outcome.stopped);
        }
        self.store.save(&state)?;
        outcome.into_result()?;
        info!(network = %state.config.network_name, nodes_only, "network stopped");
        Ok(())
    }

    /// Stops the network if it runs, then removes its home directory.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] when stopping or removal fails.
    pub async fn destroy<S: Scheduler + ?Sized>(
        &self,
        orchestrator: &JobOrchestrator<'_, S>,
    ) -> Result<(), NetworkError> {
        if let Some(state) = self.store.load()?
            && state.phase() == NetworkPhase::Running
        {
            self.stop(orchestrator, false).await?;
        }
        self.store.destroy()?;
        Ok(())
    }

    /// Adds `count` node sets to group `base_on`. New nodes get fresh
    /// indices and copy the existing genesis; existing nodes are untouched.
    ///
    /// Nodes added before a failure are kept.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] when the network is missing or generation
    /// fails.
    pub fn add_nodes<P: Provisioner>(
        &self,
        provisioner: &P,
        base_on: &str,
        count: usize,
    ) -> Result<Vec<NodeSet>, NetworkError> {
        let mut state = self.store.require()?;
        state.require_services()?;
        let output_dir = self.store.output_dir();
        let generator = Generator::new(&state.config, provisioner, &output_dir);
        let services = state.generated_services.get_or_insert_with(GeneratedServices::default);

        let mut added = Vec::with_capacity(count);
        let mut failure = None;
        for _ in 0..count {
            match generator.add_node_set(services, base_on) {
                Ok(node) => {
                    services.insert(node.clone());
                    added.push(node);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if !added.is_empty() {
            self.store.save(&state)?;
        }
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(added),
        }
    }

    /// Stops (when tracked as running) and deletes one node set.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] when the node is unknown, its job cannot be
    /// stopped, or its homes cannot be removed.
    pub async fn remove_node<S: Scheduler + ?Sized>(
        &self,
        orchestrator: &JobOrchestrator<'_, S>,
        name: &str,
    ) -> Result<NodeSet, NetworkError> {
        let mut state = self.store.require()?;
        let node = state
            .require_services()?
            .node_sets
            .get(name)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownNode {
                name: name.to_owned(),
            })?;

        let job_id = node.job_id().to_owned();
        if state
            .running_jobs
            .as_ref()
            .is_some_and(|jobs| jobs.contains(&job_id))
        {
            orchestrator
                .stop_jobs(std::slice::from_ref(&job_id))
                .await
                .into_result()?;
            state.running_jobs_mut().remove_job_ids(&[job_id]);
        }

        state.require_services_mut()?.node_sets.remove(name);
        for dir in node.home_dirs() {
            files::remove_dir_all(dir)?;
        }
        self.store.save(&state)?;
        info!(node = %node.name, index = node.index, "node set removed");
        Ok(node)
    }

    /// Starts the jobs of `names`, or of every node set when empty.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] when a node is unknown or a job fails to
    /// start.
    pub async fn start_nodes<S: Scheduler + ?Sized>(
        &self,
        orchestrator: &JobOrchestrator<'_, S>,
        names: &[String],
    ) -> Result<Vec<String>, NetworkError> {
        let mut state = self.store.require()?;
        let builder = JobBuilder::new(&state.config);
        let jobs = resolve_nodes(state.require_services()?, names)?
            .into_iter()
            .map(|node| builder.node(node))
            .collect::<Result<Vec<_>, _>>()?;

        try_join_all(jobs.iter().map(|job| orchestrator.start_job(job))).await?;

        let running = state.running_jobs_mut();
        let job_ids: Vec<String> = jobs.into_iter().map(|job| job.id).collect();
        for job_id in &job_ids {
            running.add_node_set_job(job_id.clone());
        }
        self.store.save(&state)?;
        Ok(job_ids)
    }

    /// Stops the jobs of `names`, or of every node set when empty.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] when a node is unknown or a job fails to
    /// stop.
    pub async fn stop_nodes<S: Scheduler + ?Sized>(
        &self,
        orchestrator: &JobOrchestrator<'_, S>,
        names: &[String],
    ) -> Result<(), NetworkError> {
        let state = self.store.require()?;
        let job_ids: Vec<String> = resolve_nodes(state.require_services()?, names)?
            .into_iter()
            .map(|node| node.job_id().to_owned())
            .collect();
        self.stop_jobs(orchestrator, &job_ids).await
    }

    /// Deregisters `job_ids` and untracks the ones that stopped.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] when any job fails to stop.
    pub async fn stop_jobs<S: Scheduler + ?Sized>(
        &self,
        orchestrator: &JobOrchestrator<'_, S>,
        job_ids: &[String],
    ) -> Result<(), NetworkError> {
        let mut state = self.store.require()?;
        let outcome = orchestrator.stop_jobs(job_ids).await;
        if let Some(jobs) = state.running_jobs.as_mut() {
            jobs.remove_job_ids(&outcome.stopped);
        }
        self.store.save(&state)?;
        Ok(outcome.into_result()?)
    }

    /// Starts a job from a raw JSON definition and tracks it. The job ID
    /// defaults to the file stem.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] when the file cannot be read or parsed, or
    /// the job fails to start.
    pub async fn start_job_file<S: Scheduler + ?Sized>(
        &self,
        orchestrator: &JobOrchestrator<'_, S>,
        path: &Utf8Path,
        job_id: Option<&str>,
    ) -> Result<String, NetworkError> {
        let mut state = self.store.require()?;
        let id = job_id
            .or_else(|| path.file_stem())
            .unwrap_or("job")
            .to_owned();
        let job = parse_raw_job(&id, &files::read_to_string(path)?)?;

        orchestrator.start_job(&job).await?;
        state.running_jobs_mut().add_extra_job(id.clone());
        self.store.save(&state)?;
        Ok(id)
    }

    /// Opens a merged log stream for `job_id`, or for every tracked job.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::NotRunning`] when no job is tracked, or
    /// [`NetworkError::Logs`] when subscriptions fail.
    pub async fn logs<S: Scheduler + ?Sized>(
        &self,
        aggregator: &LogAggregator<'_, S>,
        job_id: Option<&str>,
        options: LogOptions,
    ) -> Result<LogStream, NetworkError> {
        let state = self.store.require()?;
        let job_ids = match job_id {
            Some(id) => vec![id.to_owned()],
            None => state
                .running_jobs
                .as_ref()
                .map(NetworkJobs::all_job_ids)
                .unwrap_or_default(),
        };
        if job_ids.is_empty() {
            return Err(NetworkError::NotRunning {
                network: state.config.network_name,
            });
        }
        Ok(aggregator.log_jobs(&job_ids, options).await?)
    }

    /// Wipes consensus and application state of `names`, or of every node
    /// set when empty, through each node's remote command runner.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] when a node is unknown or a command fails.
    pub async fn unsafe_reset_all<S: Scheduler + ?Sized>(
        &self,
        executor: &RemoteExecutor<'_, S>,
        names: &[String],
    ) -> Result<String, NetworkError> {
        let state = self.store.require()?;
        let nodes = resolve_nodes(state.require_services()?, names)?;

        let mut output = executor
            .execute(
                "{{ consensus_binary }}",
                &reset_args("unsafe-reset-all", "{{ consensus_home }}"),
                &nodes,
            )
            .await?;
        output.push_str(
            &executor
                .execute(
                    "{{ app_binary }}",
                    &reset_args("unsafe_reset_all", "{{ app_home }}"),
                    &nodes,
                )
                .await?,
        );
        Ok(output)
    }

    /// Restores `names`, or every node set when empty, from the checkpoint
    /// at `checkpoint`. Node state is wiped first so the application
    /// replays from the checkpoint instead of its previous chain data.
    ///
    /// `checkpoint` is resolved inside each node's remote command runner.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] when a node is unknown or a command fails.
    pub async fn restore_checkpoint<S: Scheduler + ?Sized>(
        &self,
        executor: &RemoteExecutor<'_, S>,
        checkpoint: &Utf8Path,
        names: &[String],
    ) -> Result<String, NetworkError> {
        let mut output = self.unsafe_reset_all(executor, names).await?;

        let state = self.store.require()?;
        let nodes = resolve_nodes(state.require_services()?, names)?;
        let mut args = reset_args("restore-checkpoint", "{{ app_home }}");
        args.extend([String::from("--checkpoint-file"), checkpoint.to_string()]);
        output.push_str(&executor.execute("{{ app_binary }}", &args, &nodes).await?);
        info!(checkpoint = %checkpoint, nodes = nodes.len(), "checkpoint restored");
        Ok(output)
    }
}

fn reset_args(subcommand: &str, home: &str) -> Vec<String> {
    vec![subcommand.to_owned(), String::from("--home"), home.to_owned()]
}

/// Looks up `names`, or returns every node set in index order when empty.
fn resolve_nodes<'s>(
    services: &'s GeneratedServices,
    names: &[String],
) -> Result<Vec<&'s NodeSet>, NetworkError> {
    if names.is_empty() {
        return Ok(services.by_index());
    }
    names
        .iter()
        .map(|name| {
            services
                .node_sets
                .get(name)
                .ok_or_else(|| NetworkError::UnknownNode { name: name.clone() })
        })
        .collect()
}
