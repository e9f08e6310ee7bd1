//! Submits network jobs in phases and tears them down again.
//!
//! Start runs three gated phases: pre-start docker jobs (and their probes),
//! then the wallet, faucet, and every node set together. Each submission
//! registers the job and waits for its deployment to settle, using a
//! coarser liveness heuristic to tell slow image pulls from stuck tasks.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::future::try_join_all;
use futures::{StreamExt, stream};
use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::MultiError;
use crate::config::NetworkConfig;
use crate::jobspec::{Job, JobBuilder, JobSpecError};
use crate::probes::{ProbeError, ProbeRunner};
use crate::scheduler::{Allocation, DeploymentStatus, Scheduler, SchedulerError};
use crate::types::{GeneratedServices, NetworkJobs};

const DEPLOYMENT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const STOP_CONCURRENCY: usize = 8;
const RUNNING: &str = "running";

/// Job IDs submitted to the scheduler during one start attempt. Jobs found
/// already running are not recorded.
#[derive(Debug, Default)]
pub struct Registrations(Mutex<Vec<String>>);

impl Registrations {
    fn record(&self, job_id: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job_id.to_owned());
    }

    /// Recorded job IDs in submission order.
    #[must_use]
    pub fn job_ids(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Errors raised while starting or stopping jobs.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Raised when a job definition cannot be built.
    #[error(transparent)]
    Spec(#[from] JobSpecError),
    /// Raised when a scheduler call for a job fails.
    #[error("scheduler call for job {job_id} failed: {source}")]
    Scheduler {
        /// Job being handled.
        job_id: String,
        /// Underlying failure.
        #[source]
        source: SchedulerError,
    },
    /// Raised when a pre-start job fails; nothing else is started.
    #[error("pre-start job {job_id} failed: {source}")]
    PreStartFailed {
        /// Failed pre-start job.
        job_id: String,
        /// Underlying failure.
        #[source]
        source: Box<OrchestratorError>,
    },
    /// Raised when a pre-start readiness probe never passes.
    #[error(transparent)]
    Probe(#[from] ProbeError),
    /// Raised when the scheduler reports the deployment as failed.
    #[error("deployment of job {job_id} ended as {status}: {description}")]
    DeploymentFailed {
        /// Failed job.
        job_id: String,
        /// Final deployment status.
        status: String,
        /// Scheduler explanation.
        description: String,
    },
    /// Raised when a job shows no sign of starting, or the wait is
    /// cancelled.
    #[error("job {job_id} did not start in time")]
    JobTimeout {
        /// Job that timed out.
        job_id: String,
    },
    /// Raised when deregistering one or more jobs fails.
    #[error("failed to stop jobs: {0}")]
    Stop(MultiError<SchedulerError>),
}

/// Jobs derived from the configuration and generated services, grouped by
/// start phase.
#[derive(Clone, Debug)]
pub struct NetworkPlan {
    /// Pre-start docker jobs.
    pub pre_start: Vec<Job>,
    /// Wallet and faucet jobs.
    pub services: Vec<Job>,
    /// One job per node set, in index order.
    pub nodes: Vec<Job>,
    jobs: NetworkJobs,
}

impl NetworkPlan {
    /// Builds every job of the network.
    ///
    /// # Errors
    ///
    /// Returns [`JobSpecError`] when a node's raw job definition is
    /// unusable.
    pub fn build(
        config: &NetworkConfig,
        services: &GeneratedServices,
    ) -> Result<Self, JobSpecError> {
        let builder = JobBuilder::new(config);
        let mut jobs = NetworkJobs::default();

        let pre_start: Vec<Job> = config
            .pre_start
            .iter()
            .map(|docker| builder.docker(docker))
            .collect();
        for job in &pre_start {
            jobs.add_extra_job(job.id.clone());
        }

        let mut service_jobs = Vec::new();
        if let Some(wallet) = &services.wallet {
            let job = builder.wallet(wallet);
            jobs.set_wallet_job(job.id.clone());
            service_jobs.push(job);
        }
        if let Some(faucet) = &services.faucet {
            let job = builder.faucet(faucet);
            jobs.set_faucet_job(job.id.clone());
            service_jobs.push(job);
        }

        let nodes = services
            .by_index()
            .into_iter()
            .map(|node| builder.node(node))
            .collect::<Result<Vec<_>, _>>()?;
        for job in &nodes {
            jobs.add_node_set_job(job.id.clone());
        }

        Ok(Self {
            pre_start,
            services: service_jobs,
            nodes,
            jobs,
        })
    }

    /// Bookkeeping for every planned job.
    #[must_use]
    pub const fn jobs(&self) -> &NetworkJobs {
        &self.jobs
    }
}

/// Outcome of deregistering a batch of jobs.
#[derive(Debug, Default)]
pub struct StopOutcome {
    /// Jobs that were deregistered.
    pub stopped: Vec<String>,
    /// Jobs that could not be deregistered.
    pub failed: MultiError<SchedulerError>,
}

impl StopOutcome {
    /// Converts into an error when any job failed to stop.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Stop`] listing every failure.
    pub fn into_result(self) -> Result<(), OrchestratorError> {
        self.failed.into_result().map_err(OrchestratorError::Stop)
    }
}

/// Drives job submission and teardown against a [`Scheduler`].
pub struct JobOrchestrator<'a, S: Scheduler + ?Sized> {
    scheduler: &'a S,
    poll_interval: Duration,
    liveness_interval: Duration,
    probes: ProbeRunner,
    cancel: CancellationToken,
}

impl<'a, S: Scheduler + ?Sized> JobOrchestrator<'a, S> {
    /// Creates an orchestrator with the default polling cadence.
    #[must_use]
    pub fn new(scheduler: &'a S) -> Self {
        Self {
            scheduler,
            poll_interval: DEPLOYMENT_POLL_INTERVAL,
            liveness_interval: LIVENESS_CHECK_INTERVAL,
            probes: ProbeRunner::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Overrides how often deployment status is polled.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides how often the liveness heuristic runs.
    #[must_use]
    pub const fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Replaces the probe runner used for pre-start readiness checks.
    #[must_use]
    pub fn with_probe_runner(mut self, probes: ProbeRunner) -> Self {
        self.probes = probes;
        self
    }

    /// Cancelling `cancel` fails every in-flight deployment wait with
    /// [`OrchestratorError::JobTimeout`].
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Starts the whole network and returns its bookkeeping.
    ///
    /// Pre-start jobs must all succeed and their probes pass before the
    /// wallet, faucet, and node jobs are submitted.
    ///
    /// # Errors
    ///
    /// Returns the first [`OrchestratorError`] of the failing phase.
    pub async fn start_network(
        &self,
        config: &NetworkConfig,
        services: &GeneratedServices,
    ) -> Result<NetworkJobs, OrchestratorError> {
        let plan = NetworkPlan::build(config, services)?;
        self.run_plan(config, &plan, &Registrations::default()).await?;
        Ok(plan.jobs().clone())
    }

    /// Starts an already built plan, recording in `registrations` every
    /// job this call submitted to the scheduler.
    ///
    /// # Errors
    ///
    /// Returns the first [`OrchestratorError`] of the failing phase.
    pub async fn run_plan(
        &self,
        config: &NetworkConfig,
        plan: &NetworkPlan,
        registrations: &Registrations,
    ) -> Result<(), OrchestratorError> {
        if !plan.pre_start.is_empty() {
            info!(jobs = plan.pre_start.len(), "starting pre-start jobs");
            try_join_all(plan.pre_start.iter().map(|job| async move {
                self.submit(job, Some(registrations))
                    .await
                    .map_err(|source| OrchestratorError::PreStartFailed {
                        job_id: job.id.clone(),
                        source: Box::new(source),
                    })
            }))
            .await?;

            let probes = config.pre_start.iter().flat_map(|docker| docker.probes.iter());
            try_join_all(probes.map(|probe| self.probes.wait_ready(probe))).await?;
        }

        info!(
            services = plan.services.len(),
            nodes = plan.nodes.len(),
            "starting network jobs"
        );
        try_join_all(
            plan.services
                .iter()
                .chain(plan.nodes.iter())
                .map(|job| self.submit(job, Some(registrations))),
        )
        .await?;
        info!("network started");
        Ok(())
    }

    /// Registers `job` and waits for its deployment. A job the scheduler
    /// already reports as running is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when registration or the deployment
    /// fails.
    pub async fn start_job(&self, job: &Job) -> Result<(), OrchestratorError> {
        self.submit(job, None).await
    }

    async fn submit(
        &self,
        job: &Job,
        registrations: Option<&Registrations>,
    ) -> Result<(), OrchestratorError> {
        let job_id = job.id.as_str();
        let status = self
            .scheduler
            .job_status(job_id)
            .await
            .map_err(scheduler_error(job_id))?;
        if status.as_deref() == Some(RUNNING) {
            info!(job_id, "job already running");
            return Ok(());
        }

        self.scheduler
            .register_job(job)
            .await
            .map_err(scheduler_error(job_id))?;
        if let Some(registrations) = registrations {
            registrations.record(job_id);
        }
        debug!(job_id, "job registered");
        self.wait_for_deployment(job_id).await?;
        info!(job_id, "job deployed");
        Ok(())
    }

    async fn wait_for_deployment(&self, job_id: &str) -> Result<(), OrchestratorError> {
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness = interval(self.liveness_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        liveness.tick().await;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    warn!(job_id, "deployment wait cancelled");
                    return Err(OrchestratorError::JobTimeout { job_id: job_id.to_owned() });
                }
                _ = poll.tick() => {
                    if self.deployment_settled(job_id).await? {
                        return Ok(());
                    }
                }
                _ = liveness.tick() => self.assess_liveness(job_id).await?,
            }
        }
    }

    async fn deployment_settled(&self, job_id: &str) -> Result<bool, OrchestratorError> {
        let deployment = self
            .scheduler
            .latest_deployment(job_id)
            .await
            .map_err(scheduler_error(job_id))?;
        match deployment {
            Some(deployment) => match deployment.status {
                DeploymentStatus::Successful => Ok(true),
                DeploymentStatus::Failed | DeploymentStatus::Canceled => {
                    Err(OrchestratorError::DeploymentFailed {
                        job_id: job_id.to_owned(),
                        status: format!("{:?}", deployment.status).to_lowercase(),
                        description: deployment.status_description,
                    })
                }
                DeploymentStatus::Running
                | DeploymentStatus::Paused
                | DeploymentStatus::Unknown => Ok(false),
            },
            None => {
                let allocations = self.allocations(job_id).await?;
                Ok(!allocations.is_empty() && allocations.iter().all(Allocation::is_running))
            }
        }
    }

    /// Keeps waiting while any task is downloading or has started;
    /// otherwise the job is considered stuck.
    async fn assess_liveness(&self, job_id: &str) -> Result<(), OrchestratorError> {
        let allocations = self.allocations(job_id).await?;
        let events: Vec<_> = allocations
            .iter()
            .flat_map(|allocation| allocation.task_states.values())
            .flat_map(|state| state.events.iter())
            .collect();
        if events.iter().any(|event| event.is_downloading()) {
            debug!(job_id, "tasks still downloading");
            return Ok(());
        }
        if events.iter().any(|event| event.is_started()) {
            debug!(job_id, "tasks started, deployment still settling");
            return Ok(());
        }
        warn!(job_id, "no task started before the liveness check");
        Err(OrchestratorError::JobTimeout {
            job_id: job_id.to_owned(),
        })
    }

    async fn allocations(&self, job_id: &str) -> Result<Vec<Allocation>, OrchestratorError> {
        self.scheduler
            .job_allocations(job_id)
            .await
            .map_err(scheduler_error(job_id))
    }

    /// Stops a network's jobs. With `nodes_only` only node set jobs are
    /// stopped; otherwise every tracked job is stopped and scheduler garbage
    /// collection runs best effort.
    ///
    /// Stopping a network that has no tracked jobs only triggers garbage
    /// collection. A job that fails to stop does not prevent the others
    /// from being stopped; the outcome lists both.
    pub async fn stop_network(&self, jobs: Option<&NetworkJobs>, nodes_only: bool) -> StopOutcome {
        let job_ids: Vec<String> = match jobs {
            None => Vec::new(),
            Some(jobs) if nodes_only => jobs.node_set_job_ids.iter().cloned().collect(),
            Some(jobs) => jobs.all_job_ids(),
        };
        let outcome = self.stop_jobs(&job_ids).await;
        if !nodes_only && let Err(err) = self.scheduler.garbage_collect().await {
            warn!(error = %err, "garbage collection failed");
        }
        outcome
    }

    /// Deregisters `job_ids` concurrently, skipping empty IDs.
    pub async fn stop_jobs(&self, job_ids: &[String]) -> StopOutcome {
        let results: Vec<(String, Result<(), SchedulerError>)> =
            stream::iter(job_ids.iter().filter(|job_id| !job_id.is_empty()))
                .map(|job_id| async move {
                    let result = self.scheduler.deregister_job(job_id, true).await;
                    (job_id.clone(), result)
                })
                .buffer_unordered(STOP_CONCURRENCY)
                .collect()
                .await;

        let mut outcome = StopOutcome::default();
        for (job_id, result) in results {
            match result {
                Ok(()) => {
                    info!(job_id = %job_id, "job stopped");
                    outcome.stopped.push(job_id);
                }
                Err(err) => {
                    warn!(job_id = %job_id, error = %err, "failed to stop job");
                    outcome.failed.push(job_id, err);
                }
            }
        }
        outcome
    }
}

fn scheduler_error(job_id: &str) -> impl FnOnce(SchedulerError) -> OrchestratorError + '_ {
    move |source| OrchestratorError::Scheduler {
        job_id: job_id.to_owned(),
        source,
    }
}

#[cfg(test)]
mod tests;
