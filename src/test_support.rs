//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::{
    Binaries, DockerJobConfig, NetworkConfig, NodeSetConfig, RemoteCommandRunnerConfig,
    ResourceConfig,
};
use crate::files;
use crate::jobspec::Job;
use crate::provisioner::{
    AppInit, ConfigArtifact, ConsensusArtifacts, ConsensusInit, FaucetArtifacts, GenesisRequest,
    HomeInit, NodeWalletRequest, ProvisionError, Provisioner,
};
use crate::runner::{CommandOutput, CommandRunner, RunnerError};
use crate::scheduler::{
    Allocation, Deployment, DeploymentStatus, ExecOutput, JobSummary, LogFrame, LogRequest,
    LogStreamKind, LogSubscription, Scheduler, SchedulerError, SchedulerFuture, TaskEvent,
    TaskState,
};
use crate::types::{
    AppNode, ConsensusNode, GeneratedServices, NodeMode, NodeSet, NodeWalletInfo,
    RemoteCommandRunner,
};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| RunnerError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets a single environment variable while holding a global mutex.
    pub async fn set_var(key: &str, value: &str) -> Self {
        Self::set_vars(&[(key, value)]).await
    }

    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Builds a node set with plausible artifact paths and no files on disk.
#[must_use]
pub fn sample_node_set(network: &str, group: &str, index: usize, mode: NodeMode) -> NodeSet {
    let root = Utf8PathBuf::from(format!("/tmp/capsule/{network}"));
    let consensus_home = root.join(format!("consensus/node{index}"));
    let app_home = root.join(format!("app/node{index}"));
    let validator = mode.is_validator();
    let vars = BTreeMap::from([
        (String::from("consensus_home"), consensus_home.to_string()),
        (String::from("app_home"), app_home.to_string()),
        (String::from("consensus_binary"), String::from("tendermint")),
        (String::from("app_binary"), String::from("vega")),
    ]);

    NodeSet {
        index,
        group_name: group.to_owned(),
        mode,
        name: NodeSet::name_for(network, group, index, mode),
        consensus: ConsensusNode {
            binary: String::from("tendermint"),
            node_id: format!("nodeid{index}"),
            validator_pub_key: validator.then(|| format!("pubkey{index}")),
            validator_key_path: validator
                .then(|| consensus_home.join("config/priv_validator_key.json")),
            config_path: consensus_home.join("config/config.toml"),
            original_config_path: consensus_home.join("config/original-config.toml"),
            genesis_path: consensus_home.join("config/genesis.json"),
            home_dir: consensus_home,
        },
        app: AppNode {
            binary: String::from("vega"),
            config_path: app_home.join("config/node/config.toml"),
            original_config_path: app_home.join("config/node/original-config.toml"),
            node_wallet_info: validator.then(|| NodeWalletInfo {
                app_pub_key: format!("apppub{index}"),
                ethereum_address: None,
                passphrase_path: app_home.join("passphrase.txt"),
            }),
            home_dir: app_home,
        },
        data_node: None,
        remote_command_runner: Some(RemoteCommandRunner {
            task_name: String::from("remote-command-runner"),
            binary: String::from("sleep"),
            args: vec![String::from("infinity")],
            vars,
        }),
        log_forwarder: None,
        job_template: None,
    }
}

/// Builds a node group declaration with no templates.
#[must_use]
pub fn node_set_config(name: &str, mode: NodeMode, count: usize) -> NodeSetConfig {
    NodeSetConfig {
        name: name.to_owned(),
        mode,
        count,
        consensus_template: None,
        consensus_template_file: None,
        app_template: None,
        app_template_file: None,
        app_binary: None,
        data_node: None,
        remote_command_runner: Some(RemoteCommandRunnerConfig {
            task_name: String::from("remote-command-runner"),
            binary: String::from("sleep"),
            args: vec![String::from("infinity")],
        }),
        log_forwarder: None,
        job_template: None,
        job_template_file: None,
    }
}

/// Network of two validators and one full node named `testnet`.
#[must_use]
pub fn sample_network_config() -> NetworkConfig {
    NetworkConfig {
        network_name: String::from("testnet"),
        binaries: Binaries::default(),
        datacenters: vec![String::from("dc1")],
        resources: ResourceConfig::default(),
        genesis_template: None,
        genesis_template_file: None,
        smart_contracts_addresses: BTreeMap::new(),
        pre_start: Vec::new(),
        wallet: None,
        faucet: None,
        node_sets: vec![
            node_set_config("validators", NodeMode::Validator, 2),
            node_set_config("full", NodeMode::Full, 1),
        ],
    }
}

/// Services matching [`sample_network_config`]: validators 0 and 1 and
/// full node 2, with no files on disk.
#[must_use]
pub fn sample_services() -> GeneratedServices {
    let mut services = GeneratedServices::default();
    services.insert(sample_node_set("testnet", "validators", 0, NodeMode::Validator));
    services.insert(sample_node_set("testnet", "validators", 1, NodeMode::Validator));
    services.insert(sample_node_set("testnet", "full", 2, NodeMode::Full));
    services
}

/// Pre-start docker job declaration without probes.
#[must_use]
pub fn docker_job(name: &str) -> DockerJobConfig {
    DockerJobConfig {
        name: name.to_owned(),
        image: format!("{name}:latest"),
        command: None,
        args: Vec::new(),
        env: BTreeMap::new(),
        static_port: None,
        probes: Vec::new(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Provisioner writing realistic artifacts without external binaries.
///
/// Node IDs and keys are derived from a counter so every initialised node
/// gets a distinct identity.
#[derive(Debug, Default)]
pub struct FakeProvisioner {
    counter: AtomicUsize,
    calls: Mutex<Vec<String>>,
    fail_step: Option<String>,
    app_validators: Mutex<VecDeque<(String, serde_json::Value)>>,
}

impl FakeProvisioner {
    /// Creates a provisioner that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provisioner whose every `step` call fails, where `step` is
    /// the trait method name such as `update_genesis`.
    #[must_use]
    pub fn failing_on(step: &str) -> Self {
        Self {
            fail_step: Some(step.to_owned()),
            ..Self::default()
        }
    }

    /// Queues an extra `app_state.validators` entry for the next genesis
    /// fragment; each fragment takes one queued entry.
    pub fn push_app_validator(&self, key: &str, value: serde_json::Value) {
        lock(&self.app_validators).push_back((key.to_owned(), value));
    }

    /// Every call as `"<step> <home>"`, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, step: &str, home: &Utf8Path) -> Result<(), ProvisionError> {
        lock(&self.calls).push(format!("{step} {home}"));
        if self.fail_step.as_deref() == Some(step) {
            return Err(ProvisionError::Command {
                command: format!("{step} {home}"),
                status: String::from("1"),
                stderr: String::from("simulated failure"),
            });
        }
        Ok(())
    }

    fn next_id(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }
}

impl Provisioner for FakeProvisioner {
    fn init_consensus(
        &self,
        request: &ConsensusInit,
    ) -> Result<ConsensusArtifacts, ProvisionError> {
        self.record("init_consensus", &request.home)?;
        let n = self.next_id();
        let config_dir = request.home.join("config");
        let config_path = config_dir.join("config.toml");
        files::write(
            &config_path,
            format!(
                concat!(
                    "moniker = \"node{n}\"\n\n",
                    "[p2p]\nladdr = \"tcp://0.0.0.0:26656\"\npersistent_peers = \"\"\n\n",
                    "[rpc]\nladdr = \"tcp://127.0.0.1:26657\"\n",
                ),
                n = n
            ),
        )?;
        let genesis_path = config_dir.join("genesis.json");
        files::write(&genesis_path, "{}")?;

        let (validator_pub_key, validator_key_path) = if request.mode.is_validator() {
            let pub_key = format!("pubkey-{n}");
            let key_path = config_dir.join("priv_validator_key.json");
            let key = json!({
                "address": format!("ADDR{n:04}"),
                "pub_key": {"type": "tendermint/PubKeyEd25519", "value": pub_key},
                "priv_key": {"type": "tendermint/PrivKeyEd25519", "value": format!("secret-{n}")},
            });
            files::write(&key_path, key.to_string())?;
            (Some(pub_key), Some(key_path))
        } else {
            (None, None)
        };

        Ok(ConsensusArtifacts {
            config_path,
            genesis_path,
            node_id: format!("{n:040x}"),
            validator_pub_key,
            validator_key_path,
        })
    }

    fn init_app(&self, request: &AppInit) -> Result<ConfigArtifact, ProvisionError> {
        self.record("init_app", &request.home)?;
        let config_path = request.home.join("config/node/config.toml");
        files::write(
            &config_path,
            "[API]\nPort = 3007\n\n[Blockchain]\nChainProvider = \"tendermint\"\n",
        )?;
        Ok(ConfigArtifact { config_path })
    }

    fn init_data_node(&self, request: &HomeInit) -> Result<ConfigArtifact, ProvisionError> {
        self.record("init_data_node", &request.home)?;
        let config_path = request.home.join("config/data-node/config.toml");
        files::write(&config_path, "[SQLStore]\nPort = 5432\n")?;
        Ok(ConfigArtifact { config_path })
    }

    fn generate_node_wallet(
        &self,
        request: &NodeWalletRequest,
    ) -> Result<NodeWalletInfo, ProvisionError> {
        self.record("generate_node_wallet", &request.app_home)?;
        let n = self.next_id();
        let passphrase_path = request.app_home.join("passphrase.txt");
        files::write(&passphrase_path, "passphrase")?;
        Ok(NodeWalletInfo {
            app_pub_key: format!("apppub-{n}"),
            ethereum_address: Some(format!("0x{n:040x}")),
            passphrase_path,
        })
    }

    fn init_wallet(&self, request: &HomeInit) -> Result<ConfigArtifact, ProvisionError> {
        self.record("init_wallet", &request.home)?;
        let config_path = request.home.join("config/wallet-service/config.toml");
        files::write(&config_path, "[Server]\nPort = 1789\n")?;
        Ok(ConfigArtifact { config_path })
    }

    fn init_faucet(&self, request: &HomeInit) -> Result<FaucetArtifacts, ProvisionError> {
        self.record("init_faucet", &request.home)?;
        let config_path = request.home.join("config/faucet/config.toml");
        files::write(&config_path, "Port = 1790\n")?;
        let passphrase_path = request.home.join("passphrase.txt");
        files::write(&passphrase_path, "passphrase")?;
        Ok(FaucetArtifacts {
            config_path,
            public_key: String::from("faucet-pub"),
            passphrase_path,
        })
    }

    fn update_genesis(&self, request: &GenesisRequest) -> Result<String, ProvisionError> {
        self.record("update_genesis", &request.app_home)?;
        let key_path = request.consensus_home.join("config/priv_validator_key.json");
        let key: serde_json::Value = serde_json::from_str(&files::read_to_string(&key_path)?)
            .map_err(|err| ProvisionError::Decode {
                command: format!("update_genesis {}", request.app_home),
                message: err.to_string(),
            })?;
        let pub_key = key["pub_key"]["value"].as_str().unwrap_or_default().to_owned();
        let name = request.app_home.file_name().unwrap_or_default();
        let mut validators = serde_json::Map::new();
        validators.insert(
            pub_key.clone(),
            json!({"tm_pub_key": pub_key, "name": name}),
        );
        if let Some((key, value)) = lock(&self.app_validators).pop_front() {
            validators.insert(key, value);
        }
        let fragment = json!({
            "chain_id": "capsule-test",
            "genesis_time": "2026-01-01T00:00:00Z",
            "validators": [{
                "address": "dry-run",
                "pub_key": {"type": "tendermint/PubKeyEd25519", "value": pub_key},
                "power": "1",
                "name": "dry-run",
            }],
            "app_state": {
                "network": {"replay_attack_threshold": "2"},
                "validators": validators,
            },
        });
        Ok(fragment.to_string())
    }
}

/// Command executed through [`FakeScheduler::exec`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecCall {
    /// Target allocation.
    pub alloc_id: String,
    /// Target task.
    pub task: String,
    /// Command and arguments.
    pub command: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeSchedulerState {
    calls: Vec<String>,
    registered: Vec<Job>,
    statuses: BTreeMap<String, String>,
    failing_registrations: BTreeSet<String>,
    failing_deregistrations: BTreeSet<String>,
    deployments: BTreeMap<String, Option<DeploymentStatus>>,
    allocations: BTreeMap<String, Vec<Allocation>>,
    logs: BTreeMap<(String, &'static str), Vec<Bytes>>,
    exec_outputs: VecDeque<ExecOutput>,
    exec_calls: Vec<ExecCall>,
    deregistered: Vec<String>,
    gc_calls: usize,
}

/// In-memory scheduler with scripted responses and call recording.
///
/// Registered jobs become `running`, get a successful deployment, and one
/// running allocation whose tasks have all started, unless overridden.
#[derive(Debug, Default)]
pub struct FakeScheduler {
    state: Mutex<FakeSchedulerState>,
}

impl FakeScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeSchedulerState) -> T) -> T {
        f(&mut lock(&self.state))
    }

    /// Marks `job_id` as already running.
    pub fn set_running(&self, job_id: &str) {
        self.with_state(|state| {
            state
                .statuses
                .insert(job_id.to_owned(), String::from("running"));
        });
    }

    /// Makes registration of `job_id` fail.
    pub fn fail_registration(&self, job_id: &str) {
        self.with_state(|state| state.failing_registrations.insert(job_id.to_owned()));
    }

    /// Makes deregistration of `job_id` fail.
    pub fn fail_deregistration(&self, job_id: &str) {
        self.with_state(|state| state.failing_deregistrations.insert(job_id.to_owned()));
    }

    /// Overrides the latest deployment of `job_id`; `None` means the job
    /// has no deployment.
    pub fn set_deployment(&self, job_id: &str, status: Option<DeploymentStatus>) {
        self.with_state(|state| state.deployments.insert(job_id.to_owned(), status));
    }

    /// Overrides the allocations of `job_id`.
    pub fn set_allocations(&self, job_id: &str, allocations: Vec<Allocation>) {
        self.with_state(|state| state.allocations.insert(job_id.to_owned(), allocations));
    }

    /// Queues log frames for `task`'s `stream`, served by every subscription.
    pub fn push_log(&self, task: &str, stream: LogStreamKind, data: &str) {
        self.with_state(|state| {
            state
                .logs
                .entry((task.to_owned(), stream.as_str()))
                .or_default()
                .push(Bytes::from(data.to_owned()));
        });
    }

    /// Queues the output of the next exec call.
    pub fn push_exec_output(&self, output: ExecOutput) {
        self.with_state(|state| state.exec_outputs.push_back(output));
    }

    /// Every operation performed, e.g. `register <id>` or `gc`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.with_state(|state| state.calls.clone())
    }

    /// IDs of successfully registered jobs, in order.
    #[must_use]
    pub fn registered_job_ids(&self) -> Vec<String> {
        self.with_state(|state| state.registered.iter().map(|job| job.id.clone()).collect())
    }

    /// Successfully registered jobs, in order.
    #[must_use]
    pub fn registered_jobs(&self) -> Vec<Job> {
        self.with_state(|state| state.registered.clone())
    }

    /// IDs of deregistered jobs, in order.
    #[must_use]
    pub fn deregistered(&self) -> Vec<String> {
        self.with_state(|state| state.deregistered.clone())
    }

    /// Number of garbage collection requests.
    #[must_use]
    pub fn gc_calls(&self) -> usize {
        self.with_state(|state| state.gc_calls)
    }

    /// Every exec call, in order.
    #[must_use]
    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.with_state(|state| state.exec_calls.clone())
    }
}

fn simulated_failure(operation: String) -> SchedulerError {
    SchedulerError::Status {
        operation,
        status: 500,
        body: String::from("simulated failure"),
    }
}

/// Allocation of `job_id` in `client_status` whose `tasks` are all in
/// `task_state` with the given event types.
#[must_use]
pub fn allocation(
    alloc_id: &str,
    job_id: &str,
    client_status: &str,
    tasks: &[&str],
    task_state: &str,
    events: &[&str],
) -> Allocation {
    Allocation {
        id: alloc_id.to_owned(),
        job_id: job_id.to_owned(),
        task_group: job_id.to_owned(),
        client_status: client_status.to_owned(),
        task_states: tasks
            .iter()
            .map(|task| {
                (
                    (*task).to_owned(),
                    TaskState {
                        state: task_state.to_owned(),
                        failed: false,
                        events: events
                            .iter()
                            .map(|event| TaskEvent {
                                event_type: (*event).to_owned(),
                                display_message: String::new(),
                            })
                            .collect(),
                    },
                )
            })
            .collect(),
    }
}

fn default_allocation(job: &Job) -> Allocation {
    let tasks: Vec<&str> = job
        .task_groups
        .iter()
        .flat_map(|group| group.tasks.iter())
        .map(|task| task.name.as_str())
        .collect();
    allocation(
        &format!("alloc-{}", job.id),
        &job.id,
        "running",
        &tasks,
        "running",
        &["Received", "Task Setup", "Started"],
    )
}

impl Scheduler for FakeScheduler {
    fn register_job<'a>(&'a self, job: &'a Job) -> SchedulerFuture<'a, ()> {
        let result = self.with_state(|state| {
            state.calls.push(format!("register {}", job.id));
            if state.failing_registrations.contains(&job.id) {
                return Err(simulated_failure(format!("register {}", job.id)));
            }
            state
                .statuses
                .insert(job.id.clone(), String::from("running"));
            state.registered.push(job.clone());
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn job_status<'a>(&'a self, job_id: &'a str) -> SchedulerFuture<'a, Option<String>> {
        let result = self.with_state(|state| {
            state.calls.push(format!("status {job_id}"));
            state.statuses.get(job_id).cloned()
        });
        Box::pin(async move { Ok(result) })
    }

    fn list_jobs(&self) -> SchedulerFuture<'_, Vec<JobSummary>> {
        let result = self.with_state(|state| {
            state.calls.push(String::from("list"));
            state
                .statuses
                .iter()
                .map(|(id, status)| JobSummary {
                    id: id.clone(),
                    name: id.clone(),
                    status: status.clone(),
                })
                .collect()
        });
        Box::pin(async move { Ok(result) })
    }

    fn deregister_job<'a>(&'a self, job_id: &'a str, _purge: bool) -> SchedulerFuture<'a, ()> {
        let result = self.with_state(|state| {
            state.calls.push(format!("deregister {job_id}"));
            if state.failing_deregistrations.contains(job_id) {
                return Err(simulated_failure(format!("deregister {job_id}")));
            }
            state.statuses.remove(job_id);
            state.deregistered.push(job_id.to_owned());
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn latest_deployment<'a>(
        &'a self,
        job_id: &'a str,
    ) -> SchedulerFuture<'a, Option<Deployment>> {
        let result = self.with_state(|state| {
            state.calls.push(format!("deployment {job_id}"));
            let status = match state.deployments.get(job_id) {
                Some(status) => status.clone(),
                None => state
                    .statuses
                    .contains_key(job_id)
                    .then_some(DeploymentStatus::Successful),
            };
            status.map(|status| Deployment {
                id: format!("deploy-{job_id}"),
                status,
                status_description: String::new(),
            })
        });
        Box::pin(async move { Ok(result) })
    }

    fn job_allocations<'a>(&'a self, job_id: &'a str) -> SchedulerFuture<'a, Vec<Allocation>> {
        let result = self.with_state(|state| {
            state.calls.push(format!("allocations {job_id}"));
            if let Some(allocations) = state.allocations.get(job_id) {
                return allocations.clone();
            }
            state
                .registered
                .iter()
                .rev()
                .find(|job| job.id == job_id && state.statuses.contains_key(job_id))
                .map(default_allocation)
                .into_iter()
                .collect()
        });
        Box::pin(async move { Ok(result) })
    }

    fn follow_logs(&self, request: LogRequest) -> SchedulerFuture<'_, LogSubscription> {
        let frames = self.with_state(|state| {
            state.calls.push(format!(
                "logs {}/{}/{}",
                request.alloc_id,
                request.task,
                request.stream.as_str()
            ));
            state
                .logs
                .get(&(request.task.clone(), request.stream.as_str()))
                .cloned()
                .unwrap_or_default()
        });
        let (frames_tx, frames_rx) = mpsc::channel(frames.len().max(1));
        let mut offset = 0;
        for data in frames {
            offset += data.len() as u64;
            frames_tx
                .try_send(LogFrame { offset, data })
                .ok();
        }
        let (_errors_tx, errors) = mpsc::channel(1);
        Box::pin(async move {
            Ok(LogSubscription {
                frames: frames_rx,
                errors,
                cancel: CancellationToken::new(),
            })
        })
    }

    fn exec<'a>(
        &'a self,
        alloc_id: &'a str,
        task: &'a str,
        command: &'a [String],
    ) -> SchedulerFuture<'a, ExecOutput> {
        let result = self.with_state(|state| {
            state.calls.push(format!("exec {alloc_id}/{task}"));
            state.exec_calls.push(ExecCall {
                alloc_id: alloc_id.to_owned(),
                task: task.to_owned(),
                command: command.to_vec(),
            });
            state.exec_outputs.pop_front().unwrap_or_else(|| ExecOutput {
                exit_code: 0,
                stdout: String::from("ok\n"),
                stderr: String::new(),
            })
        });
        Box::pin(async move { Ok(result) })
    }

    fn garbage_collect(&self) -> SchedulerFuture<'_, ()> {
        self.with_state(|state| {
            state.calls.push(String::from("gc"));
            state.gc_calls += 1;
        });
        Box::pin(async move { Ok(()) })
    }
}
