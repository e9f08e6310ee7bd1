//! Scheduler job definitions.
//!
//! Builders here are pure: they turn generated services and configuration
//! into [`Job`] values without talking to the scheduler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{DockerJobConfig, NetworkConfig, ResourceConfig};
use crate::types::{FaucetService, NodeSet, WalletService};

const SERVICE_JOB: &str = "service";
const DRIVER_RAW_EXEC: &str = "raw_exec";
const DRIVER_DOCKER: &str = "docker";
const DOCKER_PORT_LABEL: &str = "port";

/// Errors raised while building job definitions.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JobSpecError {
    /// Raised when a raw job definition is not valid JSON.
    #[error("raw job definition for {job_id} is invalid: {message}")]
    Parse {
        /// Job the definition belongs to.
        job_id: String,
        /// Decoder message.
        message: String,
    },
    /// Raised when a raw job definition declares no task groups.
    #[error("raw job definition for {job_id} declares no task groups")]
    NoTaskGroups {
        /// Job the definition belongs to.
        job_id: String,
    },
}

/// Scheduler job.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    /// Job ID.
    #[serde(rename = "ID")]
    pub id: String,
    /// Job name.
    pub name: String,
    /// Job type.
    #[serde(rename = "Type", default = "default_job_type")]
    pub job_type: String,
    /// Datacenters the job may be placed in.
    #[serde(default)]
    pub datacenters: Vec<String>,
    /// Task groups.
    #[serde(default)]
    pub task_groups: Vec<TaskGroup>,
    /// Fields not modelled here, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_job_type() -> String {
    String::from(SERVICE_JOB)
}

/// Group of tasks placed together.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskGroup {
    /// Group name.
    pub name: String,
    /// Number of instances.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Restart behaviour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
    /// Tasks.
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Network requirements.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<NetworkResource>,
    /// Fields not modelled here, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const fn default_count() -> u32 {
    1
}

/// Restart behaviour of a task group.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    /// Restarts allowed.
    pub attempts: u32,
    /// Behaviour once attempts are exhausted.
    pub mode: String,
}

impl RestartPolicy {
    /// No restarts; a crashed task fails its allocation.
    #[must_use]
    pub fn fail_fast() -> Self {
        Self {
            attempts: 0,
            mode: String::from("fail"),
        }
    }
}

/// Network requirements of a task group.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkResource {
    /// Statically reserved host ports.
    #[serde(default)]
    pub reserved_ports: Vec<Port>,
}

/// Labelled port.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Port {
    /// Label referenced by task configuration.
    pub label: String,
    /// Host port.
    pub value: u16,
}

/// One process launched by the scheduler.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Task {
    /// Task name.
    pub name: String,
    /// Task driver.
    pub driver: String,
    /// Driver configuration.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Resource reservations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    /// Environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Fields not modelled here, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Static resource reservation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Resources {
    /// CPU in MHz.
    #[serde(rename = "CPU")]
    pub cpu: u32,
    /// Memory in megabytes.
    #[serde(rename = "MemoryMB")]
    pub memory_mb: u32,
}

impl From<ResourceConfig> for Resources {
    fn from(value: ResourceConfig) -> Self {
        Self {
            cpu: value.cpu,
            memory_mb: value.memory_mb,
        }
    }
}

/// How a node's job is defined.
#[derive(Clone, Copy, Debug)]
pub enum JobSpec<'a> {
    /// Job derived from the node's components.
    Default(&'a NodeSet),
    /// Operator-supplied definition rendered during generation.
    Raw {
        /// Node the job runs.
        node: &'a NodeSet,
        /// JSON job definition.
        definition: &'a str,
    },
}

impl<'a> JobSpec<'a> {
    /// Resolves the spec for `node`.
    #[must_use]
    pub fn for_node(node: &'a NodeSet) -> Self {
        match node.job_template.as_deref() {
            Some(definition) => Self::Raw { node, definition },
            None => Self::Default(node),
        }
    }
}

/// Builds jobs with network-wide placement and resource defaults.
#[derive(Clone, Debug)]
pub struct JobBuilder {
    datacenters: Vec<String>,
    resources: Resources,
}

impl JobBuilder {
    /// Builder using `config`'s datacenters and resources.
    #[must_use]
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            datacenters: config.datacenters.clone(),
            resources: config.resources.into(),
        }
    }

    /// Builds the job running `node`.
    ///
    /// # Errors
    ///
    /// Returns [`JobSpecError`] when a raw definition is unusable.
    pub fn node(&self, node: &NodeSet) -> Result<Job, JobSpecError> {
        match JobSpec::for_node(node) {
            JobSpec::Default(node) => Ok(self.default_node_job(node)),
            JobSpec::Raw { node, definition } => parse_raw_job(node.job_id(), definition),
        }
    }

    fn default_node_job(&self, node: &NodeSet) -> Job {
        let index = node.index;
        let consensus_home = node.consensus.home_dir.as_str();
        let app_home = node.app.home_dir.as_str();
        let mut tasks = vec![self.exec_task(
            format!("node{index}-consensus"),
            &node.consensus.binary,
            vec![
                String::from("start"),
                String::from("--home"),
                consensus_home.to_owned(),
            ],
        )];

        let mut app_args = vec![
            String::from("node"),
            String::from("--home"),
            app_home.to_owned(),
            String::from("--tendermint-home"),
            consensus_home.to_owned(),
        ];
        if let Some(wallet) = &node.app.node_wallet_info {
            app_args.push(String::from("--nodewallet-passphrase-file"));
            app_args.push(wallet.passphrase_path.to_string());
        }
        tasks.push(self.exec_task(format!("node{index}-app"), &node.app.binary, app_args));

        if let Some(data_node) = &node.data_node {
            tasks.push(self.exec_task(
                format!("node{index}-data-node"),
                &data_node.binary,
                vec![
                    String::from("node"),
                    String::from("--home"),
                    data_node.home_dir.to_string(),
                ],
            ));
        }
        if let Some(forwarder) = &node.log_forwarder {
            tasks.push(self.exec_task(
                format!("node{index}-logger"),
                &forwarder.binary,
                forwarder.args.clone(),
            ));
        }
        if let Some(runner) = &node.remote_command_runner {
            tasks.push(self.exec_task(
                runner.task_name.clone(),
                &runner.binary,
                runner.args.clone(),
            ));
        }

        self.job(node.job_id(), tasks, Vec::new())
    }

    /// Builds the wallet service job.
    #[must_use]
    pub fn wallet(&self, wallet: &WalletService) -> Job {
        let task = self.exec_task(
            String::from("wallet"),
            &wallet.binary,
            vec![
                String::from("service"),
                String::from("run"),
                String::from("--home"),
                wallet.home_dir.to_string(),
                String::from("--automatic-consent"),
            ],
        );
        self.job(&wallet.name, vec![task], Vec::new())
    }

    /// Builds the faucet service job.
    #[must_use]
    pub fn faucet(&self, faucet: &FaucetService) -> Job {
        let task = self.exec_task(
            String::from("faucet"),
            &faucet.binary,
            vec![
                String::from("faucet"),
                String::from("run"),
                String::from("--home"),
                faucet.home_dir.to_string(),
                String::from("--passphrase-file"),
                faucet.passphrase_path.to_string(),
            ],
        );
        self.job(&faucet.name, vec![task], Vec::new())
    }

    /// Builds a pre-start docker job.
    #[must_use]
    pub fn docker(&self, docker: &DockerJobConfig) -> Job {
        let mut config = Map::new();
        config.insert(String::from("image"), Value::from(docker.image.clone()));
        if let Some(command) = &docker.command {
            config.insert(String::from("command"), Value::from(command.clone()));
        }
        if !docker.args.is_empty() {
            config.insert(String::from("args"), Value::from(docker.args.clone()));
        }
        let mut networks = Vec::new();
        if let Some(port) = docker.static_port {
            config.insert(
                String::from("ports"),
                Value::from(vec![DOCKER_PORT_LABEL]),
            );
            networks.push(NetworkResource {
                reserved_ports: vec![Port {
                    label: String::from(DOCKER_PORT_LABEL),
                    value: port,
                }],
            });
        }
        let task = Task {
            name: docker.name.clone(),
            driver: String::from(DRIVER_DOCKER),
            config,
            resources: Some(self.resources),
            env: docker.env.clone(),
            extra: Map::new(),
        };
        self.job(&docker.name, vec![task], networks)
    }

    fn exec_task(&self, name: String, command: &str, args: Vec<String>) -> Task {
        let mut config = Map::new();
        config.insert(String::from("command"), Value::from(command));
        config.insert(String::from("args"), Value::from(args));
        Task {
            name,
            driver: String::from(DRIVER_RAW_EXEC),
            config,
            resources: Some(self.resources),
            env: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    fn job(&self, id: &str, tasks: Vec<Task>, networks: Vec<NetworkResource>) -> Job {
        Job {
            id: id.to_owned(),
            name: id.to_owned(),
            job_type: default_job_type(),
            datacenters: self.datacenters.clone(),
            task_groups: vec![TaskGroup {
                name: id.to_owned(),
                count: 1,
                restart_policy: Some(RestartPolicy::fail_fast()),
                tasks,
                networks,
                extra: Map::new(),
            }],
            extra: Map::new(),
        }
    }
}

/// Parses an operator-supplied job definition.
///
/// Both a bare job object and the `{"Job": {...}}` envelope are accepted.
/// The ID and name are forced to `job_id` so bookkeeping stays keyed by the
/// node name.
///
/// # Errors
///
/// Returns [`JobSpecError`] when the definition does not parse or has no
/// task groups.
pub fn parse_raw_job(job_id: &str, definition: &str) -> Result<Job, JobSpecError> {
    let parse_error = |message: String| JobSpecError::Parse {
        job_id: job_id.to_owned(),
        message,
    };
    let mut value: Value =
        serde_json::from_str(definition).map_err(|err| parse_error(err.to_string()))?;
    if let Some(inner) = value.get_mut("Job").map(Value::take) {
        value = inner;
    }
    let mut job: Job = serde_json::from_value(value).map_err(|err| parse_error(err.to_string()))?;
    if job.task_groups.is_empty() {
        return Err(JobSpecError::NoTaskGroups {
            job_id: job_id.to_owned(),
        });
    }
    job_id.clone_into(&mut job.id);
    job_id.clone_into(&mut job.name);
    Ok(job)
}
