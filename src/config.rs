//! Configuration loading.
//!
//! Operator settings (scheduler address, network home, polling cadence) are
//! layered via `ortho-config`. The network description itself lives in a
//! TOML file passed to `network generate`, parsed once per invocation and
//! persisted inside the network state.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::{OrthoConfig, toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::files::{self, FileError};
use crate::probes::Probe;
use crate::types::NodeMode;

/// Default network home, tilde-expanded at load time.
pub const DEFAULT_HOME_PATH: &str = "~/.capsule";

/// Operator settings derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "CAPSULE",
    discovery(
        app_name = "capsule",
        env_var = "CAPSULE_CONFIG_PATH",
        config_file_name = "capsule.toml",
        dotfile_name = ".capsule.toml",
        project_file_name = "capsule.toml"
    )
)]
pub struct CapsuleSettings {
    /// Directory holding the network state and generated node homes.
    #[ortho_config(default = DEFAULT_HOME_PATH.to_owned())]
    pub home_path: String,
    /// Base URL of the Nomad HTTP API.
    #[ortho_config(default = "http://127.0.0.1:4646".to_owned())]
    pub nomad_address: String,
    /// ACL token sent with every scheduler request.
    pub nomad_token: Option<String>,
    /// Nomad CLI used for `alloc exec`.
    #[ortho_config(default = "nomad".to_owned())]
    pub nomad_bin: String,
    /// Seconds between deployment status polls.
    #[ortho_config(default = 5)]
    pub deployment_poll_secs: u64,
    /// Seconds between liveness checks while a deployment is pending.
    #[ortho_config(default = 30)]
    pub liveness_check_secs: u64,
}

impl CapsuleSettings {
    /// Loads settings without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("capsule")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name both the
    /// environment variable and the configuration key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required value is blank
    /// and [`ConfigError::Invalid`] when an interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(&self.home_path, "network home", "home_path")?;
        Self::require_field(&self.nomad_address, "Nomad address", "nomad_address")?;
        Self::require_field(&self.nomad_bin, "Nomad CLI binary", "nomad_bin")?;
        if self.deployment_poll_secs == 0 || self.liveness_check_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "deployment_poll_secs and liveness_check_secs must be greater than zero",
            )));
        }
        Ok(())
    }

    fn require_field(value: &str, description: &str, key: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {description}: set CAPSULE_{} or add {key} to capsule.toml",
                key.to_uppercase()
            )));
        }
        Ok(())
    }

    /// Network home with a leading `~/` expanded.
    #[must_use]
    pub fn home_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.home_path))
    }

    /// Deployment poll interval.
    #[must_use]
    pub const fn deployment_poll_interval(&self) -> Duration {
        Duration::from_secs(self.deployment_poll_secs)
    }

    /// Liveness check interval.
    #[must_use]
    pub const fn liveness_check_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_check_secs)
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is not set the input is returned unchanged.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Executables invoked for each node component.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Binaries {
    /// Consensus engine.
    pub consensus: String,
    /// Application node.
    pub app: String,
    /// Data indexer.
    pub data_node: String,
    /// Wallet service.
    pub wallet: String,
    /// Faucet service.
    pub faucet: String,
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            consensus: String::from("tendermint"),
            app: String::from("vega"),
            data_node: String::from("data-node"),
            wallet: String::from("vegawallet"),
            faucet: String::from("vega"),
        }
    }
}

/// Static per-task reservations.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// CPU shares in MHz.
    pub cpu: u32,
    /// Memory in megabytes.
    pub memory_mb: u32,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu: 100,
            memory_mb: 512,
        }
    }
}

/// Optional data indexer attached to every node of a group.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DataNodeConfig {
    /// Binary override; defaults to [`Binaries::data_node`].
    #[serde(default)]
    pub binary: Option<String>,
    /// Configuration override template.
    #[serde(default)]
    pub template: Option<String>,
}

/// Sidecar kept alive inside each node's job for remote commands.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RemoteCommandRunnerConfig {
    /// Task name inside the node's job.
    #[serde(default = "default_runner_task")]
    pub task_name: String,
    /// Executable kept running by the sidecar.
    #[serde(default = "default_runner_binary")]
    pub binary: String,
    /// Sidecar arguments.
    #[serde(default = "default_runner_args")]
    pub args: Vec<String>,
}

fn default_runner_task() -> String {
    String::from("remote-command-runner")
}

fn default_runner_binary() -> String {
    String::from("sleep")
}

fn default_runner_args() -> Vec<String> {
    vec![String::from("infinity")]
}

/// Log forwarding task attached to every node of a group.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LogForwarderConfig {
    /// Forwarder executable.
    pub binary: String,
    /// Forwarder arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

/// One configured group of identical nodes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeSetConfig {
    /// Group name.
    pub name: String,
    /// Consensus role shared by the group.
    pub mode: NodeMode,
    /// Number of nodes in the group.
    pub count: usize,
    /// Consensus configuration override template.
    #[serde(default)]
    pub consensus_template: Option<String>,
    /// File holding the consensus template, resolved at load time.
    #[serde(default, skip_serializing)]
    pub consensus_template_file: Option<Utf8PathBuf>,
    /// Application configuration override template.
    #[serde(default)]
    pub app_template: Option<String>,
    /// File holding the application template, resolved at load time.
    #[serde(default, skip_serializing)]
    pub app_template_file: Option<Utf8PathBuf>,
    /// Application binary override; defaults to [`Binaries::app`].
    #[serde(default)]
    pub app_binary: Option<String>,
    /// Data indexer settings.
    #[serde(default)]
    pub data_node: Option<DataNodeConfig>,
    /// Remote command sidecar.
    #[serde(default)]
    pub remote_command_runner: Option<RemoteCommandRunnerConfig>,
    /// Log forwarder task.
    #[serde(default)]
    pub log_forwarder: Option<LogForwarderConfig>,
    /// Raw job definition template replacing the default node job.
    #[serde(default)]
    pub job_template: Option<String>,
    /// File holding the job template, resolved at load time.
    #[serde(default, skip_serializing)]
    pub job_template_file: Option<Utf8PathBuf>,
}

/// Arbitrary docker container started before any node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DockerJobConfig {
    /// Job name.
    pub name: String,
    /// Docker image reference.
    pub image: String,
    /// Entry point override.
    #[serde(default)]
    pub command: Option<String>,
    /// Container arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Host port exposed statically.
    #[serde(default)]
    pub static_port: Option<u16>,
    /// Readiness probes that must pass before nodes start.
    #[serde(default)]
    pub probes: Vec<Probe>,
}

/// Wallet service settings.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct WalletConfig {
    /// Binary override; defaults to [`Binaries::wallet`].
    #[serde(default)]
    pub binary: Option<String>,
    /// Configuration override template.
    #[serde(default)]
    pub template: Option<String>,
}

/// Faucet service settings.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FaucetConfig {
    /// Binary override; defaults to [`Binaries::faucet`].
    #[serde(default)]
    pub binary: Option<String>,
    /// Configuration override template.
    #[serde(default)]
    pub template: Option<String>,
}

/// Full description of a network.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NetworkConfig {
    /// Network name, used as a prefix for every node and job name.
    pub network_name: String,
    /// Executables for each component.
    #[serde(default)]
    pub binaries: Binaries,
    /// Scheduler datacenters jobs are placed in.
    #[serde(default = "default_datacenters")]
    pub datacenters: Vec<String>,
    /// Per-task resource reservations.
    #[serde(default)]
    pub resources: ResourceConfig,
    /// Genesis override template.
    #[serde(default)]
    pub genesis_template: Option<String>,
    /// File holding the genesis template, resolved at load time.
    #[serde(default, skip_serializing)]
    pub genesis_template_file: Option<Utf8PathBuf>,
    /// Named external contract addresses exposed to the genesis template.
    #[serde(default)]
    pub smart_contracts_addresses: BTreeMap<String, String>,
    /// Docker jobs started before anything else.
    #[serde(default)]
    pub pre_start: Vec<DockerJobConfig>,
    /// Wallet service.
    #[serde(default)]
    pub wallet: Option<WalletConfig>,
    /// Faucet service.
    #[serde(default)]
    pub faucet: Option<FaucetConfig>,
    /// Node groups.
    #[serde(default)]
    pub node_sets: Vec<NodeSetConfig>,
}

fn default_datacenters() -> Vec<String> {
    vec![String::from("dc1")]
}

impl NetworkConfig {
    /// Reads and validates a network file. Template files referenced by
    /// `*_file` keys are resolved relative to the file's directory and
    /// inlined, so the persisted configuration is self-contained.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or
    /// fails validation.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = files::read_to_string(path)?;
        let base_dir = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        Self::from_toml_str(&contents, &base_dir)
    }

    /// Parses a network description from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing, template resolution, or
    /// validation fails.
    pub fn from_toml_str(contents: &str, base_dir: &Utf8Path) -> Result<Self, ConfigError> {
        let mut config: Self =
            toml::from_str(contents).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        config.resolve_template_files(base_dir)?;
        Ok(config)
    }

    fn resolve_template_files(&mut self, base_dir: &Utf8Path) -> Result<(), ConfigError> {
        resolve_template(
            &mut self.genesis_template,
            self.genesis_template_file.take(),
            base_dir,
        )?;
        for group in &mut self.node_sets {
            resolve_template(
                &mut group.consensus_template,
                group.consensus_template_file.take(),
                base_dir,
            )?;
            resolve_template(
                &mut group.app_template,
                group.app_template_file.take(),
                base_dir,
            )?;
            resolve_template(
                &mut group.job_template,
                group.job_template_file.take(),
                base_dir,
            )?;
        }
        Ok(())
    }

    /// Performs semantic validation of the network description.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network_name.trim().is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "network_name must not be empty",
            )));
        }
        if self.node_sets.is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "at least one node_sets group is required",
            )));
        }
        both_set(
            self.genesis_template.as_ref(),
            self.genesis_template_file.as_ref(),
            "genesis_template",
        )?;

        let mut seen = BTreeSet::new();
        for group in &self.node_sets {
            if group.name.trim().is_empty() {
                return Err(ConfigError::Invalid(String::from(
                    "node_sets group name must not be empty",
                )));
            }
            if !seen.insert(group.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "node_sets group '{}' is declared more than once",
                    group.name
                )));
            }
            if group.count == 0 {
                return Err(ConfigError::Invalid(format!(
                    "node_sets group '{}' must have a count greater than zero",
                    group.name
                )));
            }
            both_set(
                group.consensus_template.as_ref(),
                group.consensus_template_file.as_ref(),
                "consensus_template",
            )?;
            both_set(
                group.app_template.as_ref(),
                group.app_template_file.as_ref(),
                "app_template",
            )?;
            both_set(
                group.job_template.as_ref(),
                group.job_template_file.as_ref(),
                "job_template",
            )?;
        }

        let mut job_names = BTreeSet::new();
        for job in &self.pre_start {
            if job.name.trim().is_empty() || job.image.trim().is_empty() {
                return Err(ConfigError::Invalid(String::from(
                    "pre_start jobs require a name and an image",
                )));
            }
            if !job_names.insert(job.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "pre_start job '{}' is declared more than once",
                    job.name
                )));
            }
        }
        Ok(())
    }

    /// Looks up a node group by name.
    #[must_use]
    pub fn node_set_group(&self, name: &str) -> Option<&NodeSetConfig> {
        self.node_sets.iter().find(|group| group.name == name)
    }

    /// Name of the wallet job.
    #[must_use]
    pub fn wallet_name(&self) -> String {
        format!("{}-wallet", self.network_name)
    }

    /// Name of the faucet job.
    #[must_use]
    pub fn faucet_name(&self) -> String {
        format!("{}-faucet", self.network_name)
    }
}

fn both_set<A, B>(inline: Option<&A>, file: Option<&B>, key: &str) -> Result<(), ConfigError> {
    if inline.is_some() && file.is_some() {
        return Err(ConfigError::Invalid(format!(
            "{key} and {key}_file are mutually exclusive"
        )));
    }
    Ok(())
}

fn resolve_template(
    inline: &mut Option<String>,
    file: Option<Utf8PathBuf>,
    base_dir: &Utf8Path,
) -> Result<(), ConfigError> {
    if let Some(path) = file {
        let resolved = if path.is_absolute() {
            path
        } else {
            base_dir.join(path)
        };
        *inline = Some(files::read_to_string(&resolved)?);
    }
    Ok(())
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the loaders.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when values are present but inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Raised when a configuration or template file cannot be read.
    #[error(transparent)]
    File(#[from] FileError),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests;
