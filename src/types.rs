//! Network data model shared by generation, orchestration, and state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Role a node plays in consensus.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Signs blocks and carries node wallet keys.
    Validator,
    /// Follows the chain without signing.
    Full,
}

impl NodeMode {
    /// Returns the lowercase name used on command lines and in node names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validator => "validator",
            Self::Full => "full",
        }
    }

    /// Returns `true` for validator nodes.
    #[must_use]
    pub const fn is_validator(self) -> bool {
        matches!(self, Self::Validator)
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifacts of the consensus engine for one node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConsensusNode {
    /// Consensus engine executable.
    pub binary: String,
    /// Home directory passed to the engine.
    pub home_dir: Utf8PathBuf,
    /// Peer identity reported by the engine.
    pub node_id: String,
    /// Validator public key, present for validators only.
    pub validator_pub_key: Option<String>,
    /// Path to the validator key file, present for validators only.
    pub validator_key_path: Option<Utf8PathBuf>,
    /// Live configuration file.
    pub config_path: Utf8PathBuf,
    /// Pristine configuration captured right after initialisation.
    pub original_config_path: Utf8PathBuf,
    /// Genesis document read by the engine.
    pub genesis_path: Utf8PathBuf,
}

/// Signing keys held by a validator's application node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeWalletInfo {
    /// Application-level public key.
    pub app_pub_key: String,
    /// Ethereum address used by the bridge, when generated.
    pub ethereum_address: Option<String>,
    /// Passphrase protecting the node wallet.
    pub passphrase_path: Utf8PathBuf,
}

/// Artifacts of the application node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AppNode {
    /// Application node executable.
    pub binary: String,
    /// Home directory passed to the node.
    pub home_dir: Utf8PathBuf,
    /// Live configuration file.
    pub config_path: Utf8PathBuf,
    /// Pristine configuration captured right after initialisation.
    pub original_config_path: Utf8PathBuf,
    /// Node wallet keys; set for validators, absent otherwise.
    pub node_wallet_info: Option<NodeWalletInfo>,
}

/// Artifacts of the optional data indexer.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DataNode {
    /// Indexer executable.
    pub binary: String,
    /// Home directory passed to the indexer.
    pub home_dir: Utf8PathBuf,
    /// Live configuration file.
    pub config_path: Utf8PathBuf,
    /// Pristine configuration captured right after initialisation.
    pub original_config_path: Utf8PathBuf,
}

/// Sidecar task used to run ad-hoc commands inside a node's allocation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RemoteCommandRunner {
    /// Task name of the sidecar inside the node's job.
    pub task_name: String,
    /// Executable kept running by the sidecar.
    pub binary: String,
    /// Arguments for the sidecar executable.
    pub args: Vec<String>,
    /// Per-node values substituted into remote commands, such as
    /// `app_home` or `consensus_binary`.
    pub vars: BTreeMap<String, String>,
}

/// Optional task forwarding a node's logs elsewhere.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LogForwarder {
    /// Forwarder executable.
    pub binary: String,
    /// Forwarder arguments.
    pub args: Vec<String>,
}

/// One logical validator or full node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeSet {
    /// Global ordinal, unique and stable once assigned.
    pub index: usize,
    /// Name of the configured group the node belongs to.
    pub group_name: String,
    /// Consensus role.
    pub mode: NodeMode,
    /// Unique name, also used as the scheduler job ID.
    pub name: String,
    /// Consensus engine artifacts.
    pub consensus: ConsensusNode,
    /// Application node artifacts.
    pub app: AppNode,
    /// Data indexer artifacts, when configured.
    pub data_node: Option<DataNode>,
    /// Remote command sidecar, when configured.
    pub remote_command_runner: Option<RemoteCommandRunner>,
    /// Log forwarder, when configured.
    pub log_forwarder: Option<LogForwarder>,
    /// Rendered raw job definition replacing the default job.
    pub job_template: Option<String>,
}

impl NodeSet {
    /// Derives the node name from its identity.
    #[must_use]
    pub fn name_for(network_name: &str, group_name: &str, index: usize, mode: NodeMode) -> String {
        format!("{network_name}-nodeset-{group_name}-{index}-{mode}")
    }

    /// Returns `true` for validator nodes.
    #[must_use]
    pub const fn is_validator(&self) -> bool {
        self.mode.is_validator()
    }

    /// Scheduler job ID for this node.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.name
    }

    /// Every home directory owned by this node.
    #[must_use]
    pub fn home_dirs(&self) -> Vec<&Utf8PathBuf> {
        let mut dirs = vec![&self.consensus.home_dir, &self.app.home_dir];
        if let Some(data_node) = &self.data_node {
            dirs.push(&data_node.home_dir);
        }
        dirs
    }
}

/// Wallet service generated alongside the nodes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WalletService {
    /// Job and service name.
    pub name: String,
    /// Wallet executable.
    pub binary: String,
    /// Home directory.
    pub home_dir: Utf8PathBuf,
    /// Service configuration file.
    pub config_path: Utf8PathBuf,
}

/// Faucet service generated alongside the nodes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FaucetService {
    /// Job and service name.
    pub name: String,
    /// Faucet executable.
    pub binary: String,
    /// Home directory.
    pub home_dir: Utf8PathBuf,
    /// Service configuration file.
    pub config_path: Utf8PathBuf,
    /// Public key of the faucet's signing wallet.
    pub public_key: String,
    /// Passphrase protecting the faucet wallet.
    pub passphrase_path: Utf8PathBuf,
}

/// Everything produced by `generate`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct GeneratedServices {
    /// Node sets keyed by their unique name.
    pub node_sets: BTreeMap<String, NodeSet>,
    /// Wallet service, when configured.
    pub wallet: Option<WalletService>,
    /// Faucet service, when configured.
    pub faucet: Option<FaucetService>,
}

impl GeneratedServices {
    /// Node sets ordered by index.
    #[must_use]
    pub fn by_index(&self) -> Vec<&NodeSet> {
        let mut nodes: Vec<&NodeSet> = self.node_sets.values().collect();
        nodes.sort_by_key(|node| node.index);
        nodes
    }

    /// Validator node sets ordered by index.
    #[must_use]
    pub fn validators(&self) -> Vec<&NodeSet> {
        self.by_index()
            .into_iter()
            .filter(|node| node.is_validator())
            .collect()
    }

    /// Node sets of one group, ordered by index.
    #[must_use]
    pub fn group(&self, group_name: &str) -> Vec<&NodeSet> {
        self.by_index()
            .into_iter()
            .filter(|node| node.group_name == group_name)
            .collect()
    }

    /// Index assigned to the next added node. Indices are never reused, so
    /// this is one past the highest index in use.
    #[must_use]
    pub fn next_index(&self) -> usize {
        self.node_sets
            .values()
            .map(|node| node.index + 1)
            .max()
            .unwrap_or(0)
    }

    /// Inserts a fully constructed node set.
    pub fn insert(&mut self, node: NodeSet) {
        self.node_sets.insert(node.name.clone(), node);
    }

    /// Checks that signing keys are present exactly on validators.
    ///
    /// Returns the names of node sets violating the rule.
    #[must_use]
    pub fn wallet_violations(&self) -> Vec<String> {
        self.node_sets
            .values()
            .filter(|node| node.is_validator() != node.app.node_wallet_info.is_some())
            .map(|node| node.name.clone())
            .collect()
    }
}

/// Job IDs of a running network, grouped by what they run.
///
/// A job ID lives in at most one group; inserting into one group removes it
/// from the others.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NetworkJobs {
    /// Jobs backing node sets.
    pub node_set_job_ids: BTreeSet<String>,
    /// Wallet job.
    pub wallet_job_id: Option<String>,
    /// Faucet job.
    pub faucet_job_id: Option<String>,
    /// Pre-start and user-supplied jobs.
    pub extra_job_ids: BTreeSet<String>,
}

impl NetworkJobs {
    /// Tracks a node set job.
    pub fn add_node_set_job(&mut self, job_id: impl Into<String>) {
        let id = job_id.into();
        self.forget(&id);
        self.node_set_job_ids.insert(id);
    }

    /// Tracks the wallet job.
    pub fn set_wallet_job(&mut self, job_id: impl Into<String>) {
        let id = job_id.into();
        self.forget(&id);
        self.wallet_job_id = Some(id);
    }

    /// Tracks the faucet job.
    pub fn set_faucet_job(&mut self, job_id: impl Into<String>) {
        let id = job_id.into();
        self.forget(&id);
        self.faucet_job_id = Some(id);
    }

    /// Tracks a pre-start or user-supplied job.
    pub fn add_extra_job(&mut self, job_id: impl Into<String>) {
        let id = job_id.into();
        self.forget(&id);
        self.extra_job_ids.insert(id);
    }

    /// Stops tracking every ID in `job_ids`. Empty or untracked IDs are
    /// ignored.
    pub fn remove_job_ids<S: AsRef<str>>(&mut self, job_ids: &[S]) {
        for id in job_ids {
            let job_id = id.as_ref();
            if !job_id.is_empty() {
                self.forget(job_id);
            }
        }
    }

    fn forget(&mut self, job_id: &str) {
        self.node_set_job_ids.remove(job_id);
        self.extra_job_ids.remove(job_id);
        if self.wallet_job_id.as_deref() == Some(job_id) {
            self.wallet_job_id = None;
        }
        if self.faucet_job_id.as_deref() == Some(job_id) {
            self.faucet_job_id = None;
        }
    }

    /// Returns `true` if `job_id` is tracked in any group.
    #[must_use]
    pub fn contains(&self, job_id: &str) -> bool {
        self.node_set_job_ids.contains(job_id)
            || self.extra_job_ids.contains(job_id)
            || self.wallet_job_id.as_deref() == Some(job_id)
            || self.faucet_job_id.as_deref() == Some(job_id)
    }

    /// Every tracked job ID.
    #[must_use]
    pub fn all_job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.node_set_job_ids.iter().cloned().collect();
        ids.extend(self.wallet_job_id.iter().cloned());
        ids.extend(self.faucet_job_id.iter().cloned());
        ids.extend(self.extra_job_ids.iter().cloned());
        ids
    }

    /// Tracks every job of `other` in the same group it has there.
    pub fn merge(&mut self, other: &Self) {
        for id in &other.node_set_job_ids {
            self.add_node_set_job(id.clone());
        }
        if let Some(id) = &other.wallet_job_id {
            self.set_wallet_job(id.clone());
        }
        if let Some(id) = &other.faucet_job_id {
            self.set_faucet_job(id.clone());
        }
        for id in &other.extra_job_ids {
            self.add_extra_job(id.clone());
        }
    }

    /// Returns `true` when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.node_set_job_ids.is_empty()
            && self.extra_job_ids.is_empty()
            && self.wallet_job_id.is_none()
            && self.faucet_job_id.is_none()
    }
}

#[cfg(test)]
mod tests;
