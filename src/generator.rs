//! Two-pass node set generation.
//!
//! The init pass initialises every node home in index order and collects
//! peer identities. The override pass then renders each group's templates
//! against the complete peer table and merges the result over the pristine
//! configuration captured during init.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{NetworkConfig, NodeSetConfig};
use crate::files::{self, FileError};
use crate::genesis::{GenesisAssembler, GenesisError};
use crate::overlay::{OverlayError, overlay_toml};
use crate::provisioner::{
    AppInit, ConsensusInit, HomeInit, NodeWalletRequest, ProvisionError, Provisioner,
};
use crate::template::{
    APP_TEMPLATE, CONSENSUS_TEMPLATE, DATA_NODE_TEMPLATE, GroupTemplates, JOB_TEMPLATE,
    NodeTemplateContext, Peer, TemplateError,
};
use crate::types::{
    AppNode, ConsensusNode, DataNode, FaucetService, GeneratedServices, LogForwarder, NodeSet,
    RemoteCommandRunner, WalletService,
};

/// Errors raised while generating node sets.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// Raised when the output directory already holds a generated network.
    #[error("network already generated at {path}; pass --force to regenerate")]
    AlreadyGenerated {
        /// Existing output directory.
        path: Utf8PathBuf,
    },
    /// Raised when a node group is not declared in the configuration.
    #[error("unknown node set group '{group}'")]
    UnknownGroup {
        /// Requested group.
        group: String,
    },
    /// Raised when a node binary fails.
    #[error("failed to provision {target}: {source}")]
    Provision {
        /// Node or service being provisioned.
        target: String,
        /// Underlying failure.
        #[source]
        source: ProvisionError,
    },
    /// Raised when a template fails.
    #[error("template error for {target}: {source}")]
    Template {
        /// Group or node being rendered.
        target: String,
        /// Underlying failure.
        #[source]
        source: TemplateError,
    },
    /// Raised when a rendered override cannot be merged.
    #[error("failed to merge configuration for {target}: {source}")]
    Overlay {
        /// Node being configured.
        target: String,
        /// Underlying failure.
        #[source]
        source: OverlayError,
    },
    /// Raised when genesis assembly fails.
    #[error(transparent)]
    Genesis(#[from] GenesisError),
    /// Raised when signing keys are attached to the wrong nodes.
    #[error(
        "node wallet keys must exist exactly on validators; offending nodes: {}",
        nodes.join(", ")
    )]
    WalletAssignment {
        /// Offending node names.
        nodes: Vec<String>,
    },
    /// Raised when the network has no node to copy genesis from.
    #[error("no existing node to copy genesis from")]
    NoGenesisSource,
    /// Raised when generated files cannot be accessed.
    #[error(transparent)]
    File(#[from] FileError),
}

/// Generates node sets and services for one network.
pub struct Generator<'a, P: Provisioner> {
    config: &'a NetworkConfig,
    provisioner: &'a P,
    output_dir: Utf8PathBuf,
}

impl<'a, P: Provisioner> Generator<'a, P> {
    /// Creates a generator writing node homes below `output_dir`.
    #[must_use]
    pub fn new(config: &'a NetworkConfig, provisioner: &'a P, output_dir: &Utf8Path) -> Self {
        Self {
            config,
            provisioner,
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Generates every node set, the optional services, and genesis.
    ///
    /// Fails when the output directory exists unless `force` is set, in
    /// which case it is removed first. On failure the partially generated
    /// output directory is removed again.
    ///
    /// # Errors
    ///
    /// Returns [`GenerateError`] describing the first failure.
    pub fn generate(&self, force: bool) -> Result<GeneratedServices, GenerateError> {
        if files::exists(&self.output_dir)? {
            if !force {
                return Err(GenerateError::AlreadyGenerated {
                    path: self.output_dir.clone(),
                });
            }
            info!(path = %self.output_dir, "removing previously generated network");
            files::remove_dir_all(&self.output_dir)?;
        }
        files::create_dir_all(&self.output_dir)?;

        match self.generate_all() {
            Ok(services) => Ok(services),
            Err(err) => {
                if let Err(cleanup) = files::remove_dir_all(&self.output_dir) {
                    warn!(error = %cleanup, "failed to clean up after generation error");
                }
                Err(err)
            }
        }
    }

    fn generate_all(&self) -> Result<GeneratedServices, GenerateError> {
        let mut nodes = Vec::new();
        let mut index = 0;
        for group in &self.config.node_sets {
            for _ in 0..group.count {
                nodes.push(self.init_node(group, index)?);
                index += 1;
            }
        }
        info!(nodes = nodes.len(), "node homes initialised");

        let peers: Vec<Peer> = nodes.iter().map(Peer::from).collect();
        for group in &self.config.node_sets {
            let templates = compile_group(group)?;
            for node in nodes.iter_mut().filter(|node| node.group_name == group.name) {
                self.apply_overrides(&templates, node, &peers)?;
            }
        }

        let mut services = GeneratedServices::default();
        for node in nodes {
            services.insert(node);
        }
        services.wallet = self.init_wallet()?;
        services.faucet = self.init_faucet()?;

        let violations = services.wallet_violations();
        if !violations.is_empty() {
            return Err(GenerateError::WalletAssignment { nodes: violations });
        }
        GenesisAssembler::new(self.provisioner, self.config).assemble(&services)?;
        Ok(services)
    }

    /// Generates one more node of `group_name`, reusing the peers and
    /// genesis already in `services`. Existing nodes are not re-rendered.
    ///
    /// The caller inserts the returned node into `services`.
    ///
    /// # Errors
    ///
    /// Returns [`GenerateError`] when the group is unknown or any step
    /// fails; the new node's home directories are removed in that case.
    pub fn add_node_set(
        &self,
        services: &GeneratedServices,
        group_name: &str,
    ) -> Result<NodeSet, GenerateError> {
        let group = self
            .config
            .node_set_group(group_name)
            .ok_or_else(|| GenerateError::UnknownGroup {
                group: group_name.to_owned(),
            })?;
        let genesis_source = services
            .by_index()
            .first()
            .map(|node| node.consensus.genesis_path.clone())
            .ok_or(GenerateError::NoGenesisSource)?;
        let index = services.next_index();

        let result = self.init_node(group, index).and_then(|mut node| {
            let mut peers: Vec<Peer> = services.by_index().into_iter().map(Peer::from).collect();
            peers.push(Peer::from(&node));
            let templates = compile_group(group)?;
            self.apply_overrides(&templates, &mut node, &peers)?;
            files::copy(&genesis_source, &node.consensus.genesis_path)?;
            Ok(node)
        });
        match result {
            Ok(node) => {
                info!(node = %node.name, index, "node set added");
                Ok(node)
            }
            Err(err) => {
                for dir in self.node_dirs(index) {
                    if let Err(cleanup) = files::remove_dir_all(&dir) {
                        warn!(error = %cleanup, "failed to clean up node home");
                    }
                }
                Err(err)
            }
        }
    }

    fn node_dirs(&self, index: usize) -> [Utf8PathBuf; 3] {
        let node = format!("node{index}");
        [
            self.output_dir.join("consensus").join(&node),
            self.output_dir.join("app").join(&node),
            self.output_dir.join("data-node").join(&node),
        ]
    }

    fn init_node(&self, group: &NodeSetConfig, index: usize) -> Result<NodeSet, GenerateError> {
        let network = &self.config.network_name;
        let binaries = &self.config.binaries;
        let name = NodeSet::name_for(network, &group.name, index, group.mode);
        let provision = |source: ProvisionError| GenerateError::Provision {
            target: name.clone(),
            source,
        };
        let [consensus_home, app_home, data_node_home] = self.node_dirs(index);

        let consensus = self
            .provisioner
            .init_consensus(&ConsensusInit {
                binary: binaries.consensus.clone(),
                home: consensus_home.clone(),
                mode: group.mode,
            })
            .map_err(provision)?;
        let consensus_original = snapshot(&consensus.config_path)?;

        let app_binary = group.app_binary.clone().unwrap_or_else(|| binaries.app.clone());
        let app = self
            .provisioner
            .init_app(&AppInit {
                binary: app_binary.clone(),
                home: app_home.clone(),
                consensus_home: consensus_home.clone(),
                mode: group.mode,
            })
            .map_err(provision)?;
        let app_original = snapshot(&app.config_path)?;

        let data_node = match &group.data_node {
            Some(settings) => {
                let binary = settings
                    .binary
                    .clone()
                    .unwrap_or_else(|| binaries.data_node.clone());
                let artifact = self
                    .provisioner
                    .init_data_node(&HomeInit {
                        binary: binary.clone(),
                        home: data_node_home.clone(),
                    })
                    .map_err(provision)?;
                Some(DataNode {
                    binary,
                    home_dir: data_node_home,
                    original_config_path: snapshot(&artifact.config_path)?,
                    config_path: artifact.config_path,
                })
            }
            None => None,
        };

        let node_wallet_info = if group.mode.is_validator() {
            Some(
                self.provisioner
                    .generate_node_wallet(&NodeWalletRequest {
                        binary: app_binary.clone(),
                        app_home: app_home.clone(),
                        consensus_home: consensus_home.clone(),
                    })
                    .map_err(provision)?,
            )
        } else {
            None
        };

        let remote_command_runner = group.remote_command_runner.as_ref().map(|runner| {
            let mut vars = BTreeMap::from([
                (String::from("consensus_home"), consensus_home.to_string()),
                (String::from("app_home"), app_home.to_string()),
                (String::from("consensus_binary"), binaries.consensus.clone()),
                (String::from("app_binary"), app_binary.clone()),
            ]);
            if let Some(data_node) = &data_node {
                vars.insert(String::from("data_node_home"), data_node.home_dir.to_string());
                vars.insert(String::from("data_node_binary"), data_node.binary.clone());
            }
            RemoteCommandRunner {
                task_name: runner.task_name.clone(),
                binary: runner.binary.clone(),
                args: runner.args.clone(),
                vars,
            }
        });

        Ok(NodeSet {
            index,
            group_name: group.name.clone(),
            mode: group.mode,
            consensus: ConsensusNode {
                binary: binaries.consensus.clone(),
                home_dir: consensus_home,
                node_id: consensus.node_id,
                validator_pub_key: consensus.validator_pub_key,
                validator_key_path: consensus.validator_key_path,
                config_path: consensus.config_path,
                original_config_path: consensus_original,
                genesis_path: consensus.genesis_path,
            },
            app: AppNode {
                binary: app_binary,
                home_dir: app_home,
                config_path: app.config_path,
                original_config_path: app_original,
                node_wallet_info,
            },
            data_node,
            remote_command_runner,
            log_forwarder: group.log_forwarder.as_ref().map(|forwarder| LogForwarder {
                binary: forwarder.binary.clone(),
                args: forwarder.args.clone(),
            }),
            job_template: None,
            name,
        })
    }

    fn apply_overrides(
        &self,
        templates: &GroupTemplates<'_>,
        node: &mut NodeSet,
        peers: &[Peer],
    ) -> Result<(), GenerateError> {
        let context = NodeTemplateContext::new(&self.config.network_name, node, peers);
        let render = |name: &str| {
            templates
                .render(name, &context)
                .map_err(|source| GenerateError::Template {
                    target: node.name.clone(),
                    source,
                })
        };

        let consensus = render(CONSENSUS_TEMPLATE)?;
        let app = render(APP_TEMPLATE)?;
        let data_node = render(DATA_NODE_TEMPLATE)?;
        let job = render(JOB_TEMPLATE)?;

        if let Some(rendered) = consensus {
            merge_config(
                &node.name,
                &node.consensus.original_config_path,
                &node.consensus.config_path,
                &rendered,
            )?;
        }
        if let Some(rendered) = app {
            merge_config(
                &node.name,
                &node.app.original_config_path,
                &node.app.config_path,
                &rendered,
            )?;
        }
        if let (Some(rendered), Some(data_node)) = (data_node, &node.data_node) {
            merge_config(
                &node.name,
                &data_node.original_config_path,
                &data_node.config_path,
                &rendered,
            )?;
        }
        node.job_template = job;
        Ok(())
    }

    fn init_wallet(&self) -> Result<Option<WalletService>, GenerateError> {
        let Some(wallet) = &self.config.wallet else {
            return Ok(None);
        };
        let name = self.config.wallet_name();
        let binary = wallet
            .binary
            .clone()
            .unwrap_or_else(|| self.config.binaries.wallet.clone());
        let home_dir = self.output_dir.join("wallet");
        let artifact = self
            .provisioner
            .init_wallet(&HomeInit {
                binary: binary.clone(),
                home: home_dir.clone(),
            })
            .map_err(|source| GenerateError::Provision {
                target: name.clone(),
                source,
            })?;
        if let Some(template) = &wallet.template {
            let original = snapshot(&artifact.config_path)?;
            merge_config(&name, &original, &artifact.config_path, template)?;
        }
        Ok(Some(WalletService {
            name,
            binary,
            home_dir,
            config_path: artifact.config_path,
        }))
    }

    fn init_faucet(&self) -> Result<Option<FaucetService>, GenerateError> {
        let Some(faucet) = &self.config.faucet else {
            return Ok(None);
        };
        let name = self.config.faucet_name();
        let binary = faucet
            .binary
            .clone()
            .unwrap_or_else(|| self.config.binaries.faucet.clone());
        let home_dir = self.output_dir.join("faucet");
        let artifacts = self
            .provisioner
            .init_faucet(&HomeInit {
                binary: binary.clone(),
                home: home_dir.clone(),
            })
            .map_err(|source| GenerateError::Provision {
                target: name.clone(),
                source,
            })?;
        if let Some(template) = &faucet.template {
            let original = snapshot(&artifacts.config_path)?;
            merge_config(&name, &original, &artifacts.config_path, template)?;
        }
        Ok(Some(FaucetService {
            name,
            binary,
            home_dir,
            config_path: artifacts.config_path,
            public_key: artifacts.public_key,
            passphrase_path: artifacts.passphrase_path,
        }))
    }
}

fn compile_group(group: &NodeSetConfig) -> Result<GroupTemplates<'_>, GenerateError> {
    GroupTemplates::compile(&[
        (CONSENSUS_TEMPLATE, group.consensus_template.as_deref()),
        (APP_TEMPLATE, group.app_template.as_deref()),
        (
            DATA_NODE_TEMPLATE,
            group
                .data_node
                .as_ref()
                .and_then(|data_node| data_node.template.as_deref()),
        ),
        (JOB_TEMPLATE, group.job_template.as_deref()),
    ])
    .map_err(|source| GenerateError::Template {
        target: format!("group {}", group.name),
        source,
    })
}

/// Path of the pristine copy kept next to `config_path`.
#[must_use]
pub fn original_config_path(config_path: &Utf8Path) -> Utf8PathBuf {
    let file_name = config_path.file_name().unwrap_or("config.toml");
    config_path.with_file_name(format!("original-{file_name}"))
}

/// Copies `config_path` to its pristine location unless a copy exists.
fn snapshot(config_path: &Utf8Path) -> Result<Utf8PathBuf, FileError> {
    let original = original_config_path(config_path);
    if !files::exists(&original)? {
        files::copy(config_path, &original)?;
    }
    Ok(original)
}

fn merge_config(
    target: &str,
    original_path: &Utf8Path,
    config_path: &Utf8Path,
    rendered: &str,
) -> Result<(), GenerateError> {
    let base = files::read_to_string(original_path)?;
    let merged = overlay_toml(&base, rendered).map_err(|source| GenerateError::Overlay {
        target: target.to_owned(),
        source,
    })?;
    files::write(config_path, merged)?;
    Ok(())
}
