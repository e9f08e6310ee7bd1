//! Template rendering for configuration overrides.
//!
//! Node templates are compiled once per group and rendered once per node
//! with a [`NodeTemplateContext`]. Undefined variables are errors rather
//! than silently empty strings.

use std::collections::BTreeMap;

use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde::Serialize;
use thiserror::Error;

use crate::types::{NodeMode, NodeSet};

/// Template names inside a group environment.
pub const CONSENSUS_TEMPLATE: &str = "consensus";
/// Application node template name.
pub const APP_TEMPLATE: &str = "app";
/// Data node template name.
pub const DATA_NODE_TEMPLATE: &str = "data_node";
/// Raw job template name.
pub const JOB_TEMPLATE: &str = "job";
const GENESIS_TEMPLATE: &str = "genesis";

/// Errors raised while compiling or rendering templates.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TemplateError {
    /// Raised when a template fails to compile.
    #[error("failed to compile {template} template: {message}")]
    Compile {
        /// Template name.
        template: String,
        /// Engine message.
        message: String,
    },
    /// Raised when rendering fails, for example on an undefined variable.
    #[error("failed to render {template} template: {message}")]
    Render {
        /// Template name.
        template: String,
        /// Engine message.
        message: String,
    },
}

/// Identity of one node as seen by every other node's templates.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Peer {
    /// Global index.
    pub index: usize,
    /// Node name.
    pub name: String,
    /// Group the node belongs to.
    pub group_name: String,
    /// Consensus role.
    pub mode: NodeMode,
    /// Consensus peer ID.
    pub node_id: String,
    /// Validator public key, if any.
    pub validator_pub_key: Option<String>,
}

impl From<&NodeSet> for Peer {
    fn from(node: &NodeSet) -> Self {
        Self {
            index: node.index,
            name: node.name.clone(),
            group_name: node.group_name.clone(),
            mode: node.mode,
            node_id: node.consensus.node_id.clone(),
            validator_pub_key: node.consensus.validator_pub_key.clone(),
        }
    }
}

/// Values available to node-level templates.
#[derive(Clone, Debug, Serialize)]
pub struct NodeTemplateContext {
    /// Network name.
    pub network_name: String,
    /// This node's global index.
    pub index: usize,
    /// This node's name.
    pub name: String,
    /// This node's group.
    pub group_name: String,
    /// This node's role.
    pub mode: NodeMode,
    /// This node's consensus peer ID.
    pub node_id: String,
    /// Consensus home directory.
    pub consensus_home: String,
    /// Application home directory.
    pub app_home: String,
    /// Data node home directory, when configured.
    pub data_node_home: Option<String>,
    /// Peer IDs of every node, including this one, ordered by index.
    pub node_ids: Vec<String>,
    /// Every other node, ordered by index.
    pub node_peers: Vec<Peer>,
    /// Every other node of the same group, ordered by index.
    pub group_peers: Vec<Peer>,
    /// Number of nodes in this node's group.
    pub group_size: usize,
}

impl NodeTemplateContext {
    /// Builds the context for `node` given the full peer table.
    #[must_use]
    pub fn new(network_name: &str, node: &NodeSet, peers: &[Peer]) -> Self {
        let node_peers: Vec<Peer> = peers
            .iter()
            .filter(|peer| peer.index != node.index)
            .cloned()
            .collect();
        let group_peers: Vec<Peer> = node_peers
            .iter()
            .filter(|peer| peer.group_name == node.group_name)
            .cloned()
            .collect();
        Self {
            network_name: network_name.to_owned(),
            index: node.index,
            name: node.name.clone(),
            group_name: node.group_name.clone(),
            mode: node.mode,
            node_id: node.consensus.node_id.clone(),
            consensus_home: node.consensus.home_dir.to_string(),
            app_home: node.app.home_dir.to_string(),
            data_node_home: node
                .data_node
                .as_ref()
                .map(|data_node| data_node.home_dir.to_string()),
            node_ids: peers.iter().map(|peer| peer.node_id.clone()).collect(),
            group_size: group_peers.len() + 1,
            node_peers,
            group_peers,
        }
    }
}

fn strict_environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env
}

/// Templates of one node group, compiled once and rendered per node.
pub struct GroupTemplates<'source> {
    env: Environment<'source>,
}

impl<'source> GroupTemplates<'source> {
    /// Compiles every present template under its well-known name.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Compile`] naming the first broken template.
    pub fn compile(
        templates: &[(&'static str, Option<&'source str>)],
    ) -> Result<Self, TemplateError> {
        let mut env = strict_environment();
        for &(name, source) in templates {
            if let Some(source) = source {
                env.add_template(name, source)
                    .map_err(|err| TemplateError::Compile {
                        template: name.to_owned(),
                        message: err.to_string(),
                    })?;
            }
        }
        Ok(Self { env })
    }

    /// Renders `name` with `context`, or returns `None` when the group does
    /// not define that template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Render`] when rendering fails.
    pub fn render<S: Serialize>(
        &self,
        name: &str,
        context: &S,
    ) -> Result<Option<String>, TemplateError> {
        let Ok(template) = self.env.get_template(name) else {
            return Ok(None);
        };
        template
            .render(context)
            .map(Some)
            .map_err(|err| TemplateError::Render {
                template: name.to_owned(),
                message: err.to_string(),
            })
    }
}

/// Values available to the genesis template.
#[derive(Clone, Debug, Serialize)]
pub struct GenesisTemplateContext {
    /// Network name.
    pub network_name: String,
    /// Validators in index order.
    pub validators: Vec<Peer>,
}

/// Renders the genesis override template.
///
/// The template may call `contract_address("name")`, which resolves names
/// against `addresses` and fails rendering on unknown names.
///
/// # Errors
///
/// Returns [`TemplateError`] when compiling or rendering fails.
pub fn render_genesis(
    source: &str,
    context: &GenesisTemplateContext,
    addresses: &BTreeMap<String, String>,
) -> Result<String, TemplateError> {
    let mut env = strict_environment();
    let known = addresses.clone();
    env.add_function(
        "contract_address",
        move |name: String| -> Result<String, minijinja::Error> {
            known.get(&name).cloned().ok_or_else(|| {
                minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    format!("unknown smart contract '{name}'"),
                )
            })
        },
    );
    env.add_template(GENESIS_TEMPLATE, source)
        .map_err(|err| TemplateError::Compile {
            template: GENESIS_TEMPLATE.to_owned(),
            message: err.to_string(),
        })?;
    env.get_template(GENESIS_TEMPLATE)
        .and_then(|template| template.render(context))
        .map_err(|err| TemplateError::Render {
            template: GENESIS_TEMPLATE.to_owned(),
            message: err.to_string(),
        })
}

/// Substitutes per-node variables into a single command fragment.
///
/// # Errors
///
/// Returns [`TemplateError`] when the fragment references an unknown
/// variable or is malformed.
pub fn render_command_fragment(
    fragment: &str,
    vars: &BTreeMap<String, String>,
) -> Result<String, TemplateError> {
    strict_environment()
        .render_str(fragment, vars)
        .map_err(|err| TemplateError::Render {
            template: String::from("remote command"),
            message: err.to_string(),
        })
}
