//! Genesis assembly across independently initialised validators.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::files::{self, FileError};
use crate::overlay::{OverlayError, overlay_json};
use crate::provisioner::{GenesisRequest, ProvisionError, Provisioner};
use crate::template::{GenesisTemplateContext, Peer, TemplateError, render_genesis};
use crate::types::{GeneratedServices, NodeSet};

/// Voting power assigned to every validator.
pub const VALIDATOR_POWER: &str = "10";

/// Errors raised while assembling genesis.
#[derive(Debug, Error)]
pub enum GenesisError {
    /// Raised when a validator's dry-run genesis update fails.
    #[error("genesis update for {node} failed: {source}")]
    Provision {
        /// Validator node name.
        node: String,
        /// Underlying failure.
        #[source]
        source: ProvisionError,
    },
    /// Raised when a genesis document cannot be decoded.
    #[error("invalid genesis document from {origin}: {message}")]
    Decode {
        /// Where the document came from.
        origin: String,
        /// Decoder message.
        message: String,
    },
    /// Raised when a validator carries no key file.
    #[error("validator {node} has no validator key")]
    MissingValidatorKey {
        /// Validator node name.
        node: String,
    },
    /// Raised when the genesis template fails to render.
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// Raised when the override cannot be merged.
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    /// Raised when key files or genesis files cannot be accessed.
    #[error(transparent)]
    File(#[from] FileError),
}

/// Consensus public key.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PubKey {
    /// Key type tag.
    #[serde(rename = "type")]
    pub key_type: String,
    /// Encoded key.
    pub value: String,
}

/// Entry of the consensus validator set.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GenesisValidator {
    /// Validator address.
    pub address: String,
    /// Consensus public key.
    pub pub_key: PubKey,
    /// Voting power, encoded as a string.
    #[serde(default)]
    pub power: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
}

/// Application state section of genesis.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AppState {
    /// Application-level validator entries keyed by consensus public key.
    #[serde(default)]
    pub validators: BTreeMap<String, Value>,
    /// Remaining application state.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Consensus genesis document.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct GenesisDocument {
    /// Consensus validator set.
    #[serde(default)]
    pub validators: Vec<GenesisValidator>,
    /// Application state.
    #[serde(default)]
    pub app_state: AppState,
    /// Remaining top-level fields.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ValidatorKeyFile {
    address: String,
    pub_key: PubKey,
}

/// Builds one genesis document from every validator's dry-run output and
/// writes it to every node home.
pub struct GenesisAssembler<'a, P: Provisioner> {
    provisioner: &'a P,
    config: &'a NetworkConfig,
}

impl<'a, P: Provisioner> GenesisAssembler<'a, P> {
    /// Creates an assembler.
    #[must_use]
    pub const fn new(provisioner: &'a P, config: &'a NetworkConfig) -> Self {
        Self {
            provisioner,
            config,
        }
    }

    /// Assembles genesis for `services` and writes it to every node.
    ///
    /// Returns `None` without touching disk when there are no validators.
    ///
    /// # Errors
    ///
    /// Returns [`GenesisError`] when a fragment cannot be produced or
    /// decoded, the template fails, or the result cannot be written.
    pub fn assemble(
        &self,
        services: &GeneratedServices,
    ) -> Result<Option<GenesisDocument>, GenesisError> {
        let validators = services.validators();
        if validators.is_empty() {
            debug!("no validators, skipping genesis");
            return Ok(None);
        }

        let mut base = self.fold_fragments(&validators)?;
        base.validators = consensus_validators(&validators)?;

        let mut document = serde_json::to_value(&base).map_err(|err| GenesisError::Decode {
            origin: String::from("assembled genesis"),
            message: err.to_string(),
        })?;
        if let Some(template) = &self.config.genesis_template {
            let rendered = render_genesis(
                template,
                &GenesisTemplateContext {
                    network_name: self.config.network_name.clone(),
                    validators: validators.iter().map(|node| Peer::from(*node)).collect(),
                },
                &self.config.smart_contracts_addresses,
            )?;
            decode::<GenesisDocument>(&rendered, "genesis template")?;
            overlay_json(&mut document, &rendered)?;
        }

        let encoded =
            serde_json::to_string_pretty(&document).map_err(|err| GenesisError::Decode {
                origin: String::from("merged genesis"),
                message: err.to_string(),
            })?;
        let assembled: GenesisDocument = decode(&encoded, "merged genesis")?;
        for node in services.by_index() {
            files::write(&node.consensus.genesis_path, &encoded)?;
        }
        info!(
            validators = assembled.validators.len(),
            nodes = services.node_sets.len(),
            "genesis written"
        );
        Ok(Some(assembled))
    }

    fn fold_fragments(&self, validators: &[&NodeSet]) -> Result<GenesisDocument, GenesisError> {
        let mut base: Option<GenesisDocument> = None;
        for node in validators {
            let fragment = self
                .provisioner
                .update_genesis(&GenesisRequest {
                    binary: node.app.binary.clone(),
                    app_home: node.app.home_dir.clone(),
                    consensus_home: node.consensus.home_dir.clone(),
                })
                .map_err(|source| GenesisError::Provision {
                    node: node.name.clone(),
                    source,
                })?;
            let document: GenesisDocument = decode(&fragment, &node.name)?;
            match base.as_mut() {
                None => base = Some(document),
                Some(existing) => {
                    for (key, value) in document.app_state.validators {
                        existing.app_state.validators.entry(key).or_insert(value);
                    }
                }
            }
        }
        Ok(base.unwrap_or_default())
    }
}

/// Validator set derived directly from each validator's key file.
fn consensus_validators(validators: &[&NodeSet]) -> Result<Vec<GenesisValidator>, GenesisError> {
    validators
        .iter()
        .map(|node| {
            let path: &Utf8PathBuf = node.consensus.validator_key_path.as_ref().ok_or_else(|| {
                GenesisError::MissingValidatorKey {
                    node: node.name.clone(),
                }
            })?;
            let key: ValidatorKeyFile = decode(&files::read_to_string(path)?, path.as_str())?;
            Ok(GenesisValidator {
                address: key.address,
                pub_key: key.pub_key,
                power: String::from(VALIDATOR_POWER),
                name: node.name.clone(),
            })
        })
        .collect()
}

fn decode<T: for<'de> Deserialize<'de>>(contents: &str, origin: &str) -> Result<T, GenesisError> {
    serde_json::from_str(contents).map_err(|err| GenesisError::Decode {
        origin: origin.to_owned(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests;
