//! Capability boundary over the external node binaries.
//!
//! Every piece of real node or key material work (initialising homes,
//! generating wallets, producing genesis fragments) happens behind the
//! [`Provisioner`] trait. The generator and the genesis assembler only ever
//! see artifact paths and identities returned from it.

mod process;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::files::FileError;
use crate::runner::RunnerError;
use crate::types::{NodeMode, NodeWalletInfo};

pub use process::ProcessProvisioner;

/// Initialises a consensus engine home.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConsensusInit {
    /// Consensus engine executable.
    pub binary: String,
    /// Home directory to initialise.
    pub home: Utf8PathBuf,
    /// Role of the node.
    pub mode: NodeMode,
}

/// Artifacts produced by [`Provisioner::init_consensus`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConsensusArtifacts {
    /// Generated configuration file.
    pub config_path: Utf8PathBuf,
    /// Genesis file the engine reads at start-up.
    pub genesis_path: Utf8PathBuf,
    /// Peer identity.
    pub node_id: String,
    /// Validator public key, for validators only.
    pub validator_pub_key: Option<String>,
    /// Validator key file, for validators only.
    pub validator_key_path: Option<Utf8PathBuf>,
}

/// Initialises an application node home cross-linked to its consensus home.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppInit {
    /// Application executable.
    pub binary: String,
    /// Home directory to initialise.
    pub home: Utf8PathBuf,
    /// Consensus home of the same node.
    pub consensus_home: Utf8PathBuf,
    /// Role of the node.
    pub mode: NodeMode,
}

/// Initialises a home that only needs a binary and a directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HomeInit {
    /// Executable.
    pub binary: String,
    /// Home directory to initialise.
    pub home: Utf8PathBuf,
}

/// Location of a generated configuration file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfigArtifact {
    /// Generated configuration file.
    pub config_path: Utf8PathBuf,
}

/// Artifacts produced by [`Provisioner::init_faucet`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FaucetArtifacts {
    /// Generated configuration file.
    pub config_path: Utf8PathBuf,
    /// Public key of the faucet wallet.
    pub public_key: String,
    /// Passphrase file protecting the faucet wallet.
    pub passphrase_path: Utf8PathBuf,
}

/// Generates the signing keys of a validator's application node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeWalletRequest {
    /// Application executable.
    pub binary: String,
    /// Application home.
    pub app_home: Utf8PathBuf,
    /// Consensus home whose validator key is imported.
    pub consensus_home: Utf8PathBuf,
}

/// Asks a validator for its own view of genesis.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GenesisRequest {
    /// Application executable.
    pub binary: String,
    /// Application home.
    pub app_home: Utf8PathBuf,
    /// Consensus home.
    pub consensus_home: Utf8PathBuf,
}

/// Errors raised by provisioners.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Raised when a binary cannot be launched.
    #[error(transparent)]
    Runner(#[from] RunnerError),
    /// Raised when a binary exits unsuccessfully.
    #[error("`{command}` failed with status {status}: {stderr}")]
    Command {
        /// Rendered command line.
        command: String,
        /// Exit status text.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when a binary's output cannot be decoded.
    #[error("failed to decode output of `{command}`: {message}")]
    Decode {
        /// Rendered command line.
        command: String,
        /// Decoder message.
        message: String,
    },
    /// Raised when artifacts cannot be read or written.
    #[error(transparent)]
    File(#[from] FileError),
}

/// Initialises node homes and produces key and genesis material.
pub trait Provisioner {
    /// Initialises a consensus home and reports its identity.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the engine fails.
    fn init_consensus(&self, request: &ConsensusInit)
    -> Result<ConsensusArtifacts, ProvisionError>;

    /// Initialises an application home.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the application fails.
    fn init_app(&self, request: &AppInit) -> Result<ConfigArtifact, ProvisionError>;

    /// Initialises a data indexer home.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the indexer fails.
    fn init_data_node(&self, request: &HomeInit) -> Result<ConfigArtifact, ProvisionError>;

    /// Generates the node wallet of a validator.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when key generation fails.
    fn generate_node_wallet(
        &self,
        request: &NodeWalletRequest,
    ) -> Result<NodeWalletInfo, ProvisionError>;

    /// Initialises the wallet service home.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the wallet fails.
    fn init_wallet(&self, request: &HomeInit) -> Result<ConfigArtifact, ProvisionError>;

    /// Initialises the faucet home and its signing wallet.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the faucet fails.
    fn init_faucet(&self, request: &HomeInit) -> Result<FaucetArtifacts, ProvisionError>;

    /// Runs a dry-run genesis update for one validator and returns the JSON
    /// genesis document it would produce.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the update fails.
    fn update_genesis(&self, request: &GenesisRequest) -> Result<String, ProvisionError>;
}
