//! Persisted network state.
//!
//! One JSON document per network home holds the resolved configuration,
//! the generated services, and the jobs believed to be running. Every
//! command reads it first and mutating commands write it back atomically.
//! Concurrent writers are not coordinated.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::files::{self, FileError};
use crate::types::{GeneratedServices, NetworkJobs};

const STATE_FILE_NAME: &str = "network.json";
const GENERATED_DIR_NAME: &str = "generated";

/// Errors raised while reading or writing network state.
#[derive(Debug, Error)]
pub enum StateError {
    /// Raised when no network has been generated in the home directory.
    #[error("no network found in {home}; run `capsule network generate` first")]
    NotGenerated {
        /// Network home directory.
        home: Utf8PathBuf,
    },
    /// Raised when the state exists but holds no generated services.
    #[error("network {network} has not been generated")]
    MissingServices {
        /// Network name.
        network: String,
    },
    /// Raised when the state document cannot be decoded.
    #[error("failed to decode {path}: {message}")]
    Decode {
        /// State file.
        path: Utf8PathBuf,
        /// Decoder message.
        message: String,
    },
    /// Raised when the state cannot be encoded.
    #[error("failed to encode network state: {message}")]
    Encode {
        /// Encoder message.
        message: String,
    },
    /// Raised when the state file cannot be accessed.
    #[error(transparent)]
    File(#[from] FileError),
}

/// Lifecycle phase derived from the state contents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NetworkPhase {
    /// Configuration recorded, nothing generated.
    Empty,
    /// Services generated, never started.
    Generated,
    /// At least one job tracked as running.
    Running,
    /// Started before, no job tracked any more.
    Stopped,
}

/// The persisted aggregate of one network.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NetworkState {
    /// Resolved network configuration.
    pub config: NetworkConfig,
    /// Output of generation.
    #[serde(default)]
    pub generated_services: Option<GeneratedServices>,
    /// Jobs believed to be running.
    #[serde(default)]
    pub running_jobs: Option<NetworkJobs>,
}

impl NetworkState {
    /// Fresh state holding only `config`.
    #[must_use]
    pub const fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            generated_services: None,
            running_jobs: None,
        }
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> NetworkPhase {
        match (&self.generated_services, &self.running_jobs) {
            (None, _) => NetworkPhase::Empty,
            (Some(_), None) => NetworkPhase::Generated,
            (Some(_), Some(jobs)) if jobs.is_empty() => NetworkPhase::Stopped,
            (Some(_), Some(_)) => NetworkPhase::Running,
        }
    }

    /// Generated services.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::MissingServices`] before generation.
    pub fn require_services(&self) -> Result<&GeneratedServices, StateError> {
        self.generated_services
            .as_ref()
            .ok_or_else(|| StateError::MissingServices {
                network: self.config.network_name.clone(),
            })
    }

    /// Mutable generated services.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::MissingServices`] before generation.
    pub fn require_services_mut(&mut self) -> Result<&mut GeneratedServices, StateError> {
        let network = &self.config.network_name;
        self.generated_services
            .as_mut()
            .ok_or_else(|| StateError::MissingServices {
                network: network.clone(),
            })
    }

    /// Running job bookkeeping, created empty on first use.
    pub fn running_jobs_mut(&mut self) -> &mut NetworkJobs {
        self.running_jobs.get_or_insert_with(NetworkJobs::default)
    }
}

/// Reads and writes the state document of one network home.
#[derive(Clone, Debug)]
pub struct StateStore {
    home: Utf8PathBuf,
}

impl StateStore {
    /// Store rooted at `home`.
    #[must_use]
    pub fn new(home: &Utf8Path) -> Self {
        Self {
            home: home.to_path_buf(),
        }
    }

    /// Network home directory.
    #[must_use]
    pub fn home(&self) -> &Utf8Path {
        &self.home
    }

    /// Path of the state document.
    #[must_use]
    pub fn state_path(&self) -> Utf8PathBuf {
        self.home.join(STATE_FILE_NAME)
    }

    /// Directory node homes are generated into.
    #[must_use]
    pub fn output_dir(&self) -> Utf8PathBuf {
        self.home.join(GENERATED_DIR_NAME)
    }

    /// Loads the state, or `None` when the home holds no network.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the document cannot be read or decoded.
    pub fn load(&self) -> Result<Option<NetworkState>, StateError> {
        let path = self.state_path();
        if !files::exists(&path)? {
            debug!(path = %path, "no network state");
            return Ok(None);
        }
        let contents = files::read_to_string(&path)?;
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| StateError::Decode {
                path,
                message: err.to_string(),
            })
    }

    /// Loads the state, failing when the home holds no network.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotGenerated`] when no state exists.
    pub fn require(&self) -> Result<NetworkState, StateError> {
        self.load()?.ok_or_else(|| StateError::NotGenerated {
            home: self.home.clone(),
        })
    }

    /// Atomically replaces the state document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when encoding or writing fails.
    pub fn save(&self, state: &NetworkState) -> Result<(), StateError> {
        let encoded = serde_json::to_string_pretty(state).map_err(|err| StateError::Encode {
            message: err.to_string(),
        })?;
        files::write_atomic(&self.state_path(), encoded)?;
        debug!(path = %self.state_path(), phase = ?state.phase(), "network state saved");
        Ok(())
    }

    /// Removes the whole network home.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::File`] when removal fails.
    pub fn destroy(&self) -> Result<(), StateError> {
        files::remove_dir_all(&self.home)?;
        info!(home = %self.home, "network home removed");
        Ok(())
    }
}
