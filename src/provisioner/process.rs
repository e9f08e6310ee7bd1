//! Provisioner that shells out to the real node binaries.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use shell_escape::unix::escape;
use tracing::debug;
use uuid::Uuid;

use super::{
    AppInit, ConfigArtifact, ConsensusArtifacts, ConsensusInit, FaucetArtifacts, GenesisRequest,
    HomeInit, NodeWalletRequest, ProvisionError, Provisioner,
};
use crate::files;
use crate::runner::{CommandOutput, CommandRunner};
use crate::types::NodeWalletInfo;

const PASSPHRASE_FILE: &str = "passphrase.txt";

#[derive(Debug, Deserialize)]
struct ValidatorKey {
    value: String,
}

#[derive(Debug, Deserialize)]
struct WalletKey {
    #[serde(alias = "publicKey")]
    public_key: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

/// Drives the consensus engine, application, indexer, wallet, and faucet
/// binaries through a [`CommandRunner`].
#[derive(Clone, Debug, Default)]
pub struct ProcessProvisioner<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> ProcessProvisioner<R> {
    /// Creates a provisioner using `runner` for every invocation.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self { runner }
    }

    fn run(&self, binary: &str, args: &[&str]) -> Result<CommandOutput, ProvisionError> {
        let os_args: Vec<OsString> = args.iter().map(OsString::from).collect();
        debug!(command = %render_command(binary, args), "running node binary");
        let output = self.runner.run(binary, &os_args)?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(ProvisionError::Command {
                command: render_command(binary, args),
                status: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            })
        }
    }

    fn run_json<T: for<'de> Deserialize<'de>>(
        &self,
        binary: &str,
        args: &[&str],
    ) -> Result<T, ProvisionError> {
        let output = self.run(binary, args)?;
        serde_json::from_str(output.stdout.trim()).map_err(|err| ProvisionError::Decode {
            command: render_command(binary, args),
            message: err.to_string(),
        })
    }
}

impl<R: CommandRunner> Provisioner for ProcessProvisioner<R> {
    fn init_consensus(
        &self,
        request: &ConsensusInit,
    ) -> Result<ConsensusArtifacts, ProvisionError> {
        let home = request.home.as_str();
        files::create_dir_all(&request.home)?;
        self.run(
            &request.binary,
            &["init", request.mode.as_str(), "--home", home],
        )?;
        let node_id = self
            .run(&request.binary, &["show-node-id", "--home", home])?
            .stdout
            .trim()
            .to_owned();

        let config_dir = request.home.join("config");
        let (validator_pub_key, validator_key_path) = if request.mode.is_validator() {
            let key: ValidatorKey =
                self.run_json(&request.binary, &["show-validator", "--home", home])?;
            (
                Some(key.value),
                Some(config_dir.join("priv_validator_key.json")),
            )
        } else {
            (None, None)
        };

        Ok(ConsensusArtifacts {
            config_path: config_dir.join("config.toml"),
            genesis_path: config_dir.join("genesis.json"),
            node_id,
            validator_pub_key,
            validator_key_path,
        })
    }

    fn init_app(&self, request: &AppInit) -> Result<ConfigArtifact, ProvisionError> {
        files::create_dir_all(&request.home)?;
        self.run(
            &request.binary,
            &[
                "init",
                "--home",
                request.home.as_str(),
                "--output",
                "json",
                request.mode.as_str(),
            ],
        )?;
        Ok(ConfigArtifact {
            config_path: request.home.join("config/node/config.toml"),
        })
    }

    fn init_data_node(&self, request: &HomeInit) -> Result<ConfigArtifact, ProvisionError> {
        files::create_dir_all(&request.home)?;
        self.run(
            &request.binary,
            &["init", "--force", "--home", request.home.as_str()],
        )?;
        Ok(ConfigArtifact {
            config_path: request.home.join("config/data-node/config.toml"),
        })
    }

    fn generate_node_wallet(
        &self,
        request: &NodeWalletRequest,
    ) -> Result<NodeWalletInfo, ProvisionError> {
        let passphrase_path = write_passphrase(&request.app_home)?;
        let home = request.app_home.as_str();
        let passphrase = passphrase_path.as_str();

        let app_key: WalletKey = self.run_json(
            &request.binary,
            &[
                "nodewallet",
                "generate",
                "--chain",
                "vega",
                "--home",
                home,
                "--passphrase-file",
                passphrase,
                "--output",
                "json",
            ],
        )?;
        let ethereum: WalletKey = self.run_json(
            &request.binary,
            &[
                "nodewallet",
                "generate",
                "--chain",
                "ethereum",
                "--home",
                home,
                "--passphrase-file",
                passphrase,
                "--output",
                "json",
            ],
        )?;
        self.run(
            &request.binary,
            &[
                "nodewallet",
                "import",
                "--chain",
                "tendermint",
                "--home",
                home,
                "--tendermint-home",
                request.consensus_home.as_str(),
                "--passphrase-file",
                passphrase,
            ],
        )?;

        let app_pub_key = app_key
            .public_key
            .ok_or_else(|| ProvisionError::Decode {
                command: render_command(&request.binary, &["nodewallet", "generate"]),
                message: String::from("output carries no public key"),
            })?;
        Ok(NodeWalletInfo {
            app_pub_key,
            ethereum_address: ethereum.address,
            passphrase_path,
        })
    }

    fn init_wallet(&self, request: &HomeInit) -> Result<ConfigArtifact, ProvisionError> {
        files::create_dir_all(&request.home)?;
        self.run(
            &request.binary,
            &["init", "--home", request.home.as_str(), "--output", "json"],
        )?;
        Ok(ConfigArtifact {
            config_path: request.home.join("config/wallet-service/config.toml"),
        })
    }

    fn init_faucet(&self, request: &HomeInit) -> Result<FaucetArtifacts, ProvisionError> {
        let passphrase_path = write_passphrase(&request.home)?;
        let key: WalletKey = self.run_json(
            &request.binary,
            &[
                "faucet",
                "init",
                "--home",
                request.home.as_str(),
                "--passphrase-file",
                passphrase_path.as_str(),
                "--output",
                "json",
            ],
        )?;
        let public_key = key.public_key.ok_or_else(|| ProvisionError::Decode {
            command: render_command(&request.binary, &["faucet", "init"]),
            message: String::from("output carries no public key"),
        })?;
        Ok(FaucetArtifacts {
            config_path: request.home.join("config/faucet/config.toml"),
            public_key,
            passphrase_path,
        })
    }

    fn update_genesis(&self, request: &GenesisRequest) -> Result<String, ProvisionError> {
        let output = self.run(
            &request.binary,
            &[
                "genesis",
                "update",
                "--home",
                request.app_home.as_str(),
                "--tm-home",
                request.consensus_home.as_str(),
                "--dry-run",
            ],
        )?;
        Ok(output.stdout)
    }
}

fn write_passphrase(home: &Utf8Path) -> Result<Utf8PathBuf, ProvisionError> {
    let path = home.join(PASSPHRASE_FILE);
    files::write(&path, Uuid::new_v4().simple().to_string())?;
    Ok(path)
}

fn render_command(binary: &str, args: &[&str]) -> String {
    let mut rendered = String::from(binary);
    for arg in args {
        rendered.push(' ');
        rendered.push_str(escape((*arg).into()).as_ref());
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use crate::types::NodeMode;
    use rstest::rstest;
    use tempfile::TempDir;

    fn temp_home(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().join("node0")).expect("utf8 path")
    }

    #[rstest]
    fn init_consensus_reports_validator_identity() {
        let tmp = TempDir::new().expect("tempdir");
        let home = temp_home(&tmp);
        let runner = ScriptedRunner::new();
        runner.push_success();
        runner.push_output(Some(0), "abc123\n", "");
        runner.push_output(
            Some(0),
            r#"{"type":"tendermint/PubKeyEd25519","value":"PUBKEY="}"#,
            "",
        );
        let provisioner = ProcessProvisioner::new(runner.clone());

        let artifacts = provisioner
            .init_consensus(&ConsensusInit {
                binary: String::from("tendermint"),
                home: home.clone(),
                mode: NodeMode::Validator,
            })
            .expect("init succeeds");

        assert_eq!(artifacts.node_id, "abc123");
        assert_eq!(artifacts.validator_pub_key.as_deref(), Some("PUBKEY="));
        assert_eq!(
            artifacts.validator_key_path,
            Some(home.join("config/priv_validator_key.json"))
        );
        let commands: Vec<String> = runner
            .invocations()
            .iter()
            .map(crate::test_support::CommandInvocation::command_string)
            .collect();
        assert_eq!(
            commands.first().map(String::as_str),
            Some(format!("tendermint init validator --home {home}").as_str())
        );
        assert_eq!(commands.len(), 3);
    }

    #[rstest]
    fn init_consensus_skips_validator_key_for_full_nodes() {
        let tmp = TempDir::new().expect("tempdir");
        let runner = ScriptedRunner::new();
        runner.push_success();
        runner.push_output(Some(0), "full-id", "");
        let provisioner = ProcessProvisioner::new(runner.clone());

        let artifacts = provisioner
            .init_consensus(&ConsensusInit {
                binary: String::from("tendermint"),
                home: temp_home(&tmp),
                mode: NodeMode::Full,
            })
            .expect("init succeeds");

        assert!(artifacts.validator_pub_key.is_none());
        assert_eq!(runner.invocations().len(), 2);
    }

    #[rstest]
    fn failing_binary_surfaces_command_and_stderr() {
        let tmp = TempDir::new().expect("tempdir");
        let runner = ScriptedRunner::new();
        runner.push_failure(2);
        let provisioner = ProcessProvisioner::new(runner);

        let err = provisioner
            .init_app(&AppInit {
                binary: String::from("vega"),
                home: temp_home(&tmp),
                consensus_home: Utf8PathBuf::from("/tm"),
                mode: NodeMode::Full,
            })
            .expect_err("non-zero exit fails");

        let ProvisionError::Command {
            command,
            status,
            stderr,
        } = err
        else {
            panic!("expected Command error, got {err:?}");
        };
        assert!(command.starts_with("vega init --home"), "{command}");
        assert_eq!(status, "2");
        assert_eq!(stderr, "simulated failure");
    }

    #[rstest]
    fn node_wallet_generation_writes_passphrase_and_reads_keys() {
        let tmp = TempDir::new().expect("tempdir");
        let home = temp_home(&tmp);
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), r#"{"publicKey":"app-key"}"#, "");
        runner.push_output(Some(0), r#"{"address":"0xabc"}"#, "");
        runner.push_success();
        let provisioner = ProcessProvisioner::new(runner);

        let info = provisioner
            .generate_node_wallet(&NodeWalletRequest {
                binary: String::from("vega"),
                app_home: home.clone(),
                consensus_home: Utf8PathBuf::from("/tm"),
            })
            .expect("wallet generated");

        assert_eq!(info.app_pub_key, "app-key");
        assert_eq!(info.ethereum_address.as_deref(), Some("0xabc"));
        assert_eq!(info.passphrase_path, home.join(PASSPHRASE_FILE));
        let passphrase = files::read_to_string(&info.passphrase_path).expect("passphrase");
        assert_eq!(passphrase.len(), 32);
    }

    #[rstest]
    fn render_command_quotes_arguments() {
        assert_eq!(
            render_command("vega", &["--home", "/a b"]),
            "vega --home '/a b'"
        );
    }
}
