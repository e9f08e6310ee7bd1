//! Unit tests for settings and network configuration.

use super::*;
use rstest::{fixture, rstest};
use tempfile::TempDir;

#[fixture]
fn settings() -> CapsuleSettings {
    CapsuleSettings {
        home_path: String::from("/tmp/capsule-home"),
        nomad_address: String::from("http://127.0.0.1:4646"),
        nomad_token: None,
        nomad_bin: String::from("nomad"),
        deployment_poll_secs: 5,
        liveness_check_secs: 30,
    }
}

const MINIMAL_NETWORK: &str = r#"
network_name = "testnet"

[[node_sets]]
name = "validators"
mode = "validator"
count = 2

[[node_sets]]
name = "full"
mode = "full"
count = 1
"#;

#[rstest]
fn settings_validation_names_env_var_and_key(settings: CapsuleSettings) {
    let cfg = CapsuleSettings {
        nomad_address: String::from("  "),
        ..settings
    };

    let err = cfg.validate().expect_err("blank address is rejected");
    let ConfigError::MissingField(message) = err else {
        panic!("expected MissingField, got {err:?}");
    };
    assert!(message.contains("CAPSULE_NOMAD_ADDRESS"), "{message}");
    assert!(message.contains("nomad_address"), "{message}");
}

#[rstest]
fn settings_reject_zero_intervals(settings: CapsuleSettings) {
    let cfg = CapsuleSettings {
        deployment_poll_secs: 0,
        ..settings
    };

    assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
}

#[rstest]
fn settings_expose_intervals(settings: CapsuleSettings) {
    assert_eq!(settings.deployment_poll_interval(), Duration::from_secs(5));
    assert_eq!(settings.liveness_check_interval(), Duration::from_secs(30));
    assert_eq!(settings.home_dir(), Utf8PathBuf::from("/tmp/capsule-home"));
}

#[rstest]
fn expand_tilde_leaves_absolute_paths_alone() {
    assert_eq!(expand_tilde("/abs/path"), "/abs/path");
}

#[rstest]
fn network_config_applies_defaults() {
    let config = NetworkConfig::from_toml_str(MINIMAL_NETWORK, Utf8Path::new("."))
        .expect("minimal network parses");

    assert_eq!(config.network_name, "testnet");
    assert_eq!(config.datacenters, vec![String::from("dc1")]);
    assert_eq!(config.binaries, Binaries::default());
    assert_eq!(config.resources, ResourceConfig::default());
    assert_eq!(config.node_sets.len(), 2);
    assert_eq!(
        config.node_set_group("validators").map(|group| group.count),
        Some(2)
    );
    assert_eq!(config.wallet_name(), "testnet-wallet");
}

#[rstest]
#[case::empty_name("network_name = \"\"\n[[node_sets]]\nname = \"a\"\nmode = \"full\"\ncount = 1\n")]
#[case::no_groups("network_name = \"n\"\n")]
#[case::zero_count("network_name = \"n\"\n[[node_sets]]\nname = \"a\"\nmode = \"full\"\ncount = 0\n")]
#[case::duplicate_group(
    "network_name = \"n\"\n[[node_sets]]\nname = \"a\"\nmode = \"full\"\ncount = 1\n[[node_sets]]\nname = \"a\"\nmode = \"validator\"\ncount = 1\n"
)]
#[case::both_job_templates(
    "network_name = \"n\"\n[[node_sets]]\nname = \"a\"\nmode = \"full\"\ncount = 1\njob_template = \"{}\"\njob_template_file = \"job.json\"\n"
)]
fn network_config_rejects_inconsistent_input(#[case] contents: &str) {
    let err = NetworkConfig::from_toml_str(contents, Utf8Path::new("."))
        .expect_err("input should be rejected");

    assert!(matches!(err, ConfigError::Invalid(_)), "unexpected: {err:?}");
}

#[rstest]
fn network_config_inlines_template_files() {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8");
    files::write(&root.join("genesis.tmpl"), "{\"chain_id\": \"x\"}").expect("seed genesis");
    files::write(&root.join("templates/app.tmpl"), "[api]\nport = 1").expect("seed app");
    files::write(
        &root.join("network.toml"),
        concat!(
            "network_name = \"n\"\n",
            "genesis_template_file = \"genesis.tmpl\"\n",
            "[[node_sets]]\nname = \"a\"\nmode = \"validator\"\ncount = 1\n",
            "app_template_file = \"templates/app.tmpl\"\n",
        ),
    )
    .expect("seed network");

    let config = NetworkConfig::load(&root.join("network.toml")).expect("network loads");

    assert_eq!(
        config.genesis_template.as_deref(),
        Some("{\"chain_id\": \"x\"}")
    );
    assert_eq!(
        config.node_sets.first().and_then(|group| group.app_template.as_deref()),
        Some("[api]\nport = 1")
    );
    assert!(config.genesis_template_file.is_none());
}

#[rstest]
fn network_config_parses_pre_start_probes() {
    let contents = concat!(
        "network_name = \"n\"\n",
        "[[node_sets]]\nname = \"a\"\nmode = \"full\"\ncount = 1\n",
        "[[pre_start]]\nname = \"postgres\"\nimage = \"postgres:14\"\nstatic_port = 5432\n",
        "[[pre_start.probes]]\ntype = \"tcp\"\naddress = \"127.0.0.1:5432\"\n",
    );

    let config =
        NetworkConfig::from_toml_str(contents, Utf8Path::new(".")).expect("network parses");

    let job = config.pre_start.first().expect("pre-start job");
    assert_eq!(job.static_port, Some(5432));
    assert_eq!(
        job.probes,
        vec![Probe::Tcp {
            address: String::from("127.0.0.1:5432")
        }]
    );
}
