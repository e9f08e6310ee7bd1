//! Unit tests for genesis assembly.

use super::*;
use crate::provisioner::ConsensusInit;
use crate::test_support::{FakeProvisioner, sample_network_config, sample_node_set};
use crate::types::NodeMode;
use rstest::rstest;
use tempfile::TempDir;

fn initialised_services(
    provisioner: &FakeProvisioner,
    root: &Utf8PathBuf,
    modes: &[NodeMode],
) -> GeneratedServices {
    let mut services = GeneratedServices::default();
    for (index, mode) in modes.iter().copied().enumerate() {
        let mut node = sample_node_set("testnet", mode.as_str(), index, mode);
        let home = root.join(format!("consensus/node{index}"));
        let artifacts = provisioner
            .init_consensus(&ConsensusInit {
                binary: String::from("tendermint"),
                home: home.clone(),
                mode,
            })
            .expect("consensus init");
        node.consensus.home_dir = home;
        node.consensus.genesis_path = artifacts.genesis_path;
        node.consensus.validator_key_path = artifacts.validator_key_path;
        node.consensus.validator_pub_key = artifacts.validator_pub_key;
        node.app.home_dir = root.join(format!("app/node{index}"));
        services.insert(node);
    }
    services
}

fn temp_root(tmp: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path")
}

#[rstest]
fn no_validators_means_no_genesis() {
    let tmp = TempDir::new().expect("tempdir");
    let provisioner = FakeProvisioner::new();
    let services = initialised_services(&provisioner, &temp_root(&tmp), &[NodeMode::Full]);
    let config = sample_network_config();

    let result = GenesisAssembler::new(&provisioner, &config)
        .assemble(&services)
        .expect("assembly succeeds");

    assert!(result.is_none());
    assert!(!provisioner.calls().iter().any(|call| call.starts_with("update_genesis")));
}

#[rstest]
fn validator_state_is_the_union_of_every_fragment() {
    let tmp = TempDir::new().expect("tempdir");
    let provisioner = FakeProvisioner::new();
    let services = initialised_services(
        &provisioner,
        &temp_root(&tmp),
        &[NodeMode::Validator, NodeMode::Validator, NodeMode::Validator, NodeMode::Full],
    );
    let config = sample_network_config();

    let document = GenesisAssembler::new(&provisioner, &config)
        .assemble(&services)
        .expect("assembly succeeds")
        .expect("validators produce genesis");

    let expected_keys: Vec<String> = services
        .validators()
        .iter()
        .filter_map(|node| node.consensus.validator_pub_key.clone())
        .collect();
    let mut union_keys: Vec<String> = document.app_state.validators.keys().cloned().collect();
    union_keys.sort();
    let mut sorted_expected = expected_keys.clone();
    sorted_expected.sort();
    assert_eq!(union_keys, sorted_expected);

    assert_eq!(document.validators.len(), 3);
    let listed: Vec<&str> = document
        .validators
        .iter()
        .map(|validator| validator.pub_key.value.as_str())
        .collect();
    assert_eq!(
        listed,
        expected_keys.iter().map(String::as_str).collect::<Vec<_>>()
    );
    assert!(
        document
            .validators
            .iter()
            .all(|validator| validator.address.starts_with("ADDR")
                && validator.power == VALIDATOR_POWER)
    );
    assert_eq!(
        document.rest.get("chain_id"),
        Some(&Value::from("capsule-test"))
    );
}

#[rstest]
fn first_fragment_wins_on_colliding_validator_keys() {
    let tmp = TempDir::new().expect("tempdir");
    let provisioner = FakeProvisioner::new();
    let services = initialised_services(
        &provisioner,
        &temp_root(&tmp),
        &[NodeMode::Validator, NodeMode::Validator],
    );
    provisioner.push_app_validator("shared", serde_json::json!({"from": "node0"}));
    provisioner.push_app_validator("shared", serde_json::json!({"from": "node1"}));
    let config = sample_network_config();

    let document = GenesisAssembler::new(&provisioner, &config)
        .assemble(&services)
        .expect("assembly succeeds")
        .expect("validators produce genesis");

    assert_eq!(
        document.app_state.validators.get("shared"),
        Some(&serde_json::json!({"from": "node0"}))
    );
    assert_eq!(document.app_state.validators.len(), 3);
}

#[rstest]
fn genesis_is_byte_identical_on_every_node() {
    let tmp = TempDir::new().expect("tempdir");
    let provisioner = FakeProvisioner::new();
    let services = initialised_services(
        &provisioner,
        &temp_root(&tmp),
        &[NodeMode::Validator, NodeMode::Full],
    );
    let config = sample_network_config();

    GenesisAssembler::new(&provisioner, &config)
        .assemble(&services)
        .expect("assembly succeeds");

    let written: Vec<String> = services
        .by_index()
        .iter()
        .map(|node| files::read_to_string(&node.consensus.genesis_path).expect("genesis"))
        .collect();
    assert_eq!(written.len(), 2);
    assert_eq!(written.first(), written.last());
}

#[rstest]
fn template_override_wins_and_resolves_contracts() {
    let tmp = TempDir::new().expect("tempdir");
    let provisioner = FakeProvisioner::new();
    let services = initialised_services(&provisioner, &temp_root(&tmp), &[NodeMode::Validator]);
    let mut config = sample_network_config();
    config.smart_contracts_addresses =
        BTreeMap::from([(String::from("staking_bridge"), String::from("0xSTAKE"))]);
    config.genesis_template = Some(String::from(concat!(
        r#"{"chain_id": "{{ network_name }}-chain", "app_state": {"network": "#,
        r#"{"bridge": "{{ contract_address("staking_bridge") }}"}}}"#,
    )));

    let document = GenesisAssembler::new(&provisioner, &config)
        .assemble(&services)
        .expect("assembly succeeds")
        .expect("genesis produced");

    assert_eq!(
        document.rest.get("chain_id"),
        Some(&Value::from("testnet-chain"))
    );
    let network = document.app_state.rest.get("network").expect("network state");
    assert_eq!(network["bridge"], "0xSTAKE");
    assert_eq!(network["replay_attack_threshold"], "2");
}

#[rstest]
fn template_that_is_not_a_genesis_document_is_rejected() {
    let tmp = TempDir::new().expect("tempdir");
    let provisioner = FakeProvisioner::new();
    let services = initialised_services(&provisioner, &temp_root(&tmp), &[NodeMode::Validator]);
    let mut config = sample_network_config();
    config.genesis_template = Some(String::from(r#"{"validators": "nope"}"#));

    let err = GenesisAssembler::new(&provisioner, &config)
        .assemble(&services)
        .expect_err("override fails the self-check");

    assert!(matches!(err, GenesisError::Decode { ref origin, .. } if origin == "genesis template"));
}

#[rstest]
fn failing_dry_run_names_the_validator() {
    let tmp = TempDir::new().expect("tempdir");
    let setup = FakeProvisioner::new();
    let services = initialised_services(&setup, &temp_root(&tmp), &[NodeMode::Validator]);
    let failing = FakeProvisioner::failing_on("update_genesis");
    let config = sample_network_config();

    let err = GenesisAssembler::new(&failing, &config)
        .assemble(&services)
        .expect_err("dry run fails");

    let expected = services.validators().first().map(|node| node.name.clone());
    assert!(matches!(
        err,
        GenesisError::Provision { ref node, .. } if Some(node) == expected.as_ref()
    ));
}
