//! Unit tests for the network data model.

use super::*;
use rstest::rstest;

use crate::test_support::sample_node_set;

#[rstest]
fn node_names_derive_from_identity() {
    assert_eq!(
        NodeSet::name_for("testnet", "validators", 3, NodeMode::Validator),
        "testnet-nodeset-validators-3-validator"
    );
    assert_eq!(
        NodeSet::name_for("testnet", "full", 0, NodeMode::Full),
        "testnet-nodeset-full-0-full"
    );
}

#[rstest]
fn next_index_skips_past_highest_index() {
    let mut services = GeneratedServices::default();
    assert_eq!(services.next_index(), 0);

    services.insert(sample_node_set("net", "v", 0, NodeMode::Validator));
    services.insert(sample_node_set("net", "v", 4, NodeMode::Validator));

    assert_eq!(services.next_index(), 5);
}

#[rstest]
fn wallet_violations_flag_mismatched_keys() {
    let mut services = GeneratedServices::default();
    services.insert(sample_node_set("net", "v", 0, NodeMode::Validator));
    let mut keyless_validator = sample_node_set("net", "v", 1, NodeMode::Validator);
    keyless_validator.app.node_wallet_info = None;
    services.insert(keyless_validator);
    services.insert(sample_node_set("net", "f", 2, NodeMode::Full));

    assert_eq!(
        services.wallet_violations(),
        vec![String::from("net-nodeset-v-1-validator")]
    );
}

#[rstest]
fn job_ids_live_in_one_group_only() {
    let mut jobs = NetworkJobs::default();
    jobs.add_extra_job("shared");
    jobs.add_node_set_job("shared");

    assert!(jobs.node_set_job_ids.contains("shared"));
    assert!(!jobs.extra_job_ids.contains("shared"));
    assert_eq!(jobs.all_job_ids(), vec![String::from("shared")]);
}

#[rstest]
fn removing_job_ids_leaves_others_untouched() {
    let mut jobs = NetworkJobs::default();
    jobs.add_node_set_job("node-0");
    jobs.add_node_set_job("node-1");
    jobs.set_wallet_job("wallet");
    jobs.set_faucet_job("faucet");
    jobs.add_extra_job("postgres");

    jobs.remove_job_ids(&["node-0", "wallet", "", "never-tracked"]);

    assert!(!jobs.contains("node-0"));
    assert!(!jobs.contains("wallet"));
    assert!(jobs.contains("node-1"));
    assert!(jobs.contains("faucet"));
    assert!(jobs.contains("postgres"));
}

#[rstest]
fn removing_job_ids_twice_is_idempotent() {
    let mut jobs = NetworkJobs::default();
    jobs.add_node_set_job("node-0");

    jobs.remove_job_ids(&["node-0"]);
    let after_first = jobs.clone();
    jobs.remove_job_ids(&["node-0"]);

    assert_eq!(jobs, after_first);
    assert!(jobs.is_empty());
}

#[rstest]
fn merge_keeps_each_job_in_its_group() {
    let mut running = NetworkJobs::default();
    running.add_extra_job("postgres");
    let mut started = NetworkJobs::default();
    started.add_node_set_job("node-0");
    started.set_faucet_job("faucet");

    running.merge(&started);

    assert!(running.extra_job_ids.contains("postgres"));
    assert!(running.node_set_job_ids.contains("node-0"));
    assert_eq!(running.faucet_job_id.as_deref(), Some("faucet"));
}
