//! Unit tests for the `capsule` CLI binary implementation.

use super::*;
use crate::cli::{Command, LogOriginArg, LogsArgs, NodesCommand};
use camino::Utf8PathBuf;
use capsule::scheduler::LogOrigin;
use capsule::test_support::{EnvGuard, FakeProvisioner, sample_network_config};
use capsule::{Network, NetworkError, StateError, StateStore};
use rstest::{fixture, rstest};
use std::time::Duration;
use tempfile::TempDir;

struct Home {
    _tmp: TempDir,
    path: Utf8PathBuf,
}

#[fixture]
fn home() -> Home {
    let tmp = TempDir::new().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("net")).expect("utf8 path");
    Home { _tmp: tmp, path }
}

fn generated(home: &Home) {
    Network::new(StateStore::new(&home.path))
        .generate(sample_network_config(), &FakeProvisioner::new(), false)
        .expect("network generated");
}

async fn run(args: &[&str]) -> (Result<(), CliError>, String) {
    let cli = Cli::try_parse_from(args).expect("arguments parse");
    let mut out = Vec::new();
    let result = commands::dispatch(cli, &mut out).await;
    (result, String::from_utf8(out).expect("utf8"))
}

#[tokio::test]
async fn version_prints_the_package_version() {
    let (result, out) = run(&["capsule", "version"]).await;

    assert!(result.is_ok());
    assert_eq!(out, format!("capsule {}\n", env!("CARGO_PKG_VERSION")));
}

#[rstest]
#[tokio::test]
async fn state_get_without_network_names_the_home(home: Home) {
    let (result, out) = run(&["capsule", "state", "get", "--home-path", home.path.as_str()]).await;

    assert!(matches!(
        result,
        Err(CliError::Network(NetworkError::State(StateError::NotGenerated { .. })))
    ));
    assert!(out.is_empty());
}

#[rstest]
#[tokio::test]
async fn nodes_ls_prints_generated_node_sets(home: Home) {
    generated(&home);

    let (result, out) = run(&["capsule", "nodes", "ls", "--home-path", home.path.as_str()]).await;

    assert!(result.is_ok(), "unexpected error: {result:?}");
    let listed: serde_json::Value = serde_json::from_str(&out).expect("json output");
    let names: Vec<&str> = listed
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|node| node["name"].as_str())
        .collect();
    assert_eq!(
        names,
        vec![
            "testnet-nodeset-validators-0-validator",
            "testnet-nodeset-validators-1-validator",
            "testnet-nodeset-full-2-full",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn validators_listing_carries_consensus_identity(home: Home) {
    generated(&home);

    let (result, out) = run(&[
        "capsule",
        "nodes",
        "ls-validators",
        "--home-path",
        home.path.as_str(),
    ])
    .await;

    assert!(result.is_ok(), "unexpected error: {result:?}");
    let listed: serde_json::Value = serde_json::from_str(&out).expect("json output");
    let validators = listed.as_array().expect("array");
    assert_eq!(validators.len(), 2);
    assert!(validators.iter().all(|node| node["validator_pub_key"].is_string()));
    assert!(validators.iter().all(|node| node["node_id"].is_string()));
}

#[rstest]
#[tokio::test]
async fn home_path_falls_back_to_the_environment(home: Home) {
    generated(&home);
    let _guard = EnvGuard::set_var("CAPSULE_HOME_PATH", home.path.as_str()).await;

    let (result, out) = run(&["capsule", "state", "get"]).await;

    assert!(result.is_ok(), "unexpected error: {result:?}");
    assert!(out.contains("\"network_name\": \"testnet\""));
}

#[rstest]
#[tokio::test]
async fn destroying_a_stopped_network_needs_no_scheduler(home: Home) {
    generated(&home);

    let (result, _) = run(&[
        "capsule",
        "network",
        "destroy",
        "--home-path",
        home.path.as_str(),
    ])
    .await;

    assert!(result.is_ok(), "unexpected error: {result:?}");
    assert!(!home.path.exists());
}

#[test]
fn nodes_add_starts_new_nodes_unless_disabled() {
    let parse = |args: &[&str]| match Cli::try_parse_from(args).expect("arguments parse").command {
        Command::Nodes(NodesCommand::Add(add)) => add,
        other => panic!("unexpected command: {other:?}"),
    };

    let default = parse(&["capsule", "nodes", "add", "--base-on", "validators"]);
    assert!(default.start);
    assert_eq!(default.count, 1);

    let manual = parse(&[
        "capsule",
        "nodes",
        "add",
        "--base-on",
        "validators",
        "--count",
        "2",
        "--start=false",
    ]);
    assert!(!manual.start);
    assert_eq!(manual.count, 2);
}

#[test]
fn restore_checkpoint_takes_a_file_and_optional_nodes() {
    let cli = Cli::try_parse_from([
        "capsule",
        "nodes",
        "restore-checkpoint",
        "--checkpoint-file",
        "/checkpoints/20240101.cp",
        "--name",
        "testnet-nodeset-validators-0-validator",
    ])
    .expect("arguments parse");

    let Command::Nodes(NodesCommand::RestoreCheckpoint(args)) = cli.command else {
        panic!("unexpected command: {:?}", cli.command);
    };
    assert_eq!(args.checkpoint_file, "/checkpoints/20240101.cp");
    assert_eq!(args.nodes.names, vec!["testnet-nodeset-validators-0-validator"]);
}

#[test]
fn log_flags_map_onto_aggregator_options() {
    let options = commands::log_options(&LogsArgs {
        job_id: None,
        follow: true,
        origin: LogOriginArg::End,
        offset: 512,
        idle_timeout_secs: Some(3),
    });

    assert!(options.follow);
    assert_eq!(options.origin, LogOrigin::End);
    assert_eq!(options.offset, 512);
    assert_eq!(options.idle_timeout, Some(Duration::from_secs(3)));
}

#[test]
fn write_error_prefixes_the_message() {
    let mut buf = Vec::new();
    let err = CliError::Output(String::from("broken pipe"));
    write_error(&mut buf, &err);
    let rendered = String::from_utf8(buf).expect("utf8");
    assert_eq!(rendered, "error: failed to write output: broken pipe\n");
}
