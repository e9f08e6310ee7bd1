//! Behavioural tests for the network lifecycle against in-memory doubles.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use capsule::generator::GenerateError;
use capsule::genesis::GenesisDocument;
use capsule::scheduler::{DeploymentStatus, LogStreamKind};
use capsule::test_support::{FakeProvisioner, FakeScheduler, docker_job, sample_network_config};
use capsule::{
    JobOrchestrator, LogAggregator, LogOptions, Network, NetworkError, NetworkPhase,
    OrchestratorError, RemoteExecutor, StateStore, files,
};

const VALIDATOR_0: &str = "testnet-nodeset-validators-0-validator";
const VALIDATOR_1: &str = "testnet-nodeset-validators-1-validator";
const FULL_2: &str = "testnet-nodeset-full-2-full";

struct Harness {
    _tmp: TempDir,
    root: Utf8PathBuf,
    network: Network,
    provisioner: FakeProvisioner,
    scheduler: FakeScheduler,
}

impl Harness {
    fn orchestrator(&self) -> JobOrchestrator<'_, FakeScheduler> {
        JobOrchestrator::new(&self.scheduler)
            .with_poll_interval(Duration::from_millis(5))
            .with_liveness_interval(Duration::from_millis(200))
    }

    fn generate(&self) {
        self.network
            .generate(sample_network_config(), &self.provisioner, false)
            .expect("network generated");
    }

    async fn start(&self) {
        self.generate();
        self.network
            .start(&self.orchestrator())
            .await
            .expect("network starts");
    }
}

#[fixture]
fn harness() -> Harness {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().join("testnet")).expect("utf8 path");
    Harness {
        network: Network::new(StateStore::new(&root)),
        root,
        provisioner: FakeProvisioner::new(),
        scheduler: FakeScheduler::new(),
        _tmp: tmp,
    }
}

#[rstest]
fn two_validators_and_a_full_node_produce_two_signing_identities(harness: Harness) {
    let state = harness
        .network
        .generate(sample_network_config(), &harness.provisioner, false)
        .expect("network generated");

    let services = state.generated_services.as_ref().expect("services");
    let nodes = services.by_index();
    assert_eq!(nodes.len(), 3);
    assert_eq!(
        nodes
            .iter()
            .filter(|node| node.app.node_wallet_info.is_some())
            .count(),
        2
    );
    let genesis: GenesisDocument = serde_json::from_str(
        &files::read_to_string(&nodes.last().expect("node").consensus.genesis_path)
            .expect("genesis readable"),
    )
    .expect("genesis parses");
    assert_eq!(genesis.validators.len(), 2);
    assert_eq!(harness.network.state().expect("state"), state);
    assert_eq!(state.phase(), NetworkPhase::Generated);
}

#[rstest]
fn generating_twice_requires_force(harness: Harness) {
    harness.generate();

    let err = harness
        .network
        .generate(sample_network_config(), &harness.provisioner, false)
        .expect_err("second generation refused");
    assert!(matches!(
        err,
        NetworkError::Generate(GenerateError::AlreadyGenerated { .. })
    ));

    harness
        .network
        .generate(sample_network_config(), &harness.provisioner, true)
        .expect("forced regeneration");
}

#[rstest]
#[tokio::test]
async fn running_network_is_not_regenerated(harness: Harness) {
    harness.start().await;

    let err = harness
        .network
        .generate(sample_network_config(), &harness.provisioner, true)
        .expect_err("running network refused");

    assert!(matches!(err, NetworkError::Running { ref network } if network == "testnet"));
}

#[rstest]
fn added_nodes_take_fresh_indices_and_leave_existing_ones_alone(harness: Harness) {
    harness.generate();
    let before = harness.network.state().expect("state");

    let added = harness
        .network
        .add_nodes(&harness.provisioner, "validators", 2)
        .expect("nodes added");

    let indices: Vec<usize> = added.iter().map(|node| node.index).collect();
    assert_eq!(indices, vec![3, 4]);
    let after = harness.network.state().expect("state");
    let services = after.generated_services.as_ref().expect("services");
    assert_eq!(services.node_sets.len(), 5);
    for node in before.generated_services.as_ref().expect("services").by_index() {
        assert_eq!(services.node_sets.get(&node.name), Some(node));
    }
    assert!(harness.scheduler.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn failed_pre_start_job_stops_the_whole_start(harness: Harness) {
    let mut config = sample_network_config();
    config.pre_start = vec![docker_job("postgres")];
    harness
        .network
        .generate(config, &harness.provisioner, false)
        .expect("network generated");
    harness.scheduler.fail_registration("postgres");

    let err = harness
        .network
        .start(&harness.orchestrator())
        .await
        .expect_err("start fails");

    assert!(matches!(
        err,
        NetworkError::Orchestrator(OrchestratorError::PreStartFailed { ref job_id, .. })
            if job_id == "postgres"
    ));
    assert!(harness.scheduler.registered_job_ids().is_empty());
    assert!(
        harness
            .scheduler
            .calls()
            .iter()
            .filter(|call| call.starts_with("register "))
            .all(|call| call == "register postgres")
    );
    assert!(harness.network.state().expect("state").running_jobs.is_none());
}

#[rstest]
#[tokio::test]
async fn start_then_stop_round_trips_the_bookkeeping(harness: Harness) {
    harness.start().await;

    let running = harness.network.state().expect("state");
    assert_eq!(running.phase(), NetworkPhase::Running);
    let mut tracked = running.running_jobs.as_ref().expect("jobs").all_job_ids();
    tracked.sort();
    assert_eq!(tracked, vec![FULL_2, VALIDATOR_0, VALIDATOR_1]);

    harness
        .network
        .stop(&harness.orchestrator(), false)
        .await
        .expect("network stops");

    assert_eq!(
        harness.network.state().expect("state").phase(),
        NetworkPhase::Stopped
    );
    assert_eq!(harness.scheduler.deregistered().len(), 3);
    assert_eq!(harness.scheduler.gc_calls(), 1);
}

#[rstest]
#[tokio::test]
async fn stopping_a_network_that_never_ran_only_collects_garbage(harness: Harness) {
    harness.generate();

    harness
        .network
        .stop(&harness.orchestrator(), false)
        .await
        .expect("first stop");
    harness
        .network
        .stop(&harness.orchestrator(), false)
        .await
        .expect("second stop");

    assert_eq!(harness.scheduler.calls(), vec!["gc", "gc"]);
}

#[rstest]
#[tokio::test]
async fn partial_stop_untracks_only_the_stopped_jobs(harness: Harness) {
    harness.start().await;
    harness.scheduler.fail_deregistration(VALIDATOR_0);

    let err = harness
        .network
        .stop(&harness.orchestrator(), false)
        .await
        .expect_err("one job refuses to stop");

    assert!(err.to_string().contains("1 operation(s) failed"));
    let state = harness.network.state().expect("state");
    assert_eq!(
        state.running_jobs.as_ref().expect("jobs").all_job_ids(),
        vec![VALIDATOR_0]
    );
}

#[rstest]
#[tokio::test]
async fn stop_jobs_removes_exactly_the_named_ids(harness: Harness) {
    harness.start().await;

    harness
        .network
        .stop_jobs(
            &harness.orchestrator(),
            &[String::from(VALIDATOR_0), String::from("never-tracked")],
        )
        .await
        .expect("jobs stop");

    let state = harness.network.state().expect("state");
    let jobs = state.running_jobs.as_ref().expect("jobs");
    assert!(!jobs.contains(VALIDATOR_0));
    assert!(jobs.contains(VALIDATOR_1));
    assert!(jobs.contains(FULL_2));
}

#[rstest]
#[tokio::test]
async fn removing_a_node_stops_it_and_deletes_its_homes(harness: Harness) {
    harness.start().await;
    let node = harness
        .network
        .state()
        .expect("state")
        .generated_services
        .and_then(|services| services.node_sets.get(FULL_2).cloned())
        .expect("full node");

    let removed = harness
        .network
        .remove_node(&harness.orchestrator(), FULL_2)
        .await
        .expect("node removed");

    assert_eq!(removed, node);
    assert_eq!(harness.scheduler.deregistered(), vec![FULL_2]);
    for dir in node.home_dirs() {
        assert!(!files::exists(dir).expect("stat"));
    }
    let state = harness.network.state().expect("state");
    let services = state.generated_services.as_ref().expect("services");
    let indices: Vec<usize> = services.by_index().iter().map(|node| node.index).collect();
    assert_eq!(indices, vec![0, 1]);
    assert!(!state.running_jobs.as_ref().expect("jobs").contains(FULL_2));
}

#[rstest]
#[tokio::test]
async fn unknown_node_is_reported_by_name(harness: Harness) {
    harness.generate();

    let err = harness
        .network
        .stop_nodes(&harness.orchestrator(), &[String::from("ghost")])
        .await
        .expect_err("unknown node");

    assert!(matches!(err, NetworkError::UnknownNode { ref name } if name == "ghost"));
}

#[rstest]
#[tokio::test]
async fn job_file_is_started_under_its_file_stem(harness: Harness) {
    harness.generate();
    let path = harness.root.join("jobs/explorer.json");
    files::write(
        &path,
        r#"{"Job": {"ID": "ignored", "Name": "ignored",
            "TaskGroups": [{"Name": "g", "Tasks": [{"Name": "t", "Driver": "exec"}]}]}}"#,
    )
    .expect("job file written");

    let job_id = harness
        .network
        .start_job_file(&harness.orchestrator(), &path, None)
        .await
        .expect("job starts");

    assert_eq!(job_id, "explorer");
    assert_eq!(harness.scheduler.registered_job_ids(), vec!["explorer"]);
    let state = harness.network.state().expect("state");
    assert_eq!(
        state.running_jobs.as_ref().expect("jobs").extra_job_ids,
        ["explorer"].into_iter().map(String::from).collect()
    );
}

#[rstest]
#[tokio::test]
async fn logs_merge_every_running_job(harness: Harness) {
    harness.start().await;
    harness
        .scheduler
        .push_log("node0-app", LogStreamKind::Stdout, "ready\n");
    harness
        .scheduler
        .push_log("node2-app", LogStreamKind::Stderr, "syncing\n");

    let mut stream = harness
        .network
        .logs(
            &LogAggregator::new(&harness.scheduler),
            None,
            LogOptions {
                idle_timeout: Some(Duration::from_millis(200)),
                ..LogOptions::default()
            },
        )
        .await
        .expect("logs open");
    let mut out = Vec::new();
    stream.copy_to(&mut out).await.expect("logs copied");

    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains("node0-app: ready\n"));
    assert!(text.contains("node2-app: syncing\n"));
}

#[rstest]
#[tokio::test]
async fn logs_of_a_network_that_never_ran_are_refused(harness: Harness) {
    harness.generate();

    let err = harness
        .network
        .logs(
            &LogAggregator::new(&harness.scheduler),
            None,
            LogOptions::default(),
        )
        .await
        .expect_err("nothing to stream");

    assert!(matches!(err, NetworkError::NotRunning { .. }));
}

#[rstest]
#[tokio::test]
async fn failed_start_only_stops_jobs_it_registered(harness: Harness) {
    harness.generate();
    harness.scheduler.set_running(VALIDATOR_0);
    harness
        .scheduler
        .set_deployment(VALIDATOR_1, Some(DeploymentStatus::Failed));

    let err = harness
        .network
        .start(&harness.orchestrator())
        .await
        .expect_err("start fails");

    assert!(matches!(
        err,
        NetworkError::Orchestrator(OrchestratorError::DeploymentFailed { ref job_id, .. })
            if job_id == VALIDATOR_1
    ));
    let deregistered = harness.scheduler.deregistered();
    assert!(deregistered.iter().any(|job_id| job_id == VALIDATOR_1));
    assert!(!deregistered.iter().any(|job_id| job_id == VALIDATOR_0));
    assert!(
        !harness
            .scheduler
            .registered_job_ids()
            .iter()
            .any(|job_id| job_id == VALIDATOR_0)
    );
}

#[rstest]
#[tokio::test]
async fn unsafe_reset_all_wipes_consensus_then_app_state(harness: Harness) {
    harness.start().await;

    let output = harness
        .network
        .unsafe_reset_all(
            &RemoteExecutor::new(&harness.scheduler),
            &[String::from(VALIDATOR_1)],
        )
        .await
        .expect("reset runs");

    let calls = harness.scheduler.exec_calls();
    let subcommands: Vec<&str> = calls
        .iter()
        .filter_map(|call| call.command.get(1).map(String::as_str))
        .collect();
    assert_eq!(subcommands, vec!["unsafe-reset-all", "unsafe_reset_all"]);
    assert!(calls.iter().all(|call| call.alloc_id == format!("alloc-{VALIDATOR_1}")));
    assert_eq!(output.matches(&format!("--- {VALIDATOR_1} ---")).count(), 2);
}

#[rstest]
#[tokio::test]
async fn restore_checkpoint_resets_before_restoring(harness: Harness) {
    harness.start().await;

    let output = harness
        .network
        .restore_checkpoint(
            &RemoteExecutor::new(&harness.scheduler),
            Utf8Path::new("/checkpoints/height-100.cp"),
            &[String::from(VALIDATOR_0)],
        )
        .await
        .expect("restore runs");

    let calls = harness.scheduler.exec_calls();
    let subcommands: Vec<&str> = calls
        .iter()
        .filter_map(|call| call.command.get(1).map(String::as_str))
        .collect();
    assert_eq!(
        subcommands,
        vec!["unsafe-reset-all", "unsafe_reset_all", "restore-checkpoint"]
    );
    let restore = calls.last().expect("restore call");
    assert!(restore.command.ends_with(&[
        String::from("--checkpoint-file"),
        String::from("/checkpoints/height-100.cp"),
    ]));
    assert!(calls.iter().all(|call| call.alloc_id == format!("alloc-{VALIDATOR_0}")));
    assert_eq!(output.matches(&format!("--- {VALIDATOR_0} ---")).count(), 3);
}

#[rstest]
#[tokio::test]
async fn restore_checkpoint_rejects_unknown_nodes_before_running_anything(harness: Harness) {
    harness.start().await;

    let err = harness
        .network
        .restore_checkpoint(
            &RemoteExecutor::new(&harness.scheduler),
            Utf8Path::new("/checkpoints/height-100.cp"),
            &[String::from("missing")],
        )
        .await
        .expect_err("unknown node");

    assert!(matches!(err, NetworkError::UnknownNode { .. }));
    assert!(harness.scheduler.exec_calls().is_empty());
}
