//! Unit tests for job orchestration.

use super::*;
use crate::probes::Probe;
use crate::test_support::{
    FakeScheduler, allocation, docker_job, sample_network_config, sample_services,
};
use crate::types::WalletService;
use camino::Utf8PathBuf;
use rstest::rstest;

const VALIDATOR_0: &str = "testnet-nodeset-validators-0-validator";
const FULL_2: &str = "testnet-nodeset-full-2-full";

fn orchestrator(scheduler: &FakeScheduler) -> JobOrchestrator<'_, FakeScheduler> {
    JobOrchestrator::new(scheduler)
        .with_poll_interval(Duration::from_millis(5))
        .with_liveness_interval(Duration::from_millis(40))
        .with_probe_runner(
            ProbeRunner::new()
                .with_poll_interval(Duration::from_millis(5))
                .with_wait_timeout(Duration::from_millis(50)),
        )
}

fn register_calls(scheduler: &FakeScheduler) -> Vec<String> {
    scheduler
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("register "))
        .collect()
}

#[tokio::test]
async fn start_network_submits_every_job_and_tracks_it() {
    let scheduler = FakeScheduler::new();
    let config = sample_network_config();
    let mut services = sample_services();
    services.wallet = Some(WalletService {
        name: String::from("testnet-wallet"),
        binary: String::from("vegawallet"),
        home_dir: Utf8PathBuf::from("/tmp/capsule/testnet/wallet"),
        config_path: Utf8PathBuf::from("/tmp/capsule/testnet/wallet/config.toml"),
    });

    let jobs = orchestrator(&scheduler)
        .start_network(&config, &services)
        .await
        .expect("network starts");

    assert_eq!(jobs.node_set_job_ids.len(), 3);
    assert_eq!(jobs.wallet_job_id.as_deref(), Some("testnet-wallet"));
    assert!(jobs.faucet_job_id.is_none());
    let mut registered = scheduler.registered_job_ids();
    registered.sort();
    let mut expected = jobs.all_job_ids();
    expected.sort();
    assert_eq!(registered, expected);
}

#[tokio::test]
async fn running_job_is_not_registered_again() {
    let scheduler = FakeScheduler::new();
    scheduler.set_running(VALIDATOR_0);
    let config = sample_network_config();

    orchestrator(&scheduler)
        .start_network(&config, &sample_services())
        .await
        .expect("network starts");

    assert!(!register_calls(&scheduler).contains(&format!("register {VALIDATOR_0}")));
    assert_eq!(register_calls(&scheduler).len(), 2);
}

#[tokio::test]
async fn failed_pre_start_job_blocks_every_later_phase() {
    let scheduler = FakeScheduler::new();
    scheduler.fail_registration("postgres");
    let mut config = sample_network_config();
    config.pre_start = vec![docker_job("postgres")];

    let err = orchestrator(&scheduler)
        .start_network(&config, &sample_services())
        .await
        .expect_err("pre-start fails");

    assert!(matches!(
        err,
        OrchestratorError::PreStartFailed { ref job_id, .. } if job_id == "postgres"
    ));
    assert_eq!(register_calls(&scheduler), vec![String::from("register postgres")]);
}

#[tokio::test]
async fn failing_probe_blocks_node_jobs() {
    let scheduler = FakeScheduler::new();
    let mut config = sample_network_config();
    let mut postgres = docker_job("postgres");
    postgres.probes = vec![Probe::Tcp {
        address: String::from("127.0.0.1:1"),
    }];
    config.pre_start = vec![postgres];

    let err = orchestrator(&scheduler)
        .start_network(&config, &sample_services())
        .await
        .expect_err("probe fails");

    assert!(matches!(err, OrchestratorError::Probe(_)));
    assert_eq!(scheduler.registered_job_ids(), vec![String::from("postgres")]);
}

#[rstest]
#[case(DeploymentStatus::Canceled, "canceled")]
#[case(DeploymentStatus::Failed, "failed")]
#[tokio::test]
async fn terminal_deployment_is_a_failure(
    #[case] status: DeploymentStatus,
    #[case] rendered: &str,
) {
    let scheduler = FakeScheduler::new();
    scheduler.set_deployment(FULL_2, Some(status));

    let err = orchestrator(&scheduler)
        .start_network(&sample_network_config(), &sample_services())
        .await
        .expect_err("deployment fails");

    assert!(matches!(
        err,
        OrchestratorError::DeploymentFailed { ref job_id, ref status, .. }
            if job_id == FULL_2 && status == rendered
    ));
}

#[tokio::test]
async fn job_without_deployment_settles_once_allocations_run() {
    let scheduler = FakeScheduler::new();
    scheduler.set_deployment(FULL_2, None);

    let jobs = orchestrator(&scheduler)
        .start_network(&sample_network_config(), &sample_services())
        .await
        .expect("network starts");

    assert!(jobs.contains(FULL_2));
    assert!(scheduler.calls().contains(&format!("allocations {FULL_2}")));
}

#[tokio::test]
async fn job_with_no_started_task_times_out() {
    let scheduler = FakeScheduler::new();
    scheduler.set_deployment(FULL_2, Some(DeploymentStatus::Running));
    scheduler.set_allocations(
        FULL_2,
        vec![allocation("a1", FULL_2, "pending", &["node2-app"], "pending", &["Received"])],
    );

    let err = orchestrator(&scheduler)
        .start_network(&sample_network_config(), &sample_services())
        .await
        .expect_err("job is stuck");

    assert!(matches!(err, OrchestratorError::JobTimeout { ref job_id } if job_id == FULL_2));
}

#[rstest]
#[case(&["Received", "Downloading Artifacts"], true)]
#[case(&["Received", "Started"], true)]
#[case(&["Received", "Task Setup"], false)]
#[tokio::test]
async fn liveness_heuristic_distinguishes_slow_from_stuck(
    #[case] events: &[&str],
    #[case] alive: bool,
) {
    let scheduler = FakeScheduler::new();
    scheduler.set_allocations(
        "job",
        vec![allocation("a1", "job", "pending", &["task"], "pending", events)],
    );

    let result = orchestrator(&scheduler).assess_liveness("job").await;

    assert_eq!(result.is_ok(), alive);
}

#[tokio::test]
async fn cancellation_fails_the_wait_as_a_timeout() {
    let scheduler = FakeScheduler::new();
    scheduler.set_deployment(FULL_2, Some(DeploymentStatus::Running));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = orchestrator(&scheduler)
        .with_cancellation(cancel)
        .start_network(&sample_network_config(), &sample_services())
        .await
        .expect_err("cancelled");

    assert!(matches!(err, OrchestratorError::JobTimeout { .. }));
}

#[tokio::test]
async fn stopping_an_untracked_network_only_collects_garbage() {
    let scheduler = FakeScheduler::new();

    let outcome = orchestrator(&scheduler).stop_network(None, false).await;

    assert!(outcome.stopped.is_empty());
    assert!(outcome.into_result().is_ok());
    assert_eq!(scheduler.calls(), vec![String::from("gc")]);
}

#[tokio::test]
async fn stopping_an_empty_network_only_collects_garbage() {
    let scheduler = FakeScheduler::new();

    let outcome = orchestrator(&scheduler)
        .stop_network(Some(&NetworkJobs::default()), false)
        .await;

    assert!(outcome.into_result().is_ok());
    assert_eq!(scheduler.calls(), vec![String::from("gc")]);
}

#[tokio::test]
async fn nodes_only_stop_leaves_services_running() {
    let scheduler = FakeScheduler::new();
    let mut jobs = NetworkJobs::default();
    jobs.add_node_set_job(VALIDATOR_0);
    jobs.set_wallet_job("testnet-wallet");
    jobs.add_extra_job("postgres");

    let outcome = orchestrator(&scheduler).stop_network(Some(&jobs), true).await;

    assert_eq!(outcome.stopped, vec![String::from(VALIDATOR_0)]);
    assert_eq!(scheduler.deregistered(), vec![String::from(VALIDATOR_0)]);
    assert_eq!(scheduler.gc_calls(), 0);
}

#[tokio::test]
async fn stop_jobs_skips_empty_ids_and_reports_every_failure() {
    let scheduler = FakeScheduler::new();
    scheduler.fail_deregistration("bad");
    let ids = vec![
        String::new(),
        String::from("good"),
        String::from("bad"),
    ];

    let outcome = orchestrator(&scheduler).stop_jobs(&ids).await;

    assert_eq!(outcome.stopped, vec![String::from("good")]);
    assert_eq!(outcome.failed.len(), 1);
    assert!(!scheduler.calls().iter().any(|call| call == "deregister "));
    let err = outcome.into_result().expect_err("one failure");
    assert!(err.to_string().contains("bad"));
}
