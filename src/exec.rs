//! Runs commands inside node allocations through the remote command runner
//! sidecar.

use thiserror::Error;
use tracing::info;

use crate::scheduler::{Scheduler, SchedulerError};
use crate::template::{TemplateError, render_command_fragment};
use crate::types::{NodeSet, RemoteCommandRunner};

/// Errors raised while executing remote commands.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Raised when a target node has no remote command runner.
    #[error("node {node} has no remote command runner")]
    MissingRunner {
        /// Node name.
        node: String,
    },
    /// Raised when no live allocation runs the node's runner task.
    #[error("no running allocation of job {job_id} runs task {task}")]
    NoRunningAllocation {
        /// Job backing the node.
        job_id: String,
        /// Runner task name.
        task: String,
    },
    /// Raised when the command cannot be adapted to a node.
    #[error("failed to render command for {node}: {source}")]
    Template {
        /// Node name.
        node: String,
        /// Underlying failure.
        #[source]
        source: TemplateError,
    },
    /// Raised when the scheduler call fails.
    #[error("remote execution on {node} failed: {source}")]
    Scheduler {
        /// Node name.
        node: String,
        /// Underlying failure.
        #[source]
        source: SchedulerError,
    },
    /// Raised when the command exits unsuccessfully.
    #[error("command on {node} exited with status {exit_code}: {stderr}")]
    CommandFailed {
        /// Node name.
        node: String,
        /// Exit code.
        exit_code: i32,
        /// Captured standard error.
        stderr: String,
    },
}

/// Executes one logical command on several nodes.
pub struct RemoteExecutor<'a, S: Scheduler + ?Sized> {
    scheduler: &'a S,
}

impl<'a, S: Scheduler + ?Sized> RemoteExecutor<'a, S> {
    /// Creates an executor.
    #[must_use]
    pub const fn new(scheduler: &'a S) -> Self {
        Self { scheduler }
    }

    /// Runs `binary` with `args` on every node in turn and returns the
    /// combined output, one `--- <node> ---` section per node.
    ///
    /// `binary` and `args` may reference the node's runner variables such
    /// as `{{ app_home }}`. Every node must carry a remote command runner;
    /// this is checked before anything runs.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] for the first node that fails.
    pub async fn execute(
        &self,
        binary: &str,
        args: &[String],
        nodes: &[&NodeSet],
    ) -> Result<String, ExecError> {
        let targets = nodes
            .iter()
            .map(|node| {
                node.remote_command_runner
                    .as_ref()
                    .map(|runner| (*node, runner))
                    .ok_or_else(|| ExecError::MissingRunner {
                        node: node.name.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut combined = String::new();
        for (node, runner) in targets {
            let output = self.execute_on(binary, args, node, runner).await?;
            combined.push_str(&format!("--- {} ---\n", node.name));
            combined.push_str(&output);
        }
        Ok(combined)
    }

    async fn execute_on(
        &self,
        binary: &str,
        args: &[String],
        node: &NodeSet,
        runner: &RemoteCommandRunner,
    ) -> Result<String, ExecError> {
        let render = |fragment: &str| {
            render_command_fragment(fragment, &runner.vars).map_err(|source| ExecError::Template {
                node: node.name.clone(),
                source,
            })
        };
        let mut command = vec![render(binary)?];
        for arg in args {
            command.push(render(arg)?);
        }

        let scheduler_error = |source| ExecError::Scheduler {
            node: node.name.clone(),
            source,
        };
        let allocations = self
            .scheduler
            .job_allocations(node.job_id())
            .await
            .map_err(scheduler_error)?;
        let allocation = allocations
            .iter()
            .find(|allocation| {
                allocation.is_running() && allocation.task_running(&runner.task_name)
            })
            .ok_or_else(|| ExecError::NoRunningAllocation {
                job_id: node.job_id().to_owned(),
                task: runner.task_name.clone(),
            })?;

        info!(
            node = %node.name,
            alloc_id = %allocation.id,
            command = %command.join(" "),
            "executing remote command"
        );
        let output = self
            .scheduler
            .exec(&allocation.id, &runner.task_name, &command)
            .await
            .map_err(scheduler_error)?;
        if output.exit_code != 0 {
            return Err(ExecError::CommandFailed {
                node: node.name.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        let mut text = output.stdout;
        text.push_str(&output.stderr);
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobspec::JobBuilder;
    use crate::scheduler::ExecOutput;
    use crate::test_support::{FakeScheduler, allocation, sample_network_config, sample_node_set};
    use crate::types::NodeMode;

    async fn running_nodes(scheduler: &FakeScheduler) -> Vec<NodeSet> {
        let config = sample_network_config();
        let builder = JobBuilder::new(&config);
        let nodes = vec![
            sample_node_set("testnet", "validators", 0, NodeMode::Validator),
            sample_node_set("testnet", "full", 1, NodeMode::Full),
        ];
        for node in &nodes {
            let job = builder.node(node).expect("job");
            scheduler.register_job(&job).await.expect("register");
        }
        nodes
    }

    #[tokio::test]
    async fn command_is_rendered_per_node_and_run_serially() {
        let scheduler = FakeScheduler::new();
        let nodes = running_nodes(&scheduler).await;
        let targets: Vec<&NodeSet> = nodes.iter().collect();
        let args = vec![
            String::from("unsafe-reset-all"),
            String::from("--home"),
            String::from("{{ consensus_home }}"),
        ];

        let output = RemoteExecutor::new(&scheduler)
            .execute("{{ consensus_binary }}", &args, &targets)
            .await
            .expect("exec succeeds");

        let calls = scheduler.exec_calls();
        assert_eq!(calls.len(), 2);
        for (call, node) in calls.iter().zip(&nodes) {
            assert_eq!(call.alloc_id, format!("alloc-{}", node.job_id()));
            assert_eq!(call.task, "remote-command-runner");
            assert_eq!(
                call.command,
                vec![
                    String::from("tendermint"),
                    String::from("unsafe-reset-all"),
                    String::from("--home"),
                    node.consensus.home_dir.to_string(),
                ]
            );
        }
        let expected: String = nodes
            .iter()
            .map(|node| format!("--- {} ---\nok\n", node.name))
            .collect();
        assert_eq!(output, expected);
    }

    #[tokio::test]
    async fn every_node_needs_a_runner_before_anything_runs() {
        let scheduler = FakeScheduler::new();
        let mut nodes = running_nodes(&scheduler).await;
        if let Some(node) = nodes.last_mut() {
            node.remote_command_runner = None;
        }
        let targets: Vec<&NodeSet> = nodes.iter().collect();

        let err = RemoteExecutor::new(&scheduler)
            .execute("true", &[], &targets)
            .await
            .expect_err("runner missing");

        assert!(matches!(err, ExecError::MissingRunner { .. }));
        assert!(scheduler.exec_calls().is_empty());
    }

    #[tokio::test]
    async fn failed_runner_task_is_not_targeted() {
        let scheduler = FakeScheduler::new();
        let nodes = running_nodes(&scheduler).await;
        let node = nodes.first().expect("node");
        scheduler.set_allocations(
            node.job_id(),
            vec![allocation(
                "a1",
                node.job_id(),
                "running",
                &["remote-command-runner"],
                "dead",
                &["Terminated"],
            )],
        );

        let err = RemoteExecutor::new(&scheduler)
            .execute("true", &[], &[node])
            .await
            .expect_err("no live runner");

        assert!(matches!(
            err,
            ExecError::NoRunningAllocation { ref task, .. } if task == "remote-command-runner"
        ));
    }

    #[tokio::test]
    async fn non_zero_exit_names_the_node() {
        let scheduler = FakeScheduler::new();
        let nodes = running_nodes(&scheduler).await;
        scheduler.push_exec_output(ExecOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: String::from("permission denied"),
        });
        let node = nodes.first().expect("node");

        let err = RemoteExecutor::new(&scheduler)
            .execute("rm", &[String::from("-rf"), String::from("{{ app_home }}")], &[node])
            .await
            .expect_err("command fails");

        assert!(matches!(
            err,
            ExecError::CommandFailed { ref node, exit_code: 2, ref stderr }
                if node == "testnet-nodeset-validators-0-validator" && stderr == "permission denied"
        ));
    }

    #[tokio::test]
    async fn unknown_variable_is_a_template_error() {
        let scheduler = FakeScheduler::new();
        let nodes = running_nodes(&scheduler).await;
        let node = nodes.first().expect("node");

        let err = RemoteExecutor::new(&scheduler)
            .execute("{{ nope }}", &[], &[node])
            .await
            .expect_err("unknown variable");

        assert!(matches!(err, ExecError::Template { .. }));
    }
}
