//! Readiness probes for pre-start jobs.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

const PROBE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const PROBE_WAIT_TIMEOUT: Duration = Duration::from_secs(120);
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// A readiness check against a service started by a pre-start job.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Probe {
    /// Passes once a TCP connection to `address` succeeds.
    Tcp {
        /// `host:port` to connect to.
        address: String,
    },
    /// Passes once a GET of `url` returns a success status.
    Http {
        /// URL to request.
        url: String,
    },
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { address } => write!(f, "tcp://{address}"),
            Self::Http { url } => f.write_str(url),
        }
    }
}

/// Raised when a probe never passes.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("probe {probe} did not pass within {waited_secs} seconds: {last_error}")]
pub struct ProbeError {
    /// Rendered probe target.
    pub probe: String,
    /// How long the probe was retried.
    pub waited_secs: u64,
    /// Last failure observed.
    pub last_error: String,
}

/// Polls probes until they pass or a deadline elapses.
#[derive(Clone, Debug)]
pub struct ProbeRunner {
    http: reqwest::Client,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl Default for ProbeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeRunner {
    /// Creates a runner with the default cadence.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            poll_interval: PROBE_POLL_INTERVAL,
            wait_timeout: PROBE_WAIT_TIMEOUT,
        }
    }

    /// Overrides the polling interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the overall deadline.
    #[must_use]
    pub const fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Retries `probe` until it passes.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] when the deadline elapses first.
    pub async fn wait_ready(&self, probe: &Probe) -> Result<(), ProbeError> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut last_error = String::from("probe never attempted");

        while Instant::now() <= deadline {
            match self.attempt(probe).await {
                Ok(()) => {
                    info!(probe = %probe, "probe passed");
                    return Ok(());
                }
                Err(err) => {
                    debug!(probe = %probe, error = %err, "probe not ready yet");
                    last_error = err;
                }
            }
            sleep(self.poll_interval).await;
        }

        Err(ProbeError {
            probe: probe.to_string(),
            waited_secs: self.wait_timeout.as_secs(),
            last_error,
        })
    }

    async fn attempt(&self, probe: &Probe) -> Result<(), String> {
        match probe {
            Probe::Tcp { address } => {
                match timeout(ATTEMPT_TIMEOUT, TcpStream::connect(address.as_str())).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(_) => Err(String::from("connection attempt timed out")),
                }
            }
            Probe::Http { url } => {
                let response = self
                    .http
                    .get(url)
                    .timeout(ATTEMPT_TIMEOUT)
                    .send()
                    .await
                    .map_err(|err| err.to_string())?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(format!("status {}", response.status()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::net::TcpListener;

    #[rstest]
    #[tokio::test]
    async fn tcp_probe_passes_against_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();

        let runner = ProbeRunner::new()
            .with_poll_interval(Duration::from_millis(10))
            .with_wait_timeout(Duration::from_secs(2));

        runner
            .wait_ready(&Probe::Tcp { address })
            .await
            .expect("probe should pass");
    }

    #[rstest]
    #[tokio::test]
    async fn tcp_probe_times_out_against_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let runner = ProbeRunner::new()
            .with_poll_interval(Duration::from_millis(10))
            .with_wait_timeout(Duration::from_millis(50));

        let err = runner
            .wait_ready(&Probe::Tcp {
                address: address.clone(),
            })
            .await
            .expect_err("closed port never passes");

        assert_eq!(err.probe, format!("tcp://{address}"));
    }

    #[rstest]
    fn probes_deserialize_from_tagged_tables() {
        let probe: Probe =
            serde_json::from_str(r#"{"type":"http","url":"http://localhost:3000/health"}"#)
                .expect("probe parses");

        assert_eq!(
            probe,
            Probe::Http {
                url: String::from("http://localhost:3000/health")
            }
        );
    }
}
