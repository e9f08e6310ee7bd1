//! Nomad HTTP API client.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    Allocation, Deployment, ExecOutput, JobSummary, LogFrame, LogRequest, LogSubscription,
    Scheduler, SchedulerError, SchedulerFuture,
};
use crate::jobspec::Job;

const TOKEN_HEADER: &str = "X-Nomad-Token";
const LOG_CHANNEL_CAPACITY: usize = 64;

/// Scheduler backed by a Nomad agent.
#[derive(Clone, Debug)]
pub struct NomadClient {
    http: reqwest::Client,
    address: String,
    token: Option<String>,
    nomad_bin: String,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    #[serde(rename = "Job")]
    job: &'a Job,
}

#[derive(Debug, Deserialize)]
struct JobInfo {
    #[serde(rename = "Status")]
    status: String,
}

impl NomadClient {
    /// Connects to the agent at `address`, checking reachability once.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Connection`] when the agent does not answer.
    pub async fn connect(
        address: &str,
        token: Option<String>,
        nomad_bin: &str,
    ) -> Result<Self, SchedulerError> {
        let client = Self {
            http: reqwest::Client::new(),
            address: address.trim_end_matches('/').to_owned(),
            token,
            nomad_bin: nomad_bin.to_owned(),
        };
        let connection_error = |message: String| SchedulerError::Connection {
            address: client.address.clone(),
            message,
        };
        let response = client
            .request(Method::GET, "/v1/agent/self")
            .send()
            .await
            .map_err(|err| connection_error(err.to_string()))?;
        if !response.status().is_success() {
            return Err(connection_error(format!(
                "agent answered with status {}",
                response.status()
            )));
        }
        info!(address = %client.address, "connected to nomad");
        Ok(client)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.address));
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }

    async fn send(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<Response, SchedulerError> {
        let response = builder
            .send()
            .await
            .map_err(|err| request_error(operation, &err))?;
        check_status(operation, response).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<T, SchedulerError> {
        let response = self.send(operation, builder).await?;
        response.json().await.map_err(|err| SchedulerError::Decode {
            operation: operation.to_owned(),
            message: err.to_string(),
        })
    }
}

fn request_error(operation: &str, err: &reqwest::Error) -> SchedulerError {
    SchedulerError::Request {
        operation: operation.to_owned(),
        message: err.to_string(),
    }
}

async fn check_status(operation: &str, response: Response) -> Result<Response, SchedulerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SchedulerError::Status {
        operation: operation.to_owned(),
        status: status.as_u16(),
        body: body.trim().to_owned(),
    })
}

fn is_not_found(err: &SchedulerError) -> bool {
    matches!(
        err,
        SchedulerError::Status { status, .. } if *status == StatusCode::NOT_FOUND.as_u16()
    )
}

impl Scheduler for NomadClient {
    fn register_job<'a>(&'a self, job: &'a Job) -> SchedulerFuture<'a, ()> {
        Box::pin(async move {
            let operation = format!("register {}", job.id);
            self.send(
                &operation,
                self.request(Method::POST, "/v1/jobs")
                    .json(&RegisterRequest { job }),
            )
            .await?;
            debug!(job_id = %job.id, "job registered");
            Ok(())
        })
    }

    fn job_status<'a>(&'a self, job_id: &'a str) -> SchedulerFuture<'a, Option<String>> {
        Box::pin(async move {
            let operation = format!("status {job_id}");
            let result: Result<JobInfo, SchedulerError> = self
                .send_json(
                    &operation,
                    self.request(Method::GET, &format!("/v1/job/{job_id}")),
                )
                .await;
            match result {
                Ok(info) => Ok(Some(info.status)),
                Err(err) if is_not_found(&err) => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    fn list_jobs(&self) -> SchedulerFuture<'_, Vec<JobSummary>> {
        Box::pin(async move {
            self.send_json("list jobs", self.request(Method::GET, "/v1/jobs"))
                .await
        })
    }

    fn deregister_job<'a>(&'a self, job_id: &'a str, purge: bool) -> SchedulerFuture<'a, ()> {
        Box::pin(async move {
            let operation = format!("deregister {job_id}");
            let result = self
                .send(
                    &operation,
                    self.request(Method::DELETE, &format!("/v1/job/{job_id}"))
                        .query(&[("purge", purge)]),
                )
                .await;
            match result {
                Ok(_) => Ok(()),
                Err(err) if is_not_found(&err) => {
                    debug!(job_id, "job already gone");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        })
    }

    fn latest_deployment<'a>(
        &'a self,
        job_id: &'a str,
    ) -> SchedulerFuture<'a, Option<Deployment>> {
        Box::pin(async move {
            self.send_json(
                &format!("deployment {job_id}"),
                self.request(Method::GET, &format!("/v1/job/{job_id}/deployment")),
            )
            .await
        })
    }

    fn job_allocations<'a>(&'a self, job_id: &'a str) -> SchedulerFuture<'a, Vec<Allocation>> {
        Box::pin(async move {
            self.send_json(
                &format!("allocations {job_id}"),
                self.request(Method::GET, &format!("/v1/job/{job_id}/allocations")),
            )
            .await
        })
    }

    fn follow_logs(&self, request: LogRequest) -> SchedulerFuture<'_, LogSubscription> {
        Box::pin(async move {
            let operation = format!(
                "logs {}/{}/{}",
                request.alloc_id,
                request.task,
                request.stream.as_str()
            );
            let offset = request.offset.to_string();
            let follow = if request.follow { "true" } else { "false" };
            let response = self
                .send(
                    &operation,
                    self.request(
                        Method::GET,
                        &format!("/v1/client/fs/logs/{}", request.alloc_id),
                    )
                    .query(&[
                        ("task", request.task.as_str()),
                        ("type", request.stream.as_str()),
                        ("follow", follow),
                        ("origin", request.origin.as_str()),
                        ("offset", offset.as_str()),
                    ]),
                )
                .await?;

            let (frames_tx, frames) = mpsc::channel(LOG_CHANNEL_CAPACITY);
            let (errors_tx, errors) = mpsc::channel(1);
            let cancel = CancellationToken::new();
            tokio::spawn(pump_frames(
                response,
                frames_tx,
                errors_tx,
                cancel.clone(),
                operation,
            ));
            Ok(LogSubscription {
                frames,
                errors,
                cancel,
            })
        })
    }

    fn exec<'a>(
        &'a self,
        alloc_id: &'a str,
        task: &'a str,
        command: &'a [String],
    ) -> SchedulerFuture<'a, ExecOutput> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.nomad_bin);
            cmd.arg("alloc")
                .arg("exec")
                .arg(format!("-address={}", self.address))
                .arg(format!("-task={task}"))
                .arg("-i=false")
                .arg("-t=false")
                .arg(alloc_id)
                .args(command);
            if let Some(token) = &self.token {
                cmd.env("NOMAD_TOKEN", token);
            }
            let output = cmd.output().await.map_err(|err| SchedulerError::Exec {
                alloc_id: alloc_id.to_owned(),
                message: err.to_string(),
            })?;
            Ok(ExecOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn garbage_collect(&self) -> SchedulerFuture<'_, ()> {
        Box::pin(async move {
            self.send("garbage collect", self.request(Method::PUT, "/v1/system/gc"))
                .await?;
            Ok(())
        })
    }
}

async fn pump_frames(
    response: Response,
    frames: mpsc::Sender<LogFrame>,
    errors: mpsc::Sender<SchedulerError>,
    cancel: CancellationToken,
    operation: String,
) {
    let mut body = response.bytes_stream();
    let mut decoder = FrameDecoder::new(operation.clone());
    loop {
        let chunk = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            chunk = body.next() => chunk,
        };
        match chunk {
            None => return,
            Some(Err(err)) => {
                errors.send(request_error(&operation, &err)).await.ok();
                return;
            }
            Some(Ok(bytes)) => match decoder.push(&bytes) {
                Ok(decoded) => {
                    for frame in decoded {
                        if frames.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    errors.send(err).await.ok();
                    return;
                }
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "Data", default)]
    data: Option<String>,
    #[serde(rename = "Offset", default)]
    offset: u64,
}

/// Incremental decoder for the scheduler's framed log stream.
///
/// The stream is a sequence of concatenated JSON objects carrying base64
/// `Data`. Objects may be split across network chunks; incomplete trailing
/// input is kept until the next push. Heartbeat frames without data are
/// dropped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    operation: String,
}

impl FrameDecoder {
    /// Creates a decoder; `operation` labels decode errors.
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            buffer: Vec::new(),
            operation: operation.into(),
        }
    }

    /// Feeds `chunk` and returns every frame completed by it.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Decode`] on malformed JSON or base64.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<LogFrame>, SchedulerError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut stream = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<RawFrame>();
        let mut consumed = 0;
        loop {
            match stream.next() {
                Some(Ok(raw)) => {
                    consumed = stream.byte_offset();
                    if let Some(frame) = self.decode(raw)? {
                        frames.push(frame);
                    }
                }
                Some(Err(err)) if err.is_eof() => break,
                Some(Err(err)) => {
                    return Err(SchedulerError::Decode {
                        operation: self.operation.clone(),
                        message: err.to_string(),
                    });
                }
                None => {
                    consumed = stream.byte_offset();
                    break;
                }
            }
        }
        self.buffer.drain(..consumed);
        Ok(frames)
    }

    fn decode(&self, raw: RawFrame) -> Result<Option<LogFrame>, SchedulerError> {
        let Some(data) = raw.data.filter(|data| !data.is_empty()) else {
            return Ok(None);
        };
        let bytes = STANDARD
            .decode(data.as_bytes())
            .map_err(|err| SchedulerError::Decode {
                operation: self.operation.clone(),
                message: err.to_string(),
            })?;
        Ok(Some(LogFrame {
            offset: raw.offset,
            data: bytes.into(),
        }))
    }
}
