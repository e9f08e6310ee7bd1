//! Log aggregation across every task of a set of jobs.
//!
//! [`fan_in`] merges any number of labelled item/error channel pairs into
//! one pair sharing a single cancellation. [`LogStream`] turns the merged
//! log frames back into pull-based reads with each line prefixed by the
//! task it came from.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::scheduler::{LogFrame, LogOrigin, LogRequest, LogStreamKind, Scheduler, SchedulerError};

const MERGED_CAPACITY: usize = 64;
const COPY_BUFFER: usize = 8 * 1024;

/// Errors raised while aggregating logs.
#[derive(Debug, Error)]
pub enum LogError {
    /// Raised when a job's allocations or log subscriptions cannot be
    /// obtained.
    #[error("failed to open logs for job {job_id}: {source}")]
    Subscribe {
        /// Job being read.
        job_id: String,
        /// Underlying failure.
        #[source]
        source: SchedulerError,
    },
    /// Raised when a subscription reports an error mid-stream.
    #[error("log stream failed: {0}")]
    Stream(#[source] SchedulerError),
    /// Raised when output cannot be written.
    #[error("failed to write logs: {message}")]
    Write {
        /// I/O error message.
        message: String,
    },
}

/// One channel pair to merge.
#[derive(Debug)]
pub struct Source<T, E> {
    /// Label attached to every item from this source.
    pub label: String,
    /// Items in emission order.
    pub items: mpsc::Receiver<T>,
    /// Errors raised by the source.
    pub errors: mpsc::Receiver<E>,
    /// Stops the source.
    pub cancel: CancellationToken,
}

/// Item tagged with the label of its source.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Labelled<T> {
    /// Source label.
    pub label: Arc<str>,
    /// Item as emitted by the source.
    pub item: T,
}

/// Merged view of several sources.
///
/// Both channels close once every source has closed or the merge is
/// cancelled. Dropping the merge cancels every source.
#[derive(Debug)]
pub struct Merged<T, E> {
    /// Items from every source. Each source's items keep their order.
    pub items: mpsc::Receiver<Labelled<T>>,
    /// Errors from every source.
    pub errors: mpsc::Receiver<E>,
    cancel: CancellationToken,
}

impl<T, E> Merged<T, E> {
    /// Cancels every source.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl<T, E> Drop for Merged<T, E> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Merges `sources` into one item channel and one error channel.
///
/// Must be called from within a Tokio runtime.
#[must_use]
pub fn fan_in<T, E>(sources: Vec<Source<T, E>>) -> Merged<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let (items_tx, items) = mpsc::channel(MERGED_CAPACITY);
    let (errors_tx, errors) = mpsc::channel(MERGED_CAPACITY);
    let cancel = CancellationToken::new();

    let source_tokens: Vec<CancellationToken> =
        sources.iter().map(|source| source.cancel.clone()).collect();
    let shared = cancel.clone();
    tokio::spawn(async move {
        shared.cancelled().await;
        for token in source_tokens {
            token.cancel();
        }
    });

    for source in sources {
        let label: Arc<str> = Arc::from(source.label);
        tokio::spawn(copy_items(
            source.items,
            items_tx.clone(),
            cancel.clone(),
            move |item| Labelled {
                label: Arc::clone(&label),
                item,
            },
        ));
        tokio::spawn(copy_items(
            source.errors,
            errors_tx.clone(),
            cancel.clone(),
            |error| error,
        ));
    }

    Merged {
        items,
        errors,
        cancel,
    }
}

async fn copy_items<A, B>(
    mut from: mpsc::Receiver<A>,
    to: mpsc::Sender<B>,
    cancel: CancellationToken,
    wrap: impl Fn(A) -> B,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            next = from.recv() => next,
        };
        let Some(value) = next else { break };
        if to.send(wrap(value)).await.is_err() {
            break;
        }
    }
}

/// Pull-based reader over merged log frames.
#[derive(Debug)]
pub struct LogStream {
    merged: Merged<LogFrame, SchedulerError>,
    pending: Vec<u8>,
    idle_timeout: Option<Duration>,
    frames_done: bool,
    errors_done: bool,
}

impl LogStream {
    /// Wraps merged frames. With `idle_timeout`, [`Self::read`] returns
    /// zero bytes after that long without output instead of waiting.
    #[must_use]
    pub const fn new(
        merged: Merged<LogFrame, SchedulerError>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            merged,
            pending: Vec::new(),
            idle_timeout,
            frames_done: false,
            errors_done: false,
        }
    }

    /// Returns `true` once every source has finished and all output has
    /// been read.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.frames_done && self.errors_done && self.pending.is_empty()
    }

    /// Reads prefixed log bytes into `buf`.
    ///
    /// Returns `Ok(0)` when the stream is finished or the idle timeout
    /// elapsed; use [`Self::is_finished`] to tell them apart.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Stream`] when a source reports an error.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LogError> {
        while self.pending.is_empty() && !(self.frames_done && self.errors_done) {
            let next = match self.idle_timeout {
                Some(idle) => match timeout(idle, self.next_event()).await {
                    Ok(event) => event,
                    Err(_) => return Ok(0),
                },
                None => self.next_event().await,
            };
            match next {
                Event::Frame(frame) => {
                    prefix_lines(&frame.label, &frame.item.data, &mut self.pending);
                }
                Event::Error(err) => return Err(LogError::Stream(err)),
                Event::FramesClosed => self.frames_done = true,
                Event::ErrorsClosed => self.errors_done = true,
            }
        }

        let count = buf.len().min(self.pending.len());
        if let (Some(target), Some(source)) = (buf.get_mut(..count), self.pending.get(..count)) {
            target.copy_from_slice(source);
        }
        self.pending.drain(..count);
        Ok(count)
    }

    async fn next_event(&mut self) -> Event {
        tokio::select! {
            frame = self.merged.items.recv(), if !self.frames_done => {
                frame.map_or(Event::FramesClosed, Event::Frame)
            }
            error = self.merged.errors.recv(), if !self.errors_done => {
                error.map_or(Event::ErrorsClosed, Event::Error)
            }
            else => Event::FramesClosed,
        }
    }

    /// Copies the stream into `out` until it finishes, flushing after each
    /// chunk, and returns the number of bytes written. Idle timeouts are
    /// skipped over.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] when a source fails or `out` cannot be written.
    pub async fn copy_to<W: Write>(&mut self, out: &mut W) -> Result<u64, LogError> {
        let mut buf = vec![0_u8; COPY_BUFFER];
        let mut written = 0_u64;
        loop {
            let count = self.read(&mut buf).await?;
            if count == 0 {
                if self.is_finished() {
                    break;
                }
                continue;
            }
            let chunk = buf.get(..count).unwrap_or_default();
            out.write_all(chunk)
                .and_then(|()| out.flush())
                .map_err(|err| LogError::Write {
                    message: err.to_string(),
                })?;
            written += count as u64;
        }
        Ok(written)
    }

    /// Cancels every underlying subscription.
    pub fn close(&self) {
        self.merged.close();
    }
}

enum Event {
    Frame(Labelled<LogFrame>),
    Error(SchedulerError),
    FramesClosed,
    ErrorsClosed,
}

fn prefix_lines(label: &str, data: &[u8], out: &mut Vec<u8>) {
    for line in data.split_inclusive(|byte| *byte == b'\n') {
        out.extend_from_slice(label.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(line);
    }
}

/// Options applied to every subscription of a [`LogAggregator`] call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LogOptions {
    /// Keep following new output.
    pub follow: bool,
    /// Reference point for `offset`.
    pub origin: LogOrigin,
    /// Byte offset relative to `origin`.
    pub offset: u64,
    /// Return from reads after this long without output.
    pub idle_timeout: Option<Duration>,
}

/// Opens merged log streams for jobs.
pub struct LogAggregator<'a, S: Scheduler + ?Sized> {
    scheduler: &'a S,
}

impl<'a, S: Scheduler + ?Sized> LogAggregator<'a, S> {
    /// Creates an aggregator.
    #[must_use]
    pub const fn new(scheduler: &'a S) -> Self {
        Self { scheduler }
    }

    /// Subscribes to stdout and stderr of every task in every allocation of
    /// `job_ids` and merges them into one stream.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Subscribe`] when any job's allocations or any
    /// subscription cannot be opened; subscriptions already opened are
    /// cancelled.
    pub async fn log_jobs(
        &self,
        job_ids: &[String],
        options: LogOptions,
    ) -> Result<LogStream, LogError> {
        let mut requests = Vec::new();
        for job_id in job_ids {
            let allocations = self
                .scheduler
                .job_allocations(job_id)
                .await
                .map_err(|source| LogError::Subscribe {
                    job_id: job_id.clone(),
                    source,
                })?;
            for allocation in allocations {
                for task in allocation.task_states.keys() {
                    for stream in LogStreamKind::ALL {
                        requests.push((
                            job_id,
                            LogRequest {
                                alloc_id: allocation.id.clone(),
                                task: task.clone(),
                                stream,
                                follow: options.follow,
                                origin: options.origin,
                                offset: options.offset,
                            },
                        ));
                    }
                }
            }
        }

        let opened = join_all(requests.into_iter().map(|(job_id, request)| async move {
            let label = request.task.clone();
            let result = self.scheduler.follow_logs(request).await;
            (job_id, label, result)
        }))
        .await;

        let mut sources = Vec::with_capacity(opened.len());
        let mut failure = None;
        for (job_id, label, result) in opened {
            match result {
                Ok(subscription) => sources.push(Source {
                    label,
                    items: subscription.frames,
                    errors: subscription.errors,
                    cancel: subscription.cancel,
                }),
                Err(source) => {
                    failure.get_or_insert(LogError::Subscribe {
                        job_id: job_id.clone(),
                        source,
                    });
                }
            }
        }
        if let Some(err) = failure {
            for source in &sources {
                source.cancel.cancel();
            }
            return Err(err);
        }

        info!(jobs = job_ids.len(), subscriptions = sources.len(), "following logs");
        debug!(follow = options.follow, origin = options.origin.as_str(), "log options");
        Ok(LogStream::new(fan_in(sources), options.idle_timeout))
    }
}
