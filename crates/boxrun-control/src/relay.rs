//! Log relay.
//!
//! Forwards a daemon's `StreamLogs` output to a [`LogSink`] one event at a
//! time, in the order it was received. Nothing is buffered, reordered or
//! deduplicated.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use boxrun_core::{LogEvent, SandboxRecord, TaskId};
use boxrun_proto::pb::{LogEntry, StreamLogsRequest};

use crate::backend::SandboxBackend;
use crate::connector::{deadline_exceeded, DaemonConnector};
use crate::error::ControlError;

/// Receives relayed events.
#[async_trait]
pub trait LogSink: Send {
    async fn send(&mut self, event: LogEvent) -> Result<(), SinkError>;
}

/// A sink refused an event.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

#[async_trait]
impl LogSink for mpsc::Sender<LogEvent> {
    async fn send(&mut self, event: LogEvent) -> Result<(), SinkError> {
        mpsc::Sender::send(self, event)
            .await
            .map_err(|_| SinkError("receiver dropped".to_string()))
    }
}

/// Sink backed by a synchronous callback, e.g. printing to a terminal.
pub struct FnSink<F>(pub F);

#[async_trait]
impl<F> LogSink for FnSink<F>
where
    F: FnMut(LogEvent) -> std::io::Result<()> + Send,
{
    async fn send(&mut self, event: LogEvent) -> Result<(), SinkError> {
        (self.0)(event).map_err(|e| SinkError(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    /// The stream could not be opened.
    #[error(transparent)]
    Open(#[from] ControlError),

    /// The sink failed; the relay stopped at once.
    #[error("log sink failed: {0}")]
    Sink(#[source] SinkError),
}

/// How a relay ended. `forwarded` counts upstream events delivered to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The task's completion event was forwarded.
    Completed {
        forwarded: usize,
        status: Option<String>,
    },
    /// The daemon closed the stream without a completion event.
    EndOfStream { forwarded: usize },
    /// The stream broke; one synthetic error event was forwarded.
    TransportError { forwarded: usize, message: String },
}

impl RelayOutcome {
    pub fn forwarded(&self) -> usize {
        match self {
            Self::Completed { forwarded, .. }
            | Self::EndOfStream { forwarded }
            | Self::TransportError { forwarded, .. } => *forwarded,
        }
    }
}

/// Parameters of a log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub task_id: TaskId,
    /// Keep receiving live output until the task finishes.
    pub follow: bool,
    /// Replay output produced before the stream opened.
    pub include_history: bool,
    /// Only events at or after this unix millisecond timestamp.
    pub from_timestamp_ms: Option<i64>,
}

impl StreamRequest {
    /// History plus live output.
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            follow: true,
            include_history: true,
            from_timestamp_ms: None,
        }
    }

    pub fn with_follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub fn with_history(mut self, include_history: bool) -> Self {
        self.include_history = include_history;
        self
    }

    pub fn since(mut self, timestamp_ms: i64) -> Self {
        self.from_timestamp_ms = Some(timestamp_ms);
        self
    }
}

impl From<&StreamRequest> for StreamLogsRequest {
    fn from(req: &StreamRequest) -> Self {
        StreamLogsRequest {
            task_id: req.task_id.to_string(),
            follow: req.follow,
            include_history: req.include_history,
            from_timestamp_ms: req.from_timestamp_ms,
        }
    }
}

/// Relay `upstream` into `sink` until completion, end of stream or error.
pub async fn relay_stream<S, K>(mut upstream: S, sink: &mut K) -> Result<RelayOutcome, RelayError>
where
    S: Stream<Item = Result<LogEntry, tonic::Status>> + Unpin + Send,
    K: LogSink + ?Sized,
{
    let mut forwarded = 0;

    loop {
        match upstream.next().await {
            None => {
                debug!(forwarded, "Log stream closed");
                return Ok(RelayOutcome::EndOfStream { forwarded });
            }
            Some(Ok(entry)) => {
                let event = LogEvent::from(entry);
                let completed = event.task_completed;
                let status = event.task_status.clone();

                sink.send(event).await.map_err(RelayError::Sink)?;
                forwarded += 1;

                if completed {
                    debug!(forwarded, status = ?status, "Task completed, relay done");
                    return Ok(RelayOutcome::Completed { forwarded, status });
                }
            }
            Some(Err(status)) => {
                let message = format!("log stream error: {}", status.message());
                warn!(code = ?status.code(), forwarded, "Log stream broke");
                sink.send(LogEvent::transport_error(message.clone()))
                    .await
                    .map_err(RelayError::Sink)?;
                return Ok(RelayOutcome::TransportError { forwarded, message });
            }
        }
    }
}

/// Opens daemon log streams and relays them.
pub struct LogRelay {
    connector: DaemonConnector,
    open_timeout: Duration,
}

impl LogRelay {
    pub fn new(connector: DaemonConnector, open_timeout: Duration) -> Self {
        Self {
            connector,
            open_timeout,
        }
    }

    /// Stream a task's logs from `sandbox` into `sink`.
    ///
    /// The connection lives as long as the relay and is dropped when it ends.
    pub async fn relay<K>(
        &self,
        backend: &dyn SandboxBackend,
        sandbox: &SandboxRecord,
        request: &StreamRequest,
        sink: &mut K,
    ) -> Result<RelayOutcome, RelayError>
    where
        K: LogSink + ?Sized,
    {
        let mut conn = self.connector.connect(backend, sandbox).await?;
        info!(
            sandbox = %sandbox.name,
            task_id = %request.task_id,
            follow = request.follow,
            include_history = request.include_history,
            "Opening log stream"
        );

        let timeout = self.open_timeout;
        let call = conn.client().stream_logs(StreamLogsRequest::from(request));
        let upstream = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ControlError::rpc("stream_logs", deadline_exceeded(timeout)))?
            .map_err(|status| ControlError::rpc("stream_logs", status))?
            .into_inner();

        let outcome = relay_stream(upstream, sink).await?;
        info!(task_id = %request.task_id, forwarded = outcome.forwarded(), "Log relay finished");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use boxrun_core::LogEventType;
    use boxrun_proto::pb::LogType;

    fn entry(content: &str) -> LogEntry {
        LogEntry {
            r#type: LogType::Stdout as i32,
            content: content.to_string(),
            timestamp_ms: 1,
            task_completed: false,
            task_status: String::new(),
        }
    }

    fn completed() -> LogEntry {
        LogEntry {
            r#type: LogType::Status as i32,
            content: "exit code 0".to_string(),
            timestamp_ms: 2,
            task_completed: true,
            task_status: "COMPLETED".to_string(),
        }
    }

    /// Upstream that counts how many items were pulled from it.
    fn counted(
        items: Vec<Result<LogEntry, tonic::Status>>,
        pulls: Arc<AtomicUsize>,
    ) -> impl Stream<Item = Result<LogEntry, tonic::Status>> + Unpin + Send {
        futures::stream::iter(items).inspect(move |_| {
            pulls.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn drain(mut rx: mpsc::Receiver<LogEvent>) -> Vec<LogEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_forwards_n_plus_completion_then_stops() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let upstream = counted(
            vec![
                Ok(entry("a")),
                Ok(entry("b")),
                Ok(entry("c")),
                Ok(completed()),
                Ok(entry("never")),
            ],
            pulls.clone(),
        );
        let (mut tx, rx) = mpsc::channel(16);

        let outcome = relay_stream(upstream, &mut tx).await.unwrap();
        drop(tx);
        let events = drain(rx).await;

        assert_eq!(
            outcome,
            RelayOutcome::Completed {
                forwarded: 4,
                status: Some("COMPLETED".to_string())
            }
        );
        let contents: Vec<_> = events.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, ["a", "b", "c", "exit code 0"]);
        assert!(events[3].task_completed);
        assert_eq!(pulls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_drop_yields_exactly_one_error_event() {
        let upstream = futures::stream::iter(vec![
            Ok(entry("a")),
            Ok(entry("b")),
            Err(tonic::Status::unavailable("connection reset by peer")),
            Err(tonic::Status::unavailable("again")),
        ]);
        let (mut tx, rx) = mpsc::channel(16);

        let outcome = relay_stream(upstream, &mut tx).await.unwrap();
        drop(tx);
        let events = drain(rx).await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[2].event_type, LogEventType::Error);
        assert!(events[2].content.contains("connection reset by peer"));
        assert_eq!(
            events
                .iter()
                .filter(|e| e.event_type == LogEventType::Error)
                .count(),
            1
        );
        assert!(matches!(
            outcome,
            RelayOutcome::TransportError { forwarded: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_eof_is_silent() {
        let upstream = futures::stream::iter(vec![Ok(entry("a"))]);
        let (mut tx, rx) = mpsc::channel(16);

        let outcome = relay_stream(upstream, &mut tx).await.unwrap();
        drop(tx);
        assert_eq!(outcome, RelayOutcome::EndOfStream { forwarded: 1 });
        assert_eq!(drain(rx).await.len(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_aborts() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let upstream = counted(
            vec![Ok(entry("a")), Ok(entry("b")), Ok(completed())],
            pulls.clone(),
        );
        let mut seen = 0;
        let mut sink = FnSink(|_event: LogEvent| {
            seen += 1;
            if seen == 2 {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
            } else {
                Ok(())
            }
        });

        let err = relay_stream(upstream, &mut sink).await.unwrap_err();
        assert!(matches!(err, RelayError::Sink(_)));
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_preserves_order_and_payload() {
        let upstream = futures::stream::iter(vec![
            Ok(LogEntry {
                r#type: LogType::Stderr as i32,
                ..entry("par")
            }),
            Ok(entry("tial\nli")),
            Ok(entry("ne\n")),
        ]);
        let (mut tx, rx) = mpsc::channel(16);
        relay_stream(upstream, &mut tx).await.unwrap();
        drop(tx);

        let events = drain(rx).await;
        assert_eq!(events[0].event_type, LogEventType::Stderr);
        let joined: String = events.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(joined, "partial\nline\n");
    }

    #[test]
    fn test_stream_request_to_proto() {
        let req = StreamRequest::new(TaskId::new("t-1"))
            .with_follow(false)
            .since(42);
        let proto = StreamLogsRequest::from(&req);
        assert_eq!(proto.task_id, "t-1");
        assert!(!proto.follow);
        assert!(proto.include_history);
        assert_eq!(proto.from_timestamp_ms, Some(42));
    }
}
