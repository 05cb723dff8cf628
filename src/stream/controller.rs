use super::framer::{data_payload, LineFramer};
use crate::api::events::{parse_event, ProcessEvent, ProcessResult};
use crate::api::upload::ByteStream;
use crate::api::{AnonymizeSettings, ApiClient, ApiError};
use crate::files::UploadFile;
use crate::render::{completion_content, failure_content, progress_content, PLACEHOLDER_CONTENT};
use crate::transcript::{FailureKind, MessageId, Placeholder, Transcript};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Opens the event stream for one upload.
#[async_trait]
pub trait ProcessStreamSource: Send + Sync {
    async fn open(
        &self,
        file: &UploadFile,
        settings: &AnonymizeSettings,
    ) -> Result<ByteStream, ApiError>;
}

#[async_trait]
impl ProcessStreamSource for ApiClient {
    async fn open(
        &self,
        file: &UploadFile,
        settings: &AnonymizeSettings,
    ) -> Result<ByteStream, ApiError> {
        self.open_process_stream(file, settings).await
    }
}

/// Terminal outcome of one upload, mirrored in the placeholder's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Completed,
    Failed(FailureKind),
}

/// Caller's view of an upload that is running in the background.
pub struct UploadHandle {
    message_id: MessageId,
    cancel: CancellationToken,
    task: JoinHandle<IngestOutcome>,
}

impl UploadHandle {
    /// Id of the placeholder message this upload owns.
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Stop reading and settle the placeholder as cancelled. No-op once the
    /// upload has settled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<IngestOutcome, JoinError> {
        self.task.await
    }
}

/// Drives document uploads from submission to a settled transcript message.
///
/// Callers serialize uploads; the controller does not queue.
#[derive(Clone)]
pub struct StreamIngestController {
    source: Arc<dyn ProcessStreamSource>,
    transcript: Transcript,
    idle_timeout: Option<Duration>,
}

impl StreamIngestController {
    pub fn new(source: Arc<dyn ProcessStreamSource>, transcript: Transcript) -> Self {
        Self {
            source,
            transcript,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }

    /// `None` waits for the next chunk indefinitely.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Append the placeholder and start processing in the background.
    ///
    /// Must be called from within a tokio runtime. Every outcome is reported
    /// through the transcript; the handle only allows cancelling and waiting.
    pub fn begin_streamed_upload(
        &self,
        file: UploadFile,
        settings: AnonymizeSettings,
    ) -> UploadHandle {
        let placeholder = self.transcript.begin_placeholder(PLACEHOLDER_CONTENT);
        let message_id = placeholder.id().clone();
        let cancel = CancellationToken::new();

        let ingest = Ingest {
            transcript: self.transcript.clone(),
            placeholder,
            idle_timeout: self.idle_timeout,
        };
        let source = self.source.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { ingest.run(source, file, settings, token).await });

        UploadHandle {
            message_id,
            cancel,
            task,
        }
    }
}

enum Opened {
    Body(ByteStream),
    Refused(ApiError),
    Idle,
    Cancelled,
}

enum Next {
    Chunk(Bytes),
    End,
    Broken(ApiError),
    Idle,
    Cancelled,
}

enum LineEffect {
    Continue,
    ServerError(Option<String>),
}

/// State of one running upload. Owns the placeholder until it settles.
struct Ingest {
    transcript: Transcript,
    placeholder: Placeholder,
    idle_timeout: Option<Duration>,
}

impl Ingest {
    async fn run(
        self,
        source: Arc<dyn ProcessStreamSource>,
        file: UploadFile,
        settings: AnonymizeSettings,
        cancel: CancellationToken,
    ) -> IngestOutcome {
        tracing::info!(
            message_id = %self.placeholder.id(),
            file = %file.name,
            size = file.size(),
            "upload started"
        );

        let opening = source.open(&file, &settings);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Opened::Cancelled,
            opened = with_limit(self.idle_timeout, opening) => match opened {
                Some(Ok(body)) => Opened::Body(body),
                Some(Err(err)) => Opened::Refused(err),
                None => Opened::Idle,
            },
        };

        match opened {
            Opened::Body(body) => self.consume(body, &cancel).await,
            Opened::Refused(err) => {
                tracing::warn!(error = %err, "upload request failed");
                let detail = err.to_string();
                self.fail(FailureKind::Transport, Some(&detail))
            }
            Opened::Idle => self.fail_idle(),
            Opened::Cancelled => self.fail(FailureKind::Cancelled, None),
        }
    }

    async fn consume<S>(self, mut body: S, cancel: &CancellationToken) -> IngestOutcome
    where
        S: Stream<Item = Result<Bytes, ApiError>> + Unpin,
    {
        let mut framer = LineFramer::new();
        let mut result: Option<ProcessResult> = None;

        loop {
            match next_chunk(&mut body, self.idle_timeout, cancel).await {
                Next::Chunk(chunk) => {
                    for line in framer.push(&chunk) {
                        if let LineEffect::ServerError(message) = self.apply_line(&line, &mut result)
                        {
                            return self.fail(FailureKind::Server, message.as_deref());
                        }
                    }
                }
                Next::End => break,
                Next::Broken(err) => {
                    tracing::warn!(error = %err, "event stream broke off");
                    let detail = err.to_string();
                    return self.fail(FailureKind::Transport, Some(&detail));
                }
                Next::Idle => return self.fail_idle(),
                Next::Cancelled => return self.fail(FailureKind::Cancelled, None),
            }
        }

        if let Some(line) = framer.finish() {
            if let LineEffect::ServerError(message) = self.apply_line(&line, &mut result) {
                return self.fail(FailureKind::Server, message.as_deref());
            }
        }

        self.finalize(result)
    }

    fn apply_line(&self, line: &str, result: &mut Option<ProcessResult>) -> LineEffect {
        let Some(payload) = data_payload(line) else {
            return LineEffect::Continue;
        };

        let event = match parse_event(payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, payload, "skipping malformed event");
                return LineEffect::Continue;
            }
        };

        match event {
            ProcessEvent::Start { message } => {
                tracing::debug!(note = message.as_deref().unwrap_or(""), "processing started");
            }
            ProcessEvent::Progress(step) => {
                tracing::debug!(step = step.step, action = %step.action, status = %step.status, "progress");
                self.transcript
                    .update(&self.placeholder, progress_content(&step));
            }
            ProcessEvent::Complete { result: complete } => {
                tracing::debug!(success = complete.success, "result received");
                *result = Some(complete);
            }
            ProcessEvent::Error { message } => return LineEffect::ServerError(message),
        }
        LineEffect::Continue
    }

    fn finalize(self, result: Option<ProcessResult>) -> IngestOutcome {
        let Some(result) = result else {
            return self.fail(FailureKind::NoResult, None);
        };
        if !result.success {
            return self.fail(FailureKind::Server, result.error.as_deref());
        }

        match result.to_attachment() {
            Some(attachment) => {
                tracing::info!(
                    message_id = %self.placeholder.id(),
                    entities = attachment.entity_count(),
                    "upload completed"
                );
                let content = completion_content(&attachment);
                self.transcript
                    .complete(self.placeholder, content, Some(attachment));
                IngestOutcome::Completed
            }
            None => {
                tracing::warn!("successful result is missing its text");
                self.fail(FailureKind::NoResult, None)
            }
        }
    }

    fn fail_idle(self) -> IngestOutcome {
        let detail = self
            .idle_timeout
            .map(|limit| format!("{}s", limit.as_secs()))
            .unwrap_or_default();
        self.fail(FailureKind::IdleTimeout, Some(&detail))
    }

    fn fail(self, kind: FailureKind, detail: Option<&str>) -> IngestOutcome {
        tracing::info!(
            message_id = %self.placeholder.id(),
            kind = kind.as_str(),
            "upload failed"
        );
        self.transcript
            .fail(self.placeholder, kind, failure_content(kind, detail));
        IngestOutcome::Failed(kind)
    }
}

/// Await `fut`, giving up after `limit`. Returns None on timeout.
async fn with_limit<F: std::future::Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn next_chunk<S>(body: &mut S, limit: Option<Duration>, cancel: &CancellationToken) -> Next
where
    S: Stream<Item = Result<Bytes, ApiError>> + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Next::Cancelled,
        next = with_limit(limit, body.next()) => match next {
            Some(Some(Ok(chunk))) => Next::Chunk(chunk),
            Some(Some(Err(err))) => Next::Broken(err),
            Some(None) => Next::End,
            None => Next::Idle,
        },
    }
}
