use crate::api::{AnonymizeSettings, ApiClient, ApiError};
use crate::db::Database;
use crate::files::{format_file_size, FileError, UploadFile};
use crate::render::{completion_content, failure_content, PLACEHOLDER_CONTENT};
use crate::settings::{self, DeskConfig, SettingsError};
use crate::stream::controller::{ProcessStreamSource, StreamIngestController, UploadHandle};
use crate::transcript::{FailureKind, Message, MessageId, Role, Transcript};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DeskError {
    #[error("Another upload is still in progress")]
    Busy,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// The client session: one transcript, one service connection, one local store.
pub struct Desk {
    api: Arc<ApiClient>,
    db: Database,
    transcript: Transcript,
    controller: StreamIngestController,
}

impl Desk {
    pub fn new(db: Database, config: DeskConfig) -> Self {
        let api = Arc::new(ApiClient::new(config.api.clone()).with_session(config.session_id.clone()));
        let source: Arc<dyn ProcessStreamSource> = api.clone();
        Self::with_source(db, config, api, source)
    }

    /// Like `new`, with uploads read from `source` instead of the service.
    pub fn with_source(
        db: Database,
        config: DeskConfig,
        api: Arc<ApiClient>,
        source: Arc<dyn ProcessStreamSource>,
    ) -> Self {
        let transcript = Transcript::new();
        let controller = StreamIngestController::new(source, transcript.clone())
            .with_idle_timeout(config.idle_timeout);
        Self {
            api,
            db,
            transcript,
            controller,
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Validate locally. A rejected file is reported in the transcript and
    /// never reaches the network.
    fn prepare_upload(&self, path: &Path) -> Option<UploadFile> {
        match UploadFile::from_path(path) {
            Ok(file) => Some(file),
            Err(err) => {
                tracing::info!(path = %path.display(), error = %err, "upload rejected");
                let detail = match &err {
                    FileError::Unsupported(_) => err.to_string(),
                    FileError::Read { .. } => format!("could not read the file ({})", err),
                };
                self.transcript.append_failure(
                    FailureKind::Validation,
                    failure_content(FailureKind::Validation, Some(&detail)),
                );
                None
            }
        }
    }

    fn announce_upload(&self, file: &UploadFile) {
        self.transcript.append(
            Role::User,
            format!("Upload file: {} ({})", file.name, format_file_size(file.size())),
        );
    }

    /// Start a streamed upload. Returns None when the file was rejected.
    pub fn upload(
        &self,
        path: &Path,
        settings: AnonymizeSettings,
    ) -> Result<Option<UploadHandle>, DeskError> {
        if self.transcript.has_pending() {
            return Err(DeskError::Busy);
        }
        let Some(file) = self.prepare_upload(path) else {
            return Ok(None);
        };
        self.announce_upload(&file);
        Ok(Some(self.controller.begin_streamed_upload(file, settings)))
    }

    /// Upload through the single request/response endpoint.
    pub async fn upload_legacy(
        &self,
        path: &Path,
        settings: &AnonymizeSettings,
    ) -> Result<Option<MessageId>, DeskError> {
        if self.transcript.has_pending() {
            return Err(DeskError::Busy);
        }
        let Some(file) = self.prepare_upload(path) else {
            return Ok(None);
        };
        self.announce_upload(&file);

        let placeholder = self.transcript.begin_placeholder(PLACEHOLDER_CONTENT);
        let id = match self.api.upload_legacy(&file, settings).await {
            Ok(upload) => {
                let attachment = upload.to_attachment();
                let content = completion_content(&attachment);
                self.transcript.complete(placeholder, content, Some(attachment))
            }
            Err(err) => {
                tracing::warn!(error = %err, "legacy upload failed");
                let detail = err.to_string();
                self.transcript.fail(
                    placeholder,
                    FailureKind::Transport,
                    failure_content(FailureKind::Transport, Some(&detail)),
                )
            }
        };
        Ok(Some(id))
    }

    /// One chat turn. Failures land in the transcript; the new session id,
    /// if any, is remembered in the store.
    pub async fn send_chat(&self, text: &str) -> Result<MessageId, DeskError> {
        self.transcript.append(Role::User, text);

        match self.api.chat(text).await {
            Ok(reply) => {
                self.db.set_setting(settings::SESSION_ID, &reply.session_id)?;
                Ok(self.transcript.append(Role::Assistant, reply.response))
            }
            Err(err) => {
                tracing::warn!(error = %err, "chat request failed");
                Ok(self
                    .transcript
                    .append_failure(FailureKind::Transport, format!("**Chat failed:** {}", err)))
            }
        }
    }

    /// Forget the chat session on both ends.
    pub async fn clear_session(&self) -> Result<bool, DeskError> {
        let cleared = self.api.clear_conversation().await?;
        self.db.delete_setting(settings::SESSION_ID)?;
        Ok(cleared)
    }

    /// Store every settled message. Pending placeholders are skipped.
    pub fn persist(&self) -> Result<usize, DeskError> {
        let mut saved = 0;
        for message in self.transcript.snapshot() {
            if message.is_pending() {
                continue;
            }
            self.db.save_message(&message)?;
            saved += 1;
        }
        Ok(saved)
    }

    pub fn history(&self, limit: usize) -> Result<Vec<Message>, DeskError> {
        let rows = self.db.recent_messages(limit)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                let message = row.into_message();
                if message.is_none() {
                    tracing::warn!(message_id = %id, "skipping unreadable stored message");
                }
                message
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::upload::ByteStream;
    use crate::api::ApiConfig;
    use crate::stream::controller::IngestOutcome;
    use crate::transcript::MessageStatus;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use futures::StreamExt;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// Counts opens; answers with a fixed body, or hangs when `hang` is set.
    struct CountingSource {
        opened: AtomicUsize,
        body: &'static str,
        hang: bool,
    }

    #[async_trait]
    impl ProcessStreamSource for CountingSource {
        async fn open(
            &self,
            _file: &UploadFile,
            _settings: &AnonymizeSettings,
        ) -> Result<ByteStream, ApiError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let head = stream::iter(vec![Ok(Bytes::from_static(self.body.as_bytes()))]);
            Ok(if self.hang {
                head.chain(stream::pending()).boxed()
            } else {
                head.boxed()
            })
        }
    }

    fn desk_with(source: Arc<CountingSource>) -> Desk {
        let config = DeskConfig {
            api: ApiConfig::default(),
            idle_timeout: None,
            session_id: None,
        };
        let api = Arc::new(ApiClient::new(config.api.clone()));
        Desk::with_source(Database::open_in_memory().unwrap(), config, api, source)
    }

    fn source(body: &'static str, hang: bool) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            opened: AtomicUsize::new(0),
            body,
            hang,
        })
    }

    fn write_file(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"%PDF-1.7 test").unwrap();
        path
    }

    #[tokio::test]
    async fn test_unsupported_file_never_reaches_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "scan.png");
        let source = source("", false);
        let desk = desk_with(source.clone());

        let handle = desk.upload(&path, AnonymizeSettings::default()).unwrap();

        assert!(handle.is_none());
        assert_eq!(source.opened.load(Ordering::SeqCst), 0);
        let messages = desk.transcript().snapshot();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Failed(FailureKind::Validation));
        assert!(messages[0].content.contains(".png"));
    }

    #[tokio::test]
    async fn test_second_upload_is_refused_while_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "brief.pdf");
        let desk = desk_with(source("", true));

        let handle = desk
            .upload(&path, AnonymizeSettings::default())
            .unwrap()
            .unwrap();
        assert!(matches!(
            desk.upload(&path, AnonymizeSettings::default()),
            Err(DeskError::Busy)
        ));

        handle.cancel();
        assert_eq!(
            handle.wait().await.unwrap(),
            IngestOutcome::Failed(FailureKind::Cancelled)
        );
        assert!(!desk.transcript().has_pending());
    }

    #[tokio::test]
    async fn test_upload_announces_file_and_persists_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "brief.pdf");
        let desk = desk_with(source("data: {\"type\":\"start\"}\n\n", false));

        let handle = desk
            .upload(&path, AnonymizeSettings::default())
            .unwrap()
            .unwrap();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome, IngestOutcome::Failed(FailureKind::NoResult));

        let messages = desk.transcript().snapshot();
        assert_eq!(messages[0].role, Role::User);
        assert!(messages[0].content.starts_with("Upload file: brief.pdf"));

        assert_eq!(desk.persist().unwrap(), 2);
        let history = desk.history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[1].status,
            MessageStatus::Failed(FailureKind::NoResult)
        );
    }
    /// One request as the stub service saw it.
    struct Recorded {
        head: String,
        body: String,
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    async fn read_request(socket: &mut TcpStream) -> Recorded {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = find(&buf, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_string();
                let lower = head.to_ascii_lowercase();
                let body = &buf[end + 4..];
                let length = lower
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok());
                let done = match length {
                    Some(length) => body.len() >= length,
                    None if lower.contains("transfer-encoding: chunked") => {
                        body.ends_with(b"0\r\n\r\n")
                    }
                    None => true,
                };
                if done || n == 0 {
                    return Recorded {
                        head,
                        body: String::from_utf8_lossy(body).to_string(),
                    };
                }
            }
            assert!(n > 0, "connection closed mid-request");
        }
    }

    /// Serves the canned `(status, json)` replies in order, one per
    /// connection, and hands back the requests it received.
    async fn stub_service(
        replies: Vec<(u16, &'static str)>,
    ) -> (String, JoinHandle<Vec<Recorded>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let mut seen = Vec::new();
            for (status, body) in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                seen.push(read_request(&mut socket).await);
                let reply = format!(
                    "HTTP/1.1 {} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
            seen
        });
        (base_url, task)
    }

    fn desk_at(base_url: String, session_id: Option<&str>) -> Desk {
        let db = Database::open_in_memory().unwrap();
        if let Some(id) = session_id {
            db.set_setting(settings::SESSION_ID, id).unwrap();
        }
        let config = DeskConfig {
            api: ApiConfig { base_url },
            idle_timeout: None,
            session_id: session_id.map(String::from),
        };
        Desk::new(db, config)
    }

    #[tokio::test]
    async fn test_chat_session_is_stored_and_reused() {
        let (base_url, service) = stub_service(vec![
            (200, r#"{"success":true,"response":"hello","session_id":"s-42"}"#),
            (200, r#"{"success":true,"response":"again","session_id":"s-42"}"#),
        ])
        .await;
        let desk = desk_at(base_url, None);

        desk.send_chat("first").await.unwrap();
        assert_eq!(
            desk.db().get_setting(settings::SESSION_ID).unwrap().as_deref(),
            Some("s-42")
        );
        let reply = desk.send_chat("second").await.unwrap();

        let requests = service.await.unwrap();
        assert!(requests[0].head.starts_with("POST /api/chat "));
        assert!(!requests[0].body.contains("session_id"));
        let second: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
        assert_eq!(
            second,
            serde_json::json!({ "message": "second", "session_id": "s-42" })
        );

        let message = desk.transcript().get(&reply).unwrap();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.content, "again");
        assert_eq!(message.status, MessageStatus::Completed);
    }

    #[tokio::test]
    async fn test_chat_failure_is_reported_in_transcript() {
        let (base_url, service) = stub_service(vec![(500, r#"{"detail":"agent crashed"}"#)]).await;
        let desk = desk_at(base_url, None);

        let id = desk.send_chat("hello").await.unwrap();
        service.await.unwrap();

        let message = desk.transcript().get(&id).unwrap();
        assert_eq!(message.status, MessageStatus::Failed(FailureKind::Transport));
        assert!(message.content.contains("agent crashed"));
        assert_eq!(desk.db().get_setting(settings::SESSION_ID).unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_session_forgets_session_unknown_to_service() {
        let (base_url, service) =
            stub_service(vec![(404, r#"{"detail":"session not found"}"#)]).await;
        let desk = desk_at(base_url, Some("stale-id"));

        assert!(desk.clear_session().await.unwrap());

        let requests = service.await.unwrap();
        assert!(requests[0]
            .head
            .starts_with("DELETE /api/conversation/stale-id "));
        assert_eq!(desk.db().get_setting(settings::SESSION_ID).unwrap(), None);
        assert_eq!(desk.api().session_id(), None);
    }

    #[tokio::test]
    async fn test_clear_session_keeps_id_when_service_fails() {
        let (base_url, service) = stub_service(vec![(500, r#"{"detail":"down"}"#)]).await;
        let desk = desk_at(base_url, Some("live-id"));

        assert!(desk.clear_session().await.is_err());
        service.await.unwrap();
        assert_eq!(
            desk.db().get_setting(settings::SESSION_ID).unwrap().as_deref(),
            Some("live-id")
        );
        assert_eq!(desk.api().session_id().as_deref(), Some("live-id"));
    }

    #[tokio::test]
    async fn test_remote_history_uses_session() {
        let (base_url, service) = stub_service(vec![(
            200,
            r#"{"success":true,"session_id":"s-7","conversation":[{"role":"user","content":"hi"},{"role":"assistant","content":"hello"}]}"#,
        )])
        .await;
        let desk = desk_at(base_url, Some("s-7"));

        let turns = desk.api().conversation().await.unwrap();

        let requests = service.await.unwrap();
        assert!(requests[0].head.starts_with("GET /api/conversation/s-7 "));
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].content, "hello");
    }

    #[tokio::test]
    async fn test_legacy_upload_completes_with_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "memo.pdf");
        let (base_url, service) = stub_service(vec![(
            200,
            r#"{
                "filename":"memo.pdf",
                "content_type":"application/pdf",
                "size":13,
                "original_content":"call 13812345678",
                "anonymized_content":"call 13*******78",
                "sensitive_entities":[{"start":5,"end":16,"type":"PHONE","original":"13812345678"}],
                "entity_statistics":{"PHONE":1},
                "message":"done"
            }"#,
        )])
        .await;
        let desk = desk_at(base_url, None);

        let id = desk
            .upload_legacy(&path, &AnonymizeSettings::default())
            .await
            .unwrap()
            .unwrap();

        let requests = service.await.unwrap();
        assert!(requests[0].head.starts_with("POST /api/upload?config="));
        assert!(requests[0].body.contains("memo.pdf"));

        let message = desk.transcript().get(&id).unwrap();
        assert_eq!(message.status, MessageStatus::Completed);
        let attachment = message.attachment.unwrap();
        assert_eq!(attachment.masked_text, "call 13*******78");
        assert_eq!(attachment.entity_count(), 1);
        assert!(!desk.transcript().has_pending());
    }

    #[tokio::test]
    async fn test_legacy_upload_error_status_settles_as_transport() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "memo.pdf");
        let (base_url, service) =
            stub_service(vec![(500, r#"{"detail":"extraction failed"}"#)]).await;
        let desk = desk_at(base_url, None);

        let id = desk
            .upload_legacy(&path, &AnonymizeSettings::default())
            .await
            .unwrap()
            .unwrap();
        service.await.unwrap();

        let message = desk.transcript().get(&id).unwrap();
        assert_eq!(message.status, MessageStatus::Failed(FailureKind::Transport));
        assert!(message.content.contains("extraction failed"));
        assert!(message.attachment.is_none());
        assert_eq!(desk.transcript().len(), 2);
    }
}
