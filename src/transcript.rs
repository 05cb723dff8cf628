use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::api::events::{Entity, ExportInfo, FileInfo};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// Machine-readable reason a message ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Rejected locally before any network call.
    Validation,
    /// Connection error, non-success status or a broken read.
    Transport,
    /// The server reported the failure itself.
    Server,
    /// The stream ended without a usable result.
    NoResult,
    Cancelled,
    IdleTimeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Transport => "transport",
            FailureKind::Server => "server",
            FailureKind::NoResult => "no-result",
            FailureKind::Cancelled => "cancelled",
            FailureKind::IdleTimeout => "idle-timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            FailureKind::Validation,
            FailureKind::Transport,
            FailureKind::Server,
            FailureKind::NoResult,
            FailureKind::Cancelled,
            FailureKind::IdleTimeout,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "kind", rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Completed,
    Failed(FailureKind),
}

impl MessageStatus {
    /// Compact text form used by the local store, e.g. `failed:no-result`.
    pub fn label(&self) -> String {
        match self {
            MessageStatus::Pending => "pending".to_string(),
            MessageStatus::Completed => "completed".to_string(),
            MessageStatus::Failed(kind) => format!("failed:{}", kind.as_str()),
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MessageStatus::Pending),
            "completed" => Some(MessageStatus::Completed),
            other => other
                .strip_prefix("failed:")
                .and_then(FailureKind::parse)
                .map(MessageStatus::Failed),
        }
    }
}

/// Result of document processing attached to a completed assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub original_text: String,
    pub masked_text: String,
    pub entities: Vec<Entity>,
    pub entity_statistics: BTreeMap<String, usize>,
    #[serde(default)]
    pub source: Option<FileInfo>,
    #[serde(default)]
    pub export: Option<ExportInfo>,
}

impl Attachment {
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub attachment: Option<Attachment>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: String, status: MessageStatus) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content,
            attachment: None,
            status,
            created_at: Utc::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }
}

/// Change notification carrying the message as it looked right after the change.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    Appended(Message),
    Updated(Message),
    Settled(Message),
}

impl TranscriptEvent {
    pub fn message(&self) -> &Message {
        match self {
            TranscriptEvent::Appended(m) | TranscriptEvent::Updated(m) | TranscriptEvent::Settled(m) => m,
        }
    }
}

/// Exclusive right to mutate one in-flight message.
///
/// Not `Clone`: whoever created the placeholder is the only party able to
/// update it, and settling consumes the token so a message is settled once.
#[derive(Debug)]
pub struct Placeholder {
    id: MessageId,
}

impl Placeholder {
    pub fn id(&self) -> &MessageId {
        &self.id
    }
}

#[derive(Default)]
struct Inner {
    order: Vec<MessageId>,
    messages: HashMap<MessageId, Message>,
}

/// Ordered, append-only message list shared between the UI layer and
/// in-flight uploads. Cloning yields another handle to the same transcript.
#[derive(Clone)]
pub struct Transcript {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<TranscriptEvent>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: TranscriptEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.events.subscribe()
    }

    fn insert(&self, message: Message) -> MessageId {
        let id = message.id.clone();
        {
            let mut inner = self.lock();
            inner.order.push(id.clone());
            inner.messages.insert(id.clone(), message.clone());
        }
        self.emit(TranscriptEvent::Appended(message));
        id
    }

    /// Append an immutable message.
    pub fn append(&self, role: Role, content: impl Into<String>) -> MessageId {
        self.insert(Message::new(role, content.into(), MessageStatus::Completed))
    }

    /// Append an immutable assistant message that reports a failure.
    pub fn append_failure(&self, kind: FailureKind, content: impl Into<String>) -> MessageId {
        self.insert(Message::new(
            Role::Assistant,
            content.into(),
            MessageStatus::Failed(kind),
        ))
    }

    /// Append the in-flight assistant message of a new operation.
    pub fn begin_placeholder(&self, content: impl Into<String>) -> Placeholder {
        let id = self.insert(Message::new(
            Role::Assistant,
            content.into(),
            MessageStatus::Pending,
        ));
        Placeholder { id }
    }

    /// Replace the in-flight content. Returns false if the message is gone or
    /// already settled.
    pub fn update(&self, placeholder: &Placeholder, content: impl Into<String>) -> bool {
        let updated = {
            let mut inner = self.lock();
            match inner.messages.get_mut(&placeholder.id) {
                Some(message) if message.is_pending() => {
                    message.content = content.into();
                    Some(message.clone())
                }
                _ => None,
            }
        };
        match updated {
            Some(message) => {
                self.emit(TranscriptEvent::Updated(message));
                true
            }
            None => false,
        }
    }

    pub fn complete(
        &self,
        placeholder: Placeholder,
        content: impl Into<String>,
        attachment: Option<Attachment>,
    ) -> MessageId {
        self.settle(placeholder, content.into(), MessageStatus::Completed, attachment)
    }

    pub fn fail(
        &self,
        placeholder: Placeholder,
        kind: FailureKind,
        content: impl Into<String>,
    ) -> MessageId {
        self.settle(placeholder, content.into(), MessageStatus::Failed(kind), None)
    }

    fn settle(
        &self,
        placeholder: Placeholder,
        content: String,
        status: MessageStatus,
        attachment: Option<Attachment>,
    ) -> MessageId {
        let Placeholder { id } = placeholder;
        let settled = {
            let mut inner = self.lock();
            match inner.messages.get_mut(&id) {
                Some(message) if message.is_pending() => {
                    message.content = content;
                    message.status = status;
                    message.attachment = attachment;
                    Some(message.clone())
                }
                _ => None,
            }
        };
        match settled {
            Some(message) => self.emit(TranscriptEvent::Settled(message)),
            None => tracing::warn!(message_id = %id, "placeholder missing or already settled"),
        }
        id
    }

    pub fn get(&self, id: &MessageId) -> Option<Message> {
        self.lock().messages.get(id).cloned()
    }

    /// Messages in display order.
    pub fn snapshot(&self) -> Vec<Message> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.messages.get(id).cloned())
            .collect()
    }

    /// True while some operation still owns a placeholder.
    pub fn has_pending(&self) -> bool {
        self.lock().messages.values().any(Message::is_pending)
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_keeps_insertion_order() {
        let transcript = Transcript::new();
        let a = transcript.append(Role::User, "first");
        let b = transcript.append(Role::Assistant, "second");
        let ids: Vec<MessageId> = transcript.snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_update_by_id_survives_interleaved_appends() {
        let transcript = Transcript::new();
        let placeholder = transcript.begin_placeholder("thinking");
        let user = transcript.append(Role::User, "typed while waiting");

        assert!(transcript.update(&placeholder, "step 1"));

        let messages = transcript.snapshot();
        assert_eq!(messages[0].content, "step 1");
        assert_eq!(messages[1].id, user);
        assert_eq!(messages[1].content, "typed while waiting");
    }

    #[test]
    fn test_settled_message_is_immutable() {
        let transcript = Transcript::new();
        let placeholder = transcript.begin_placeholder("thinking");
        let id = placeholder.id().clone();
        let twin = Placeholder { id: id.clone() };

        transcript.fail(placeholder, FailureKind::NoResult, "nothing came back");
        assert!(!transcript.update(&twin, "late progress"));

        let message = transcript.get(&id).unwrap();
        assert_eq!(message.content, "nothing came back");
        assert_eq!(message.status, MessageStatus::Failed(FailureKind::NoResult));
    }

    #[test]
    fn test_status_label_round_trips_through_store_form() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Completed,
            MessageStatus::Failed(FailureKind::IdleTimeout),
        ] {
            assert_eq!(MessageStatus::from_label(&status.label()), Some(status));
        }
        assert_eq!(MessageStatus::from_label("failed:bogus"), None);
    }

    #[tokio::test]
    async fn test_subscribers_see_append_update_settle() {
        let transcript = Transcript::new();
        let mut rx = transcript.subscribe();

        let placeholder = transcript.begin_placeholder("thinking");
        let id = placeholder.id().clone();
        transcript.update(&placeholder, "working");
        transcript.complete(placeholder, "done", None);

        let appended = rx.recv().await.unwrap();
        assert!(matches!(appended, TranscriptEvent::Appended(_)));
        assert_eq!(appended.message().id, id);
        assert_eq!(appended.message().content, "thinking");

        let updated = rx.recv().await.unwrap();
        assert!(matches!(updated, TranscriptEvent::Updated(_)));
        assert_eq!(updated.message().content, "working");

        let settled = rx.recv().await.unwrap();
        assert!(matches!(settled, TranscriptEvent::Settled(_)));
        assert_eq!(settled.message().content, "done");
        assert_eq!(settled.message().status, MessageStatus::Completed);
    }
}
