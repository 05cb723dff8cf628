use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transcript::{Attachment, Message, MessageId, MessageStatus, Role};

/// A settled message as stored in the `messages` table.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub status: String,
    pub attachment: Option<String>,
    pub created_at: String,
}

impl StoredMessage {
    pub fn from_message(message: &Message) -> Result<Self, serde_json::Error> {
        let attachment = message
            .attachment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        Ok(Self {
            id: message.id.to_string(),
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
            status: message.status.label(),
            attachment,
            created_at: message.created_at.to_rfc3339(),
        })
    }

    /// Rebuild the transcript message. None if any column fails to parse.
    pub fn into_message(self) -> Option<Message> {
        let role = Role::parse(&self.role)?;
        let status = MessageStatus::from_label(&self.status)?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .ok()?
            .with_timezone(&Utc);
        let attachment = match self.attachment {
            Some(json) => Some(serde_json::from_str::<Attachment>(&json).ok()?),
            None => None,
        };
        Some(Message {
            id: MessageId::from(self.id),
            role,
            content: self.content,
            attachment,
            status,
            created_at,
        })
    }
}
