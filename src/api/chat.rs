use super::{ensure_success, ApiClient, ApiError};
use crate::transcript::Role;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatReply {
    pub response: String,
    pub session_id: String,
}

/// One turn of the history the service keeps for a session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

#[derive(Deserialize)]
struct ConversationLog {
    #[serde(default)]
    conversation: Vec<ConversationTurn>,
}

const CONVERSATION_PATH: &str = "/api/conversation";

impl ApiClient {
    /// Send one chat turn. The session id from the reply is kept for later turns.
    pub async fn chat(&self, message: &str) -> Result<ChatReply, ApiError> {
        let body = ChatRequest {
            message,
            session_id: self.session_id(),
        };

        let resp = self
            .http()
            .post(self.url("/api/chat"))
            .json(&body)
            .send()
            .await?;
        let reply: ChatReply = ensure_success(resp).await?.json().await?;

        self.remember_session(&reply.session_id);
        Ok(reply)
    }

    /// History the service keeps for the current session, oldest first.
    /// Empty when no session has been established yet.
    pub async fn conversation(&self) -> Result<Vec<ConversationTurn>, ApiError> {
        let Some(session_id) = self.session_id() else {
            return Ok(Vec::new());
        };

        let url = self.endpoint(CONVERSATION_PATH, &[&session_id])?;
        let resp = self.http().get(url).send().await?;
        let log: ConversationLog = ensure_success(resp).await?.json().await?;
        Ok(log.conversation)
    }

    /// Drop the server-side history of the current session. Returns false
    /// when no session has been established yet.
    ///
    /// The service keeps sessions in memory only, so a 404 means the session
    /// is already gone and the id is forgotten all the same.
    pub async fn clear_conversation(&self) -> Result<bool, ApiError> {
        let Some(session_id) = self.session_id() else {
            return Ok(false);
        };

        let url = self.endpoint(CONVERSATION_PATH, &[&session_id])?;
        let resp = self.http().delete(url).send().await?;
        match ensure_success(resp).await {
            Ok(_) => {}
            Err(ApiError::Api { status: 404, .. }) => {
                tracing::info!(session_id = %session_id, "session already gone on the service");
            }
            Err(err) => return Err(err),
        }

        self.forget_session();
        Ok(true)
    }
}
