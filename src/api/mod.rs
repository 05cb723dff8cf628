pub mod chat;
pub mod events;
pub mod service;
pub mod upload;

use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8001";

/// Entity categories the masking service knows how to detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Idcard,
    Phone,
    Email,
    Bankcard,
    CaseNumber,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Idcard,
        EntityType::Phone,
        EntityType::Email,
        EntityType::Bankcard,
        EntityType::CaseNumber,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Idcard => "IDCARD",
            EntityType::Phone => "PHONE",
            EntityType::Email => "EMAIL",
            EntityType::Bankcard => "BANKCARD",
            EntityType::CaseNumber => "CASE_NUMBER",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("Unknown entity type: {}", s.trim()))
    }
}

/// Masking options sent with every upload, serialized as the `config` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymizeSettings {
    pub enabled_rules: BTreeSet<EntityType>,
    pub mask_char: char,
    pub keep_prefix: u32,
    pub keep_suffix: u32,
}

impl Default for AnonymizeSettings {
    fn default() -> Self {
        Self {
            enabled_rules: EntityType::ALL.into_iter().collect(),
            mask_char: '●',
            keep_prefix: 2,
            keep_suffix: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// HTTP client for the de-identification service.
///
/// Holds the chat session id once the server hands one out; every later chat
/// call reuses it.
pub struct ApiClient {
    config: ApiConfig,
    http: Client,
    session_id: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Self {
        Self {
            config,
            http: Client::new(),
            session_id: Mutex::new(None),
        }
    }

    pub fn with_session(self, session_id: Option<String>) -> Self {
        *self.session_slot() = session_id;
        self
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_slot().clone()
    }

    pub(crate) fn remember_session(&self, session_id: &str) {
        let mut slot = self.session_slot();
        if slot.as_deref() != Some(session_id) {
            tracing::debug!(session_id, "chat session established");
            *slot = Some(session_id.to_string());
        }
    }

    pub(crate) fn forget_session(&self) {
        *self.session_slot() = None;
    }

    fn session_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// `path` followed by `segments`, each escaped as a single path segment.
    pub(crate) fn endpoint(&self, path: &str, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.url(path))
            .map_err(|e| ApiError::Parse(format!("Invalid service URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Parse(format!("Invalid service URL: {}", self.config.base_url)))?
            .extend(segments);
        Ok(url)
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Parse(err.to_string())
    }
}

impl Serialize for ApiError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: String,
}

/// Prefer the service's `detail` field over the raw body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.detail)
        .unwrap_or_else(|_| body.trim().to_string())
}

pub(crate) async fn ensure_success(resp: Response) -> Result<Response, ApiError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    Err(ApiError::Api {
        status,
        message: error_detail(&text),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_serialize_to_wire_shape() {
        let settings = AnonymizeSettings {
            enabled_rules: [EntityType::Idcard, EntityType::CaseNumber].into_iter().collect(),
            mask_char: '*',
            keep_prefix: 1,
            keep_suffix: 3,
        };
        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "enabled_rules": ["IDCARD", "CASE_NUMBER"],
                "mask_char": "*",
                "keep_prefix": 1,
                "keep_suffix": 3
            })
        );
    }

    #[test]
    fn test_entity_type_parse_is_case_insensitive() {
        assert_eq!("case_number".parse::<EntityType>(), Ok(EntityType::CaseNumber));
        assert_eq!(" PHONE ".parse::<EntityType>(), Ok(EntityType::Phone));
        assert!("PASSPORT".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_error_detail_prefers_detail_field() {
        assert_eq!(error_detail(r#"{"detail":"unsupported type"}"#), "unsupported type");
        assert_eq!(error_detail("Bad Gateway\n"), "Bad Gateway");
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let client = ApiClient::new(ApiConfig {
            base_url: "http://host:8001/".into(),
        });
        assert_eq!(client.url("/api/chat"), "http://host:8001/api/chat");
    }

    #[test]
    fn test_endpoint_escapes_segments() {
        let client = ApiClient::new(ApiConfig {
            base_url: "http://host:8001/".into(),
        });
        let url = client
            .endpoint("/api/download", &["brief #2?.docx"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://host:8001/api/download/brief%20%232%3F.docx"
        );
        let url = client.endpoint("/api/conversation", &["a/b"]).unwrap();
        assert_eq!(url.as_str(), "http://host:8001/api/conversation/a%2Fb");
    }

    #[test]
    fn test_session_is_remembered() {
        let client = ApiClient::new(ApiConfig::default()).with_session(None);
        assert_eq!(client.session_id(), None);
        client.remember_session("abc");
        assert_eq!(client.session_id().as_deref(), Some("abc"));
        client.forget_session();
        assert_eq!(client.session_id(), None);
    }
}
