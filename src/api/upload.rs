use super::events::{Entity, FileInfo};
use super::{ensure_success, AnonymizeSettings, ApiClient, ApiError};
use crate::files::UploadFile;
use crate::transcript::Attachment;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::collections::BTreeMap;

pub const STREAM_PATH: &str = "/api/upload-and-process-stream";
pub const LEGACY_PATH: &str = "/api/upload";

/// Raw response body of the streaming endpoint.
pub type ByteStream = BoxStream<'static, Result<Bytes, ApiError>>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub pages: Option<u64>,
    #[serde(default)]
    pub paragraphs: Option<u64>,
    #[serde(default)]
    pub tables: Option<u64>,
    #[serde(default)]
    pub extraction_method: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyProcessingInfo {
    pub original_length: usize,
    pub anonymized_length: usize,
    #[serde(default)]
    pub entities_found: usize,
    #[serde(default)]
    pub entity_types: Vec<String>,
}

/// Response of the non-streaming upload endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyUpload {
    pub filename: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub original_content: String,
    #[serde(default)]
    pub anonymized_content: String,
    #[serde(default)]
    pub sensitive_entities: Vec<Entity>,
    #[serde(default)]
    pub entity_statistics: BTreeMap<String, usize>,
    #[serde(default)]
    pub processing_info: Option<LegacyProcessingInfo>,
    #[serde(default)]
    pub metadata: DocumentMetadata,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_type: String,
}

impl LegacyUpload {
    pub fn to_attachment(&self) -> Attachment {
        Attachment {
            original_text: self.original_content.clone(),
            masked_text: self.anonymized_content.clone(),
            entities: self.sensitive_entities.clone(),
            entity_statistics: self.entity_statistics.clone(),
            source: Some(FileInfo {
                original_name: self.filename.clone(),
                size: self.size,
                content_type: self.content_type.clone(),
                file_id: None,
            }),
            export: None,
        }
    }
}

fn file_part(file: &UploadFile) -> Result<Part, ApiError> {
    Ok(Part::bytes(file.bytes.clone())
        .file_name(file.name.clone())
        .mime_str(&file.content_type)?)
}

impl ApiClient {
    /// Submit a document and hand back the undecoded event-stream body.
    pub async fn open_process_stream(
        &self,
        file: &UploadFile,
        settings: &AnonymizeSettings,
    ) -> Result<ByteStream, ApiError> {
        let config = serde_json::to_string(settings)?;
        let form = Form::new()
            .part("file", file_part(file)?)
            .text("config", config);

        tracing::debug!(file = %file.name, size = file.size(), "opening process stream");
        let resp = self
            .http()
            .post(self.url(STREAM_PATH))
            .header(ACCEPT, "text/event-stream")
            .multipart(form)
            .send()
            .await?;
        let resp = ensure_success(resp).await?;

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(ApiError::from))
            .boxed())
    }

    /// Single request/response upload. The service reads `config` from the
    /// query string on this endpoint.
    pub async fn upload_legacy(
        &self,
        file: &UploadFile,
        settings: &AnonymizeSettings,
    ) -> Result<LegacyUpload, ApiError> {
        let config = serde_json::to_string(settings)?;
        let form = Form::new().part("file", file_part(file)?);

        let resp = self
            .http()
            .post(self.url(LEGACY_PATH))
            .query(&[("config", config)])
            .multipart(form)
            .send()
            .await?;
        Ok(ensure_success(resp).await?.json().await?)
    }
}
