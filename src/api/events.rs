use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::transcript::Attachment;

/// One event of the upload-and-process stream, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    Start {
        #[serde(default)]
        message: Option<String>,
    },
    Progress(ProgressStep),
    Complete {
        result: ProcessResult,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressStep {
    pub step: u32,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

/// A detected sensitive span, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub start: usize,
    pub end: usize,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub original: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub original_name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingSummary {
    pub original_length: usize,
    pub masked_length: usize,
    #[serde(default)]
    pub entities_count: Option<usize>,
    #[serde(default)]
    pub steps_completed: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInfo {
    #[serde(default)]
    pub export_path: Option<String>,
    #[serde(default)]
    pub export_filename: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// Payload of the `complete` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProcessResult {
    pub success: bool,
    #[serde(default)]
    pub file_info: Option<FileInfo>,
    #[serde(default)]
    pub original_text: Option<String>,
    #[serde(default)]
    pub masked_text: Option<String>,
    #[serde(default)]
    pub entities_found: Vec<Entity>,
    #[serde(default)]
    pub entity_statistics: BTreeMap<String, usize>,
    #[serde(default)]
    pub processing_summary: Option<ProcessingSummary>,
    #[serde(default)]
    pub config_used: Option<serde_json::Value>,
    #[serde(default)]
    pub steps: Vec<serde_json::Value>,
    #[serde(default)]
    pub export_info: Option<ExportInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProcessResult {
    /// Build the transcript attachment. Both text variants are required; a
    /// successful result without them is not usable.
    pub fn to_attachment(&self) -> Option<Attachment> {
        if !self.success {
            return None;
        }
        let original_text = self.original_text.clone()?;
        let masked_text = self.masked_text.clone()?;
        Some(Attachment {
            original_text,
            masked_text,
            entities: self.entities_found.clone(),
            entity_statistics: self.entity_statistics.clone(),
            source: self.file_info.clone(),
            export: self.export_info.clone(),
        })
    }
}

pub fn parse_event(payload: &str) -> Result<ProcessEvent, serde_json::Error> {
    serde_json::from_str(payload)
}
