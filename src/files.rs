use std::fs;
use std::path::Path;

pub const PDF: &str = "application/pdf";
pub const DOC: &str = "application/msword";
pub const DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Content types the service will process. Anything else is rejected locally.
pub const ACCEPTED_TYPES: [&str; 3] = [PDF, DOCX, DOC];

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("Unsupported file type: {0}. Only PDF and Word documents (.pdf, .doc, .docx) are accepted")]
    Unsupported(String),
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A document ready to be uploaded.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<Self, FileError> {
        let content_type = content_type.into();
        if !is_accepted(&content_type) {
            return Err(FileError::Unsupported(content_type));
        }
        Ok(Self {
            name: name.into(),
            content_type,
            bytes,
        })
    }

    /// Read a document from disk. The type is checked before the file is read.
    pub fn from_path(path: &Path) -> Result<Self, FileError> {
        let content_type = content_type_for(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let bytes = fs::read(path).map_err(|source| FileError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            name,
            content_type: content_type.to_string(),
            bytes,
        })
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

pub fn is_accepted(content_type: &str) -> bool {
    ACCEPTED_TYPES.contains(&content_type)
}

/// Infer the content type from the file extension.
pub fn content_type_for(path: &Path) -> Result<&'static str, FileError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "pdf" => Ok(PDF),
        "doc" => Ok(DOC),
        "docx" => Ok(DOCX),
        "" => Err(FileError::Unsupported("(no extension)".into())),
        _ => Err(FileError::Unsupported(format!(".{}", ext))),
    }
}

/// Human-readable size, e.g. `1.5 KB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let formatted = format!("{:.2}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[unit])
}
