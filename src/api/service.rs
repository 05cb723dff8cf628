use super::{ensure_success, ApiClient, ApiError};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Health {
    pub status: String,
    #[serde(default)]
    pub sessions_count: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCatalog {
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
    #[serde(default)]
    pub supported_rules: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportedFile {
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
}

#[derive(Deserialize)]
struct ExportList {
    #[serde(default)]
    files: Vec<ExportedFile>,
}

impl ApiClient {
    pub async fn health(&self) -> Result<Health, ApiError> {
        let resp = self.http().get(self.url("/api/health")).send().await?;
        Ok(ensure_success(resp).await?.json().await?)
    }

    pub async fn tools(&self) -> Result<ToolCatalog, ApiError> {
        let resp = self.http().get(self.url("/api/tools")).send().await?;
        Ok(ensure_success(resp).await?.json().await?)
    }

    pub async fn exports(&self) -> Result<Vec<ExportedFile>, ApiError> {
        let resp = self.http().get(self.url("/api/export-list")).send().await?;
        let list: ExportList = ensure_success(resp).await?.json().await?;
        Ok(list.files)
    }

    /// Fetch an exported (masked) file.
    pub async fn download(&self, filename: &str) -> Result<Vec<u8>, ApiError> {
        let url = self.endpoint("/api/download", &[filename])?;
        let resp = self.http().get(url).send().await?;
        let bytes = ensure_success(resp).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}
