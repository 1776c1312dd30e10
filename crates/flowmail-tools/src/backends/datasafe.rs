//! Datasafe tool backend: downloads a previously-stored attachment by
//! path. The Decision Engine watches for this tool's name specifically
//! so it can buffer the returned content for the final outbound
//! message's attachments.

use async_trait::async_trait;
use flowmail_core::error::{FlowMailError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::base::{require_string, Tool, ToolContext, ToolResult};

/// The fixed tool name the Decision Engine recognises for attachment
/// capture during the tool loop.
pub const DOWNLOAD_TOOL_NAME: &str = "datasafe_download";

#[async_trait]
pub trait DatasafeBackend: Send + Sync {
    /// Returns `(base64_content, mime_type)` for a stored path.
    async fn download(&self, path: &str) -> Result<(String, String)>;
}

#[derive(Default, Clone)]
pub struct InMemoryDatasafeBackend {
    pub files: HashMap<String, (String, String)>,
}

#[async_trait]
impl DatasafeBackend for InMemoryDatasafeBackend {
    async fn download(&self, path: &str) -> Result<(String, String)> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| FlowMailError::NotFound(format!("datasafe path {path}")))
    }
}

pub struct DatasafeDownloadTool {
    backend: Box<dyn DatasafeBackend>,
}

impl DatasafeDownloadTool {
    pub fn new(backend: Box<dyn DatasafeBackend>) -> Self {
        DatasafeDownloadTool { backend }
    }
}

#[async_trait]
impl Tool for DatasafeDownloadTool {
    fn name(&self) -> &str {
        DOWNLOAD_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Downloads a previously stored attachment by its datasafe path."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<ToolResult> {
        let path = require_string(&args, "path")?;
        let (content, mime_type) = self.backend.download(&path).await?;
        Ok(ToolResult::ok_json(&json!({
            "path": path,
            "mimeType": mime_type,
            "contentBase64": content
        })))
    }
}
