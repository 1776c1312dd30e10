//! Groups tools under stable names and dispatches a model-requested
//! tool call to the right one.

use std::collections::HashMap;
use std::sync::Arc;

use flowmail_core::error::{FlowMailError, Result};
use flowmail_core::types::ToolDefinition;
use serde_json::Value;
use tracing::{debug, warn};

use crate::base::{Tool, ToolContext, ToolResult};

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!(tool = %name, "registered tool");
        self.tools.insert(name, tool);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.input_schema()))
            .collect()
    }

    pub async fn execute(&self, name: &str, ctx: &ToolContext, args: Value) -> Result<ToolResult> {
        let Some(tool) = self.get(name) else {
            warn!(tool = name, "tool execution requested for unknown tool");
            return Err(FlowMailError::ToolError(format!("unknown tool '{name}'")));
        };
        tool.execute(ctx, args).await
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
