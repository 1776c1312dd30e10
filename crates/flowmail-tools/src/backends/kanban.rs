//! Kanban tool backend. Like the calendar, the board service itself is
//! an external collaborator; this declares the schema and the in-memory
//! stub used in tests and local dev.

use async_trait::async_trait;
use flowmail_core::error::Result;
use serde_json::{json, Value};
use std::sync::Mutex;

use crate::base::{optional_string, require_string, Tool, ToolContext, ToolResult};

#[async_trait]
pub trait KanbanBackend: Send + Sync {
    async fn create_card(&self, board: &str, title: &str, description: Option<&str>) -> Result<String>;
}

#[derive(Default)]
pub struct InMemoryKanbanBackend {
    cards: Mutex<Vec<String>>,
}

#[async_trait]
impl KanbanBackend for InMemoryKanbanBackend {
    async fn create_card(&self, board: &str, title: &str, _description: Option<&str>) -> Result<String> {
        let card_id = format!("card-{}", nanoid::nanoid!(8));
        self.cards
            .lock()
            .expect("kanban backend lock poisoned")
            .push(format!("{card_id}: [{board}] {title}"));
        Ok(card_id)
    }
}

pub struct KanbanTool {
    backend: Box<dyn KanbanBackend>,
}

impl KanbanTool {
    pub fn new(backend: Box<dyn KanbanBackend>) -> Self {
        KanbanTool { backend }
    }
}

#[async_trait]
impl Tool for KanbanTool {
    fn name(&self) -> &str {
        "create_card"
    }

    fn description(&self) -> &str {
        "Creates a kanban card on a board with a title and optional description."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "board": {"type": "string"},
                "title": {"type": "string"},
                "description": {"type": "string"}
            },
            "required": ["board", "title"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<ToolResult> {
        let board = require_string(&args, "board")?;
        let title = require_string(&args, "title")?;
        let description = optional_string(&args, "description");
        let card_id = self.backend.create_card(&board, &title, description.as_deref()).await?;
        Ok(ToolResult::ok_json(&json!({"status": "created", "cardId": card_id})))
    }
}
