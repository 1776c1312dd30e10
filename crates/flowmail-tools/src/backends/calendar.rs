//! Calendar tool backend. The calendar service itself is an external
//! collaborator (out of scope); this module only declares the schema
//! and the contract `CalendarTool` dispatches through, plus an
//! in-memory stub good enough for tests and local dev.

use async_trait::async_trait;
use flowmail_core::error::Result;
use serde_json::{json, Value};
use std::sync::Mutex;

use crate::base::{require_string, optional_string, optional_string_array, Tool, ToolContext, ToolResult};

#[async_trait]
pub trait CalendarBackend: Send + Sync {
    async fn book_event(
        &self,
        title: &str,
        start: &str,
        end: Option<&str>,
        attendees: &[String],
    ) -> Result<String>;
}

/// Stand-in backend: books events into an in-process list instead of a
/// real calendar provider.
#[derive(Default)]
pub struct InMemoryCalendarBackend {
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl CalendarBackend for InMemoryCalendarBackend {
    async fn book_event(
        &self,
        title: &str,
        start: &str,
        _end: Option<&str>,
        _attendees: &[String],
    ) -> Result<String> {
        let event_id = format!("evt-{}", nanoid::nanoid!(8));
        self.events
            .lock()
            .expect("calendar backend lock poisoned")
            .push(format!("{event_id}: {title} @ {start}"));
        Ok(event_id)
    }
}

pub struct CalendarTool {
    backend: Box<dyn CalendarBackend>,
}

impl CalendarTool {
    pub fn new(backend: Box<dyn CalendarBackend>) -> Self {
        CalendarTool { backend }
    }
}

#[async_trait]
impl Tool for CalendarTool {
    fn name(&self) -> &str {
        "book_event"
    }

    fn description(&self) -> &str {
        "Books a calendar event with a title, start time, optional end time, and attendees."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "start": {"type": "string", "description": "ISO-8601 start time"},
                "end": {"type": "string", "description": "ISO-8601 end time"},
                "attendees": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["title", "start"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<ToolResult> {
        let title = require_string(&args, "title")?;
        let start = require_string(&args, "start")?;
        let end = optional_string(&args, "end");
        let attendees = optional_string_array(&args, "attendees");
        let event_id = self.backend.book_event(&title, &start, end.as_deref(), &attendees).await?;
        Ok(ToolResult::ok_json(&json!({"status": "booked", "eventId": event_id})))
    }
}
