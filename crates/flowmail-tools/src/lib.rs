//! The built-in tool registry: schemas and execution for calendar,
//! kanban, directory, datasafe, and reply/forward backends.

pub mod backends;
pub mod base;
pub mod registry;

pub use backends::calendar::{CalendarBackend, CalendarTool, InMemoryCalendarBackend};
pub use backends::datasafe::{DatasafeBackend, DatasafeDownloadTool, InMemoryDatasafeBackend, DOWNLOAD_TOOL_NAME};
pub use backends::directory::{DirectoryBackend, DirectoryTool, InMemoryDirectoryBackend};
pub use backends::email_action::{EmailActionTool, MailSender};
pub use backends::kanban::{InMemoryKanbanBackend, KanbanBackend, KanbanTool};
pub use base::{Tool, ToolContext, ToolContentBlock, ToolResult};
pub use registry::ToolRegistry;
