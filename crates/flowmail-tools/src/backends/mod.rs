pub mod calendar;
pub mod datasafe;
pub mod directory;
pub mod email_action;
pub mod kanban;
