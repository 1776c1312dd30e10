//! Filesystem layout, timestamps, and small string helpers shared by the
//! store, sweeper, and server crates.

use std::path::PathBuf;

/// Base directory for all on-disk state, honoring `FLOWMAIL_DATA_DIR`
/// and falling back to `~/.flowmail`.
pub fn get_data_path() -> PathBuf {
    if let Ok(dir) = std::env::var("FLOWMAIL_DATA_DIR") {
        return PathBuf::from(expand_home(&dir));
    }
    home_dir().join(".flowmail")
}

pub fn get_flows_path() -> PathBuf {
    get_data_path().join("flows")
}

pub fn get_mail_path() -> PathBuf {
    get_data_path().join("mail")
}

pub fn get_conversation_index_path() -> PathBuf {
    get_mail_path().join("by-conversation")
}

fn home_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home);
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        return PathBuf::from(profile);
    }
    PathBuf::from(".")
}

/// Expands a leading `~` to the current user's home directory.
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        return home_dir().join(rest).to_string_lossy().into_owned();
    }
    if path == "~" {
        return home_dir().to_string_lossy().into_owned();
    }
    path.to_string()
}

/// Current UTC timestamp, ISO-8601.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Truncates a string to at most `max_chars` unicode scalar values,
/// appending an ellipsis if truncated.
pub fn truncate_string(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut truncated: String = s.chars().take(max_chars).collect();
    truncated.push('\u{2026}');
    truncated
}

/// Converts an arbitrary string into a filesystem-safe filename
/// fragment: alphanumerics, `-`, and `_` pass through; everything else
/// becomes `_`.
pub fn safe_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_string_respects_char_boundaries() {
        assert_eq!(truncate_string("hello", 10), "hello");
        assert_eq!(truncate_string("hello world", 5), "hello\u{2026}");
    }

    #[test]
    fn truncate_string_handles_multibyte_chars() {
        let s = "héllo wörld";
        let truncated = truncate_string(s, 5);
        assert_eq!(truncated.chars().count(), 6);
    }

    #[test]
    fn safe_filename_replaces_unsafe_chars() {
        assert_eq!(safe_filename("<m1@x.com>"), "_m1_x.com_");
        assert_eq!(safe_filename("req-abc123"), "req-abc123");
    }

    #[test]
    fn expand_home_handles_tilde() {
        std::env::set_var("HOME", "/home/flowmail");
        assert_eq!(expand_home("~/data"), "/home/flowmail/data");
        assert_eq!(expand_home("/abs/path"), "/abs/path");
    }

    #[test]
    fn get_flows_path_nests_under_data_path() {
        std::env::set_var("FLOWMAIL_DATA_DIR", "/tmp/flowmail-test-data");
        assert_eq!(get_flows_path(), PathBuf::from("/tmp/flowmail-test-data/flows"));
        std::env::remove_var("FLOWMAIL_DATA_DIR");
    }
}
