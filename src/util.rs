use std::path::PathBuf;

/// Home directory for all persisted gateway state (`~/.picoclaw`).
pub fn picoclaw_home() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".picoclaw"))
        .unwrap_or_else(|| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
                .join(".picoclaw")
        })
}

/// Workspace directory used by adapters for on-disk state (session stores, media).
pub fn workspace_dir() -> PathBuf {
    picoclaw_home().join("workspace")
}

/// Strip control characters that confuse terminals and downstream models,
/// keeping newlines and tabs. The result is trimmed.
pub fn sanitize_content(content: &str) -> String {
    content
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Truncate a string to at most `max` bytes on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Shorten a string for log previews, appending an ellipsis when cut.
pub fn truncate_with_ellipsis(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_control_chars() {
        assert_eq!(sanitize_content("a\u{0}b\u{7}c"), "abc");
    }

    #[test]
    fn sanitize_keeps_newlines_and_tabs() {
        assert_eq!(sanitize_content("a\nb\tc"), "a\nb\tc");
    }

    #[test]
    fn sanitize_trims_whitespace() {
        assert_eq!(sanitize_content("  hi  "), "hi");
        assert_eq!(sanitize_content(" \n\t "), "");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo";
        // 'é' is two bytes; cutting at 2 would split it
        assert_eq!(truncate_chars(s, 2), "h");
        assert_eq!(truncate_chars(s, 3), "hé");
        assert_eq!(truncate_chars(s, 100), "héllo");
    }

    #[test]
    fn ellipsis_only_when_cut() {
        assert_eq!(truncate_with_ellipsis("short", 10), "short");
        assert_eq!(truncate_with_ellipsis("0123456789", 4), "0123…");
    }
}
