//! Small helpers shared across modules.

use std::borrow::Cow;
use std::path::PathBuf;

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = home_dir() {
            let home = home.to_string_lossy().into_owned();
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// `$HOME`, if set and non-empty.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// One-line preview of `s`: whitespace collapsed, cut to `max` chars with `...`.
pub fn truncate_str(s: &str, max: usize) -> String {
    let cleaned: String = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() <= max {
        cleaned
    } else {
        let mut result = cleaned
            .chars()
            .take(max.saturating_sub(3))
            .collect::<String>();
        result.push_str("...");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde("/etc/hosts"), "/etc/hosts");
        assert_eq!(expand_tilde("~user/x"), "~user/x");
    }

    #[test]
    fn test_expand_tilde_home() {
        let Some(home) = home_dir() else { return };
        let home = home.to_string_lossy().into_owned();
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/.moltbot"), format!("{home}/.moltbot"));
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("hello\n  world", 20), "hello world");
        assert_eq!(truncate_str("abcdefghij", 6), "abc...");
    }
}
