//! Small helpers shared across modules.

use std::borrow::Cow;

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    expand_tilde_with(path, std::env::var("HOME").ok().as_deref())
}

fn expand_tilde_with<'a>(path: &'a str, home: Option<&str>) -> Cow<'a, str> {
    match (path.strip_prefix('~'), home) {
        (Some(""), Some(home)) => Cow::Owned(home.to_string()),
        (Some(rest), Some(home)) if rest.starts_with('/') => Cow::Owned(format!("{home}{rest}")),
        _ => Cow::Borrowed(path),
    }
}
