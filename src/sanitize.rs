use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static CONTROL_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\p{Cc}").unwrap());

/// Escapes control characters so keys and paths read from disk cannot forge
/// or split log lines.
pub fn sanitize_for_display(message: &str) -> String {
    CONTROL_CHARS
        .replace_all(message, |caps: &Captures| caps[0].escape_default().to_string())
        .into_owned()
}
