use once_cell::sync::Lazy;
use regex::Regex;

pub const OPT_ID_WIDTH: usize = 4;

/// Stands in for a literal space inside a single token on the decoder wire.
pub const WHITESPACE_ESCAPE: char = '\u{2581}';

pub static OPT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<<MT_OPT:(\d{4,})>>$").expect("opt regex"));

pub fn opt_token(opt_id: usize) -> String {
    format!("<<MT_OPT:{opt_id:0width$}>>", width = OPT_ID_WIDTH)
}

pub fn is_opt_token(s: &str) -> bool {
    OPT_RE.is_match(s)
}

pub fn escape_whitespaces(token: &str) -> String {
    token
        .chars()
        .map(|c| if c.is_whitespace() { WHITESPACE_ESCAPE } else { c })
        .collect()
}

pub fn deescape_whitespaces(token: &str) -> String {
    token.replace(WHITESPACE_ESCAPE, " ")
}
