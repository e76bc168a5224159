//! Plain-text derivation from HTML mail bodies.

use once_cell::sync::Lazy;
use regex::Regex;

static SCRIPT_STYLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").unwrap()
});
static BREAK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(br\s*/?|/p|/div|/tr|/li)>").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static BLANK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Derive a plain rendering from HTML by dropping script/style blocks and
/// stripping tags. Used when a mail carries only an HTML body.
pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT_STYLE_RE.replace_all(html, "");
    let text = BREAK_RE.replace_all(&text, "\n");
    let text = TAG_RE.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    let trimmed: Vec<&str> =
        text.lines().map(str::trim_end).collect();
    BLANK_RE
        .replace_all(&trimmed.join("\n"), "\n\n")
        .trim()
        .to_owned()
}
