use once_cell::sync::Lazy;
use regex::Regex;

static SENSITIVE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passphrase|key|secret|recovery|mnemonic)[\s:=]+[^\s]+").unwrap()
});

/// Redact anything that looks like secret material before it reaches a log
/// line or terminal.
pub fn sanitize_for_display(message: &str) -> String {
    let sanitized = SENSITIVE_PATTERN.replace_all(message, "$1=[REDACTED]");
    sanitized.to_string()
}
