use std::sync::OnceLock;

use regex::Regex;

fn wrapping_fence() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*\n(.*?)\n?```$").ok())
        .as_ref()
}

/// Trims a model reply and removes a markdown code fence wrapped around all of it.
/// Anything else, including fences inside the reply, passes through untouched.
pub fn strip_code_fence(reply: &str) -> String {
    let text = reply.trim();
    if !text.starts_with("```") {
        return text.to_string();
    }

    wrapping_fence()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1).map(|body| body.as_str().trim().to_string()))
        .unwrap_or_else(|| text.to_string())
}

/// Like `strip_code_fence`, but also drops an opening fence line that is never
/// closed. Only meant for replies that must be a single JSON document.
pub fn strip_json_fence(reply: &str) -> String {
    let text = strip_code_fence(reply);
    if !text.starts_with("```") || text[3..].contains("```") {
        return text;
    }
    match text.split_once('\n') {
        Some((_, body)) => body.trim().to_string(),
        None => text,
    }
}
