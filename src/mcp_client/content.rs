//! Helpers for reading `tools/call` results.
//!
//! Tool results are `{"content": [...], "isError": bool}` where each content
//! block is typed (`text`, `image`, `resource`). The connection layer returns
//! them untouched; these helpers pull out the pieces callers usually want.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Image extensions that mark a URL as a rendered chart.
const CHART_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "svg", "webp"];

fn url_regex() -> &'static Regex {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    URL_RE.get_or_init(|| {
        Regex::new(r#"https?://[^\s"'<>()\[\]]+"#).expect("URL pattern is valid")
    })
}

/// Text of every `text` content block, in order.
pub fn text_blocks(result: &Value) -> Vec<&str> {
    result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

/// Whether the server flagged the result as a tool-level failure.
pub fn is_error_result(result: &Value) -> bool {
    result.get("isError").and_then(Value::as_bool).unwrap_or(false)
}

/// Chart image URLs found anywhere in the result, de-duplicated in order of
/// first appearance.
///
/// A URL counts as a chart when its path ends in an image extension or
/// contains a `/chart` segment.
pub fn extract_chart_urls(result: &Value) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    let mut strings = Vec::new();
    collect_strings(result, &mut strings);

    for text in strings {
        for m in url_regex().find_iter(text) {
            let url = m.as_str().trim_end_matches(['.', ',', ';', '!', '?']);
            if is_chart_url(url) && !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        }
    }
    urls
}

fn is_chart_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let lower = path.to_ascii_lowercase();
    let has_image_ext = lower
        .rsplit_once('.')
        .is_some_and(|(_, ext)| CHART_EXTENSIONS.contains(&ext));
    has_image_ext || lower.contains("/chart")
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Rows from the first text block holding a JSON array.
///
/// Database servers answer queries with the rows serialised as JSON text.
pub fn parse_rows(result: &Value) -> Option<Vec<Value>> {
    text_blocks(result).into_iter().find_map(|text| {
        match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Array(rows)) => Some(rows),
            _ => None,
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
