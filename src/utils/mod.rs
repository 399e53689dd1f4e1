pub mod markers;

pub use markers::{MarkerStore, Markers};

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static QUOTED_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["'](https?://[^"'\s]+)["']"#).unwrap());

/// Collect every quoted absolute URL literal in `text`, in document order.
pub fn quoted_urls(text: &str) -> impl Iterator<Item = &str> {
    QUOTED_URL_RE
        .captures_iter(text)
        .filter_map(|captures| captures.get(1).map(|m| m.as_str()))
}

/// Whether `candidate` parses as an absolute http(s) URL.
pub fn is_absolute_url(candidate: &str) -> bool {
    url::Url::parse(candidate)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

/// Undo the escaping a URL picks up when it lives inside a JS or JSON string.
pub fn unescape_js_url(raw: &str) -> String {
    if !raw.contains('\\') {
        return raw.to_string();
    }
    // Most page state is JSON-encoded, so let serde handle \uXXXX and friends.
    if let Ok(Value::String(decoded)) = serde_json::from_str::<Value>(&format!("\"{}\"", raw)) {
        return decoded;
    }
    raw.replace("\\/", "/").replace("\\u0026", "&")
}

/// Flatten nested JSON into `a.b.0.c`-style keys, keeping only leaves.
///
/// Object members keep their document order, so the first match found by a
/// caller is stable across runs.
pub fn flatten_json(value: &Value) -> Vec<(String, &Value)> {
    let mut flat = Vec::new();
    flatten_into(value, String::new(), &mut flat);
    flat
}

fn flatten_into<'a>(value: &'a Value, prefix: String, out: &mut Vec<(String, &'a Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(child, join_key(&prefix, key), out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(child, join_key(&prefix, &index.to_string()), out);
            }
        }
        leaf => out.push((prefix, leaf)),
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

pub fn sanitize_filename(filename: &str) -> String {
    // Remove or replace characters that are invalid in filenames
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            '/' | '\\' => '-',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Build an RFC 6266 attachment disposition that survives non-ASCII names.
pub fn attachment_disposition(filename: &str) -> String {
    let ascii: String = sanitize_filename(filename)
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        urlencoding::encode(filename)
    )
}

/// Cut `text` down to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("hello/world"), "hello-world");
        assert_eq!(sanitize_filename("test<>file"), "test__file");
        assert_eq!(sanitize_filename("normal_file.mp4"), "normal_file.mp4");
    }

    #[test]
    fn test_attachment_disposition_keeps_utf8_name() {
        let value = attachment_disposition("naïve \"cut\".mp4");
        assert_eq!(
            value,
            "attachment; filename=\"na_ve _cut_.mp4\"; filename*=UTF-8''na%C3%AFve%20%22cut%22.mp4"
        );
    }

    #[test]
    fn test_flatten_json_preserves_order() {
        let value = json!({
            "file": {"name": "a.mp4", "urls": ["https://x/1", "https://x/2"]},
            "size": 10
        });
        let keys: Vec<String> = flatten_json(&value).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["file.name", "file.urls.0", "file.urls.1", "size"]);
    }

    #[test]
    fn test_unescape_js_url() {
        assert_eq!(
            unescape_js_url(r"https:\/\/d.terabox.com\/file\/abc?x=1&y=2"),
            "https://d.terabox.com/file/abc?x=1&y=2"
        );
        assert_eq!(unescape_js_url("https://plain.example/a"), "https://plain.example/a");
    }

    #[test]
    fn test_quoted_urls_in_order() {
        let script = r#"var a = "https://one.example/x"; b = 'https://two.example/y';"#;
        let urls: Vec<&str> = quoted_urls(script).collect();
        assert_eq!(urls, vec!["https://one.example/x", "https://two.example/y"]);
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("ééé", 2), "éé");
        assert_eq!(truncate_chars("short", 500), "short");
    }

    #[test]
    fn test_is_absolute_url() {
        assert!(is_absolute_url("https://d.terabox.com/file/1"));
        assert!(!is_absolute_url("/file/1"));
        assert!(!is_absolute_url("javascript:download()"));
    }
}
