use crate::core::FileMetadata;
use anyhow::Result;
use regex::Regex;
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, USER_AGENT};
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

static EXTENDED_FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)filename\*\s*=\s*UTF-8''([^;]+)").unwrap());
static PLAIN_FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)filename\s*=\s*"?([^";]+)"?"#).unwrap());

/// Issues header-only requests and turns the answer into [`FileMetadata`].
pub struct MetadataProber {
    client: reqwest::Client,
    timeout: Duration,
}

impl MetadataProber {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Never fails: anything short of a 2xx answer yields empty metadata.
    pub async fn probe(&self, url: &str, user_agent: &str, cookie: Option<&str>) -> FileMetadata {
        match self.head(url, user_agent, cookie).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("HEAD failed for {}: {:#}", url, e);
                FileMetadata::default()
            }
        }
    }

    async fn head(&self, url: &str, user_agent: &str, cookie: Option<&str>) -> Result<FileMetadata> {
        let mut request = self
            .client
            .head(url)
            .timeout(self.timeout)
            .header(USER_AGENT, user_agent);
        if let Some(cookie) = cookie {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await?.error_for_status()?;
        debug!("HEAD {} -> {}", url, response.status());
        Ok(metadata_from_headers(response.headers()))
    }
}

pub fn metadata_from_headers(headers: &HeaderMap) -> FileMetadata {
    FileMetadata {
        filename: filename_from_headers(headers),
        content_length: header_str(headers, CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse::<u64>().ok()),
        content_type: header_str(headers, CONTENT_TYPE.as_str()),
        headers: flatten_headers(headers),
    }
}

/// Pick a filename out of `Content-Disposition`, preferring the RFC 5987 form.
pub fn filename_from_headers(headers: &HeaderMap) -> Option<String> {
    let disposition = header_str(headers, CONTENT_DISPOSITION.as_str())?;
    filename_from_disposition(&disposition)
}

pub fn filename_from_disposition(disposition: &str) -> Option<String> {
    if let Some(encoded) = EXTENDED_FILENAME_RE
        .captures(disposition)
        .and_then(|c| c.get(1))
    {
        let encoded = encoded.as_str().trim();
        match urlencoding::decode(encoded) {
            Ok(decoded) => return Some(decoded.into_owned()),
            Err(e) => debug!("Undecodable filename* value {:?}: {}", encoded, e),
        }
    }

    PLAIN_FILENAME_RE
        .captures(disposition)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Lowercased name to value; a repeated header keeps its last value.
pub fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat = HashMap::new();
    for (name, value) in headers {
        flat.insert(
            name.as_str().to_ascii_lowercase(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }
    flat
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_extended_filename_wins_and_is_decoded() {
        let map = headers(&[(
            "content-disposition",
            "attachment; filename=\"plain.mp4\"; filename*=UTF-8''na%C3%AFve.mp4",
        )]);
        assert_eq!(filename_from_headers(&map).as_deref(), Some("naïve.mp4"));
    }

    #[test]
    fn test_plain_filename_with_and_without_quotes() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"movie 1.mkv\"").as_deref(),
            Some("movie 1.mkv")
        );
        assert_eq!(
            filename_from_disposition("inline; filename=clip.mp4; size=10").as_deref(),
            Some("clip.mp4")
        );
        assert!(filename_from_disposition("attachment").is_none());
    }

    #[test]
    fn test_metadata_from_headers() {
        let map = headers(&[
            ("content-length", "5000"),
            ("content-type", "video/mp4"),
            ("x-dup", "first"),
            ("x-dup", "second"),
        ]);
        let meta = metadata_from_headers(&map);
        assert_eq!(meta.content_length, Some(5000));
        assert_eq!(meta.content_type.as_deref(), Some("video/mp4"));
        assert_eq!(meta.headers.get("x-dup").map(String::as_str), Some("second"));
        assert!(meta.filename.is_none());
    }

    #[test]
    fn test_non_numeric_length_is_absent() {
        let meta = metadata_from_headers(&headers(&[("content-length", "lots")]));
        assert!(meta.content_length.is_none());
    }
}
