use crate::core::prober::filename_from_headers;
use crate::core::ProxyRequest;
use crate::utils::{attachment_disposition, truncate_chars};
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, COOKIE,
    RANGE, USER_AGENT,
};
use reqwest::StatusCode;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const ERROR_SNIPPET_CHARS: usize = 500;
/// Enough bytes for `ERROR_SNIPPET_CHARS` characters of any UTF-8 text.
const ERROR_SNIPPET_BYTES: usize = ERROR_SNIPPET_CHARS * 4;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid download request: {0}")]
    InvalidRequest(String),
    #[error("upstream responded {status}")]
    UpstreamStatus { status: u16, detail: String },
    #[error("failed to contact upstream: {0}")]
    Unreachable(#[source] reqwest::Error),
}

/// Everything needed to answer the caller: the head is fixed, the body is lazy.
pub struct ProxyResponse {
    pub status: u16,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub accept_ranges: Option<String>,
    pub content_range: Option<String>,
    pub filename: Option<String>,
    pub body: ByteStream,
}

impl ProxyResponse {
    pub fn content_disposition(&self) -> Option<String> {
        self.filename.as_deref().map(attachment_disposition)
    }
}

impl std::fmt::Debug for ProxyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("accept_ranges", &self.accept_ranges)
            .field("content_range", &self.content_range)
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

/// Relays any URL with range semantics intact.
///
/// Headers come from a first GET whose body is never read on success; the
/// bytes come from a second GET opened only once the caller starts pulling
/// the body. Some hosts reject HEAD, hence the GET.
pub struct StreamingProxy {
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl StreamingProxy {
    pub fn new(client: reqwest::Client, probe_timeout: Duration) -> Self {
        Self {
            client,
            probe_timeout,
        }
    }

    /// A client whose read timeout is per chunk, so long transfers are not cut off.
    pub fn with_timeout(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self::new(client, timeout))
    }

    pub async fn open(&self, req: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let headers = upstream_headers(&req)?;

        let probe = self
            .client
            .get(req.url.clone())
            .headers(headers.clone())
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| {
                warn!("Failed to probe upstream URL {}: {}", req.url, e);
                ProxyError::Unreachable(e)
            })?;

        let upstream_status = probe.status();
        if upstream_status.as_u16() >= 400 {
            warn!("Upstream probe for {} answered {}", req.url, upstream_status);
            return Err(ProxyError::UpstreamStatus {
                status: upstream_status.as_u16(),
                detail: error_snippet(probe).await,
            });
        }

        let ranged = req.range.is_some();
        let probe_headers = probe.headers();
        let response = ProxyResponse {
            status: if ranged && upstream_status == StatusCode::PARTIAL_CONTENT {
                206
            } else {
                200
            },
            content_type: header_string(probe_headers, CONTENT_TYPE.as_str())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            // A ranged transfer's length is not the probe's length.
            content_length: if ranged {
                None
            } else {
                header_string(probe_headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok())
            },
            accept_ranges: header_string(probe_headers, ACCEPT_RANGES.as_str()),
            content_range: header_string(probe_headers, CONTENT_RANGE.as_str()),
            filename: req.filename.clone().or_else(|| filename_from_headers(probe_headers)),
            body: relay(self.client.clone(), req.url.clone(), headers),
        };
        drop(probe);

        info!("Proxying {} ({})", req.url, response.status);
        Ok(response)
    }
}

/// The head of an error body. Reading stops at the snippet size, at the end
/// of the body, or at the first transport error, keeping whatever arrived.
async fn error_snippet(mut response: reqwest::Response) -> String {
    let mut buf = Vec::new();
    while buf.len() < ERROR_SNIPPET_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => {
                debug!("Error body cut short: {}", e);
                break;
            }
        }
    }
    buf.truncate(ERROR_SNIPPET_BYTES);
    truncate_chars(&String::from_utf8_lossy(&buf), ERROR_SNIPPET_CHARS)
}

fn upstream_headers(req: &ProxyRequest) -> Result<HeaderMap, ProxyError> {
    let value = |name: &str, raw: &str| {
        HeaderValue::from_str(raw)
            .map_err(|_| ProxyError::InvalidRequest(format!("{} is not a valid header value", name)))
    };

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, value("user_agent", &req.user_agent)?);
    if let Some(range) = &req.range {
        headers.insert(RANGE, value("range", range)?);
    }
    if let Some(cookie) = &req.cookie {
        headers.insert(COOKIE, value("cookie", cookie)?);
    }
    Ok(headers)
}

/// The body as a lazy stream. Failures after this point can only end the
/// stream early; the caller sees a short transfer.
fn relay(client: reqwest::Client, url: url::Url, headers: HeaderMap) -> ByteStream {
    stream::once(async move {
        let response = client.get(url.clone()).headers(headers).send().await.map_err(|e| {
            warn!("Stream request to {} failed: {}", url, e);
            io::Error::other(e)
        })?;
        if response.status().as_u16() >= 400 {
            warn!("Stream request to {} answered {}", url, response.status());
            return Err(io::Error::other(format!("upstream responded {}", response.status())));
        }
        debug!("Streaming body from {}", url);
        Ok(response.bytes_stream().map_err(io::Error::other))
    })
    .try_flatten()
    .boxed()
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
