//! HTTP metadata probing via HEAD with a ranged-GET fallback.
//!
//! A job needs `Content-Length` and range support before it can be
//! segmented. Some servers block HEAD or only reveal capabilities on a real
//! GET, so `probe_best_effort` merges a HEAD with a 1-byte `Range: bytes=0-0`
//! GET when the HEAD alone is not conclusive.

mod parse;

use anyhow::{Context, Result};
use std::str;
use std::time::Duration;

pub use parse::parse_headers;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Metadata needed to plan a segmented download.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    /// Final HTTP status after redirects.
    pub status_code: u32,
    /// Total size in bytes, if the server disclosed one.
    pub total_bytes: Option<u64>,
    /// `Content-Type` value, if present.
    pub content_type: Option<String>,
    /// True if the server honors byte ranges.
    pub accepts_ranges: bool,
    /// Filename from `Content-Disposition`, if present.
    pub suggested_filename: Option<String>,
    /// `Retry-After` delay, if the server sent one.
    pub retry_after: Option<Duration>,
}

fn collecting_handle(url: &str) -> Result<curl::easy::Easy> {
    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    easy.follow_location(true)?;
    easy.max_redirections(10)?;
    easy.connect_timeout(CONNECT_TIMEOUT)?;
    easy.timeout(PROBE_TIMEOUT)?;
    Ok(easy)
}

/// Performs a HEAD request and returns parsed metadata. Follows redirects;
/// only the final response's headers are kept.
pub fn probe(url: &str) -> Result<ProbeResult> {
    let mut headers: Vec<String> = Vec::new();
    let mut easy = collecting_handle(url)?;
    easy.nobody(true)?;

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                let line = s.trim_end();
                // Each redirect hop emits a fresh status line; keep only the
                // final hop's headers.
                if line.starts_with("HTTP/") {
                    headers.clear();
                }
                headers.push(line.to_string());
            }
            true
        })?;
        transfer.perform().context("HEAD request failed")?;
    }

    let code = easy.response_code().context("no response code")? as u32;
    let mut result = parse_headers(&headers);
    result.status_code = code;
    if code < 200 || code >= 300 {
        anyhow::bail!(ProbeRejected { code, retry_after: result.retry_after });
    }
    Ok(result)
}

/// GET probe requesting only the first byte (`Range: bytes=0-0`).
///
/// Useful when HEAD is blocked or does not advertise ranges. A 206 response
/// proves range support even without `Accept-Ranges`, and its
/// `Content-Range` total replaces a missing `Content-Length`.
pub fn probe_range0(url: &str) -> Result<ProbeResult> {
    let mut headers: Vec<String> = Vec::new();
    let mut easy = collecting_handle(url)?;
    easy.range("0-0")?;

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                let line = s.trim_end();
                if line.starts_with("HTTP/") {
                    headers.clear();
                }
                headers.push(line.to_string());
            }
            true
        })?;
        transfer.write_function(|data| Ok(data.len()))?;
        transfer.perform().context("range probe failed")?;
    }

    let code = easy.response_code().context("no response code")? as u32;
    let mut result = parse_headers(&headers);
    result.status_code = code;
    if code < 200 || code >= 300 {
        anyhow::bail!(ProbeRejected { code, retry_after: result.retry_after });
    }
    if code == 206 {
        result.accepts_ranges = true;
        if result.total_bytes.is_none() {
            result.total_bytes = parse::content_range_total(&headers);
        } else if let Some(total) = parse::content_range_total(&headers) {
            // A 206's Content-Range total is authoritative over the 1-byte
            // Content-Length.
            result.total_bytes = Some(total);
        }
    }
    Ok(result)
}

/// Best-effort probe: HEAD first, merged with the range probe when HEAD is
/// blocked or inconclusive.
pub fn probe_best_effort(url: &str) -> Result<ProbeResult> {
    match probe(url) {
        Ok(mut head) => {
            if head.accepts_ranges && head.total_bytes.is_some() {
                return Ok(head);
            }
            if let Ok(ranged) = probe_range0(url) {
                head.accepts_ranges |= ranged.accepts_ranges;
                if head.total_bytes.is_none() {
                    head.total_bytes = ranged.total_bytes;
                }
                if head.content_type.is_none() {
                    head.content_type = ranged.content_type;
                }
                if head.suggested_filename.is_none() {
                    head.suggested_filename = ranged.suggested_filename;
                }
            }
            Ok(head)
        }
        Err(_) => probe_range0(url),
    }
}

/// Probe failure carrying the HTTP status so the engine can decide between
/// retry and permanent failure.
#[derive(Debug)]
pub struct ProbeRejected {
    pub code: u32,
    pub retry_after: Option<Duration>,
}

impl std::fmt::Display for ProbeRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "probe returned HTTP {}", self.code)
    }
}

impl std::error::Error for ProbeRejected {}
