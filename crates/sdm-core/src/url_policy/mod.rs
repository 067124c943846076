//! URL validation and local filename selection.
//!
//! Validation enforces the https-plus-allowlist rule applied to every job
//! before it is admitted. Filename selection prefers the server's
//! Content-Disposition, then the URL path, sanitized for the local
//! filesystem, with a content-type based extension upgrade for bare names.

mod content_disposition;
mod filename;

pub use content_disposition::parse_content_disposition_filename;
pub use filename::{filename_from_url_path, sanitize_filename};

use std::fmt;
use std::time::Duration;
use url::Url;

/// Default filename when neither header nor URL path yields a usable name.
const DEFAULT_FILENAME: &str = "download.bin";

/// Rejection reason reported synchronously by `Queue::add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidUrl {
    Unparseable,
    NotHttps,
    HostNotAllowed,
}

impl fmt::Display for InvalidUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidUrl::Unparseable => write!(f, "URL is not parseable"),
            InvalidUrl::NotHttps => write!(f, "URL must use https"),
            InvalidUrl::HostNotAllowed => write!(f, "host is not on the allowlist"),
        }
    }
}

impl std::error::Error for InvalidUrl {}

/// Validation rules supplied at queue initialization.
#[derive(Debug, Clone, Default)]
pub struct UrlRules {
    /// Accepted host suffixes (`example.com` matches `example.com` and any
    /// subdomain). Empty means any host.
    pub allowed_host_suffixes: Vec<String>,
    /// Accept `http` in addition to `https`. For loopback test servers.
    pub allow_insecure: bool,
}

impl UrlRules {
    pub fn new(allowed_host_suffixes: Vec<String>, allow_insecure: bool) -> Self {
        Self {
            allowed_host_suffixes,
            allow_insecure,
        }
    }

    /// Check scheme and host. Returns the parsed URL so callers don't parse twice.
    pub fn validate(&self, raw: &str) -> Result<Url, InvalidUrl> {
        let url = Url::parse(raw).map_err(|_| InvalidUrl::Unparseable)?;
        match url.scheme() {
            "https" => {}
            "http" if self.allow_insecure => {}
            _ => return Err(InvalidUrl::NotHttps),
        }
        let host = url.host_str().ok_or(InvalidUrl::Unparseable)?.to_ascii_lowercase();
        if !self.allowed_host_suffixes.is_empty() && !self.host_allowed(&host) {
            return Err(InvalidUrl::HostNotAllowed);
        }
        Ok(url)
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.allowed_host_suffixes.iter().any(|suffix| {
            let suffix = suffix.trim_start_matches('.').to_ascii_lowercase();
            host == suffix || host.ends_with(&format!(".{suffix}"))
        })
    }
}

/// Per-connection rate hint from a `rate=` query parameter, in bytes/sec.
///
/// A `k` suffix means kilobits (`rate=800k` is 100_000 bytes/sec); a plain
/// number is taken as bytes/sec.
pub fn rate_hint_bytes_per_sec(url: &Url) -> Option<f64> {
    let raw = url
        .query_pairs()
        .find(|(k, _)| k == "rate")
        .map(|(_, v)| v.into_owned())?;
    let raw = raw.trim().to_ascii_lowercase();
    if let Some(kbits) = raw.strip_suffix('k') {
        let n: f64 = kbits.parse().ok()?;
        Some(n * 1000.0 / 8.0)
    } else {
        raw.parse().ok()
    }
}

/// Suggested retry pacing is not part of the hint; callers convert to a
/// per-connection cap themselves.
pub fn rate_hint_from_str(raw_url: &str) -> Option<f64> {
    Url::parse(raw_url).ok().as_ref().and_then(rate_hint_bytes_per_sec)
}

/// Picks the final local filename given an already-parsed server
/// suggestion (the probe extracts it from Content-Disposition).
///
/// Preference order: server suggestion, last URL path segment,
/// `download.bin`. The result is sanitized; empty or reserved results fall
/// back to the default. `content_type` may upgrade a bare or `.bin` name
/// with a known media extension.
pub fn choose_filename(url: &str, suggested: Option<&str>, content_type: Option<&str>) -> String {
    let candidate = suggested
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .or_else(|| filename_from_url_path(url));

    let name = match candidate {
        Some(raw) => {
            let sanitized = sanitize_filename(&raw);
            if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
                DEFAULT_FILENAME.to_string()
            } else {
                sanitized
            }
        }
        None => DEFAULT_FILENAME.to_string(),
    };

    match content_type {
        Some(ct) => apply_media_extension(&name, ct),
        None => name,
    }
}

/// Upgrade a name with no meaningful extension using the response
/// content type. Names that already carry an extension are left alone.
fn apply_media_extension(name: &str, content_type: &str) -> String {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let mapped = match ct.as_str() {
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "video/x-matroska" => ".mkv",
        "video/quicktime" => ".mov",
        "video/x-msvideo" => ".avi",
        "video/mpeg" => ".mpeg",
        "video/mp2t" => ".ts",
        "video/ogg" => ".ogv",
        "video/x-flv" => ".flv",
        "application/zip" => ".zip",
        "application/gzip" => ".gz",
        _ => return name.to_string(),
    };
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => name.split_at(i),
        _ => (name, ""),
    };
    if ext.is_empty() || ext.eq_ignore_ascii_case(".bin") {
        format!("{stem}{mapped}")
    } else {
        name.to_string()
    }
}
