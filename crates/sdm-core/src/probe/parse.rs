//! Header-line parsing for probe responses.

use std::time::Duration;

use super::ProbeResult;
use crate::url_policy::parse_content_disposition_filename;

/// Builds a `ProbeResult` from raw header lines (status line included).
/// `status_code` is left at 0; callers fill it from the transfer handle.
pub fn parse_headers(lines: &[String]) -> ProbeResult {
    let mut result = ProbeResult::default();

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            result.total_bytes = value.parse::<u64>().ok().filter(|n| *n > 0);
        } else if name.eq_ignore_ascii_case("accept-ranges") {
            result.accepts_ranges = value.eq_ignore_ascii_case("bytes");
        } else if name.eq_ignore_ascii_case("content-type") {
            if !value.is_empty() {
                result.content_type = Some(value.to_string());
            }
        } else if name.eq_ignore_ascii_case("content-disposition") {
            result.suggested_filename = parse_content_disposition_filename(value);
        } else if name.eq_ignore_ascii_case("retry-after") {
            // Only the delta-seconds form; HTTP-date values are ignored.
            result.retry_after = value.parse::<u64>().ok().map(Duration::from_secs);
        }
    }

    result
}

/// Total size from a `Content-Range: bytes X-Y/total` header, if present
/// and not `*`.
pub fn content_range_total(lines: &[String]) -> Option<u64> {
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("content-range") {
            continue;
        }
        let (_, total) = value.trim().split_once('/')?;
        let total = total.trim();
        if total == "*" {
            return None;
        }
        return total.parse::<u64>().ok();
    }
    None
}
