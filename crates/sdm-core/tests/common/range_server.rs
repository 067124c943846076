//! Minimal HTTP/1.1 server for integration tests: HEAD, Range GET, and the
//! misbehaviors the engine has to survive (ranges ignored, HEAD blocked,
//! 429 with Retry-After, throttled bodies, truncated bodies).
//!
//! Serves one static body per server. Every request is recorded so tests
//! can assert what the engine actually sent (e.g. resume offsets).

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RangeServerOptions {
    /// If false, HEAD returns 405 (simulates servers that block HEAD).
    pub head_allowed: bool,
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// If false, omit `Accept-Ranges: bytes` even when ranges work.
    pub advertise_ranges: bool,
    /// Content-Type header value, when set.
    pub content_type: Option<String>,
    /// Respond 429 + `Retry-After: 1` to this many GETs before serving.
    pub reject_first_gets: u32,
    /// Cap body write speed per connection (bytes/sec).
    pub throttle_bytes_per_sec: Option<u64>,
    /// Close the connection after this many body bytes (short reads).
    pub truncate_body_at: Option<usize>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            head_allowed: true,
            support_ranges: true,
            advertise_ranges: true,
            content_type: None,
            reject_first_gets: 0,
            throttle_bytes_per_sec: None,
            truncate_body_at: None,
        }
    }
}

/// One observed request.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub method: String,
    /// Parsed `Range: bytes=start-end` (end inclusive; None = open-ended).
    pub range: Option<(u64, Option<u64>)>,
}

/// Running server handle. The server lives until the process exits.
pub struct RangeServer {
    pub url: String,
    pub requests: Arc<Mutex<Vec<RequestRecord>>>,
}

impl RangeServer {
    /// Range starts of every GET, in arrival order. No-Range GETs show as 0.
    pub fn get_range_starts(&self) -> Vec<u64> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == "GET")
            .map(|r| r.range.map(|(s, _)| s).unwrap_or(0))
            .collect()
    }

    pub fn get_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == "GET")
            .count()
    }
}

pub fn start(body: Vec<u8>) -> RangeServer {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let requests: Arc<Mutex<Vec<RequestRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let rejections = Arc::new(AtomicU32::new(opts.reject_first_gets));

    let server = RangeServer {
        url: format!("http://127.0.0.1:{}/", port),
        requests: Arc::clone(&requests),
    };

    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let requests = Arc::clone(&requests);
            let rejections = Arc::clone(&rejections);
            let opts = opts.clone();
            thread::spawn(move || handle(stream, &body, &opts, &requests, &rejections));
        }
    });

    server
}

fn handle(
    mut stream: TcpStream,
    body: &[u8],
    opts: &RangeServerOptions,
    requests: &Mutex<Vec<RequestRecord>>,
    rejections: &AtomicU32,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));

    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let (method, range) = parse_request(request);
    requests.lock().unwrap().push(RequestRecord {
        method: method.to_string(),
        range,
    });

    let total = body.len() as u64;
    let accept_ranges = if opts.advertise_ranges {
        "Accept-Ranges: bytes\r\n"
    } else {
        ""
    };
    let content_type = opts
        .content_type
        .as_deref()
        .map(|ct| format!("Content-Type: {}\r\n", ct))
        .unwrap_or_default();

    if method.eq_ignore_ascii_case("HEAD") {
        if !opts.head_allowed {
            let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
            return;
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}{}Connection: close\r\n\r\n",
            total, accept_ranges, content_type
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }

    // 1-byte probe GETs don't consume the rejection budget; only real
    // transfers should see the 429s.
    let is_probe = matches!(range, Some((0, Some(0))));
    if !is_probe
        && rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
            .is_ok()
    {
        let _ = stream.write_all(
            b"HTTP/1.1 429 Too Many Requests\r\nRetry-After: 1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        return;
    }

    let (status_line, slice, content_range) = match (opts.support_ranges, range) {
        (true, Some((start, end))) => {
            let start = start.min(total);
            let end_incl = end.unwrap_or(total.saturating_sub(1)).min(total.saturating_sub(1));
            if start > end_incl {
                let response = format!(
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    total
                );
                let _ = stream.write_all(response.as_bytes());
                return;
            }
            let slice = &body[start as usize..=end_incl as usize];
            (
                "206 Partial Content",
                slice,
                format!("Content-Range: bytes {}-{}/{}\r\n", start, end_incl, total),
            )
        }
        _ => ("200 OK", body, String::new()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}{}{}Connection: close\r\n\r\n",
        status_line,
        slice.len(),
        content_range,
        accept_ranges,
        content_type
    );
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }

    let limit = opts.truncate_body_at.unwrap_or(slice.len()).min(slice.len());
    write_body(&mut stream, &slice[..limit], opts.throttle_bytes_per_sec);
}

/// Write the body, optionally pacing to roughly `bytes_per_sec`.
fn write_body(stream: &mut TcpStream, body: &[u8], bytes_per_sec: Option<u64>) {
    match bytes_per_sec {
        None => {
            let _ = stream.write_all(body);
        }
        Some(bps) => {
            let chunk = (bps / 20).clamp(1, 64 * 1024) as usize;
            let delay = Duration::from_millis(50);
            for piece in body.chunks(chunk) {
                if stream.write_all(piece).is_err() {
                    return;
                }
                let _ = stream.flush();
                thread::sleep(delay);
            }
        }
    }
}

/// Returns (method, optional (start, end_inclusive) from `Range: bytes=X-Y`;
/// an empty end means open-ended).
fn parse_request(request: &str) -> (&str, Option<(u64, Option<u64>)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("range") {
            continue;
        }
        let value = value.trim();
        let Some(spec) = value.strip_prefix("bytes=") else {
            continue;
        };
        if let Some((a, b)) = spec.split_once('-') {
            let start = a.trim().parse::<u64>().unwrap_or(0);
            let end = b.trim();
            let end = if end.is_empty() {
                None
            } else {
                end.parse::<u64>().ok()
            };
            range = Some((start, end));
        }
    }
    (method, range)
}
