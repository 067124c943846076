//! Map HTTP statuses and curl errors onto retry error kinds.

use super::error::WorkerError;
use super::policy::ErrorKind;

/// Classify an HTTP status code for retry decisions.
///
/// 408 counts as a timeout and 429 as throttling; both retry. Any other 4xx
/// is permanent.
pub fn classify_http_status(code: u32) -> ErrorKind {
    match code {
        408 => ErrorKind::Timeout,
        429 | 503 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(code as u16),
        _ => ErrorKind::Permanent,
    }
}

/// Classify a curl error for retry decisions.
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Timeout;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_partial_file()
    {
        return ErrorKind::Connection;
    }
    if e.is_too_many_redirects() {
        return ErrorKind::Permanent;
    }
    ErrorKind::Permanent
}

/// Classify a worker error into an ErrorKind.
pub fn classify(e: &WorkerError) -> ErrorKind {
    match e {
        WorkerError::Curl(ce) => classify_curl_error(ce),
        WorkerError::Http { code, .. } => classify_http_status(*code),
        WorkerError::ShortBody { .. } => ErrorKind::Connection,
        WorkerError::Storage(_) => ErrorKind::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_408_timeout_429_503_throttled() {
        assert_eq!(classify_http_status(408), ErrorKind::Timeout);
        assert_eq!(classify_http_status(429), ErrorKind::Throttled);
        assert_eq!(classify_http_status(503), ErrorKind::Throttled);
    }

    #[test]
    fn http_5xx_retryable() {
        assert!(matches!(classify_http_status(500), ErrorKind::Http5xx(500)));
        assert!(matches!(classify_http_status(502), ErrorKind::Http5xx(502)));
    }

    #[test]
    fn http_other_4xx_permanent() {
        assert_eq!(classify_http_status(403), ErrorKind::Permanent);
        assert_eq!(classify_http_status(404), ErrorKind::Permanent);
        assert_eq!(classify_http_status(416), ErrorKind::Permanent);
    }

    #[test]
    fn short_body_retries_as_connection() {
        let e = WorkerError::ShortBody {
            expected: 100,
            received: 50,
        };
        assert_eq!(classify(&e), ErrorKind::Connection);
    }

    #[test]
    fn storage_errors_are_permanent() {
        let e = WorkerError::Storage(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only filesystem",
        ));
        assert_eq!(classify(&e), ErrorKind::Permanent);
        assert!(e.user_message().starts_with("Permission denied"));
    }
}
