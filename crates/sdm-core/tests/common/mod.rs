pub mod range_server;

use sdm_core::config::SdmConfig;

/// Config tuned for tests: loopback http allowed, fast backoff, responsive
/// progress, unthrottled sidecar writes.
pub fn test_config() -> SdmConfig {
    let mut cfg = SdmConfig::default();
    cfg.allow_insecure = true;
    cfg.progress_interval_ms = 50;
    cfg.sidecar_interval_secs = 0;
    cfg.retry.base_delay_ms = 5;
    cfg.retry.max_delay_ms = 40;
    cfg
}

/// Deterministic body of `len` bytes.
pub fn pattern_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
