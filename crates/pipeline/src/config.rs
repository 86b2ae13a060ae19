use serde::{Deserialize, Serialize};

/// Tunables for the per-session finalization pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Hold window applied to every incoming audio chunk before release.
    pub jitter_release_ms: u64,
    /// Minimum time a chunk must have been held before it is eligible
    /// for release when the batch timer fires.
    pub jitter_min_hold_ms: u64,
    /// Duration of the rolling audio ring kept for post-hoc recovery.
    pub rolling_buffer_ms: u64,
    /// Per-chunk recognizer watchdog.
    pub chunk_timeout_ms: u64,
    /// Number of chunk timeouts within `chunk_timeout_burst_window_ms`
    /// that forces a stream restart.
    pub chunk_timeout_burst: usize,
    pub chunk_timeout_burst_window_ms: u64,
    /// Maximum times a single chunk is submitted to the recognizer.
    pub max_chunk_retries: u32,
    /// Retry backoff schedule in milliseconds.
    pub chunk_retry_backoff_ms: Vec<u64>,
    /// Hard ceiling on how long a pending final may wait before commit.
    pub max_finalization_wait_ms: u64,
    /// Cap applied to every individual finalization reschedule.
    pub finalization_reschedule_cap_ms: u64,
    /// Safety timeout for a buffered forced final.
    pub forced_final_max_wait_ms: u64,
    /// Watchdog between finalize and broadcast-commit.
    pub recovery_watchdog_ms: u64,
    /// Window after a broadcast final during which the next final may be
    /// merged into it.
    pub continuation_window_ms: u64,
    /// Freshness window for `longestPartialText` when extending a final.
    pub longest_partial_max_age_ms: u64,
    /// Freshness window for `latestPartialText` when extending a final.
    pub latest_partial_max_age_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            jitter_release_ms: 100,
            jitter_min_hold_ms: 80,
            rolling_buffer_ms: 2500,
            chunk_timeout_ms: 7000,
            chunk_timeout_burst: 6,
            chunk_timeout_burst_window_ms: 2500,
            max_chunk_retries: 3,
            chunk_retry_backoff_ms: vec![100, 200, 400],
            max_finalization_wait_ms: 10_000,
            finalization_reschedule_cap_ms: 4000,
            forced_final_max_wait_ms: 1500,
            recovery_watchdog_ms: 5000,
            continuation_window_ms: 3000,
            longest_partial_max_age_ms: 10_000,
            latest_partial_max_age_ms: 5000,
        }
    }
}
