use std::collections::VecDeque;

use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::config::PipelineConfig;

/// One audio chunk inside the jitter gate.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub chunk_id: u64,
    pub bytes: Vec<u8>,
    pub received_at: Instant,
    pub release_at: Instant,
    /// Times this chunk has been written to the recognizer.
    pub attempts: u32,
}

/// Holds incoming chunks for a small batching window to smooth bursts, then
/// releases them to the recognizer in receive order.
#[derive(Debug)]
pub struct JitterGate {
    queue: VecDeque<AudioChunk>,
    next_chunk_id: u64,
    release_after: Duration,
    min_hold: Duration,
}

impl JitterGate {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            next_chunk_id: 0,
            release_after: Duration::from_millis(cfg.jitter_release_ms),
            min_hold: Duration::from_millis(cfg.jitter_min_hold_ms),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueues a chunk, tagging it with the next monotonic id.
    pub fn push(&mut self, bytes: Vec<u8>, now: Instant) -> u64 {
        let chunk_id = self.next_chunk_id;
        self.next_chunk_id += 1;
        self.queue.push_back(AudioChunk {
            chunk_id,
            bytes,
            received_at: now,
            release_at: now + self.release_after,
            attempts: 0,
        });
        chunk_id
    }

    /// Re-enqueues a timed-out chunk at the front for another attempt.
    /// Returns the backoff delay, or `None` when the retry budget is spent.
    pub fn requeue(&mut self, mut chunk: AudioChunk, cfg: &PipelineConfig, now: Instant) -> Option<Duration> {
        if chunk.attempts >= cfg.max_chunk_retries {
            debug!(chunk_id = chunk.chunk_id, "chunk retry budget exhausted, dropping");
            return None;
        }
        let backoff_ms = cfg
            .chunk_retry_backoff_ms
            .get((chunk.attempts as usize).saturating_sub(1))
            .copied()
            .unwrap_or_else(|| cfg.chunk_retry_backoff_ms.last().copied().unwrap_or(400));
        let delay = Duration::from_millis(backoff_ms);
        chunk.release_at = now + delay;
        self.queue.push_front(chunk);
        Some(delay)
    }

    /// The earliest release deadline, for arming the single release timer.
    pub fn next_release_at(&self) -> Option<Instant> {
        self.queue.iter().map(|c| c.release_at).min()
    }

    /// Releases every chunk that has been held at least the minimum window
    /// and whose release time has arrived, ordered by receive time. Chunks
    /// received out of order are re-sorted here.
    pub fn take_releasable(&mut self, now: Instant) -> Vec<AudioChunk> {
        let mut ready: Vec<AudioChunk> = Vec::new();
        let mut keep: VecDeque<AudioChunk> = VecDeque::with_capacity(self.queue.len());
        for chunk in self.queue.drain(..) {
            let held = now.duration_since(chunk.received_at);
            if now >= chunk.release_at && held >= self.min_hold {
                ready.push(chunk);
            } else {
                keep.push_back(chunk);
            }
        }
        self.queue = keep;
        ready.sort_by_key(|c| (c.received_at, c.chunk_id));
        for chunk in &mut ready {
            chunk.attempts += 1;
        }
        ready
    }

    /// Drains everything regardless of deadlines (used when refilling a
    /// freshly restarted stream).
    pub fn drain_all(&mut self) -> Vec<AudioChunk> {
        let mut all: Vec<AudioChunk> = self.queue.drain(..).collect();
        all.sort_by_key(|c| (c.received_at, c.chunk_id));
        for chunk in &mut all {
            chunk.attempts += 1;
        }
        all
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Fixed-duration ring of recently released audio, kept for post-hoc
/// recovery after a forced restart truncated an utterance.
#[derive(Debug)]
pub struct RollingAudioBuffer {
    window: Duration,
    chunks: VecDeque<(Instant, Vec<u8>)>,
}

impl RollingAudioBuffer {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            window: Duration::from_millis(cfg.rolling_buffer_ms),
            chunks: VecDeque::new(),
        }
    }

    pub fn push(&mut self, bytes: Vec<u8>, now: Instant) {
        self.chunks.push_back((now, bytes));
        while let Some((at, _)) = self.chunks.front() {
            if now.duration_since(*at) > self.window {
                self.chunks.pop_front();
            } else {
                break;
            }
        }
    }

    /// Concatenated PCM of the retained window.
    pub fn snapshot(&self) -> Vec<u8> {
        let total: usize = self.chunks.iter().map(|(_, b)| b.len()).sum();
        let mut out = Vec::with_capacity(total);
        for (_, bytes) in &self.chunks {
            out.extend_from_slice(bytes);
        }
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// FIFO of armed per-chunk watchdogs plus the sliding window of recent
/// timeouts that triggers a burst restart.
#[derive(Debug)]
pub struct ChunkWatchdogs {
    armed: VecDeque<(u64, Instant)>,
    recent_timeouts: VecDeque<Instant>,
    timeout: Duration,
    burst: usize,
    burst_window: Duration,
}

impl ChunkWatchdogs {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            armed: VecDeque::new(),
            recent_timeouts: VecDeque::new(),
            timeout: Duration::from_millis(cfg.chunk_timeout_ms),
            burst: cfg.chunk_timeout_burst,
            burst_window: Duration::from_millis(cfg.chunk_timeout_burst_window_ms),
        }
    }

    /// Arms a watchdog for a chunk just written to the recognizer.
    pub fn arm(&mut self, chunk_id: u64, now: Instant) {
        self.armed.push_back((chunk_id, now + self.timeout));
    }

    /// A partial result acknowledges the oldest outstanding chunk.
    pub fn clear_oldest(&mut self) {
        self.armed.pop_front();
    }

    /// A final result acknowledges everything outstanding.
    pub fn clear_all(&mut self) {
        self.armed.clear();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.front().map(|(_, deadline)| *deadline)
    }

    /// Pops every watchdog whose deadline has passed, recording each as a
    /// timeout. Returns the expired chunk ids and whether the burst rule
    /// now demands a stream restart.
    pub fn expire(&mut self, now: Instant) -> (Vec<u64>, bool) {
        let mut expired = Vec::new();
        while let Some((chunk_id, deadline)) = self.armed.front().copied() {
            if deadline <= now {
                self.armed.pop_front();
                self.recent_timeouts.push_back(now);
                expired.push(chunk_id);
            } else {
                break;
            }
        }
        while let Some(at) = self.recent_timeouts.front() {
            if now.duration_since(*at) > self.burst_window {
                self.recent_timeouts.pop_front();
            } else {
                break;
            }
        }
        let restart = self.recent_timeouts.len() >= self.burst;
        if restart {
            self.recent_timeouts.clear();
        }
        (expired, restart)
    }

    pub fn clear(&mut self) {
        self.armed.clear();
        self.recent_timeouts.clear();
    }
}
