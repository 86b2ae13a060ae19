use std::collections::VecDeque;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::recognizer::jitter::{AudioChunk, ChunkWatchdogs, JitterGate, RollingAudioBuffer};
use crate::recognizer::{
    ConfigProblem, RecognizerError, RecognizerEvent, StreamEvent, StreamOptions,
    StreamingRecognizer,
};

/// Transient reconnect attempts before the failure is treated as fatal.
const MAX_RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);

enum AdapterCmd {
    Audio(Vec<u8>),
    AudioEnd,
    Snapshot(oneshot::Sender<Vec<u8>>),
    Destroy,
}

/// Guard that aborts the adapter task when dropped.
///
/// `tokio::spawn` returns a `JoinHandle` whose `Drop` impl detaches (does
/// NOT abort) the task, so the adapter aborts it explicitly.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Thin wrapper over the external stream recognizer. Hides reconnects,
/// chunk retries and voice-activity restarts; delivers an ordered stream of
/// `Partial`, `Final` and `Forced` events to the session.
pub struct RecognizerAdapter {
    cmd_tx: mpsc::Sender<AdapterCmd>,
    _task: AbortOnDrop,
}

impl RecognizerAdapter {
    /// Prepares a streaming session in the chosen language with interim
    /// results enabled.
    ///
    /// Fails with `RecognizerError::UnsupportedLanguage` when the language
    /// is not recognizer-supported, unless `fallback_to_english` lets the
    /// adapter downgrade to English (surfaced as a `Warning` event).
    pub async fn initialize(
        recognizer: Arc<dyn StreamingRecognizer>,
        cfg: PipelineConfig,
        mut options: StreamOptions,
        fallback_to_english: bool,
        events: mpsc::Sender<RecognizerEvent>,
    ) -> Result<Self, RecognizerError> {
        if !recognizer.supports_language(&options.language) {
            if !fallback_to_english {
                return Err(RecognizerError::UnsupportedLanguage(options.language));
            }
            warn!(
                language = %options.language,
                "source language unsupported, falling back to English"
            );
            let _ = events
                .send(RecognizerEvent::Warning(format!(
                    "language {} not supported by recognizer, using en-US",
                    options.language
                )))
                .await;
            options.language = "en-US".to_string();
        }

        let (audio_tx, result_rx) = open_stream(recognizer.as_ref(), &mut options).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let worker = AdapterWorker {
            recognizer,
            cfg: cfg.clone(),
            options,
            events,
            gate: JitterGate::new(&cfg),
            rolling: RollingAudioBuffer::new(&cfg),
            watchdogs: ChunkWatchdogs::new(&cfg),
            pending: VecDeque::new(),
            cached_partial: None,
            downgrade_warned: false,
        };
        let task = tokio::spawn(worker.run(cmd_rx, audio_tx, result_rx));

        Ok(Self {
            cmd_tx,
            _task: AbortOnDrop(task),
        })
    }

    /// Enqueues a base64 PCM chunk into the jitter gate.
    pub async fn process_audio(&self, base64_pcm: &str) -> Result<(), RecognizerError> {
        let bytes = BASE64
            .decode(base64_pcm)
            .map_err(|e| RecognizerError::Fatal(format!("undecodable audio payload: {e}")))?;
        self.cmd_tx
            .send(AdapterCmd::Audio(bytes))
            .await
            .map_err(|_| RecognizerError::Fatal("recognizer adapter stopped".to_string()))
    }

    /// Client end-of-audio hint. The pipeline keeps running until the
    /// recognizer finalizes naturally.
    pub async fn audio_end(&self) {
        let _ = self.cmd_tx.send(AdapterCmd::AudioEnd).await;
    }

    /// Snapshot of the rolling audio ring, for post-hoc recovery.
    pub async fn rolling_snapshot(&self) -> Vec<u8> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(AdapterCmd::Snapshot(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Intentional no-op: the recognizer alone decides when to finalize;
    /// the finalization wait-window guarantees an eventual commit.
    pub fn force_commit(&self) {}

    /// Releases all resources and cancels all timers.
    pub async fn destroy(&self) {
        let _ = self.cmd_tx.send(AdapterCmd::Destroy).await;
    }
}

/// Opens a stream, transparently downgrading enhanced-model / adaptation
/// options on the first configuration rejection.
async fn open_stream(
    recognizer: &dyn StreamingRecognizer,
    options: &mut StreamOptions,
) -> Result<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<StreamEvent>), RecognizerError> {
    match recognizer.start_stream(options.clone()).await {
        Ok(pair) => Ok(pair),
        Err(RecognizerError::Config(problem)) => {
            apply_downgrade(options, &problem);
            info!(?problem, "recognizer configuration rejected, retrying downgraded");
            recognizer.start_stream(options.clone()).await
        }
        Err(e) => Err(e),
    }
}

fn apply_downgrade(options: &mut StreamOptions, problem: &ConfigProblem) {
    match problem {
        ConfigProblem::EnhancedModelUnavailable => options.enhanced_model = false,
        ConfigProblem::PhraseSetRejected => {
            options.phrase_set_id = None;
            options.project_id = None;
        }
    }
}

struct AdapterWorker {
    recognizer: Arc<dyn StreamingRecognizer>,
    cfg: PipelineConfig,
    options: StreamOptions,
    events: mpsc::Sender<RecognizerEvent>,
    gate: JitterGate,
    rolling: RollingAudioBuffer,
    watchdogs: ChunkWatchdogs,
    /// Chunks written to the recognizer, awaiting acknowledgment (FIFO,
    /// mirrors the watchdog queue).
    pending: VecDeque<AudioChunk>,
    /// Most recent partial with no final emitted for it yet.
    cached_partial: Option<String>,
    downgrade_warned: bool,
}

enum LoopStep {
    Continue,
    Restart,
    Stop,
}

impl AdapterWorker {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<AdapterCmd>,
        mut audio_tx: mpsc::Sender<Vec<u8>>,
        mut result_rx: mpsc::Receiver<StreamEvent>,
    ) {
        info!(recognizer = %self.recognizer.name(), language = %self.options.language, "recognizer adapter started");
        loop {
            let release_at = self.gate.next_release_at();
            let watchdog_at = self.watchdogs.next_deadline();

            let step = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(AdapterCmd::Audio(bytes)) => {
                        self.gate.push(bytes, Instant::now());
                        LoopStep::Continue
                    }
                    Some(AdapterCmd::AudioEnd) => LoopStep::Continue,
                    Some(AdapterCmd::Snapshot(reply)) => {
                        let _ = reply.send(self.rolling.snapshot());
                        LoopStep::Continue
                    }
                    Some(AdapterCmd::Destroy) | None => LoopStep::Stop,
                },
                event = result_rx.recv() => self.on_stream_event(event).await,
                _ = conditional_sleep(release_at), if release_at.is_some() => {
                    self.release_chunks(&mut audio_tx).await
                }
                _ = conditional_sleep(watchdog_at), if watchdog_at.is_some() => {
                    self.on_watchdog().await
                }
            };

            match step {
                LoopStep::Continue => {}
                LoopStep::Stop => break,
                LoopStep::Restart => {
                    match self.restart().await {
                        Some((tx, rx)) => {
                            audio_tx = tx;
                            result_rx = rx;
                            self.refill(&mut audio_tx).await;
                        }
                        None => break,
                    }
                }
            }
        }
        debug!("recognizer adapter stopped");
    }

    async fn on_stream_event(&mut self, event: Option<StreamEvent>) -> LoopStep {
        match event {
            Some(StreamEvent::Result { text, is_final }) => {
                if is_final {
                    self.watchdogs.clear_all();
                    self.pending.clear();
                    self.cached_partial = None;
                    if self.events.send(RecognizerEvent::Final(text)).await.is_err() {
                        return LoopStep::Stop;
                    }
                } else {
                    self.watchdogs.clear_oldest();
                    self.pending.pop_front();
                    self.cached_partial = Some(text.clone());
                    if self.events.send(RecognizerEvent::Partial(text)).await.is_err() {
                        return LoopStep::Stop;
                    }
                }
                LoopStep::Continue
            }
            Some(StreamEvent::Error(e)) => self.on_stream_error(e).await,
            // Stream ended without error: voice-activity restart.
            None => LoopStep::Restart,
        }
    }

    async fn on_stream_error(&mut self, error: RecognizerError) -> LoopStep {
        match error {
            RecognizerError::Transient(reason) => {
                debug!(%reason, "transient recognizer failure, restarting stream");
                LoopStep::Restart
            }
            RecognizerError::Config(problem) => {
                apply_downgrade(&mut self.options, &problem);
                if self.downgrade_warned {
                    let _ = self
                        .events
                        .send(RecognizerEvent::Warning(format!(
                            "recognizer configuration repeatedly rejected: {problem:?}"
                        )))
                        .await;
                } else {
                    self.downgrade_warned = true;
                }
                LoopStep::Restart
            }
            RecognizerError::Fatal(reason) => {
                let _ = self.events.send(RecognizerEvent::Fatal(reason)).await;
                LoopStep::Stop
            }
            RecognizerError::UnsupportedLanguage(lang) => {
                let _ = self
                    .events
                    .send(RecognizerEvent::Fatal(format!("unsupported language: {lang}")))
                    .await;
                LoopStep::Stop
            }
        }
    }

    /// Releases due chunks into the recognizer, promoting each to the
    /// rolling buffer and arming its watchdog.
    async fn release_chunks(&mut self, audio_tx: &mut mpsc::Sender<Vec<u8>>) -> LoopStep {
        let now = Instant::now();
        for chunk in self.gate.take_releasable(now) {
            if audio_tx.send(chunk.bytes.clone()).await.is_err() {
                warn!("recognizer stream closed while writing audio");
                // Keep the chunk for the refill after restart.
                self.pending.push_back(chunk);
                return LoopStep::Restart;
            }
            self.rolling.push(chunk.bytes.clone(), now);
            self.watchdogs.arm(chunk.chunk_id, now);
            self.pending.push_back(chunk);
        }
        LoopStep::Continue
    }

    async fn on_watchdog(&mut self) -> LoopStep {
        let now = Instant::now();
        let (expired, restart) = self.watchdogs.expire(now);
        for chunk_id in expired {
            if let Some(pos) = self.pending.iter().position(|c| c.chunk_id == chunk_id) {
                let chunk = self.pending.remove(pos).expect("position just found");
                if self.gate.requeue(chunk, &self.cfg, now).is_none() {
                    debug!(chunk_id, "chunk dropped after exhausting retries");
                }
            }
        }
        if restart {
            warn!("chunk timeout burst, forcing stream restart");
            LoopStep::Restart
        } else {
            LoopStep::Continue
        }
    }

    /// The restart sequence: flush any unacknowledged partial as `Forced`,
    /// tear down per-stream state, reopen with the same language and
    /// session context. Queued audio is drained by the caller via
    /// [`refill`](Self::refill).
    async fn restart(&mut self) -> Option<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<StreamEvent>)> {
        if let Some(partial) = self.cached_partial.take()
            && !partial.trim().is_empty()
        {
            info!("emitting unacknowledged partial as forced final before restart");
            if self.events.send(RecognizerEvent::Forced(partial)).await.is_err() {
                return None;
            }
        }

        // Unacknowledged chunks go back through the gate so the new stream
        // hears them again (subject to each chunk's retry budget).
        let now = Instant::now();
        self.watchdogs.clear();
        while let Some(chunk) = self.pending.pop_back() {
            let _ = self.gate.requeue(chunk, &self.cfg, now);
        }

        let mut attempt = 0;
        loop {
            match open_stream(self.recognizer.as_ref(), &mut self.options).await {
                Ok(pair) => {
                    info!(language = %self.options.language, "recognizer stream restarted");
                    return Some(pair);
                }
                Err(e) if e.is_transient() && attempt < MAX_RECONNECT_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(RECONNECT_BACKOFF * attempt).await;
                }
                Err(e) => {
                    let _ = self
                        .events
                        .send(RecognizerEvent::Fatal(format!("recognizer restart failed: {e}")))
                        .await;
                    return None;
                }
            }
        }
    }

    /// Writes everything queued in the jitter gate into a fresh stream.
    async fn refill(&mut self, audio_tx: &mut mpsc::Sender<Vec<u8>>) {
        let now = Instant::now();
        for chunk in self.gate.drain_all() {
            if audio_tx.send(chunk.bytes.clone()).await.is_err() {
                warn!("fresh recognizer stream closed during refill");
                self.pending.push_back(chunk);
                return;
            }
            self.rolling.push(chunk.bytes.clone(), now);
            self.watchdogs.arm(chunk.chunk_id, now);
            self.pending.push_back(chunk);
        }
    }
}

async fn conditional_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
