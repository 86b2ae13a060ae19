pub mod broadcast;
pub mod registry;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, timeout};
use tracing::{debug, info, warn};

use voxrelay_pipeline::recognizer::{RecognizerEvent, StreamOptions, StreamingRecognizer};
use voxrelay_pipeline::recognizer::DiarizationOptions;
use voxrelay_pipeline::{
    CandidateSource, PipelineAction, PipelineConfig, PipelineDriver, PipelineInput,
    RecognizerAdapter, RecognizerError, SegmentId,
};
use voxrelay_translate::coordinator::{
    CoordinatorEvent, CoordinatorSettings, TranslationCoordinator,
};
use voxrelay_translate::{GrammarCorrector, RecoveryTranscriber, Translator};

use crate::ws::messages::{ControlMessage, InitRequest, error_codes};
use broadcast::SequencedBroadcaster;
use registry::{SessionHandle, SessionRegistry};

/// Messages fed into a session's serialization point.
pub enum SessionMsg {
    Audio { data: String },
    AudioEnd,
    Pipeline(PipelineInput),
    ListenerJoin {
        connection_id: String,
        target_lang: String,
        tx: mpsc::Sender<String>,
    },
    ListenerLeave { connection_id: String },
    StatsRequest,
    Shutdown,
}

/// Everything a session needs injected at creation.
pub struct SessionDeps {
    pub recognizer: Arc<dyn StreamingRecognizer>,
    pub translator: Option<Arc<dyn Translator>>,
    pub grammar: Option<Arc<dyn GrammarCorrector>>,
    pub recovery: Option<Arc<dyn RecoveryTranscriber>>,
    pub pipeline: PipelineConfig,
    pub fallback_to_english: bool,
    pub phrase_set_id: Option<String>,
    pub project_id: Option<String>,
    pub detect_scripture: bool,
}

/// Spawns the session actor: one task owning one pipeline, one
/// coordinator and one broadcaster. Returns the registered handle.
pub async fn spawn_session(
    session_id: String,
    init: InitRequest,
    deps: SessionDeps,
    host_tx: mpsc::Sender<String>,
    registry: Arc<SessionRegistry>,
) -> Result<SessionHandle, RecognizerError> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<SessionMsg>(256);
    let (recog_tx, recog_rx) = mpsc::channel::<RecognizerEvent>(256);
    let (coord_tx, coord_rx) = mpsc::channel::<CoordinatorEvent>(256);

    let options = StreamOptions {
        language: init.source_lang.clone(),
        enhanced_model: init.tier.as_deref() != Some("default"),
        phrase_set_id: deps.phrase_set_id.clone(),
        project_id: deps.project_id.clone(),
        alternative_languages: init
            .enable_multi_language
            .unwrap_or(false)
            .then(|| init.alternative_language_codes.clone().unwrap_or_default())
            .unwrap_or_default(),
        diarization: init.enable_speaker_diarization.unwrap_or(false).then(|| {
            DiarizationOptions {
                min_speakers: init.min_speakers.unwrap_or(1),
                max_speakers: init.max_speakers.unwrap_or(4),
            }
        }),
        ..StreamOptions::default()
    };

    let adapter = Arc::new(
        RecognizerAdapter::initialize(
            deps.recognizer.clone(),
            deps.pipeline.clone(),
            options,
            deps.fallback_to_english,
            recog_tx,
        )
        .await?,
    );

    let mut coordinator_settings = CoordinatorSettings::for_source(&init.source_lang);
    coordinator_settings.detect_scripture = deps.detect_scripture;
    coordinator_settings.continuation_window =
        tokio::time::Duration::from_millis(deps.pipeline.continuation_window_ms);
    let coordinator = TranslationCoordinator::new(
        coordinator_settings,
        deps.translator.clone(),
        deps.grammar.clone(),
        coord_tx,
    );

    // Solo mode collapses host and listener into this one connection: the
    // host's own target language is translated even with no listeners.
    let host_target = (init.mode.as_deref() == Some("solo"))
        .then(|| init.target_lang.clone())
        .flatten()
        .filter(|t| *t != init.source_lang);

    let actor = SessionActor {
        session_id: session_id.clone(),
        source_lang: init.source_lang.clone(),
        host_target,
        driver: PipelineDriver::new(deps.pipeline.clone()),
        coordinator,
        broadcaster: SequencedBroadcaster::new(host_tx),
        adapter,
        recovery: deps.recovery.clone(),
        cmd_tx: cmd_tx.clone(),
        registry: registry.clone(),
        committed_finals: 0,
        started_at: Instant::now(),
    };
    tokio::spawn(actor.run(cmd_rx, recog_rx, coord_rx));

    let handle = SessionHandle {
        id: session_id,
        source_lang: init.source_lang,
        cmd_tx,
    };
    registry.insert(handle.clone());
    Ok(handle)
}

struct SessionActor {
    session_id: String,
    source_lang: String,
    host_target: Option<String>,
    driver: PipelineDriver,
    coordinator: TranslationCoordinator,
    broadcaster: SequencedBroadcaster,
    adapter: Arc<RecognizerAdapter>,
    recovery: Option<Arc<dyn RecoveryTranscriber>>,
    cmd_tx: mpsc::Sender<SessionMsg>,
    registry: Arc<SessionRegistry>,
    committed_finals: u64,
    started_at: Instant,
}

impl SessionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionMsg>,
        mut recog_rx: mpsc::Receiver<RecognizerEvent>,
        mut coord_rx: mpsc::Receiver<CoordinatorEvent>,
    ) {
        info!(session_id = %self.session_id, source = %self.source_lang, "session started");
        loop {
            let keep_going = tokio::select! {
                msg = cmd_rx.recv() => match msg {
                    Some(msg) => self.on_cmd(msg).await,
                    None => false,
                },
                event = recog_rx.recv() => match event {
                    Some(event) => self.on_recognizer(event).await,
                    // Adapter gone (fatal already reported or destroyed).
                    None => false,
                },
                event = coord_rx.recv() => match event {
                    Some(event) => {
                        self.on_coordinator(event).await;
                        true
                    }
                    None => false,
                },
            };
            if !keep_going {
                break;
            }
        }

        self.flush_open_segment(&mut coord_rx).await;
        self.adapter.destroy().await;
        self.registry.remove(&self.session_id);
        self.broadcaster.send_control_to_all(&ControlMessage::Info {
            message: "session closed".to_string(),
            connection_id: None,
        });
        info!(session_id = %self.session_id, "session stopped");
    }

    /// Closes the open segment on teardown so a best candidate still in
    /// flight is committed rather than abandoned, then drains the
    /// coordinator until that final (and anything queued before it) has
    /// been broadcast.
    async fn flush_open_segment(&mut self, coord_rx: &mut mpsc::Receiver<CoordinatorEvent>) {
        let segment = self.driver.current_segment();
        let actions = self
            .driver
            .handle(PipelineInput::CloseSegment { segment }, Instant::now());
        let committed = actions
            .iter()
            .any(|action| matches!(action, PipelineAction::Commit(_)));
        self.dispatch(actions).await;
        if !committed {
            return;
        }

        // Bounded drain: the fan-out worker is still running, so the final
        // arrives unless a worker hangs past its own timeouts.
        for _ in 0..64 {
            match timeout(Duration::from_secs(5), coord_rx.recv()).await {
                Ok(Some(event)) => {
                    let done = matches!(
                        &event,
                        CoordinatorEvent::Final { segment: s, .. } if *s == segment
                    );
                    self.on_coordinator(event).await;
                    if done {
                        return;
                    }
                }
                Ok(None) | Err(_) => return,
            }
        }
    }

    async fn on_cmd(&mut self, msg: SessionMsg) -> bool {
        match msg {
            SessionMsg::Audio { data } => {
                if let Err(e) = self.adapter.process_audio(&data).await {
                    self.broadcaster.send_control_to_host(&ControlMessage::Warning {
                        code: Some(error_codes::VALIDATION_ERROR.to_string()),
                        message: e.to_string(),
                    });
                }
            }
            SessionMsg::AudioEnd => self.adapter.audio_end().await,
            SessionMsg::Pipeline(input) => {
                let actions = self.driver.handle(input, Instant::now());
                self.dispatch(actions).await;
            }
            SessionMsg::ListenerJoin {
                connection_id,
                target_lang,
                tx,
            } => {
                let joined = ControlMessage::SessionJoined {
                    session_id: self.session_id.clone(),
                    connection_id: connection_id.clone(),
                    target_lang: target_lang.clone(),
                };
                let _ = tx.try_send(joined.to_json());
                self.broadcaster
                    .add_subscriber(&connection_id, &target_lang, tx);
                debug!(%connection_id, %target_lang, "listener joined");
                self.send_stats();
            }
            SessionMsg::ListenerLeave { connection_id } => {
                self.broadcaster.remove_subscriber(&connection_id);
                self.send_stats();
            }
            SessionMsg::StatsRequest => self.send_stats(),
            SessionMsg::Shutdown => return false,
        }
        true
    }

    async fn on_recognizer(&mut self, event: RecognizerEvent) -> bool {
        let now = Instant::now();
        match event {
            RecognizerEvent::Partial(text) => {
                let actions = self.driver.handle(PipelineInput::Partial(text), now);
                self.dispatch(actions).await;
            }
            RecognizerEvent::Final(text) => {
                let actions = self.driver.handle(PipelineInput::Final(text), now);
                self.dispatch(actions).await;
            }
            RecognizerEvent::Forced(text) => {
                let actions = self.driver.handle(PipelineInput::Forced(text), now);
                self.dispatch(actions).await;
            }
            RecognizerEvent::Warning(message) => {
                self.broadcaster
                    .send_control_to_host(&ControlMessage::Warning {
                        code: None,
                        message,
                    });
            }
            RecognizerEvent::Fatal(message) => {
                warn!(session_id = %self.session_id, %message, "fatal recognizer failure");
                self.broadcaster.send_control_to_host(&ControlMessage::Error {
                    code: Some(error_codes::INTERNAL_ERROR.to_string()),
                    message,
                    retry_after: None,
                });
                return false;
            }
        }
        true
    }

    async fn on_coordinator(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Partial(translation) => {
                self.broadcaster.broadcast_partial(translation);
            }
            CoordinatorEvent::Final {
                segment,
                commit_id,
                events,
                scripture,
            } => {
                if self.broadcaster.broadcast_final(events) {
                    self.driver.mark_committed(segment, &commit_id);
                    self.committed_finals += 1;
                }
                if let Some(event) = scripture {
                    self.broadcaster.broadcast_scripture(event);
                }
            }
            CoordinatorEvent::GrammarCandidate { segment, text } => {
                let actions = self.driver.handle(
                    PipelineInput::ExternalCandidate {
                        segment,
                        text,
                        source: CandidateSource::Grammar,
                    },
                    Instant::now(),
                );
                self.dispatch(actions).await;
            }
        }
    }

    /// Carries out pipeline actions; follow-up actions produced while
    /// resolving one (e.g. immediate recovery resolution) join the queue.
    async fn dispatch(&mut self, actions: Vec<PipelineAction>) {
        let mut queue = actions;
        while !queue.is_empty() {
            let mut follow_ups = Vec::new();
            for action in queue {
                match action {
                    PipelineAction::EmitPartial { segment, text } => {
                        let targets = self.targets();
                        self.coordinator.on_partial(segment, &text, &targets);
                    }
                    PipelineAction::Commit(utterance) => {
                        let targets = self.targets();
                        self.coordinator.on_commit(utterance, targets).await;
                    }
                    PipelineAction::ArmFinalizeTimer { generation, delay } => {
                        self.arm_timer(PipelineInput::FinalizeTimer { generation }, delay);
                    }
                    PipelineAction::ArmForcedTimer { generation, delay } => {
                        self.arm_timer(PipelineInput::ForcedTimer { generation }, delay);
                    }
                    PipelineAction::ArmRecoveryWatchdog {
                        segment,
                        commit_id,
                        delay,
                    } => {
                        self.arm_timer(
                            PipelineInput::RecoveryWatchdog { segment, commit_id },
                            delay,
                        );
                    }
                    PipelineAction::RequestRecovery { segment } => {
                        follow_ups.extend(self.request_recovery(segment).await);
                    }
                }
            }
            queue = follow_ups;
        }
    }

    fn arm_timer(&self, input: PipelineInput, delay: tokio::time::Duration) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(SessionMsg::Pipeline(input)).await;
        });
    }

    /// Hands the rolling audio buffer to the recovery transcriber. Without
    /// a configured worker, recovery resolves immediately so the gate
    /// never deadlocks waiting for it.
    async fn request_recovery(&mut self, segment: SegmentId) -> Vec<PipelineAction> {
        let Some(worker) = self.recovery.clone() else {
            return self
                .driver
                .handle(PipelineInput::RecoveryResolved { segment }, Instant::now());
        };

        let adapter = self.adapter.clone();
        let cmd_tx = self.cmd_tx.clone();
        let language = self.source_lang.clone();
        tokio::spawn(async move {
            let audio = adapter.rolling_snapshot().await;
            if !audio.is_empty() {
                match worker.transcribe(audio, &language).await {
                    Ok(text) if !text.trim().is_empty() => {
                        let _ = cmd_tx
                            .send(SessionMsg::Pipeline(PipelineInput::ExternalCandidate {
                                segment,
                                text,
                                source: CandidateSource::Recovery,
                            }))
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => debug!(%e, "recovery transcription failed"),
                }
            }
            let _ = cmd_tx
                .send(SessionMsg::Pipeline(PipelineInput::RecoveryResolved { segment }))
                .await;
        });
        Vec::new()
    }

    fn targets(&self) -> Vec<String> {
        let mut targets = self.broadcaster.target_languages();
        if let Some(extra) = &self.host_target
            && !targets.contains(extra)
        {
            targets.push(extra.clone());
        }
        targets
    }

    fn send_stats(&mut self) {
        let stats = ControlMessage::SessionStats {
            session_id: self.session_id.clone(),
            listener_count: self.broadcaster.subscriber_count(),
            languages: self.targets(),
            committed_finals: self.committed_finals,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
        };
        self.broadcaster.send_control_to_host(&stats);
    }
}
