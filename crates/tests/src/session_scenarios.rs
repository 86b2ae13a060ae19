use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::time::{Duration, timeout};

use crate::fixtures::*;
use voxrelay_api::session::SessionMsg;
use voxrelay_translate::worker::{GrammarCorrector, RecoveryTranscriber, Translator};

/// Waits (in paused time) until the recognizer has opened `n` streams.
async fn wait_for_streams(session: &TestSession, n: usize) {
    for _ in 0..200 {
        if session.recognizer.opened.load(Ordering::SeqCst) >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("recognizer never opened {n} streams");
}

/// Scenario: partials grow into a final, then keep growing into a second
/// final. Exactly one final reaches every channel, carrying the full text.
#[tokio::test(start_paused = true)]
async fn extension_into_final_broadcasts_once() {
    let session = TestSessionBuilder::english().start().await;
    let mut listener = session.add_listener("es").await;

    let r = &session.recognizer;
    r.emit_partial("where").await;
    r.emit_partial("where two").await;
    r.emit_partial("where two or three are").await;
    r.emit_final("where two or three are").await;
    r.emit_partial("where two or three are gathered").await;
    r.emit_partial("where two or three are gathered together").await;
    r.emit_final("where two or three are gathered together").await;

    let finals = collect_finals(&mut listener, Duration::from_secs(15)).await;
    assert_eq!(finals.len(), 1, "exactly one committed final: {finals:?}");
    assert_eq!(
        finals[0]["originalText"],
        "where two or three are gathered together"
    );
    assert_eq!(
        finals[0]["translatedText"],
        "[es] where two or three are gathered together"
    );
    assert_eq!(finals[0]["hasTranslation"], true);
    assert!(finals[0].get("forceFinal").is_none());
}

/// Per-channel seq ids are strictly increasing.
#[tokio::test(start_paused = true)]
async fn listener_seq_ids_are_strictly_monotonic() {
    let session = TestSessionBuilder::english().start().await;
    let mut listener = session.add_listener("es").await;

    let r = &session.recognizer;
    r.emit_partial("the first words").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    r.emit_partial("the first words keep going").await;
    r.emit_final("the first words keep going now.").await;

    let mut last_seq = 0u64;
    let mut seen = 0;
    loop {
        match timeout(Duration::from_secs(15), listener.recv()).await {
            Ok(Some(raw)) => {
                let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
                if value["type"] != "translation" {
                    continue;
                }
                let seq = value["seqId"].as_u64().expect("seqId present");
                assert!(seq > last_seq, "seq {seq} not above {last_seq}");
                last_seq = seq;
                seen += 1;
            }
            _ => break,
        }
    }
    assert!(seen >= 2, "expected partials and a final, saw {seen}");
}

/// Scenario: recognizer restart mid-utterance. The forced flush merges
/// with the continuation and the eventual ASR final commits exactly once.
#[tokio::test(start_paused = true)]
async fn forced_restart_keeps_one_final() {
    let mut builder = TestSessionBuilder::english();
    // Recovery slower than the finalization wait: the ASR final must win.
    builder.recovery = Some(Arc::new(ScriptedRecovery {
        text: "Our own self-centered desires cordoned".to_string(),
        delay: Duration::from_secs(3),
    }) as Arc<dyn RecoveryTranscriber>);
    let session = builder.start().await;
    let mut listener = session.add_listener("es").await;

    session.feed_audio(3).await;
    let r = &session.recognizer;
    r.emit_partial("Our own self").await;
    r.emit_partial("Our own self-centered desires").await;

    // Stream teardown: the adapter flushes the partial as Forced and
    // reopens.
    r.break_stream().await;
    wait_for_streams(&session, 2).await;

    r.emit_partial("Our own self-centered desires cordoned off").await;
    r.emit_final("Our own self-centered desires cordoned off from others.")
        .await;

    let finals = collect_finals(&mut listener, Duration::from_secs(15)).await;
    assert_eq!(finals.len(), 1, "exactly one committed final: {finals:?}");
    assert_eq!(
        finals[0]["originalText"],
        "Our own self-centered desires cordoned off from others."
    );
    assert!(finals[0].get("forceFinal").is_none());
}

/// Scenario: grammar and recovery race for the same segment while recovery
/// is pending. The recovery text wins; the grammar candidate never
/// reaches subscribers.
#[tokio::test(start_paused = true)]
async fn recovery_dominates_grammar_race() {
    let mut builder = TestSessionBuilder::english();
    builder.grammar = Some(Arc::new(ScriptedGrammar {
        corrected: "Where two or three are.".to_string(),
        delay: Duration::ZERO,
    }) as Arc<dyn GrammarCorrector>);
    builder.recovery = Some(Arc::new(ScriptedRecovery {
        text: "where two or three are gathered together".to_string(),
        delay: Duration::from_millis(500),
    }) as Arc<dyn RecoveryTranscriber>);
    let session = builder.start().await;
    let mut listener = session.add_listener("es").await;

    session.feed_audio(3).await;
    let r = &session.recognizer;
    // The mid-word partial becomes a forced flush when the stream breaks.
    r.emit_partial("where two or thr").await;
    r.break_stream().await;
    wait_for_streams(&session, 2).await;

    let finals = collect_finals(&mut listener, Duration::from_secs(15)).await;
    assert_eq!(finals.len(), 1, "exactly one committed final: {finals:?}");
    assert_eq!(
        finals[0]["originalText"],
        "where two or three are gathered together"
    );
    // The grammar correction must never surface as the committed text.
    for value in &finals {
        assert_ne!(value["originalText"], "Where two or three are.");
    }
}

/// Scenario: the partial translator times out. The partial still reaches
/// the listener, marked untranslated-with-error, never silently dropped.
#[tokio::test(start_paused = true)]
async fn translator_timeout_still_delivers_partial() {
    let mut builder = TestSessionBuilder::english();
    builder.translator = Some(Arc::new(TaggingTranslator {
        fail_partials: true,
        fail_final_targets: vec![],
    }) as Arc<dyn Translator>);
    let session = builder.start().await;
    let mut listener = session.add_listener("es").await;

    session.recognizer.emit_partial("and you know").await;

    let event = next_matching(&mut listener, |v| {
        v["type"] == "translation" && v["isPartial"] == true && v["targetLang"] == "es"
    })
    .await;
    assert_eq!(event["originalText"], "and you know");
    assert_eq!(event["translatedText"], "and you know");
    assert_eq!(event["hasTranslation"], false);
    assert_eq!(event["translationError"], true);
}

/// Scenario: a sentence-incomplete final with no follow-up commits by the
/// finalization ceiling, exactly once.
#[tokio::test(start_paused = true)]
async fn incomplete_final_commits_at_ceiling() {
    let session = TestSessionBuilder::english().start().await;
    let mut listener = session.add_listener("es").await;

    session.recognizer.emit_final("The Lord is").await;

    let finals = collect_finals(&mut listener, Duration::from_secs(15)).await;
    assert_eq!(finals.len(), 1, "exactly one committed final: {finals:?}");
    assert_eq!(finals[0]["originalText"], "The Lord is");
}

/// A second final inside the continuation window that extends the first
/// broadcasts only the suffix.
#[tokio::test(start_paused = true)]
async fn continuation_final_broadcasts_delta_only() {
    let session = TestSessionBuilder::english().start().await;
    let mut listener = session.add_listener("es").await;

    let r = &session.recognizer;
    r.emit_final("It is finished.").await;
    let first = next_matching(&mut listener, |v| {
        v["type"] == "translation" && v["isPartial"] == false
    })
    .await;
    assert_eq!(first["originalText"], "It is finished.");

    // An extending final right after the commit, inside the window.
    r.emit_final("It is finished. Go in peace.").await;
    let second = next_matching(&mut listener, |v| {
        v["type"] == "translation" && v["isPartial"] == false
    })
    .await;
    assert_eq!(second["originalText"], "Go in peace.");
}

/// Solo mode: the host is its own listener, so its chosen target language
/// is translated even with nobody else attached.
#[tokio::test(start_paused = true)]
async fn solo_mode_translates_for_host_without_listeners() {
    let mut builder = TestSessionBuilder::english();
    builder.init = init_request("en-US", Some("es"));
    builder.init.mode = Some("solo".to_string());
    let mut session = builder.start().await;

    session.recognizer.emit_partial("and you know").await;

    let event = next_matching(&mut session.host_rx, |v| {
        v["type"] == "translation" && v["targetLang"] == "es"
    })
    .await;
    assert_eq!(event["translatedText"], "[es] and you know");
    assert_eq!(event["isPartial"], true);
}

/// Host disconnect mid-finalization: the open segment is closed and its
/// pending final is committed and broadcast before the session dies.
#[tokio::test(start_paused = true)]
async fn shutdown_flushes_open_segment_to_listeners() {
    let session = TestSessionBuilder::english().start().await;
    let mut listener = session.add_listener("es").await;

    // Sentence-incomplete: still waiting out its window when the host
    // goes away.
    session.recognizer.emit_final("The Lord is").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let _ = session.handle.cmd_tx.send(SessionMsg::Shutdown).await;

    let finals = collect_finals(&mut listener, Duration::from_secs(15)).await;
    assert_eq!(finals.len(), 1, "flushed final expected: {finals:?}");
    assert_eq!(finals[0]["originalText"], "The Lord is");
}

/// Host disconnect semantics: shutdown closes the session and informs
/// subscribers.
#[tokio::test(start_paused = true)]
async fn shutdown_notifies_subscribers_and_clears_registry() {
    let session = TestSessionBuilder::english().start().await;
    let mut listener = session.add_listener("es").await;

    assert_eq!(session.registry.len(), 1);
    let registry = session.registry.clone();
    session.shutdown().await;

    let info = next_matching(&mut listener, |v| v["type"] == "info").await;
    assert_eq!(info["message"], "session closed");

    // Actor cleanup removes the registration.
    for _ in 0..100 {
        if registry.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(registry.is_empty());
}
