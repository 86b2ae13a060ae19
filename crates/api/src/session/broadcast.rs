use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use voxrelay_translate::{ScriptureEvent, TranslationEvent};

use crate::ws::messages::ControlMessage;

/// Outbound queue depth per subscriber. A subscriber that cannot drain
/// this many messages is closed rather than ever blocking the pipeline.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 128;

/// One attached listener sink.
struct Subscriber {
    target_lang: String,
    tx: mpsc::Sender<String>,
}

/// Stamps every outgoing message with the session's monotonic sequence id
/// and routes it: partials to the host plus the matching language,
/// finals to the host plus all matching listeners.
///
/// Subscribers must discard any `seqId` at or below their per-channel high
/// water mark.
pub struct SequencedBroadcaster {
    seq: u64,
    host: Option<mpsc::Sender<String>>,
    subscribers: HashMap<String, Subscriber>,
}

impl SequencedBroadcaster {
    pub fn new(host: mpsc::Sender<String>) -> Self {
        Self {
            seq: 0,
            host: Some(host),
            subscribers: HashMap::new(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub fn add_subscriber(&mut self, connection_id: &str, target_lang: &str, tx: mpsc::Sender<String>) {
        self.subscribers.insert(
            connection_id.to_string(),
            Subscriber {
                target_lang: target_lang.to_string(),
                tx,
            },
        );
    }

    pub fn remove_subscriber(&mut self, connection_id: &str) {
        self.subscribers.remove(connection_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Distinct target languages across attached subscribers.
    pub fn target_languages(&self) -> Vec<String> {
        let mut langs: Vec<String> = self
            .subscribers
            .values()
            .map(|s| s.target_lang.clone())
            .collect();
        langs.sort();
        langs.dedup();
        langs
    }

    /// Assigns the next seq and sends to the host plus subscribers whose
    /// language matches the event's target.
    pub fn broadcast_partial(&mut self, mut event: TranslationEvent) {
        event.seq_id = self.next_seq();
        let target = event.target_lang.clone();
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!(%e, "unserializable partial event");
                return;
            }
        };
        self.send_to_host(&json);
        self.send_to_lang(&target, &json);
    }

    /// Emits each per-language event of a committed utterance at its own
    /// seq. Returns true when at least the host emit was attempted, so the
    /// caller can confirm the commit to the finality gate.
    pub fn broadcast_final(&mut self, events: Vec<TranslationEvent>) -> bool {
        for mut event in events {
            event.seq_id = self.next_seq();
            let target = event.target_lang.clone();
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!(%e, "unserializable final event");
                    continue;
                }
            };
            self.send_to_host(&json);
            self.send_to_lang(&target, &json);
        }
        true
    }

    pub fn broadcast_scripture(&mut self, mut event: ScriptureEvent) {
        event.seq_id = self.next_seq();
        if let Ok(json) = serde_json::to_string(&event) {
            self.send_to_host(&json);
            let all: Vec<String> = self.subscribers.keys().cloned().collect();
            for id in all {
                self.send_to_subscriber(&id, &json);
            }
        }
    }

    /// Control messages are sequenced too; the seq counter is the session's
    /// single ordering primitive.
    pub fn send_control_to_host(&mut self, message: &ControlMessage) {
        let json = message.to_json();
        self.send_to_host(&json);
    }

    pub fn send_control_to_all(&mut self, message: &ControlMessage) {
        let json = message.to_json();
        self.send_to_host(&json);
        let all: Vec<String> = self.subscribers.keys().cloned().collect();
        for id in all {
            self.send_to_subscriber(&id, &json);
        }
    }

    fn send_to_host(&mut self, json: &str) {
        if let Some(host) = &self.host
            && host.try_send(json.to_string()).is_err()
        {
            debug!("host outbound queue unavailable");
        }
    }

    fn send_to_lang(&mut self, target_lang: &str, json: &str) {
        let matching: Vec<String> = self
            .subscribers
            .iter()
            .filter(|(_, s)| s.target_lang == target_lang)
            .map(|(id, _)| id.clone())
            .collect();
        for id in matching {
            self.send_to_subscriber(&id, json);
        }
    }

    /// Never blocks: a full queue means the subscriber cannot keep up, and
    /// it is dropped (its pump task closes the socket when the sender side
    /// goes away).
    fn send_to_subscriber(&mut self, connection_id: &str, json: &str) {
        let Some(subscriber) = self.subscribers.get(connection_id) else {
            return;
        };
        if subscriber.tx.try_send(json.to_string()).is_err() {
            warn!(%connection_id, "subscriber queue overflow, closing subscriber");
            self.subscribers.remove(connection_id);
        }
    }
}
