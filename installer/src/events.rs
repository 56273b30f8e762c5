// Progress event sink
//
// One ordered channel per operation: the orchestrator/engine produces, the UI (here: the CLI)
// consumes on its own schedule. Sends never block and never fail a session.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// The session entered `stage`.
    StateChanged,
    /// Informational line while in `stage`.
    Log,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub stage: String,
    pub message: String,
    pub level: EventLevel,
    pub kind: EventKind,
}

pub type EventStream = mpsc::UnboundedReceiver<ProgressEvent>;

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl EventSink {
    pub fn channel() -> (EventSink, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx }, rx)
    }

    /// Sink whose events are only logged (no consumer attached).
    pub fn detached() -> EventSink {
        let (sink, _rx) = Self::channel();
        sink
    }

    pub fn emit(&self, event: ProgressEvent) {
        match event.level {
            EventLevel::Info => info!(
                "[PHASE: {}] [STEP: {}] {}",
                phase_for(&event),
                event.stage,
                event.message
            ),
            EventLevel::Warn => warn!(
                "[PHASE: {}] [STEP: {}] {}",
                phase_for(&event),
                event.stage,
                event.message
            ),
            EventLevel::Error => error!(
                "[PHASE: {}] [STEP: {}] {}",
                phase_for(&event),
                event.stage,
                event.message
            ),
        }

        if self.tx.send(event).is_err() {
            debug!("[PHASE: events] progress consumer dropped; event kept in log only");
        }
    }

    pub fn state_changed(&self, session_id: &str, stage: &str, message: impl Into<String>) {
        self.emit(ProgressEvent {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            stage: stage.to_string(),
            message: message.into(),
            level: EventLevel::Info,
            kind: EventKind::StateChanged,
        });
    }

    pub fn log(&self, session_id: &str, stage: &str, level: EventLevel, message: impl Into<String>) {
        self.emit(ProgressEvent {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            stage: stage.to_string(),
            message: message.into(),
            level,
            kind: EventKind::Log,
        });
    }
}

fn phase_for(event: &ProgressEvent) -> &'static str {
    match event.kind {
        EventKind::StateChanged => "session",
        EventKind::Log => "progress",
    }
}

/// Drain everything currently buffered. Used by tests and by the CLI after a session ends.
pub fn drain(stream: &mut EventStream) -> Vec<ProgressEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = stream.try_recv() {
        out.push(ev);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_emit_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.state_changed("s1", "Validated", "ok");
        sink.log("s1", "Validated", EventLevel::Info, "pulling image");
        sink.state_changed("s1", "NetworkReady", "network jira_network ready");

        let events = drain(&mut rx);
        let stages: Vec<&str> = events.iter().map(|e| e.stage.as_str()).collect();
        assert_eq!(stages, vec!["Validated", "Validated", "NetworkReady"]);
        assert_eq!(events[1].kind, EventKind::Log);
        assert!(events.iter().all(|e| e.session_id == "s1"));
    }

    #[test]
    fn dropped_consumer_does_not_panic() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.state_changed("s1", "Completed", "done");
    }

    #[test]
    fn event_serializes_camel_case() {
        let (sink, mut rx) = EventSink::channel();
        sink.log("abc", "Downloading", EventLevel::Warn, "slow mirror");
        let ev = drain(&mut rx).pop().expect("one event");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["sessionId"], "abc");
        assert_eq!(json["level"], "warn");
        assert_eq!(json["kind"], "log");
    }
}
