//! `replication.link.changed` event emission (spec §6). The real
//! dispatcher/event-bus collaborator is out of scope (spec §1); this is
//! the narrow trait it implements, with a `log`-backed default matching
//! the teacher's `log::info!` usage and an in-memory recorder for tests.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOperation {
    Create,
    Update,
    Delete,
}

impl LinkOperation {
    fn as_str(&self) -> &'static str {
        match self {
            LinkOperation::Create => "create",
            LinkOperation::Update => "update",
            LinkOperation::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkChangedEvent {
    pub operation: LinkOperation,
    pub ids: Vec<String>,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: LinkChangedEvent);
}

/// Default sink: logs at info level, the same level the teacher uses for
/// lifecycle events.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: LinkChangedEvent) {
        log::info!(
            "replication.link.changed operation={} ids={:?}",
            event.operation.as_str(),
            event.ids
        );
    }
}

/// In-memory recorder for tests.
#[derive(Default)]
pub struct RecordingEventSink {
    events: std::sync::Mutex<Vec<LinkChangedEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        RecordingEventSink::default()
    }

    pub fn events(&self) -> Vec<LinkChangedEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: LinkChangedEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_keeps_emitted_events_in_order() {
        let sink = RecordingEventSink::new();
        sink.emit(LinkChangedEvent {
            operation: LinkOperation::Create,
            ids: vec!["l1".into()],
        });
        sink.emit(LinkChangedEvent {
            operation: LinkOperation::Update,
            ids: vec!["l1".into()],
        });
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].operation, LinkOperation::Create);
        assert_eq!(events[1].operation, LinkOperation::Update);
    }
}
