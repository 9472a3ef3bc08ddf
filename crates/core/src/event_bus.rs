//! Engine event bus — trait for emitting enrollment lifecycle events.
//!
//! Components accept an `Arc<dyn EventSink>` so the engine can feed
//! operator dashboards and downstream consumers without depending on them.

use crate::types::{EngineEvent, EngineEventType};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Trait for emitting engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// No-op sink for tests and deployments that don't consume events.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Writes every event to the structured log at debug level.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        tracing::debug!(
            event_type = ?event.event_type,
            scenario_id = %event.scenario_id,
            enrollment_id = %event.enrollment_id,
            recipient_id = %event.recipient_id,
            step_order = ?event.step_order,
            detail = event.detail.as_deref().unwrap_or(""),
            "Engine event"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EngineEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating an `EngineEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EngineEventType,
    scenario_id: Uuid,
    enrollment_id: Uuid,
    recipient_id: impl Into<String>,
    step_order: Option<usize>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        event_type,
        scenario_id,
        enrollment_id,
        recipient_id: recipient_id.into(),
        step_order,
        node_id: "local".into(),
        detail: None,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus for components that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let scenario = Uuid::new_v4();
        let enrollment = Uuid::new_v4();
        sink.emit(make_event(
            EngineEventType::EnrollmentCreated,
            scenario,
            enrollment,
            "patient-1",
            Some(0),
        ));
        sink.emit(make_event(
            EngineEventType::StepExecuted,
            scenario,
            enrollment,
            "patient-1",
            Some(0),
        ));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EngineEventType::EnrollmentCreated), 1);
        assert_eq!(sink.count_type(EngineEventType::StepExecuted), 1);

        let events = sink.events();
        assert_eq!(events[0].recipient_id, "patient-1");
        assert_eq!(events[1].step_order, Some(0));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(make_event(
            EngineEventType::EnrollmentExited,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "patient-2",
            None,
        ));
    }
}
