//! Typed lifecycle events and the synchronous fan-out bus.
//!
//! Subscribers run inline on the emitting task in registration order; a
//! panicking subscriber is caught and logged so it can never break the bus.
//! An optional buffering mode captures every emitted event into an in-memory
//! list for later draining (used by non-interactive JSON output).

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::agent::message::BudgetState;

/// Lifecycle signal emitted during a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    SessionStart {
        session_id: String,
        query: String,
    },
    SessionEnd {
        session_id: String,
        status: String,
    },
    IterationStart {
        iteration: u32,
        max_iterations: u32,
        budget: BudgetState,
    },
    IterationEnd {
        iteration: u32,
        decision: String,
        tokens_used: u64,
    },
    Thinking {
        content: String,
    },
    ToolCall {
        name: String,
        arguments: Value,
    },
    ToolResult {
        name: String,
        result: String,
        duration_ms: u64,
    },
    Done {
        result: String,
    },
    Error {
        error: String,
        recoverable: bool,
        retrying: bool,
    },
    Compression {
        messages_compressed: usize,
        tokens_freed: usize,
        used_before: usize,
        used_after: usize,
    },
    Recall {
        key: String,
        success: bool,
        tokens_recalled: usize,
    },
    MessagesDiscarded {
        count: usize,
        tokens_freed: usize,
    },
    PhaseStart {
        phase: String,
    },
    PhaseEnd {
        phase: String,
        #[serde(skip_serializing_if = "Value::is_null")]
        detail: Value,
    },
    SynthesisStart {},
    SynthesisComplete {
        tokens_used: u64,
    },
    SynthesisError {
        error: String,
    },
    OrchestratorStart {
        query: String,
    },
    OrchestratorComplete {
        iterations: u32,
        total_tokens_used: u64,
    },
    OrchestratorError {
        error: String,
    },
}

impl AgentEvent {
    /// The wire name of the event (matches the serialized `type` tag).
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::SessionStart { .. } => "session_start",
            AgentEvent::SessionEnd { .. } => "session_end",
            AgentEvent::IterationStart { .. } => "iteration_start",
            AgentEvent::IterationEnd { .. } => "iteration_end",
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::ToolCall { .. } => "tool_call",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::Done { .. } => "done",
            AgentEvent::Error { .. } => "error",
            AgentEvent::Compression { .. } => "compression",
            AgentEvent::Recall { .. } => "recall",
            AgentEvent::MessagesDiscarded { .. } => "messages_discarded",
            AgentEvent::PhaseStart { .. } => "phase_start",
            AgentEvent::PhaseEnd { .. } => "phase_end",
            AgentEvent::SynthesisStart {} => "synthesis_start",
            AgentEvent::SynthesisComplete { .. } => "synthesis_complete",
            AgentEvent::SynthesisError { .. } => "synthesis_error",
            AgentEvent::OrchestratorStart { .. } => "orchestrator_start",
            AgentEvent::OrchestratorComplete { .. } => "orchestrator_complete",
            AgentEvent::OrchestratorError { .. } => "orchestrator_error",
        }
    }
}

type Subscriber = Box<dyn Fn(&AgentEvent) + Send + Sync>;

/// Synchronous event bus.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    /// `Some` while buffering mode is enabled.
    buffer: Mutex<Option<Vec<AgentEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer: Mutex::new(None),
        }
    }

    /// Register a subscriber. Subscribers are invoked in registration order.
    pub fn subscribe(&self, f: impl Fn(&AgentEvent) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap().push(Box::new(f));
    }

    /// Enable or disable buffering mode. Enabling starts a fresh buffer.
    pub fn set_buffering(&self, on: bool) {
        let mut buffer = self.buffer.lock().unwrap();
        *buffer = if on { Some(Vec::new()) } else { None };
    }

    /// Take all buffered events, leaving an empty buffer in place.
    pub fn drain(&self) -> Vec<AgentEvent> {
        self.buffer
            .lock()
            .unwrap()
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Emit an event to every subscriber (and the buffer when enabled).
    pub fn emit(&self, event: AgentEvent) {
        if let Some(buf) = self.buffer.lock().unwrap().as_mut() {
            buf.push(event.clone());
        }
        let subscribers = self.subscribers.lock().unwrap();
        for sub in subscribers.iter() {
            if std::panic::catch_unwind(AssertUnwindSafe(|| sub(&event))).is_err() {
                warn!("event subscriber panicked on {}; continuing", event.kind());
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_subscribers_run_in_order() {
        let bus = EventBus::new();
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let l1 = log.clone();
        bus.subscribe(move |_| l1.lock().unwrap().push("first"));
        let l2 = log.clone();
        bus.subscribe(move |_| l2.lock().unwrap().push("second"));

        bus.emit(AgentEvent::PhaseStart {
            phase: "investigation".into(),
        });
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_panicking_subscriber_does_not_break_bus() {
        let bus = EventBus::new();
        bus.subscribe(|_| panic!("bad subscriber"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(AgentEvent::SynthesisStart {});
        bus.emit(AgentEvent::SynthesisStart {});
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_buffering_captures_and_drains() {
        let bus = EventBus::new();
        bus.set_buffering(true);
        bus.emit(AgentEvent::PhaseStart {
            phase: "investigation".into(),
        });
        bus.emit(AgentEvent::PhaseEnd {
            phase: "investigation".into(),
            detail: Value::Null,
        });

        let events = bus.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "phase_start");
        assert_eq!(events[1].kind(), "phase_end");

        // Drained: buffer is empty but still active.
        assert!(bus.drain().is_empty());
        bus.emit(AgentEvent::SynthesisStart {});
        assert_eq!(bus.drain().len(), 1);
    }

    #[test]
    fn test_buffering_disabled_drops_nothing_to_subscribers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.set_buffering(true);
        bus.emit(AgentEvent::SynthesisStart {});
        bus.set_buffering(false);
        bus.emit(AgentEvent::SynthesisStart {});
        // Subscribers saw both; only the first was buffered.
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn test_event_serialization_tags() {
        let e = AgentEvent::ToolCall {
            name: "read_file".into(),
            arguments: serde_json::json!({"path": "src/main.rs"}),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "tool_call");
        assert_eq!(v["name"], "read_file");

        let e = AgentEvent::IterationEnd {
            iteration: 3,
            decision: "tool_call".into(),
            tokens_used: 42,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "iteration_end");
        assert_eq!(v["tokensUsed"], 42);
    }
}
