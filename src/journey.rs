//! Journey recorder: begin/end timestamps for the logical journeys a
//! caller experiences (start, foreground switch, unlock). The sink is an
//! external collaborator; this layer only pairs begins with ends and logs
//! elapsed time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::services::TelemetrySink;
use crate::state::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JourneyKind {
    SessionStart,
    SwitchForeground,
    Unlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JourneyPhase {
    Begin,
    End,
}

#[derive(Clone)]
pub struct JourneyRecorder {
    sink: Arc<dyn TelemetrySink>,
    active: Arc<Mutex<HashMap<(SessionId, JourneyKind), Instant>>>,
}

impl JourneyRecorder {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        JourneyRecorder {
            sink,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record the beginning of a journey. A begin for a `(session, kind)`
    /// pair already in flight restarts its clock.
    pub fn begin(&self, kind: JourneyKind, id: SessionId) {
        self.active.lock().insert((id, kind), Instant::now());
        self.sink.record(kind, JourneyPhase::Begin, id);
    }

    /// Record the end of a journey. An end with no matching begin is still
    /// forwarded to the sink; there is just no elapsed time to log.
    pub fn end(&self, kind: JourneyKind, id: SessionId) {
        let started = self.active.lock().remove(&(id, kind));
        match started {
            Some(t0) => {
                tracing::info!(session = %id, ?kind, elapsed_ms = t0.elapsed().as_millis() as u64, "journey complete");
            }
            None => {
                tracing::debug!(session = %id, ?kind, "journey end without begin");
            }
        }
        self.sink.record(kind, JourneyPhase::End, id);
    }
}
