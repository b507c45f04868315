//! Typed event broadcasting for engine lifecycle and analysis updates.
//!
//! The bus decouples the engine stack from whatever frontend is attached
//! (Tauri IPC, WebSocket, a CLI). Multiple subscribers receive the same
//! events concurrently; with no subscribers, events are dropped silently.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::uci::AnalysisRecord;

/// Events beyond this capacity cause slow subscribers to miss events (lag).
const DEFAULT_CAPACITY: usize = 1024;

/// Everything a frontend might want to observe about the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EngineEvent {
    /// The worker answered the readiness handshake.
    EngineReady,
    /// A failure was observed; a restart is pending.
    EngineDegraded { restarts: u32 },
    /// The restart budget is exhausted. Fatal until the user intervenes.
    EngineDead { restarts: u32 },
    AnalysisStarted { position: String },
    AnalysisUpdate {
        position: String,
        record: AnalysisRecord,
    },
    AnalysisComplete { position: String },
    AnalysisStopped { position: String },
}

/// Broadcast bus for [`EngineEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers; returns how many received it.
    pub fn emit(&self, event: EngineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to all future events. Past events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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
    use crate::uci::Score;

    #[test]
    fn emit_without_subscribers_drops_event() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(EngineEvent::EngineReady), 0);
    }

    #[test]
    fn subscribe_tracks_count() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn events_reach_all_subscribers_in_order() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.emit(EngineEvent::EngineReady), 2);
        bus.emit(EngineEvent::EngineDegraded { restarts: 1 });

        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(rx.recv().await.unwrap(), EngineEvent::EngineReady));
            assert!(matches!(
                rx.recv().await.unwrap(),
                EngineEvent::EngineDegraded { restarts: 1 }
            ));
        }
    }

    #[test]
    fn analysis_update_serializes_tagged() {
        let record = AnalysisRecord {
            depth: 12,
            seldepth: None,
            time_ms: None,
            nodes: None,
            nps: None,
            multipv: Some(1),
            score: Score::Cp(25),
            pv: vec!["e2e4".to_string()],
        };
        let event = EngineEvent::AnalysisUpdate {
            position: "startpos".to_string(),
            record,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"analysisUpdate\""));
        assert!(json.contains("e2e4"));
    }
}
