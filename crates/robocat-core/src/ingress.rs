use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::types::{Event, EventKind, MrId};

/// Default duplicate-suppression window.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(30);

/// Suppresses duplicate events: an event whose `(mr_id, kind, payload_hash)`
/// was seen within the TTL is dropped. Stale webhook re-deliveries and
/// double-fired hooks collapse here before reaching the actor registry.
pub struct EventIngress {
    ttl: Duration,
    seen: Mutex<HashMap<(MrId, EventKind, String), Instant>>,
}

impl EventIngress {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, seen: Mutex::new(HashMap::new()) }
    }

    /// Returns true when the event is fresh and should be routed; false
    /// when it is a duplicate within the TTL window.
    pub fn accept(&self, event: &Event) -> bool {
        let key = (event.mr_id, event.kind, event.payload_hash());
        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            // A poisoned dedup set must never stall the event feed.
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.retain(|_, t| now.duration_since(*t) < self.ttl);
        match seen.get(&key) {
            Some(_) => {
                debug!("dropping duplicate {} event for MR !{}", event.kind.as_str(), event.mr_id);
                false
            }
            None => {
                seen.insert(key, now);
                true
            }
        }
    }
}

impl Default for EventIngress {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(mr: MrId, kind: EventKind, payload: serde_json::Value) -> Event {
        Event::new(mr, kind, payload)
    }

    #[test]
    fn duplicate_within_ttl_is_dropped() {
        let ingress = EventIngress::default();
        let e = event(1, EventKind::MrUpdated, json!({"sha": "abc"}));
        assert!(ingress.accept(&e));
        assert!(!ingress.accept(&e.clone()));
    }

    #[test]
    fn different_payload_is_not_a_duplicate() {
        let ingress = EventIngress::default();
        assert!(ingress.accept(&event(1, EventKind::MrUpdated, json!({"sha": "abc"}))));
        assert!(ingress.accept(&event(1, EventKind::MrUpdated, json!({"sha": "def"}))));
    }

    #[test]
    fn different_mr_or_kind_is_not_a_duplicate() {
        let ingress = EventIngress::default();
        assert!(ingress.accept(&event(1, EventKind::MrUpdated, json!({}))));
        assert!(ingress.accept(&event(2, EventKind::MrUpdated, json!({}))));
        assert!(ingress.accept(&event(1, EventKind::MrNoteAdded, json!({}))));
    }

    #[test]
    fn duplicate_after_ttl_expiry_is_accepted() {
        let ingress = EventIngress::new(Duration::from_millis(10));
        let e = event(7, EventKind::PipelineStateChanged, json!({"id": 3}));
        assert!(ingress.accept(&e));
        std::thread::sleep(Duration::from_millis(20));
        assert!(ingress.accept(&e.clone()));
    }
}
