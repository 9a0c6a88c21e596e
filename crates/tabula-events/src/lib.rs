use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;


/// Default channel capacity when `TABULA_BUS_CAPACITY` is unset.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// A simple broadcast bus for JSON-serializable events.
///
/// Publishing never fails: serialization errors degrade to a marker payload
/// and a send without receivers is silently dropped.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

fn bus_capacity() -> usize {
    std::env::var("TABULA_BUS_CAPACITY")
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_BUS_CAPACITY)
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Capacity from the environment (`TABULA_BUS_CAPACITY`) or the default.
    pub fn new_default() -> Self {
        Self::new(bus_capacity())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        let _ = self.tx.send(Envelope {
            time: now,
            kind: kind.to_string(),
            payload: val,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = Bus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish("space.switched", &json!({"from": "s1", "to": "s2"}));

        let env_a = a.recv().await.expect("subscriber a receives");
        let env_b = b.recv().await.expect("subscriber b receives");
        assert_eq!(env_a.kind, "space.switched");
        assert_eq!(env_b.payload["to"], "s2");
        assert!(!env_a.time.is_empty());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = Bus::new(4);
        bus.publish("widget.added", &json!({"id": "todo-1"}));
        // Late subscribers do not see past events.
        let mut rx = bus.subscribe();
        bus.publish("widget.removed", &json!({"id": "todo-1"}));
        let env = rx.recv().await.expect("only the later event arrives");
        assert_eq!(env.kind, "widget.removed");
    }

    #[tokio::test]
    async fn capacity_env_override_is_honored() {
        let mut guard = test_support::env::guard();
        guard.set("TABULA_BUS_CAPACITY", "2");
        let bus = Bus::new_default();
        let mut rx = bus.subscribe();
        for i in 0..3 {
            bus.publish("settings.updated", &json!({"seq": i}));
        }
        // Oldest event was overwritten; the receiver lags.
        assert!(matches!(
            rx.recv().await,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_))
        ));
    }
}
