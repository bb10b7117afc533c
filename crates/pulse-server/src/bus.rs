//! Config reload bus: node mutations flow from the REST layer to the
//! poll supervisor in emission order.

use pulse_common::types::NodeConfig;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum ConfigEvent {
    NodeAdded(NodeConfig),
    NodeUpdated(NodeConfig),
    NodeRemoved(String),
}

#[derive(Clone)]
pub struct ConfigBus {
    tx: broadcast::Sender<ConfigEvent>,
}

impl ConfigBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn publish(&self, event: ConfigEvent) {
        // No subscribers yet is fine (startup ordering).
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.tx.subscribe()
    }
}

impl Default for ConfigBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_common::types::{Capabilities, NodeKind};

    fn node(id: &str) -> NodeConfig {
        NodeConfig {
            id: id.into(),
            kind: NodeKind::Pve,
            name: id.into(),
            url: format!("https://{id}:8006"),
            user: None,
            password: None,
            token_name: None,
            token_secret: None,
            verify_tls: false,
            capabilities: Capabilities::default(),
            timeout_secs: None,
            cluster_name: None,
            cluster_endpoints: Vec::new(),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let bus = ConfigBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ConfigEvent::NodeAdded(node("a")));
        bus.publish(ConfigEvent::NodeUpdated(node("a")));
        bus.publish(ConfigEvent::NodeRemoved("a".into()));

        assert!(matches!(rx.recv().await.unwrap(), ConfigEvent::NodeAdded(_)));
        assert!(matches!(rx.recv().await.unwrap(), ConfigEvent::NodeUpdated(_)));
        assert!(matches!(rx.recv().await.unwrap(), ConfigEvent::NodeRemoved(_)));
    }
}
