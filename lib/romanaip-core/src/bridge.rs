//! Push bridge from the listener to a node agent's HTTP surface

use crate::error::Result;
use crate::registry::ActivationRecord;
use async_trait::async_trait;
use tracing::debug;

/// Port the per-node agent's HTTP surface listens on.
pub const AGENT_PORT: u16 = 9604;

/// Outbound bind/unbind pushes to the agent owning a record's node.
///
/// Pushes are fire-and-forget from the caller's perspective: the registry is
/// mutated regardless of push outcome, and a failed push is not retried
/// until a new event arrives for the same record.
#[async_trait]
pub trait AgentPush: Send + Sync {
    /// Asks the node's agent to bind the record's floating IP.
    async fn bind(&self, record: &ActivationRecord) -> Result<()>;

    /// Asks the node's agent to unbind the record's floating IP.
    async fn unbind(&self, record: &ActivationRecord) -> Result<()>;
}

/// REST push to `http://<nodeIPAddress>:<port>/romanaip`.
pub struct HttpAgentBridge {
    client: reqwest::Client,
    port: u16,
}

impl HttpAgentBridge {
    pub fn new() -> Self {
        Self::with_port(AGENT_PORT)
    }

    pub fn with_port(port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            port,
        }
    }

    fn bind_url(&self, record: &ActivationRecord) -> String {
        format!("http://{}:{}/romanaip", record.node_ip_address, self.port)
    }

    fn unbind_url(&self, record: &ActivationRecord) -> String {
        format!(
            "http://{}:{}/romanaip/{}",
            record.node_ip_address, self.port, record.romana_ip.ip
        )
    }
}

impl Default for HttpAgentBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentPush for HttpAgentBridge {
    async fn bind(&self, record: &ActivationRecord) -> Result<()> {
        let url = self.bind_url(record);
        debug!("Pushing romanaIP bind to {}", url);
        self.client
            .post(&url)
            .body(record.romana_ip.ip.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn unbind(&self, record: &ActivationRecord) -> Result<()> {
        let url = self.unbind_url(record);
        debug!("Pushing romanaIP unbind to {}", url);
        self.client.delete(&url).send().await?.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use romanaip_api::RomanaIp;

    fn record() -> ActivationRecord {
        ActivationRecord {
            romana_ip: RomanaIp {
                auto: false,
                ip: "203.0.113.7".to_string(),
            },
            node_ip_address: "10.0.0.8".to_string(),
            activated: true,
        }
    }

    #[test]
    fn test_bind_url() {
        let bridge = HttpAgentBridge::new();
        assert_eq!(bridge.bind_url(&record()), "http://10.0.0.8:9604/romanaip");
    }

    #[test]
    fn test_unbind_url() {
        let bridge = HttpAgentBridge::new();
        assert_eq!(
            bridge.unbind_url(&record()),
            "http://10.0.0.8:9604/romanaip/203.0.113.7"
        );
    }

    #[test]
    fn test_custom_port() {
        let bridge = HttpAgentBridge::with_port(19604);
        assert_eq!(bridge.bind_url(&record()), "http://10.0.0.8:19604/romanaip");
    }
}
