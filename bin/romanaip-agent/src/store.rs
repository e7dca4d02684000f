//! Store client: romanaIP tree watch plus the key writes the agent's HTTP
//! surface uses. Speaks the store's v2-style HTTP API.

use anyhow::Context;
use romanaip_api::{ChangeAction, ChangeEvent, ExposedIpSpec};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";
pub const ROMANAIP_PREFIX: &str = "/romana/romanaip";

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct EtcdStore {
    client: reqwest::Client,
    endpoint: String,
    prefix: String,
}

#[derive(Debug, Deserialize)]
struct WatchResponse {
    action: String,
    node: Option<WatchNode>,
    #[serde(rename = "prevNode")]
    prev_node: Option<WatchNode>,
}

#[derive(Debug, Deserialize)]
struct WatchNode {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
}

impl EtcdStore {
    /// Endpoint from `ETCD_ENDPOINT`, falling back to the local default.
    pub fn from_env() -> Self {
        let endpoint =
            std::env::var("ETCD_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        Self::new(endpoint)
    }

    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            prefix: ROMANAIP_PREFIX.to_string(),
        }
    }

    fn keys_url(&self, key: &str) -> String {
        format!("{}/v2/keys{}", self.endpoint, key)
    }

    /// Subscribes to every change under the romanaIP prefix.
    ///
    /// The initial probe runs before this returns, so a failed subscription
    /// surfaces to the caller and is fatal at agent startup. Once
    /// subscribed, failed long-poll requests are retried after a fixed
    /// delay rather than tearing the stream down.
    pub async fn watch_tree(&self) -> anyhow::Result<mpsc::Receiver<ChangeEvent>> {
        let url = self.keys_url(&self.prefix);
        let probe = self
            .client
            .get(&url)
            .send()
            .await
            .context("romanaIP store watch subscription failed")?;
        let mut wait_index = probe
            .headers()
            .get("x-etcd-index")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(|index| index + 1);

        let (tx, rx) = mpsc::channel(16);
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                let mut request = client
                    .get(&url)
                    .query(&[("wait", "true"), ("recursive", "true")]);
                if let Some(index) = wait_index {
                    request = request.query(&[("waitIndex", index.to_string())]);
                }

                let response = match request.send().await {
                    Ok(response) => response,
                    Err(err) => {
                        warn!("romanaIP watch request failed, retrying: {}", err);
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                        continue;
                    }
                };

                let body: WatchResponse = match response.json().await {
                    Ok(body) => body,
                    Err(err) => {
                        warn!("undecodable watch response, retrying: {}", err);
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                        continue;
                    }
                };

                if let Some(node) = &body.node {
                    wait_index = Some(node.modified_index + 1);
                }

                if tx.send(change_event(body)).await.is_err() {
                    debug!("romanaIP change receiver dropped, stopping watch");
                    return;
                }
            }
        });

        Ok(rx)
    }

    /// Writes the record under the romanaIP prefix, keyed by the floating
    /// IP. All agents observe the write through their own watch.
    pub async fn put_exposed_ip(&self, spec: &ExposedIpSpec) -> anyhow::Result<()> {
        let key = format!("{}/{}", self.prefix, spec.romana_ip.ip);
        let value = serde_json::to_string(spec)?;
        self.client
            .put(self.keys_url(&key))
            .form(&[("value", value.as_str())])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Deletes the record for `ip` from the romanaIP prefix.
    pub async fn delete_exposed_ip(&self, ip: &str) -> anyhow::Result<()> {
        let key = format!("{}/{}", self.prefix, ip);
        self.client
            .delete(self.keys_url(&key))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn change_event(response: WatchResponse) -> ChangeEvent {
    let action = ChangeAction::from(response.action.as_str());
    let is_directory = response.node.as_ref().map(|node| node.dir).unwrap_or(false)
        || response
            .prev_node
            .as_ref()
            .map(|node| node.dir)
            .unwrap_or(false);
    ChangeEvent {
        action,
        is_directory,
        value: response
            .node
            .and_then(|node| node.value)
            .unwrap_or_default(),
        previous_value: response
            .prev_node
            .and_then(|node| node.value)
            .unwrap_or_default(),
    }
}
