//! Central watcher reconciling service lifecycle events into romanaIP
//! activations and agent pushes

use async_trait::async_trait;
use futures::{pin_mut, StreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Node, Service};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use romanaip_api::RomanaIp;
use romanaip_core::{ActivationRecord, ActivationRegistry, AgentPush, CoreError};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Service annotation carrying the floating-IP record.
pub const ROMANAIP_ANNOTATION: &str = "romanaip";

/// Cluster lookups the watcher needs: resolving the node behind a service
/// and reflecting the floating IP on the service resource itself.
#[async_trait]
pub trait TopologyResolver: Send + Sync {
    /// Address of the node hosting the first pod backing `service`.
    async fn node_address_for(&self, service: &Service) -> romanaip_core::Result<String>;

    /// Sets the service's external IP list to the floating IP so the
    /// orchestrator's own service routing reflects it.
    async fn set_external_ip(&self, service: &Service, ip: &str) -> romanaip_core::Result<()>;
}

/// Kubernetes-backed topology resolution.
pub struct KubeTopology {
    client: Client,
}

impl KubeTopology {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn namespace_of(service: &Service) -> String {
    service.namespace().unwrap_or_else(|| "default".to_string())
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl TopologyResolver for KubeTopology {
    async fn node_address_for(&self, service: &Service) -> romanaip_core::Result<String> {
        let name = service.name_any();
        let endpoints: Api<Endpoints> =
            Api::namespaced(self.client.clone(), &namespace_of(service));

        let selector = label_selector(service.labels());
        let list = endpoints
            .list(&ListParams::default().labels(&selector))
            .await?;

        // First backing pod decides the owning node until per-record IPAM
        // support lands.
        let node_name = list
            .items
            .into_iter()
            .next()
            .and_then(|endpoints| endpoints.subsets)
            .and_then(|subsets| subsets.into_iter().next())
            .and_then(|subset| subset.addresses)
            .and_then(|addresses| addresses.into_iter().next())
            .and_then(|address| address.node_name)
            .ok_or(CoreError::EndpointNotFound(name))?;

        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get(&node_name).await?;
        node.status
            .and_then(|status| status.addresses)
            .and_then(|addresses| addresses.into_iter().next())
            .map(|address| address.address)
            .ok_or(CoreError::NodeAddressNotFound(node_name))
    }

    async fn set_external_ip(&self, service: &Service, ip: &str) -> romanaip_core::Result<()> {
        let services: Api<Service> =
            Api::namespaced(self.client.clone(), &namespace_of(service));
        let patch = serde_json::json!({"spec": {"externalIPs": [ip]}});
        services
            .patch(
                &service.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

/// Subscribes to service lifecycle events and drives the activation
/// registry and the per-node agent pushes.
pub struct ServiceEventWatcher {
    registry: Arc<Mutex<ActivationRegistry>>,
    topology: Arc<dyn TopologyResolver>,
    bridge: Arc<dyn AgentPush>,
}

impl ServiceEventWatcher {
    pub fn new(
        registry: Arc<Mutex<ActivationRegistry>>,
        topology: Arc<dyn TopologyResolver>,
        bridge: Arc<dyn AgentPush>,
    ) -> Self {
        Self {
            registry,
            topology,
            bridge,
        }
    }

    pub async fn run(&self, client: Client) -> anyhow::Result<()> {
        info!("Starting to receive service events");
        let services: Api<Service> = Api::all(client);
        let stream = watcher(services, watcher::Config::default());
        pin_mut!(stream);

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(service))
                | Ok(watcher::Event::InitApply(service)) => {
                    let name = service.name_any();
                    debug!("Add/update event received for service {}", name);
                    if let Err(err) = self.on_add_or_update(&service).await {
                        error!("error updating romanaIP for service {}: {}", name, err);
                    }
                }
                Ok(watcher::Event::Delete(service)) => {
                    info!("Delete event received for service {}", service.name_any());
                    self.on_delete(&service).await;
                }
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
                Err(err) => warn!("service watch error: {}", err),
            }
        }
        Ok(())
    }

    /// Activates the service's floating IP at most once. The registry lock
    /// is held across the full read-modify-write, including the outbound
    /// push, so concurrent deliveries serialize here.
    async fn on_add_or_update(&self, service: &Service) -> romanaip_core::Result<()> {
        let mut registry = self.registry.lock().await;

        let name = service.name_any();
        let Some(annotation) = service.annotations().get(ROMANAIP_ANNOTATION) else {
            return Ok(());
        };

        if registry.contains(&name) {
            debug!("Service {} already has a romanaIP associated with it", name);
            return Ok(());
        }

        let romana_ip: RomanaIp =
            serde_json::from_str(annotation).map_err(CoreError::MalformedAnnotation)?;
        if romana_ip.ip.parse::<IpAddr>().is_err() {
            return Err(CoreError::InvalidAddress(romana_ip.ip));
        }

        self.topology.set_external_ip(service, &romana_ip.ip).await?;
        let node_ip_address = self.topology.node_address_for(service).await?;

        let record = ActivationRecord {
            romana_ip,
            node_ip_address,
            activated: true,
        };
        // Fire and forget: the registry is mutated regardless of push
        // outcome, and a failed push is not retried.
        if let Err(err) = self.bridge.bind(&record).await {
            warn!(
                "bind push to agent {} failed: {}",
                record.node_ip_address, err
            );
        }
        registry.insert(name, record);
        Ok(())
    }

    async fn on_delete(&self, service: &Service) {
        let mut registry = self.registry.lock().await;

        let name = service.name_any();
        let Some(record) = registry.remove(&name) else {
            debug!("Service {} not found in the activation list", name);
            return;
        };

        if let Err(err) = self.bridge.unbind(&record).await {
            warn!(
                "unbind push to agent {} failed: {}",
                record.node_ip_address, err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeTopology {
        node_address: String,
        external_ips: StdMutex<Vec<String>>,
    }

    impl FakeTopology {
        fn on_node(node_address: &str) -> Arc<Self> {
            Arc::new(Self {
                node_address: node_address.to_string(),
                external_ips: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TopologyResolver for FakeTopology {
        async fn node_address_for(&self, _service: &Service) -> romanaip_core::Result<String> {
            Ok(self.node_address.clone())
        }

        async fn set_external_ip(
            &self,
            _service: &Service,
            ip: &str,
        ) -> romanaip_core::Result<()> {
            self.external_ips.lock().unwrap().push(ip.to_string());
            Ok(())
        }
    }

    struct UnbackedTopology;

    #[async_trait]
    impl TopologyResolver for UnbackedTopology {
        async fn node_address_for(&self, service: &Service) -> romanaip_core::Result<String> {
            Err(CoreError::EndpointNotFound(service.name_any()))
        }

        async fn set_external_ip(
            &self,
            _service: &Service,
            _ip: &str,
        ) -> romanaip_core::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingBridge {
        binds: StdMutex<Vec<ActivationRecord>>,
        unbinds: StdMutex<Vec<ActivationRecord>>,
    }

    #[async_trait]
    impl AgentPush for RecordingBridge {
        async fn bind(&self, record: &ActivationRecord) -> romanaip_core::Result<()> {
            self.binds.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn unbind(&self, record: &ActivationRecord) -> romanaip_core::Result<()> {
            self.unbinds.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct UnreachableBridge;

    #[async_trait]
    impl AgentPush for UnreachableBridge {
        async fn bind(&self, _record: &ActivationRecord) -> romanaip_core::Result<()> {
            Err(CoreError::PushFailure("agent unreachable".to_string()))
        }

        async fn unbind(&self, _record: &ActivationRecord) -> romanaip_core::Result<()> {
            Err(CoreError::PushFailure("agent unreachable".to_string()))
        }
    }

    fn service(name: &str, annotation: Option<&str>) -> Service {
        let mut service = Service::default();
        service.metadata.name = Some(name.to_string());
        service.metadata.namespace = Some("default".to_string());
        if let Some(value) = annotation {
            let mut annotations = BTreeMap::new();
            annotations.insert(ROMANAIP_ANNOTATION.to_string(), value.to_string());
            service.metadata.annotations = Some(annotations);
        }
        service
    }

    fn watcher_with(
        topology: Arc<dyn TopologyResolver>,
        bridge: Arc<RecordingBridge>,
    ) -> (Arc<Mutex<ActivationRegistry>>, ServiceEventWatcher) {
        let registry = Arc::new(Mutex::new(ActivationRegistry::new()));
        let watcher = ServiceEventWatcher::new(registry.clone(), topology, bridge);
        (registry, watcher)
    }

    const ANNOTATION: &str = r#"{"auto":false,"ip":"203.0.113.7"}"#;

    #[tokio::test]
    async fn test_annotated_service_is_activated() {
        let topology = FakeTopology::on_node("10.0.0.8");
        let bridge = Arc::new(RecordingBridge::default());
        let (registry, watcher) = watcher_with(topology.clone(), bridge.clone());

        watcher
            .on_add_or_update(&service("web", Some(ANNOTATION)))
            .await
            .unwrap();

        let registry = registry.lock().await;
        let record = registry.get("web").unwrap();
        assert_eq!(record.romana_ip.ip, "203.0.113.7");
        assert_eq!(record.node_ip_address, "10.0.0.8");
        assert!(record.activated);

        let binds = bridge.binds.lock().unwrap();
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].node_ip_address, "10.0.0.8");

        assert_eq!(*topology.external_ips.lock().unwrap(), vec!["203.0.113.7"]);
    }

    #[tokio::test]
    async fn test_second_activation_is_ignored() {
        let topology = FakeTopology::on_node("10.0.0.8");
        let bridge = Arc::new(RecordingBridge::default());
        let (registry, watcher) = watcher_with(topology, bridge.clone());

        let svc = service("web", Some(ANNOTATION));
        watcher.on_add_or_update(&svc).await.unwrap();
        watcher.on_add_or_update(&svc).await.unwrap();

        assert_eq!(registry.lock().await.len(), 1);
        assert_eq!(bridge.binds.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_service_without_annotation_is_ignored() {
        let topology = FakeTopology::on_node("10.0.0.8");
        let bridge = Arc::new(RecordingBridge::default());
        let (registry, watcher) = watcher_with(topology, bridge.clone());

        watcher.on_add_or_update(&service("web", None)).await.unwrap();

        assert!(registry.lock().await.is_empty());
        assert!(bridge.binds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_annotation_is_rejected() {
        let topology = FakeTopology::on_node("10.0.0.8");
        let bridge = Arc::new(RecordingBridge::default());
        let (registry, watcher) = watcher_with(topology, bridge.clone());

        let err = watcher
            .on_add_or_update(&service("web", Some("not json")))
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::MalformedAnnotation(_)));
        assert!(registry.lock().await.is_empty());
        assert!(bridge.binds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_address_is_rejected() {
        let topology = FakeTopology::on_node("10.0.0.8");
        let bridge = Arc::new(RecordingBridge::default());
        let (registry, watcher) = watcher_with(topology, bridge.clone());

        let err = watcher
            .on_add_or_update(&service("web", Some(r#"{"auto":false,"ip":"nope"}"#)))
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::InvalidAddress(_)));
        assert!(registry.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unbacked_service_is_not_activated() {
        let bridge = Arc::new(RecordingBridge::default());
        let (registry, watcher) = watcher_with(Arc::new(UnbackedTopology), bridge.clone());

        let err = watcher
            .on_add_or_update(&service("web", Some(ANNOTATION)))
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::EndpointNotFound(_)));
        assert!(registry.lock().await.is_empty());
        assert!(bridge.binds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_and_unbinds() {
        let topology = FakeTopology::on_node("10.0.0.8");
        let bridge = Arc::new(RecordingBridge::default());
        let (registry, watcher) = watcher_with(topology, bridge.clone());

        let svc = service("web", Some(ANNOTATION));
        watcher.on_add_or_update(&svc).await.unwrap();
        watcher.on_delete(&svc).await;

        assert!(registry.lock().await.is_empty());
        let unbinds = bridge.unbinds.lock().unwrap();
        assert_eq!(unbinds.len(), 1);
        assert_eq!(unbinds[0].romana_ip.ip, "203.0.113.7");
        assert_eq!(unbinds[0].node_ip_address, "10.0.0.8");
    }

    #[tokio::test]
    async fn test_failed_push_still_records_activation() {
        let topology = FakeTopology::on_node("10.0.0.8");
        let registry = Arc::new(Mutex::new(ActivationRegistry::new()));
        let watcher = ServiceEventWatcher::new(
            registry.clone(),
            topology,
            Arc::new(UnreachableBridge),
        );

        // Pushes are fire and forget: the registry mutation proceeds
        // regardless of push outcome.
        watcher
            .on_add_or_update(&service("web", Some(ANNOTATION)))
            .await
            .unwrap();

        assert!(registry.lock().await.contains("web"));
    }

    #[tokio::test]
    async fn test_delete_of_unknown_service_pushes_nothing() {
        let topology = FakeTopology::on_node("10.0.0.8");
        let bridge = Arc::new(RecordingBridge::default());
        let (_, watcher) = watcher_with(topology, bridge.clone());

        watcher.on_delete(&service("web", Some(ANNOTATION))).await;

        assert!(bridge.unbinds.lock().unwrap().is_empty());
    }

    #[test]
    fn test_label_selector() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        labels.insert("tier".to_string(), "front".to_string());
        assert_eq!(label_selector(&labels), "app=web,tier=front");
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }
}
