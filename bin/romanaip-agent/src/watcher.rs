//! Per-node watch loop reconciling store change events into kernel state

use romanaip_api::{ChangeAction, ChangeEvent};
use romanaip_net::LinkAddressReconciler;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Consumes the change-event channel serially until it closes. Exactly one
/// event is reconciled at a time, so the reconciler needs no locking of its
/// own.
pub async fn run(mut events: mpsc::Receiver<ChangeEvent>, reconciler: Arc<LinkAddressReconciler>) {
    info!("Starting romanaIP change watcher");
    while let Some(event) = events.recv().await {
        dispatch(&event, &reconciler).await;
    }
    info!("romanaIP change stream closed, stopping watcher");
}

/// Per-event errors are logged and the next event is processed; they never
/// terminate the watcher.
async fn dispatch(event: &ChangeEvent, reconciler: &LinkAddressReconciler) {
    match event.action {
        ChangeAction::Create
        | ChangeAction::Set
        | ChangeAction::Update
        | ChangeAction::CompareAndSwap => {
            debug!("Creating/updating romanaIP from {:?} event", event.action);
            if let Err(err) = reconciler.apply_record(event, true).await {
                error!("error adding romanaIP to the link: {}", err);
            }
        }
        ChangeAction::Delete if event.is_directory => {
            // Bulk unbind of a deleted subtree is not implemented; each key
            // under the prefix still produces its own delete event.
            warn!("directory delete received for romanaIP subtree, ignoring");
        }
        ChangeAction::Delete => {
            debug!("Deleting romanaIP");
            if let Err(err) = reconciler.apply_record(event, false).await {
                error!("error removing romanaIP from the link: {}", err);
            }
        }
        ChangeAction::Other => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use romanaip_net::{AddressMutator, DefaultLink};
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeMutator {
        bound: Mutex<BTreeSet<Ipv4Addr>>,
    }

    #[async_trait]
    impl AddressMutator for FakeMutator {
        async fn add_address(
            &self,
            _link: &DefaultLink,
            address: Ipv4Addr,
        ) -> romanaip_net::Result<()> {
            self.bound.lock().unwrap().insert(address);
            Ok(())
        }

        async fn remove_address(
            &self,
            _link: &DefaultLink,
            address: Ipv4Addr,
        ) -> romanaip_net::Result<()> {
            self.bound.lock().unwrap().remove(&address);
            Ok(())
        }
    }

    fn setup() -> (Arc<FakeMutator>, Arc<LinkAddressReconciler>) {
        let mutator = Arc::new(FakeMutator::default());
        let link = DefaultLink {
            index: 2,
            name: "eth0".to_string(),
        };
        let reconciler = Arc::new(LinkAddressReconciler::new(
            mutator.clone(),
            link,
            vec!["10.0.0.5".parse().unwrap()],
        ));
        (mutator, reconciler)
    }

    const RECORD: &str = r#"{"romanaIP":{"ip":"203.0.113.5"},"nodeIPAddress":"10.0.0.5"}"#;

    #[tokio::test]
    async fn test_create_then_delete_converges() {
        let (mutator, reconciler) = setup();
        let (tx, rx) = mpsc::channel(4);

        let task = tokio::spawn(run(rx, reconciler));

        tx.send(ChangeEvent {
            action: ChangeAction::Create,
            value: RECORD.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        tx.send(ChangeEvent {
            action: ChangeAction::Delete,
            previous_value: RECORD.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        drop(tx);

        task.await.unwrap();
        assert!(mutator.bound.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_event_does_not_stop_the_watcher() {
        let (mutator, reconciler) = setup();
        let (tx, rx) = mpsc::channel(4);

        let task = tokio::spawn(run(rx, reconciler));

        // Both payload fields empty: logged and skipped.
        tx.send(ChangeEvent {
            action: ChangeAction::Set,
            ..Default::default()
        })
        .await
        .unwrap();
        tx.send(ChangeEvent {
            action: ChangeAction::Set,
            value: RECORD.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        drop(tx);

        task.await.unwrap();
        assert_eq!(mutator.bound.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_directory_delete_is_ignored() {
        let (mutator, reconciler) = setup();
        let (tx, rx) = mpsc::channel(4);

        let task = tokio::spawn(run(rx, reconciler));

        tx.send(ChangeEvent {
            action: ChangeAction::Create,
            value: RECORD.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        tx.send(ChangeEvent {
            action: ChangeAction::Delete,
            is_directory: true,
            previous_value: RECORD.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        drop(tx);

        task.await.unwrap();
        // The record stays bound: directory deletes carry no per-record
        // unbind semantics.
        assert_eq!(mutator.bound.lock().unwrap().len(), 1);
    }
}
