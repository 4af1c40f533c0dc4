// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Pod watcher: the producer side of the pod event queue.
//!
//! Translates the raw pod watch into [`WatchMessage`]s for pods that request a
//! role through the [`POD_ROLE_ANNOTATION`]. Sending blocks while the queue is
//! full; events are never dropped, since a lost delete leaks a Secret and a
//! lost add leaves a pod without credentials.

use std::collections::{BTreeMap, BTreeSet};
use std::pin::pin;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::POD_ROLE_ANNOTATION;
use crate::errors::AppError;
use crate::models::{PodEvent, PodEventKind, PodKey, WatchMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Announced {
    role: String,
    service_account: String,
}

pub struct PodWatcher {
    tx: mpsc::Sender<WatchMessage>,
    /// Pods the consumer currently knows about, with what it was told.
    announced: BTreeMap<PodKey, Announced>,
    /// Pods seen since the current listing began.
    listing: Option<BTreeSet<PodKey>>,
}

impl PodWatcher {
    pub fn new(tx: mpsc::Sender<WatchMessage>) -> Self {
        Self {
            tx,
            announced: BTreeMap::new(),
            listing: None,
        }
    }

    /// Watches pods in `namespace` (all namespaces when `None`) until cancelled.
    pub async fn run(self, client: Client, namespace: Option<String>, token: CancellationToken) {
        let pods: Api<Pod> = match namespace.as_deref() {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };

        tracing::info!(
            "[watcher] watching pods in {}",
            namespace.as_deref().unwrap_or("all namespaces")
        );

        let stream = watcher::watcher(pods, watcher::Config::default()).default_backoff();
        self.run_stream(stream, token).await;
    }

    /// Drives the watcher from any stream of watch events.
    pub async fn run_stream<S>(mut self, stream: S, token: CancellationToken)
    where
        S: Stream<Item = Result<Event<Pod>, watcher::Error>>,
    {
        let mut stream = pin!(stream);

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = stream.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    // The backoff wrapper restarts the watch.
                    tracing::warn!("[watcher] {}", AppError::from(e));
                    continue;
                }
            };

            for message in self.handle(event) {
                tracing::debug!("[watcher] queueing {:?}", message);
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("[watcher] stopped");
                        return;
                    }
                    sent = self.tx.send(message) => {
                        if sent.is_err() {
                            tracing::warn!("[watcher] event queue closed");
                            return;
                        }
                    }
                }
            }
        }

        tracing::info!("[watcher] stopped");
    }

    /// Translates one watch event into queue messages.
    pub fn handle(&mut self, event: Event<Pod>) -> Vec<WatchMessage> {
        match event {
            Event::Init => {
                self.listing = Some(BTreeSet::new());
                Vec::new()
            }
            Event::InitApply(pod) => {
                if let Some(listing) = self.listing.as_mut() {
                    listing.insert(pod_key(&pod));
                }
                self.apply(&pod).into_iter().collect()
            }
            Event::InitDone => {
                let live = self.listing.take().unwrap_or_default();
                let gone: Vec<PodKey> = self
                    .announced
                    .keys()
                    .filter(|key| !live.contains(key))
                    .cloned()
                    .collect();

                let mut messages: Vec<WatchMessage> = gone
                    .into_iter()
                    .filter_map(|key| self.release(key, PodEventKind::Deleted))
                    .collect();
                messages.push(WatchMessage::Synced);
                messages
            }
            Event::Apply(pod) => self.apply(&pod).into_iter().collect(),
            Event::Delete(pod) => self
                .release(pod_key(&pod), PodEventKind::Deleted)
                .into_iter()
                .collect(),
        }
    }

    fn apply(&mut self, pod: &Pod) -> Option<WatchMessage> {
        let key = pod_key(pod);

        let role = requested_role(pod);
        let (Some(role), false) = (role, is_terminated(pod)) else {
            let kind = if is_terminated(pod) {
                PodEventKind::Deleted
            } else {
                PodEventKind::Updated
            };
            return self.release(key, kind);
        };

        let current = Announced {
            role,
            service_account: service_account(pod),
        };

        let kind = match self.announced.get(&key) {
            None => PodEventKind::Added,
            Some(previous) if *previous != current => PodEventKind::Updated,
            Some(_) => return None,
        };

        self.announced.insert(key.clone(), current.clone());
        Some(WatchMessage::Pod(PodEvent {
            kind,
            pod: key,
            role: Some(current.role),
            service_account: current.service_account,
        }))
    }

    /// Tells the consumer to drop a previously announced pod.
    fn release(&mut self, key: PodKey, kind: PodEventKind) -> Option<WatchMessage> {
        let previous = self.announced.remove(&key)?;
        Some(WatchMessage::Pod(PodEvent {
            kind,
            pod: key,
            role: None,
            service_account: previous.service_account,
        }))
    }
}

fn pod_key(pod: &Pod) -> PodKey {
    PodKey::new(pod.namespace().unwrap_or_default(), pod.name_any())
}

fn requested_role(pod: &Pod) -> Option<String> {
    pod.annotations()
        .get(POD_ROLE_ANNOTATION)
        .map(|role| role.trim().to_string())
        .filter(|role| !role.is_empty())
}

fn service_account(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.service_account_name.clone())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

/// Pods that ran to completion no longer need credentials.
fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|status| status.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use kube::api::ObjectMeta;

    use super::*;

    fn pod(name: &str, role: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("team-a".to_string()),
                annotations: role
                    .map(|role| [(POD_ROLE_ANNOTATION.to_string(), role.to_string())].into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                service_account_name: Some("builder".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn with_phase(mut pod: Pod, phase: &str) -> Pod {
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        pod
    }

    fn watcher() -> PodWatcher {
        let (tx, _rx) = mpsc::channel(1);
        PodWatcher::new(tx)
    }

    fn kinds(messages: &[WatchMessage]) -> Vec<Option<PodEventKind>> {
        messages
            .iter()
            .map(|message| match message {
                WatchMessage::Pod(event) => Some(event.kind),
                WatchMessage::Synced => None,
            })
            .collect()
    }

    #[test]
    fn test_unannotated_pods_ignored() {
        let mut watcher = watcher();
        assert!(watcher.handle(Event::Apply(pod("web-0", None))).is_empty());
        assert!(watcher.handle(Event::Delete(pod("web-0", None))).is_empty());
    }

    #[test]
    fn test_added_then_unchanged() {
        let mut watcher = watcher();
        let messages = watcher.handle(Event::Apply(pod("web-0", Some("app"))));
        assert_eq!(
            messages,
            vec![WatchMessage::Pod(PodEvent {
                kind: PodEventKind::Added,
                pod: PodKey::new("team-a", "web-0"),
                role: Some("app".into()),
                service_account: "builder".into(),
            })]
        );
        assert!(watcher.handle(Event::Apply(pod("web-0", Some("app")))).is_empty());
    }

    #[test]
    fn test_role_change_and_removal() {
        let mut watcher = watcher();
        watcher.handle(Event::Apply(pod("web-0", Some("app"))));

        let messages = watcher.handle(Event::Apply(pod("web-0", Some("other"))));
        assert_eq!(kinds(&messages), vec![Some(PodEventKind::Updated)]);

        let messages = watcher.handle(Event::Apply(pod("web-0", None)));
        assert_eq!(kinds(&messages), vec![Some(PodEventKind::Updated)]);
        assert!(matches!(&messages[0], WatchMessage::Pod(event) if event.role.is_none()));

        // Already released.
        assert!(watcher.handle(Event::Delete(pod("web-0", None))).is_empty());
    }

    #[test]
    fn test_terminated_pod_released() {
        let mut watcher = watcher();
        watcher.handle(Event::Apply(pod("job-0", Some("app"))));
        let messages = watcher.handle(Event::Apply(with_phase(pod("job-0", Some("app")), "Succeeded")));
        assert_eq!(kinds(&messages), vec![Some(PodEventKind::Deleted)]);

        // A finished pod is never announced in the first place.
        let messages = watcher.handle(Event::Apply(with_phase(pod("job-1", Some("app")), "Failed")));
        assert!(messages.is_empty());
    }

    #[test]
    fn test_delete_of_announced_pod() {
        let mut watcher = watcher();
        watcher.handle(Event::Apply(pod("web-0", Some("app"))));
        let messages = watcher.handle(Event::Delete(pod("web-0", Some("app"))));
        assert_eq!(kinds(&messages), vec![Some(PodEventKind::Deleted)]);
    }

    #[test]
    fn test_relist_releases_vanished_pods() {
        let mut watcher = watcher();
        watcher.handle(Event::Apply(pod("web-0", Some("app"))));
        watcher.handle(Event::Apply(pod("web-1", Some("app"))));

        assert!(watcher.handle(Event::Init).is_empty());
        assert!(watcher.handle(Event::InitApply(pod("web-1", Some("app")))).is_empty());
        let messages = watcher.handle(Event::InitApply(pod("web-2", Some("app"))));
        assert_eq!(kinds(&messages), vec![Some(PodEventKind::Added)]);

        let messages = watcher.handle(Event::InitDone);
        assert_eq!(kinds(&messages), vec![Some(PodEventKind::Deleted), None]);
        assert!(matches!(&messages[0], WatchMessage::Pod(event) if event.pod.name == "web-0"));
    }

    #[test]
    fn test_default_service_account() {
        let mut bare = pod("web-0", Some("app"));
        bare.spec = None;
        assert_eq!(service_account(&bare), "default");
    }
}
