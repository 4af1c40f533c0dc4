// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Secrets controller: the consumer side of the pod event queue.
//!
//! Events are applied one at a time in queue order. Each pod is bound to at
//! most one credential Secret; the Secret lives as long as at least one pod is
//! bound to it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::configuration::{ControllerConfig, resolve_role_arn};
use crate::credentials::CredentialsGetter;
use crate::errors::AppError;
use crate::external_id;
use crate::models::{CredentialState, PodEvent, PodEventKind, PodKey, SecretKey, WatchMessage};
use crate::registry::{Registry, TrackedCredential};
use crate::scheduler::refresh_entry;
use crate::secrets::{SecretStore, secret_name};

/// Where a pod's credentials should come from.
struct Target {
    key: SecretKey,
    role_arn: String,
    external_id: Option<String>,
}

pub struct SecretsController {
    config: Arc<ControllerConfig>,
    registry: Arc<Registry>,
    getter: Arc<dyn CredentialsGetter>,
    store: Arc<dyn SecretStore>,
    bindings: HashMap<PodKey, SecretKey>,
}

impl SecretsController {
    pub fn new(
        config: Arc<ControllerConfig>,
        registry: Arc<Registry>,
        getter: Arc<dyn CredentialsGetter>,
        store: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            config,
            registry,
            getter,
            store,
            bindings: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<WatchMessage>, token: CancellationToken) {
        tracing::info!("[controller] processing pod events");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
            }
        }

        tracing::info!("[controller] stopped");
    }

    /// Applies one queued message. Failures are logged and never stop the loop.
    pub async fn handle(&mut self, message: WatchMessage) {
        match message {
            WatchMessage::Pod(event) => {
                let pod = event.pod.clone();
                if let Err(e) = self.handle_pod(event).await {
                    tracing::warn!("[controller] failed to handle pod {}: {}", pod, e);
                }
            }
            WatchMessage::Synced => {
                if !self.registry.is_synced() {
                    tracing::info!(
                        "[controller] pod listing applied, tracking {} secrets",
                        self.registry.len()
                    );
                }
                self.registry.mark_synced();
            }
        }
    }

    /// The Secret `pod` is currently bound to.
    pub fn binding(&self, pod: &PodKey) -> Option<&SecretKey> {
        self.bindings.get(pod)
    }

    async fn handle_pod(&mut self, event: PodEvent) -> Result<(), AppError> {
        match (event.kind, event.role.as_deref()) {
            (PodEventKind::Deleted, _) | (_, None) => {
                self.release(&event.pod).await;
                Ok(())
            }
            (_, Some(role)) => {
                let role = role.to_string();
                self.bind(&event, &role).await
            }
        }
    }

    fn target(&self, event: &PodEvent, role: &str) -> Result<Target, AppError> {
        let role_arn = resolve_role_arn(&self.config.base_role_arn, role);
        let external_id = external_id::compose(
            &self.config.external_id_prefix,
            self.config.external_id_scope,
            &event.pod.namespace,
            &event.service_account,
        )?;
        let name = secret_name(
            &role_arn,
            self.config.external_id_scope,
            &event.service_account,
        )?;

        Ok(Target {
            key: SecretKey::new(event.pod.namespace.clone(), name),
            role_arn,
            external_id,
        })
    }

    /// Binds the pod to the Secret for `role`, issuing credentials if needed.
    ///
    /// The new binding is made before the old one is released. The pod stays
    /// bound even when issuing fails so the scheduler keeps retrying. A Secret
    /// switched to a role that cannot be assumed is removed rather than left
    /// serving the previous role.
    #[tracing::instrument(skip(self, event), fields(pod = %event.pod))]
    async fn bind(&mut self, event: &PodEvent, role: &str) -> Result<(), AppError> {
        let target = match self.target(event, role) {
            Ok(target) => target,
            Err(e) => {
                self.release(&event.pod).await;
                return Err(e);
            }
        };

        let mut guard = self
            .registry
            .lock(&target.key, || {
                TrackedCredential::new(
                    target.key.clone(),
                    target.role_arn.clone(),
                    target.external_id.clone(),
                )
            })
            .await;

        // Set when the Secret still holds credentials for the previous role.
        let mut stale_secret = false;
        if guard.role_arn != target.role_arn || guard.external_id != target.external_id {
            if guard.pods.iter().any(|name| *name != event.pod.name) {
                let error = AppError::InvalidArn(format!(
                    "{} is already used for {} in namespace {}",
                    target.key.name, guard.role_arn, target.key.namespace
                ));
                drop(guard);
                self.release(&event.pod).await;
                return Err(error);
            }

            tracing::info!(
                "[controller] retargeting secret {} from {} to {}",
                target.key,
                guard.role_arn,
                target.role_arn
            );
            stale_secret = guard.credentials.is_some();
            guard.role_arn = target.role_arn.clone();
            guard.external_id = target.external_id.clone();
            guard.credentials = None;
            guard.state = CredentialState::Pending;
        }

        let now = Utc::now();
        let mut result = Ok(());
        if guard.needs_refresh(now, self.config.refresh_limit) {
            guard.state = CredentialState::Refreshing;
            result = refresh_entry(
                &mut guard,
                self.getter.as_ref(),
                self.store.as_ref(),
                &self.config,
            )
            .await;

            match &result {
                Ok(()) => tracing::info!(
                    "[controller] issued credentials for {} into {}",
                    target.role_arn,
                    target.key
                ),
                Err(e) => {
                    guard.record_failure(now, e);
                    if stale_secret {
                        match self.store.delete(&target.key).await {
                            Ok(()) => tracing::info!(
                                "[controller] removed secret {} until {} can be assumed",
                                target.key,
                                target.role_arn
                            ),
                            Err(e) => tracing::warn!(
                                "[controller] failed to remove stale secret {}: {}",
                                target.key,
                                e
                            ),
                        }
                    }
                }
            }
        }

        if guard.pods.insert(event.pod.name.clone()) {
            tracing::debug!("[controller] bound pod {} to {}", event.pod, target.key);
        }
        drop(guard);

        let previous = self.bindings.insert(event.pod.clone(), target.key.clone());
        if let Some(previous) = previous.filter(|previous| *previous != target.key) {
            self.unbind(&event.pod, &previous).await;
        }

        result
    }

    async fn release(&mut self, pod: &PodKey) {
        if let Some(key) = self.bindings.remove(pod) {
            self.unbind(pod, &key).await;
        }
    }

    /// Drops `pod` from the Secret's users, deleting the Secret after its last one.
    async fn unbind(&self, pod: &PodKey, key: &SecretKey) {
        let Some(mut guard) = self.registry.lock_existing(key).await else {
            return;
        };

        guard.pods.remove(&pod.name);
        if !guard.pods.is_empty() {
            return;
        }

        match self.store.delete(key).await {
            Ok(()) => {
                self.registry.remove(&mut guard);
                tracing::info!("[controller] removed secret {} after its last pod", key);
            }
            // Left for the scheduler's orphan cleanup.
            Err(e) => tracing::warn!("[controller] failed to remove secret {}: {}", key, e),
        }
    }
}
