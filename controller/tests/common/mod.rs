// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! In-memory stand-ins for STS and the Kubernetes Secret API.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube_aws_iam_controller::configuration::{ControllerConfig, ControllerOptions};
use kube_aws_iam_controller::controller::SecretsController;
use kube_aws_iam_controller::errors::AppError;
use kube_aws_iam_controller::models::{
    Credentials, PodEvent, PodEventKind, PodKey, SecretKey, WatchMessage,
};
use kube_aws_iam_controller::registry::Registry;
use kube_aws_iam_controller::scheduler::RefreshScheduler;
use kube_aws_iam_controller::secrets::{SecretStore, StoredCredential};
use kube_aws_iam_controller::credentials::CredentialsGetter;

pub const BASE_ROLE_ARN: &str = "arn:aws:iam::123456789012:role/";

/// Issues credentials with a strictly increasing expiration per call.
pub struct MockGetter {
    next_expiration: Mutex<DateTime<Utc>>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<BTreeSet<String>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockGetter {
    pub fn new(first_expiration: DateTime<Utc>) -> Self {
        Self {
            next_expiration: Mutex::new(first_expiration),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(BTreeSet::new()),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_for(&self, role_arn: &str) {
        self.failing.lock().unwrap().insert(role_arn.to_string());
    }

    pub fn recover(&self, role_arn: &str) {
        self.failing.lock().unwrap().remove(role_arn);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialsGetter for MockGetter {
    async fn get(
        &self,
        role: &str,
        session_duration: Duration,
        _external_id: &str,
    ) -> Result<Credentials, AppError> {
        self.calls.lock().unwrap().push(role.to_string());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(role) {
            return Err(AppError::AssumeRoleFailed {
                role_arn: role.to_string(),
                message: "AccessDenied".into(),
            });
        }

        let mut next = self.next_expiration.lock().unwrap();
        let expiration = *next;
        *next = expiration + chrono::Duration::from_std(session_duration).unwrap();

        Ok(Credentials {
            role_arn: role.to_string(),
            access_key_id: "AKIAEXAMPLE".into(),
            secret_access_key: "secret".into(),
            session_token: "token".into(),
            expiration,
        })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    secrets: Mutex<BTreeMap<SecretKey, StoredCredential>>,
    failing: AtomicBool,
    applies: AtomicUsize,
}

impl MemoryStore {
    pub fn insert(&self, stored: StoredCredential) {
        self.secrets.lock().unwrap().insert(stored.key.clone(), stored);
    }

    pub fn get(&self, key: &SecretKey) -> Option<StoredCredential> {
        self.secrets.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<SecretKey> {
        self.secrets.lock().unwrap().keys().cloned().collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn apply(&self, stored: &StoredCredential) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::SecretStoreFailed("connection refused".into()));
        }
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.insert(stored.clone());
        Ok(())
    }

    async fn delete(&self, key: &SecretKey) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::SecretStoreFailed("connection refused".into()));
        }
        self.secrets.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_managed(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<StoredCredential>, AppError> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .values()
            .filter(|stored| namespace.is_none_or(|ns| stored.key.namespace == ns))
            .cloned()
            .collect())
    }
}

/// All components wired together around the in-memory doubles.
pub struct Harness {
    pub config: Arc<ControllerConfig>,
    pub registry: Arc<Registry>,
    pub getter: Arc<MockGetter>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_getter(MockGetter::new(Utc::now() + chrono::Duration::hours(1)))
    }

    pub fn with_getter(getter: MockGetter) -> Self {
        Self::with_options(&ControllerOptions::default(), getter)
    }

    pub fn with_options(options: &ControllerOptions, getter: MockGetter) -> Self {
        let config = ControllerConfig::from_options(options, BASE_ROLE_ARN.to_string()).unwrap();
        Self {
            config: Arc::new(config),
            registry: Arc::new(Registry::new()),
            getter: Arc::new(getter),
            store: Arc::new(MemoryStore::default()),
        }
    }

    pub fn controller(&self) -> SecretsController {
        SecretsController::new(
            self.config.clone(),
            self.registry.clone(),
            self.getter.clone(),
            self.store.clone(),
        )
    }

    pub fn scheduler(&self) -> RefreshScheduler {
        RefreshScheduler::new(
            self.config.clone(),
            self.registry.clone(),
            self.getter.clone(),
            self.store.clone(),
        )
    }
}

pub fn role_arn(role: &str) -> String {
    format!("{BASE_ROLE_ARN}{role}")
}

pub fn secret_key(namespace: &str, role: &str) -> SecretKey {
    SecretKey::new(namespace, format!("aws-iam-{role}"))
}

pub fn pod_event(kind: PodEventKind, namespace: &str, name: &str, role: Option<&str>) -> WatchMessage {
    WatchMessage::Pod(PodEvent {
        kind,
        pod: PodKey::new(namespace, name),
        role: role.map(str::to_string),
        service_account: "default".into(),
    })
}

pub fn added(namespace: &str, name: &str, role: &str) -> WatchMessage {
    pod_event(PodEventKind::Added, namespace, name, Some(role))
}

pub fn updated(namespace: &str, name: &str, role: Option<&str>) -> WatchMessage {
    pod_event(PodEventKind::Updated, namespace, name, role)
}

pub fn deleted(namespace: &str, name: &str) -> WatchMessage {
    pod_event(PodEventKind::Deleted, namespace, name, None)
}

pub fn stored(namespace: &str, role: &str, expiration: DateTime<Utc>) -> StoredCredential {
    StoredCredential {
        key: secret_key(namespace, role),
        role_arn: role_arn(role),
        external_id: None,
        credentials: Credentials {
            role_arn: role_arn(role),
            access_key_id: "AKIAADOPTED".into(),
            secret_access_key: "secret".into(),
            session_token: "token".into(),
            expiration,
        },
    }
}
