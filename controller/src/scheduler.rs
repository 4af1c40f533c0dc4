// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Periodic refresh of tracked credentials.
//!
//! Every tick the scheduler walks the registry and, for each entry whose
//! credentials are within the refresh limit of expiring, assumes the role
//! again and rewrites the Secret. Entries locked by the secrets controller are
//! left for the next tick. A failed attempt keeps serving the previous
//! credentials and is retried on the next tick, never in a tight loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::configuration::ControllerConfig;
use crate::credentials::CredentialsGetter;
use crate::errors::AppError;
use crate::models::{CredentialState, SecretKey};
use crate::registry::{EntryGuard, Registry, TrackedCredential};
use crate::secrets::{SecretStore, StoredCredential};

/// Outcome counts of one scheduler pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub refreshed: usize,
    pub failed: usize,
    /// Entries skipped because another task held them.
    pub busy: usize,
    pub removed: usize,
}

enum Outcome {
    Refreshed,
    Failed,
    Busy,
    /// No longer due when its turn came.
    Current,
    /// Never started because the scheduler is stopping.
    Cancelled,
}

pub struct RefreshScheduler {
    config: Arc<ControllerConfig>,
    registry: Arc<Registry>,
    getter: Arc<dyn CredentialsGetter>,
    store: Arc<dyn SecretStore>,
}

impl RefreshScheduler {
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
        }
    }

    /// Tracks the managed Secrets that already exist in the cluster.
    ///
    /// Runs once before the pod pipeline starts so pods that already have a
    /// valid Secret do not trigger a new AssumeRole call.
    #[tracing::instrument(skip(self))]
    pub async fn adopt_existing(&self) -> Result<usize, AppError> {
        let existing = self
            .store
            .list_managed(self.config.namespace.as_deref())
            .await?;

        let mut adopted = 0;
        for stored in existing {
            let key = stored.key.clone();
            if self.registry.insert_if_absent(TrackedCredential::adopted(stored)) {
                tracing::debug!("[scheduler] adopted secret {}", key);
                adopted += 1;
            }
        }

        tracing::info!("[scheduler] adopted {} existing secrets", adopted);
        Ok(adopted)
    }

    pub async fn run(&self, token: CancellationToken) {
        tracing::info!(
            "[scheduler] refreshing credentials every {}",
            humantime::format_duration(self.config.interval)
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let summary = self.tick(Utc::now(), &token).await;
                    tracing::debug!("[scheduler] tick finished: {:?}", summary);
                }
            }
        }

        tracing::info!("[scheduler] stopped");
    }

    /// One pass over the registry as of `now`.
    ///
    /// Once `token` is cancelled no further refresh is started; refreshes
    /// already running finish.
    pub async fn tick(&self, now: DateTime<Utc>, token: &CancellationToken) -> TickSummary {
        let mut summary = TickSummary::default();
        let mut due = Vec::new();

        for key in self.registry.keys() {
            let Some(mut guard) = self.registry.try_lock(&key) else {
                summary.busy += 1;
                continue;
            };

            if self.registry.is_synced() && guard.pods.is_empty() {
                if self.remove_orphan(&mut guard).await {
                    summary.removed += 1;
                }
                continue;
            }

            guard.observe(now, self.config.refresh_limit);
            if guard.needs_refresh(now, self.config.refresh_limit) {
                due.push(key);
            }
        }

        // Each entry is locked only while its own refresh runs.
        let semaphore = Semaphore::new(self.config.max_concurrent_refreshes);
        let refreshes = due.into_iter().map(|key| {
            let semaphore = &semaphore;
            async move {
                let permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Outcome::Cancelled,
                    permit = semaphore.acquire() => permit,
                };
                let Ok(_permit) = permit else {
                    return Outcome::Cancelled;
                };
                self.refresh(key, now).await
            }
        });
        let outcomes = futures::future::join_all(refreshes).await;

        for outcome in outcomes {
            match outcome {
                Outcome::Refreshed => summary.refreshed += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::Busy => summary.busy += 1,
                Outcome::Current | Outcome::Cancelled => {}
            }
        }
        summary
    }

    #[tracing::instrument(skip(self, key, now), fields(secret = %key))]
    async fn refresh(&self, key: SecretKey, now: DateTime<Utc>) -> Outcome {
        let Some(mut guard) = self.registry.try_lock(&key) else {
            return Outcome::Busy;
        };
        // The secrets controller may have refreshed it since the scan.
        if !guard.needs_refresh(now, self.config.refresh_limit) {
            return Outcome::Current;
        }

        guard.state = CredentialState::Refreshing;
        let result = refresh_entry(
            &mut guard,
            self.getter.as_ref(),
            self.store.as_ref(),
            &self.config,
        )
        .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    "[scheduler] refreshed credentials for {}, expire at {:?}",
                    guard.key,
                    guard.expiration()
                );
                Outcome::Refreshed
            }
            Err(e) => {
                guard.record_failure(now, &e);
                if guard.state == CredentialState::Expired {
                    tracing::error!(
                        "[scheduler] credentials for {} expired at {:?} and could not be refreshed: {}",
                        guard.key,
                        guard.expiration(),
                        e
                    );
                } else {
                    tracing::warn!(
                        "[scheduler] failed to refresh credentials for {}, retrying next tick: {}",
                        guard.key,
                        e
                    );
                }
                Outcome::Failed
            }
        }
    }

    async fn remove_orphan(&self, guard: &mut EntryGuard) -> bool {
        match self.store.delete(&guard.key).await {
            Ok(()) => {
                tracing::info!("[scheduler] removed secret {} with no pods", guard.key);
                self.registry.remove(guard);
                true
            }
            Err(e) => {
                tracing::warn!("[scheduler] failed to remove secret {}: {}", guard.key, e);
                false
            }
        }
    }
}

/// Issues credentials for a locked entry and persists them.
///
/// The Secret is written before the entry is updated, so a store failure
/// leaves the entry exactly as it was.
pub(crate) async fn refresh_entry(
    guard: &mut EntryGuard,
    getter: &dyn CredentialsGetter,
    store: &dyn SecretStore,
    config: &ControllerConfig,
) -> Result<(), AppError> {
    let credentials = getter
        .get(
            &guard.role_arn,
            config.session_duration,
            guard.external_id.as_deref().unwrap_or_default(),
        )
        .await?;

    guard.check_newer(&credentials)?;

    let stored = StoredCredential {
        key: guard.key.clone(),
        role_arn: guard.role_arn.clone(),
        external_id: guard.external_id.clone(),
        credentials: credentials.clone(),
    };
    store.apply(&stored).await?;

    guard.record_success(credentials)
}
