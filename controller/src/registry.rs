// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Tracked credentials keyed by their Secret.
//!
//! Each entry sits behind its own [`tokio::sync::Mutex`]. Whoever holds the
//! lock is the only writer for that Secret: the secrets controller waits for
//! it, the refresh scheduler only ever tries it and skips a busy key, so two
//! AssumeRole calls for the same Secret never overlap.
//!
//! An entry leaving the registry is first marked [`CredentialState::Removed`]
//! under its lock; anyone who cloned the handle earlier sees that after
//! locking and must not act on it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::AppError;
use crate::models::{CredentialState, CredentialStatus, Credentials, SecretKey};
use crate::secrets::StoredCredential;

#[derive(Debug, Clone)]
pub struct TrackedCredential {
    pub key: SecretKey,
    pub role_arn: String,
    pub external_id: Option<String>,
    pub credentials: Option<Credentials>,
    /// Names of the pods in `key.namespace` using this Secret.
    pub pods: BTreeSet<String>,
    pub state: CredentialState,
    pub last_error: Option<String>,
}

impl TrackedCredential {
    pub fn new(key: SecretKey, role_arn: String, external_id: Option<String>) -> Self {
        Self {
            key,
            role_arn,
            external_id,
            credentials: None,
            pods: BTreeSet::new(),
            state: CredentialState::Pending,
            last_error: None,
        }
    }

    /// Entry for a Secret found in the cluster at startup.
    pub fn adopted(stored: StoredCredential) -> Self {
        Self {
            key: stored.key.clone(),
            role_arn: stored.role_arn.clone(),
            external_id: stored.external_id.clone(),
            credentials: Some(stored.credentials.clone()),
            pods: BTreeSet::new(),
            state: CredentialState::Fresh,
            last_error: None,
        }
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.credentials.as_ref().map(|c| c.expiration)
    }

    /// True once `now` has reached `expiration - refresh_limit`, or when
    /// nothing has been issued yet.
    pub fn needs_refresh(&self, now: DateTime<Utc>, refresh_limit: Duration) -> bool {
        match self.expiration() {
            None => true,
            Some(expiration) => match chrono::Duration::from_std(refresh_limit) {
                Ok(limit) => now >= expiration - limit,
                Err(_) => true,
            },
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration().is_some_and(|expiration| now >= expiration)
    }

    /// Recomputes `Fresh`/`DueForRefresh` from the clock; failure states stick
    /// until the next attempt.
    pub fn observe(&mut self, now: DateTime<Utc>, refresh_limit: Duration) {
        if self.state == CredentialState::Fresh && self.needs_refresh(now, refresh_limit) {
            self.state = CredentialState::DueForRefresh;
        }
    }

    /// Fails unless `credentials` expire strictly later than the ones held.
    pub fn check_newer(&self, credentials: &Credentials) -> Result<(), AppError> {
        match self.expiration() {
            Some(current) if credentials.expiration <= current => Err(AppError::AssumeRoleFailed {
                role_arn: self.role_arn.clone(),
                message: format!(
                    "issued credentials expire at {} which is not after {}",
                    credentials.expiration, current
                ),
            }),
            _ => Ok(()),
        }
    }

    /// Stores newly issued credentials.
    ///
    /// # Errors
    ///
    /// Rejects credentials that do not expire strictly later than the ones
    /// already held; the entry is then left as it was.
    pub fn record_success(&mut self, credentials: Credentials) -> Result<(), AppError> {
        self.check_newer(&credentials)?;
        self.credentials = Some(credentials);
        self.state = CredentialState::Fresh;
        self.last_error = None;
        Ok(())
    }

    /// Records a failed attempt. Credentials and expiration are left alone.
    pub fn record_failure(&mut self, now: DateTime<Utc>, error: &AppError) {
        self.state = if self.is_expired(now) {
            CredentialState::Expired
        } else {
            CredentialState::RefreshFailed
        };
        self.last_error = Some(error.to_string());
    }

    pub fn status(&self) -> CredentialStatus {
        CredentialStatus {
            secret: self.key.clone(),
            role_arn: self.role_arn.clone(),
            state: self.state,
            expiration: self.expiration(),
            pods: self.pods.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

pub type Entry = Arc<Mutex<TrackedCredential>>;
pub type EntryGuard = OwnedMutexGuard<TrackedCredential>;

#[derive(Default)]
pub struct Registry {
    entries: DashMap<SecretKey, Entry>,
    synced: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the entry for `key`, creating it with `init` when absent.
    ///
    /// Waits while another task holds the entry.
    pub async fn lock<F>(&self, key: &SecretKey, init: F) -> EntryGuard
    where
        F: Fn() -> TrackedCredential,
    {
        loop {
            let entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(init())))
                .clone();
            let guard = entry.lock_owned().await;
            if guard.state != CredentialState::Removed {
                return guard;
            }
        }
    }

    /// Locks an existing entry, waiting while it is busy.
    pub async fn lock_existing(&self, key: &SecretKey) -> Option<EntryGuard> {
        let entry = self.entries.get(key).map(|entry| entry.clone())?;
        let guard = entry.lock_owned().await;
        (guard.state != CredentialState::Removed).then_some(guard)
    }

    /// Locks an existing entry without waiting.
    ///
    /// Returns `None` when the key is unknown, busy, or already removed.
    pub fn try_lock(&self, key: &SecretKey) -> Option<EntryGuard> {
        let entry = self.entries.get(key).map(|entry| entry.clone())?;
        let guard = entry.try_lock_owned().ok()?;
        (guard.state != CredentialState::Removed).then_some(guard)
    }

    /// Tracks an entry unless one already exists for its key.
    pub fn insert_if_absent(&self, tracked: TrackedCredential) -> bool {
        let mut inserted = false;
        self.entries.entry(tracked.key.clone()).or_insert_with(|| {
            inserted = true;
            Arc::new(Mutex::new(tracked))
        });
        inserted
    }

    /// Untracks the locked entry.
    pub fn remove(&self, guard: &mut EntryGuard) {
        guard.state = CredentialState::Removed;
        let mutex = OwnedMutexGuard::mutex(guard).clone();
        self.entries
            .remove_if(&guard.key, |_, entry| Arc::ptr_eq(entry, &mutex));
    }

    pub fn keys(&self) -> Vec<SecretKey> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn statuses(&self) -> Vec<CredentialStatus> {
        let entries: Vec<Entry> = self.entries.iter().map(|entry| entry.value().clone()).collect();
        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            let tracked = entry.lock().await;
            if tracked.state != CredentialState::Removed {
                statuses.push(tracked.status());
            }
        }
        statuses.sort_by(|a, b| a.secret.cmp(&b.secret));
        statuses
    }

    /// Set once the pod pipeline has applied a complete pod listing.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn key() -> SecretKey {
        SecretKey::new("team-a", "aws-iam-app")
    }

    fn tracked() -> TrackedCredential {
        TrackedCredential::new(key(), "arn:aws:iam::1:role/app".into(), None)
    }

    fn credentials(expiration: DateTime<Utc>) -> Credentials {
        Credentials {
            role_arn: "arn:aws:iam::1:role/app".into(),
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
            session_token: "token".into(),
            expiration,
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_needs_refresh() {
        let limit = Duration::from_secs(15 * 60);
        let mut entry = tracked();
        assert!(entry.needs_refresh(at(10, 0), limit));

        entry.record_success(credentials(at(11, 0))).unwrap();
        assert!(!entry.needs_refresh(at(10, 44), limit));
        assert!(entry.needs_refresh(at(10, 45), limit));
        assert!(entry.needs_refresh(at(12, 0), limit));
    }

    #[test]
    fn test_observe_marks_due() {
        let limit = Duration::from_secs(15 * 60);
        let mut entry = tracked();
        entry.record_success(credentials(at(11, 0))).unwrap();
        entry.observe(at(10, 0), limit);
        assert_eq!(entry.state, CredentialState::Fresh);
        entry.observe(at(10, 50), limit);
        assert_eq!(entry.state, CredentialState::DueForRefresh);
    }

    #[test]
    fn test_failure_keeps_credentials() {
        let mut entry = tracked();
        entry.record_success(credentials(at(11, 0))).unwrap();
        let before = entry.credentials.clone();

        let error = AppError::AssumeRoleFailed {
            role_arn: entry.role_arn.clone(),
            message: "throttled".into(),
        };
        entry.record_failure(at(10, 50), &error);
        assert_eq!(entry.state, CredentialState::RefreshFailed);
        assert_eq!(entry.credentials, before);
        assert!(entry.last_error.as_deref().unwrap().contains("throttled"));

        entry.record_failure(at(11, 5), &error);
        assert_eq!(entry.state, CredentialState::Expired);
        assert_eq!(entry.credentials, before);
    }

    #[test]
    fn test_success_must_move_expiration_forward() {
        let mut entry = tracked();
        entry.record_success(credentials(at(11, 0))).unwrap();
        assert!(entry.record_success(credentials(at(11, 0))).is_err());
        assert!(entry.record_success(credentials(at(10, 0))).is_err());
        assert_eq!(entry.expiration(), Some(at(11, 0)));

        entry.record_success(credentials(at(12, 0))).unwrap();
        assert_eq!(entry.expiration(), Some(at(12, 0)));
        assert_eq!(entry.state, CredentialState::Fresh);
    }

    #[tokio::test]
    async fn test_try_lock_skips_held_entry() {
        let registry = Registry::new();
        let guard = registry.lock(&key(), tracked).await;
        assert!(registry.try_lock(&key()).is_none());
        drop(guard);
        assert!(registry.try_lock(&key()).is_some());
    }

    #[tokio::test]
    async fn test_removed_entry_is_recreated() {
        let registry = Registry::new();
        let mut guard = registry.lock(&key(), tracked).await;
        guard.pods.insert("web-0".into());
        registry.remove(&mut guard);
        drop(guard);

        assert!(registry.is_empty());
        assert!(registry.try_lock(&key()).is_none());

        let guard = registry.lock(&key(), tracked).await;
        assert!(guard.pods.is_empty());
        assert_eq!(guard.state, CredentialState::Pending);
    }

    #[tokio::test]
    async fn test_stale_handle_sees_removal() {
        let registry = Registry::new();
        registry.insert_if_absent(tracked());
        let stale = registry.entries.get(&key()).unwrap().clone();

        let mut guard = registry.try_lock(&key()).unwrap();
        registry.remove(&mut guard);
        drop(guard);

        assert_eq!(stale.lock().await.state, CredentialState::Removed);
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_existing() {
        let registry = Registry::new();
        assert!(registry.insert_if_absent(tracked()));
        let mut other = tracked();
        other.role_arn = "arn:aws:iam::1:role/other".into();
        assert!(!registry.insert_if_absent(other));
        assert_eq!(registry.statuses().await[0].role_arn, "arn:aws:iam::1:role/app");
    }
}
