// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Temporary credentials issued for one role.
#[derive(Clone, PartialEq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub role_arn: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    #[zeroize(skip)]
    pub expiration: DateTime<Utc>,
}

// Custom Debug implementation to prevent accidental logging of sensitive data
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("role_arn", &self.role_arn)
            .field("access_key_id", &"[REDACTED]")
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &"[REDACTED]")
            .field("expiration", &self.expiration)
            .finish()
    }
}

impl Credentials {
    /// AWS shared credentials file with a single `default` profile.
    pub fn to_credentials_file(&self) -> String {
        format!(
            "[default]\naws_access_key_id = {}\naws_secret_access_key = {}\naws_session_token = {}\naws_expiration = {}\n",
            self.access_key_id,
            self.secret_access_key,
            self.session_token,
            format_expiration(&self.expiration),
        )
    }

    /// JSON document printed by a `credential_process` helper.
    pub fn to_credentials_process(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&CredentialProcessOutput {
            version: 1,
            access_key_id: &self.access_key_id,
            secret_access_key: &self.secret_access_key,
            session_token: &self.session_token,
            expiration: format_expiration(&self.expiration),
        })
    }

    /// Parses a `credential_process` document back into credentials.
    pub fn from_credentials_process(role_arn: &str, payload: &[u8]) -> Result<Self, serde_json::Error> {
        let parsed: OwnedCredentialProcessOutput = serde_json::from_slice(payload)?;
        Ok(Self {
            role_arn: role_arn.to_string(),
            access_key_id: parsed.access_key_id,
            secret_access_key: parsed.secret_access_key,
            session_token: parsed.session_token,
            expiration: parsed.expiration,
        })
    }
}

pub fn format_expiration(expiration: &DateTime<Utc>) -> String {
    expiration.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialProcessOutput<'a> {
    version: u8,
    access_key_id: &'a str,
    secret_access_key: &'a str,
    session_token: &'a str,
    expiration: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OwnedCredentialProcessOutput {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    expiration: DateTime<Utc>,
}

/// Namespace and name of a Kubernetes object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub type PodKey = ObjectKey;
pub type SecretKey = ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventKind {
    Added,
    Updated,
    Deleted,
}

/// A change to a pod that requests (or used to request) a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEvent {
    pub kind: PodEventKind,
    pub pod: PodKey,
    /// Value of the role annotation; `None` once the annotation is removed.
    pub role: Option<String>,
    pub service_account: String,
}

/// Items carried on the queue between the pod watcher and the secrets controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchMessage {
    Pod(PodEvent),
    /// Every pod of a full listing has been queued.
    Synced,
}

/// Lifecycle of a tracked credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialState {
    /// Tracked but never issued successfully.
    Pending,
    Fresh,
    DueForRefresh,
    Refreshing,
    RefreshFailed,
    /// Refresh kept failing past the credential's expiration.
    Expired,
    Removed,
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Pending => "pending",
            Self::Fresh => "fresh",
            Self::DueForRefresh => "due-for-refresh",
            Self::Refreshing => "refreshing",
            Self::RefreshFailed => "refresh-failed",
            Self::Expired => "expired",
            Self::Removed => "removed",
        };
        f.write_str(state)
    }
}

/// Status view of a tracked credential, free of secret material.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub secret: SecretKey,
    pub role_arn: String,
    pub state: CredentialState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    pub pods: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn credentials() -> Credentials {
        Credentials {
            role_arn: "arn:aws:iam::123456789012:role/app".into(),
            access_key_id: "AKIAEXAMPLE".into(),
            secret_access_key: "secret".into(),
            session_token: "token".into(),
            expiration: Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let debug = format!("{:?}", credentials());
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("AKIAEXAMPLE"));
        assert!(!debug.contains("secret\""));
        assert!(!debug.contains("token\""));
    }

    #[test]
    fn test_credentials_file() {
        let file = credentials().to_credentials_file();
        assert_eq!(
            file,
            "[default]\naws_access_key_id = AKIAEXAMPLE\naws_secret_access_key = secret\naws_session_token = token\naws_expiration = 2030-01-02T03:04:05Z\n"
        );
    }

    #[test]
    fn test_credentials_process_document() {
        let creds = credentials();
        let json = creds.to_credentials_process().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["Version"], 1);
        assert_eq!(value["AccessKeyId"], "AKIAEXAMPLE");
        assert_eq!(value["Expiration"], "2030-01-02T03:04:05Z");

        let parsed = Credentials::from_credentials_process(&creds.role_arn, json.as_bytes()).unwrap();
        assert_eq!(parsed, creds);
    }

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::new("team-a", "web-0").to_string(), "team-a/web-0");
    }

    #[test]
    fn test_state_display_matches_serde() {
        let json = serde_json::to_string(&CredentialState::RefreshFailed).unwrap();
        assert_eq!(json, format!("\"{}\"", CredentialState::RefreshFailed));
    }
}
