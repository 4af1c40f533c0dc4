// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Kubernetes Secrets holding issued credentials.
//!
//! Every managed Secret carries the `heritage` and `type` labels so the
//! scheduler can find and adopt it after a restart, plus annotations with the
//! role ARN, external ID and expiration it was issued for.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, ResourceExt};

use crate::configuration::ExternalIdScope;
use crate::constants::{
    ARN_PREFIX, CONTROLLER_NAME, CREDENTIALS_FILE_KEY, CREDENTIALS_PROCESS_KEY,
    EXPIRATION_ANNOTATION, EXTERNAL_ID_ANNOTATION, HERITAGE_LABEL_KEY, HERITAGE_LABEL_VALUE,
    MAX_OBJECT_NAME_LENGTH, ROLE_ARN_ANNOTATION, SECRET_NAME_PREFIX, SECRET_TYPE_LABEL_KEY,
    SECRET_TYPE_LABEL_VALUE,
};
use crate::errors::AppError;
use crate::models::{Credentials, SecretKey, format_expiration};

/// What is persisted for one tracked credential.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCredential {
    pub key: SecretKey,
    pub role_arn: String,
    pub external_id: Option<String>,
    pub credentials: Credentials,
}

/// Persistence for issued credentials.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Creates or overwrites the Secret for `stored.key`.
    async fn apply(&self, stored: &StoredCredential) -> Result<(), AppError>;

    /// Deletes a Secret; a Secret that is already gone is not an error.
    async fn delete(&self, key: &SecretKey) -> Result<(), AppError>;

    /// Lists Secrets managed by this controller, in one namespace or all.
    async fn list_managed(&self, namespace: Option<&str>)
    -> Result<Vec<StoredCredential>, AppError>;
}

pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    #[tracing::instrument(skip(self, stored), fields(secret = %stored.key))]
    async fn apply(&self, stored: &StoredCredential) -> Result<(), AppError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &stored.key.namespace);
        let secret = build_secret(stored)?;

        secrets
            .patch(
                &stored.key.name,
                &PatchParams::apply(CONTROLLER_NAME).force(),
                &Patch::Apply(&secret),
            )
            .await?;

        tracing::debug!("[secrets] applied secret {}", stored.key);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, key: &SecretKey) -> Result<(), AppError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &key.namespace);

        match secrets.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => {
                tracing::debug!("[secrets] deleted secret {}", key);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn list_managed(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<StoredCredential>, AppError> {
        let secrets: Api<Secret> = match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };

        let list = secrets
            .list(&ListParams::default().labels(&managed_label_selector()))
            .await?;

        let mut stored = Vec::with_capacity(list.items.len());
        for secret in &list.items {
            match parse_secret(secret) {
                Ok(credential) => stored.push(credential),
                Err(e) => tracing::warn!(
                    "[secrets] ignoring managed secret {}/{}: {}",
                    secret.namespace().unwrap_or_default(),
                    secret.name_any(),
                    e
                ),
            }
        }
        Ok(stored)
    }
}

pub fn managed_label_selector() -> String {
    format!(
        "{HERITAGE_LABEL_KEY}={HERITAGE_LABEL_VALUE},{SECRET_TYPE_LABEL_KEY}={SECRET_TYPE_LABEL_VALUE}"
    )
}

/// Name of the Secret holding credentials for `role_arn`.
///
/// Uses the role path and name from the ARN, lowercased, with characters a
/// Secret name cannot hold replaced by `-`.
pub fn secret_name(
    role_arn: &str,
    scope: ExternalIdScope,
    service_account: &str,
) -> Result<String, AppError> {
    let role = role_arn
        .strip_prefix(ARN_PREFIX)
        .and_then(|rest| rest.split_once(":role/"))
        .map(|(_, role)| role)
        .unwrap_or(role_arn);

    let role = sanitize(role);
    if role.is_empty() {
        return Err(AppError::InvalidArn(format!(
            "{role_arn}: no usable role name for a secret"
        )));
    }

    let name = match scope {
        ExternalIdScope::Namespace => format!("{SECRET_NAME_PREFIX}{role}"),
        ExternalIdScope::ServiceAccount => {
            format!("{SECRET_NAME_PREFIX}{}.{role}", sanitize(service_account))
        }
    };

    let mut name: String = name.chars().take(MAX_OBJECT_NAME_LENGTH).collect();
    while name.ends_with(['-', '.']) {
        name.pop();
    }
    Ok(name)
}

/// Lowercased DNS subdomain text: every `.`-separated label is non-empty and
/// starts and ends with an alphanumeric character.
fn sanitize(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-' | '.') => c,
            _ => '-',
        })
        .collect();

    mapped
        .split('.')
        .map(|label| label.trim_matches('-'))
        .filter(|label| !label.is_empty())
        .collect::<Vec<_>>()
        .join(".")
}

pub fn build_secret(stored: &StoredCredential) -> Result<Secret, AppError> {
    let labels = BTreeMap::from([
        (HERITAGE_LABEL_KEY.to_string(), HERITAGE_LABEL_VALUE.to_string()),
        (SECRET_TYPE_LABEL_KEY.to_string(), SECRET_TYPE_LABEL_VALUE.to_string()),
    ]);

    let mut annotations = BTreeMap::from([
        (ROLE_ARN_ANNOTATION.to_string(), stored.role_arn.clone()),
        (
            EXPIRATION_ANNOTATION.to_string(),
            format_expiration(&stored.credentials.expiration),
        ),
    ]);
    if let Some(external_id) = &stored.external_id {
        annotations.insert(EXTERNAL_ID_ANNOTATION.to_string(), external_id.clone());
    }

    let data = BTreeMap::from([
        (
            CREDENTIALS_FILE_KEY.to_string(),
            ByteString(stored.credentials.to_credentials_file().into_bytes()),
        ),
        (
            CREDENTIALS_PROCESS_KEY.to_string(),
            ByteString(stored.credentials.to_credentials_process()?.into_bytes()),
        ),
    ]);

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(stored.key.name.clone()),
            namespace: Some(stored.key.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

pub fn parse_secret(secret: &Secret) -> Result<StoredCredential, AppError> {
    let invalid = |reason: &str| {
        AppError::SecretStoreFailed(format!(
            "secret {}/{} {reason}",
            secret.namespace().unwrap_or_default(),
            secret.name_any()
        ))
    };

    let namespace = secret.namespace().ok_or_else(|| invalid("has no namespace"))?;
    let annotations = secret.annotations();
    let role_arn = annotations
        .get(ROLE_ARN_ANNOTATION)
        .ok_or_else(|| invalid("has no role ARN annotation"))?;
    let external_id = annotations.get(EXTERNAL_ID_ANNOTATION).cloned();

    let payload = secret
        .data
        .as_ref()
        .and_then(|data| data.get(CREDENTIALS_PROCESS_KEY))
        .ok_or_else(|| invalid("has no credentials"))?;
    let mut credentials = Credentials::from_credentials_process(role_arn, &payload.0)
        .map_err(|e| invalid(&format!("has malformed credentials: {e}")))?;

    // The annotation wins if both are present but disagree.
    if let Some(expiration) = annotations.get(EXPIRATION_ANNOTATION) {
        credentials.expiration = DateTime::parse_from_rfc3339(expiration)
            .map_err(|e| invalid(&format!("has malformed expiration: {e}")))?
            .with_timezone(&Utc);
    }

    Ok(StoredCredential {
        key: SecretKey::new(namespace, secret.name_any()),
        role_arn: role_arn.clone(),
        external_id,
        credentials,
    })
}
