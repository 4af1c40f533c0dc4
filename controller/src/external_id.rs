// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! External IDs supplied on AssumeRole.
//!
//! The operator configures a prefix once; every assumption appends the
//! requesting namespace (and, depending on [`ExternalIdScope`], the service
//! account), so a role trusting `<prefix>/team-a` cannot be assumed on behalf
//! of a pod in `team-b`.

use crate::configuration::ExternalIdScope;
use crate::constants::{EXTERNAL_ID_DELIMITER, EXTERNAL_ID_MAX_SIZE, EXTERNAL_ID_PREFIX_MAX_SIZE};
use crate::errors::AppError;

/// Validates the operator supplied external ID prefix.
///
/// Checks run in order and the first failure wins: length, forward slash,
/// character set. The accepted set is `[A-Za-z0-9_+=,.@:\-]` plus `\`.
pub fn validate_prefix(prefix: &str) -> Result<(), AppError> {
    if prefix.len() > EXTERNAL_ID_PREFIX_MAX_SIZE {
        return Err(AppError::InvalidConfig(format!(
            "external ID prefix must not be longer than {EXTERNAL_ID_PREFIX_MAX_SIZE} characters"
        )));
    }
    if prefix.contains(EXTERNAL_ID_DELIMITER) {
        return Err(AppError::InvalidConfig(
            "external ID prefix must not contain a forward slash character".into(),
        ));
    }
    if !prefix.chars().all(is_prefix_char) {
        return Err(AppError::InvalidConfig(
            r"external ID prefix must contain only alphanumeric characters and _+=,.@:\-".into(),
        ));
    }
    Ok(())
}

fn is_prefix_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '=' | ',' | '.' | '@' | ':' | '\\' | '-')
}

/// Builds the external ID for one assumption.
///
/// Returns `None` when no prefix is configured; the `ExternalId` parameter is
/// then left out of the request entirely.
pub fn compose(
    prefix: &str,
    scope: ExternalIdScope,
    namespace: &str,
    service_account: &str,
) -> Result<Option<String>, AppError> {
    if prefix.is_empty() {
        return Ok(None);
    }

    let external_id = match scope {
        ExternalIdScope::Namespace => format!("{prefix}{EXTERNAL_ID_DELIMITER}{namespace}"),
        ExternalIdScope::ServiceAccount => format!(
            "{prefix}{EXTERNAL_ID_DELIMITER}{namespace}{EXTERNAL_ID_DELIMITER}{service_account}"
        ),
    };

    if external_id.len() > EXTERNAL_ID_MAX_SIZE {
        return Err(AppError::InvalidExternalId(format!(
            "external ID for {namespace}/{service_account} exceeds {EXTERNAL_ID_MAX_SIZE} characters"
        )));
    }

    Ok(Some(external_id))
}
