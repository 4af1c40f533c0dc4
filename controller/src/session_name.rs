// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Role session names derived from role ARNs.
//!
//! STS limits `RoleSessionName` to 64 characters from `[\w+=,.@-]`. The name
//! produced here is `<account>.<path...>.<role>` where the role (last path
//! segment) keeps as many characters as the budget allows and every other
//! path segment shrinks, down to a single character, before the role does.
//!
//! ```text
//! arn:aws:iam::123456789012:role/aaaaa/bbbbb/ccccccc
//!                         -> 123456789012.aaaaa.bbbbb.ccccccc
//! ```

use crate::constants::{ARN_PREFIX, ROLE_ARN_SUFFIX, ROLE_SESSION_NAME_MAX_SIZE};
use crate::errors::AppError;

/// Normalizes a role ARN into a valid role session name.
///
/// # Errors
///
/// Returns [`AppError::InvalidArn`] when the ARN has no `/`, when the account
/// part leaves no room for the path, or when the result would contain
/// characters STS does not accept.
pub fn normalize(role_arn: &str) -> Result<String, AppError> {
    normalize_with_budget(role_arn, ROLE_SESSION_NAME_MAX_SIZE)
}

pub(crate) fn normalize_with_budget(role_arn: &str, max_size: usize) -> Result<String, AppError> {
    let mut parts = role_arn.split('/');
    let account_part = parts.next().unwrap_or_default();
    let levels: Vec<&str> = parts.collect();
    if levels.is_empty() {
        return Err(AppError::InvalidArn(format!("{role_arn}: missing '/'")));
    }

    let account_id = account_part.strip_prefix(ARN_PREFIX).unwrap_or(account_part);
    let account_id = account_id.strip_suffix(ROLE_ARN_SUFFIX).unwrap_or(account_id);

    let remaining = max_size as isize - account_id.len() as isize;
    let path = normalize_path(&levels, remaining)
        .ok_or_else(|| AppError::InvalidArn(format!("{role_arn}: session name budget exhausted")))?;

    let name = format!("{account_id}{path}");
    if name.is_empty() || name.len() > max_size {
        return Err(AppError::InvalidArn(format!(
            "{role_arn}: cannot derive a session name of at most {max_size} characters"
        )));
    }
    if let Some(c) = name.chars().find(|c| !is_session_name_char(*c)) {
        return Err(AppError::InvalidArn(format!(
            "{role_arn}: character {c:?} is not allowed in a role session name"
        )));
    }

    Ok(name)
}

/// Compresses path levels into `.`-separated form within `remaining` chars.
///
/// The last level gets every character it can while still leaving one
/// character plus a separator for each of the other levels. Returns `None`
/// when a level would have to shrink below zero characters.
fn normalize_path(levels: &[&str], remaining: isize) -> Option<String> {
    let Some((last, others)) = levels.split_last() else {
        return Some(String::new());
    };

    let mut last = last.replace(':', "_");
    let max_name = remaining - (others.len() as isize * 2) - 1;
    if max_name <= 0 {
        return None;
    }
    if last.len() > max_name as usize {
        last = truncate(&last, max_name as usize);
    }

    let prefix = normalize_path(others, remaining - last.len() as isize - 1)?;
    Some(format!("{prefix}.{last}"))
}

/// Truncates to at most `max` bytes without splitting a character.
fn truncate(value: &str, max: usize) -> String {
    let mut end = max.min(value.len());
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

fn is_session_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '=' | ',' | '.' | '@' | '-')
}
