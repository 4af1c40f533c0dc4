// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::errors::AppError;

/// Long-lived tasks, each resolving to its own name when it returns.
pub type Components = JoinSet<&'static str>;

/// Runs until `shutdown` resolves or a component returns, then cancels
/// `token` and waits for the remaining components.
///
/// # Errors
///
/// [`AppError::ComponentStopped`] when a component returned before shutdown
/// was requested.
pub async fn supervise<F>(
    mut components: Components,
    shutdown: F,
    token: CancellationToken,
) -> Result<(), AppError>
where
    F: Future<Output = ()>,
{
    let stopped = tokio::select! {
        () = shutdown => {
            tracing::info!("[controller] shutting down");
            None
        }
        joined = components.join_next() => {
            let name = match joined {
                Some(Ok(name)) => name.to_string(),
                Some(Err(e)) => format!("component task ({e})"),
                None => "component set".to_string(),
            };
            tracing::error!("[controller] {} stopped unexpectedly", name);
            Some(name)
        }
    };

    token.cancel();
    while components.join_next().await.is_some() {}
    tracing::info!("[controller] stopped");

    match stopped {
        Some(name) => Err(AppError::ComponentStopped(name)),
        None => Ok(()),
    }
}
