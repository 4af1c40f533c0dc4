// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kube_aws_iam_controller::application::{AppState, Application};
use kube_aws_iam_controller::configuration::{ControllerConfig, ControllerOptions};
use kube_aws_iam_controller::controller::SecretsController;
use kube_aws_iam_controller::credentials::{CredentialsGetter, StsCredentialsGetter, sts_client};
use kube_aws_iam_controller::registry::Registry;
use kube_aws_iam_controller::scheduler::RefreshScheduler;
use kube_aws_iam_controller::secrets::{KubeSecretStore, SecretStore};
use kube_aws_iam_controller::supervisor::{Components, supervise};
use kube_aws_iam_controller::watcher::PodWatcher;
use kube_aws_iam_controller::{external_id, imds};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = ControllerOptions::parse();

    let level = if options.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| level.into()),
        ))
        // this needs to be set to remove duplicated information in the log.
        .with_current_span(false)
        // this needs to be set to false, otherwise ANSI color codes will
        // show up in a confusing manner in CloudWatch logs.
        .with_ansi(false)
        // remove the name of the function from every log entry
        .with_target(false)
        .init();

    tracing::info!("[controller] {:?}", &options);

    // Checked before any network call is made.
    external_id::validate_prefix(&options.external_id_prefix)?;

    let base_role_arn = match options.base_role_arn.as_deref().filter(|arn| !arn.is_empty()) {
        Some(arn) => arn.to_string(),
        None => {
            tracing::info!("[controller] discovering base role ARN from instance metadata");
            imds::get_base_role_arn()
                .await
                .context("base role ARN was not set and could not be discovered")?
        }
    };

    let config = Arc::new(ControllerConfig::from_options(&options, base_role_arn)?);
    tracing::info!("[controller] using base role ARN {}", config.base_role_arn);

    let client = kube_client(options.apiserver.as_deref()).await?;
    let sts = sts_client(config.assume_role.as_deref()).await;

    let getter: Arc<dyn CredentialsGetter> =
        Arc::new(StsCredentialsGetter::new(sts, config.base_role_arn.clone()));
    let store: Arc<dyn SecretStore> = Arc::new(KubeSecretStore::new(client.clone()));
    let registry = Arc::new(Registry::new());

    let scheduler = RefreshScheduler::new(
        config.clone(),
        registry.clone(),
        getter.clone(),
        store.clone(),
    );
    scheduler
        .adopt_existing()
        .await
        .context("failed to list existing credential secrets")?;

    let application = Application::build(
        &options,
        AppState {
            registry: registry.clone(),
        },
    )
    .await?;

    let token = CancellationToken::new();
    let (tx, rx) = mpsc::channel(config.event_queue_size);
    let mut components = Components::new();

    {
        let token = token.clone();
        let namespace = config.namespace.clone();
        components.spawn(async move {
            PodWatcher::new(tx).run(client, namespace, token).await;
            "pod watcher"
        });
    }
    {
        let token = token.clone();
        let controller = SecretsController::new(config.clone(), registry, getter, store);
        components.spawn(async move {
            controller.run(rx, token).await;
            "secrets controller"
        });
    }
    {
        let token = token.clone();
        components.spawn(async move {
            scheduler.run(token).await;
            "refresh scheduler"
        });
    }
    {
        let token = token.clone();
        components.spawn(async move {
            if let Err(e) = application.run_until_stopped(token).await {
                tracing::error!("[http] server failed: {}", e);
            }
            "http server"
        });
    }

    supervise(components, shutdown_signal(), token).await?;
    Ok(())
}

async fn kube_client(apiserver: Option<&str>) -> anyhow::Result<kube::Client> {
    let mut config = kube::Config::infer()
        .await
        .context("failed to load kubernetes configuration")?;

    if let Some(apiserver) = apiserver.filter(|url| !url.is_empty()) {
        config.cluster_url = apiserver
            .parse()
            .with_context(|| format!("invalid apiserver URL {apiserver:?}"))?;
    }

    kube::Client::try_from(config).context("failed to build kubernetes client")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("[controller] failed to install ctrl-c handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("[controller] failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
