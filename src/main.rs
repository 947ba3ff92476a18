// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, CustomResourceExt};
use tracing::{info, warn};

use loom_operator::cluster::KubeClusterClient;
use loom_operator::config::OperatorConfig;
use loom_operator::controller::integration::{KubeEventSinkFactory, WatchInstaller};
use loom_operator::controller::model_data::ModelDataReconciler;
use loom_operator::controller::sandbox::AgenticSandboxReconciler;
use loom_operator::controller::stateful::KindReconciler;
use loom_operator::controller::IntegrationController;
use loom_operator::transformer::blob::HttpBlobStore;
use loom_operator::transformer::compose::OverlayComposer;
use loom_operator::transformer::registry::{HttpProbeClient, IntegrationRegistry};
use loom_operator::transformer::vfs::DefaultFsProvider;
use loom_operator::{Error, Integration, Transformer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("run");
    if cmd == "export" {
        info!("exporting custom resource definition");
        println!("{}", serde_yaml::to_string(&Integration::crd())?);
        return Ok(());
    }
    if cmd != "run" {
        warn!("wrong command; please use \"export\" or \"run\"");
        return Ok(());
    }

    info!("running loom-operator");
    let config = OperatorConfig::from_env();
    let client = Client::try_default().await?;

    let registry = Arc::new(IntegrationRegistry::new(Arc::new(HttpProbeClient::new(
        config.probe_timeout,
    ))));
    let transformer = Arc::new(Transformer::new(
        registry,
        Arc::new(DefaultFsProvider::new(Arc::new(HttpBlobStore::new(
            reqwest::Client::new(),
        )))),
        Arc::new(OverlayComposer),
    ));

    let mut stateful: HashMap<String, Arc<dyn KindReconciler>> = HashMap::new();
    stateful.insert("ModelData".to_string(), Arc::new(ModelDataReconciler));
    stateful.insert(
        "AgenticSandbox".to_string(),
        Arc::new(AgenticSandboxReconciler),
    );

    let integration_controller = Arc::new(IntegrationController::new(
        transformer,
        Arc::new(KubeClusterClient::new(client.clone(), config)),
        Arc::new(WatchInstaller::new(client.clone())),
        Arc::new(KubeEventSinkFactory::new(client.clone())),
        stateful,
    ));

    let integrations = Api::<Integration>::all(client.clone());
    if let Err(err) = integrations.list(&ListParams::default()).await {
        warn!(error = %err, "unable to list Integration resources; is the CRD installed?");
    }

    Controller::new(integrations, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            |integration: Arc<Integration>, ctx: Arc<IntegrationController>| async move {
                ctx.reconcile(&integration).await
            },
            |_obj, error: &Error, _ctx| {
                warn!(%error, "integration reconcile failed");
                Action::requeue(Duration::from_secs(10))
            },
            integration_controller,
        )
        .for_each(|result| async move {
            match result {
                Ok(reconciled) => info!(?reconciled, "reconciled"),
                Err(err) => warn!(error = %err, "reconcile failed"),
            }
        })
        .await;
    info!("controller terminated");
    Ok(())
}
