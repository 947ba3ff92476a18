// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Watches the Integration document, keeps one generic reconciler per
//! declared kind and swaps the registry snapshot atomically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::Client;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{Integration, IntegrationEntry, KindRef};
use crate::cluster::ClusterClient;
use crate::controller::generic::GenericReconciler;
use crate::controller::stateful::KindReconciler;
use crate::error::{Error, Result};
use crate::events::{EventSink, KubeEventSink};
use crate::transformer::Transformer;

/// Creates the per-controller event sink under which a kind's events are
/// reported.
pub trait EventSinkFactory: Send + Sync {
    fn sink(&self, reporter_name: &str) -> Arc<dyn EventSink>;
}

pub struct KubeEventSinkFactory {
    client: Client,
}

impl KubeEventSinkFactory {
    pub fn new(client: Client) -> Self {
        KubeEventSinkFactory { client }
    }
}

impl EventSinkFactory for KubeEventSinkFactory {
    fn sink(&self, reporter_name: &str) -> Arc<dyn EventSink> {
        Arc::new(KubeEventSink::new(self.client.clone(), reporter_name))
    }
}

/// Installs a reconcile loop under the controller framework. The returned
/// handle is kept for bookkeeping only; removal from the Integration
/// document does not tear the watch down (the orphaned loop short-circuits
/// on the registry check).
#[async_trait]
pub trait ReconcilerInstaller: Send + Sync {
    async fn install(&self, reconciler: Arc<GenericReconciler>) -> Result<Option<JoinHandle<()>>>;
}

/// Production installer: spawns a dynamic watch over the kind and runs the
/// generic reconciler for every event.
pub struct WatchInstaller {
    client: Client,
}

impl WatchInstaller {
    pub fn new(client: Client) -> Self {
        WatchInstaller { client }
    }
}

#[async_trait]
impl ReconcilerInstaller for WatchInstaller {
    async fn install(&self, reconciler: Arc<GenericReconciler>) -> Result<Option<JoinHandle<()>>> {
        let gvk = reconciler.gvk.to_gvk();
        let (ar, _caps) = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(Error::Kube)?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);

        let handle = tokio::spawn(async move {
            Controller::new_with(api, watcher::Config::default(), ar)
                .shutdown_on_signal()
                .run(
                    |obj: Arc<DynamicObject>, ctx: Arc<GenericReconciler>| async move {
                        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
                        let name = obj.metadata.name.clone().unwrap_or_default();
                        ctx.reconcile(&namespace, &name).await
                    },
                    |_obj, error: &Error, _ctx| {
                        warn!(%error, "reconcile failed");
                        Action::requeue(Duration::from_secs(10))
                    },
                    reconciler,
                )
                .for_each(|result| async move {
                    match result {
                        Ok(reconciled) => info!(?reconciled, "reconciled"),
                        Err(err) => warn!(error = %err, "reconcile failed"),
                    }
                })
                .await;
        });
        Ok(Some(handle))
    }
}

struct ManagedReconciler {
    reconciler: Arc<GenericReconciler>,
    // Held, never aborted: see the installer contract.
    _handle: Option<JoinHandle<()>>,
}

pub struct IntegrationController {
    transformer: Arc<Transformer>,
    cluster: Arc<dyn ClusterClient>,
    installer: Arc<dyn ReconcilerInstaller>,
    sink_factory: Arc<dyn EventSinkFactory>,
    stateful: HashMap<String, Arc<dyn KindReconciler>>,
    // Shared by every generic reconciler; serializes child mutation.
    generic_mutex: Arc<Mutex<()>>,
    // Also serializes this controller with itself.
    reconcilers: Mutex<HashMap<String, ManagedReconciler>>,
}

impl IntegrationController {
    pub fn new(
        transformer: Arc<Transformer>,
        cluster: Arc<dyn ClusterClient>,
        installer: Arc<dyn ReconcilerInstaller>,
        sink_factory: Arc<dyn EventSinkFactory>,
        stateful: HashMap<String, Arc<dyn KindReconciler>>,
    ) -> Self {
        IntegrationController {
            transformer,
            cluster,
            installer,
            sink_factory,
            stateful,
            generic_mutex: Arc::new(Mutex::new(())),
            reconcilers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn reconcile(&self, integration: &Integration) -> Result<Action> {
        let mut reconcilers = self.reconcilers.lock().await;
        let entries = integration.spec.entries.clone();

        // Duplicates fail the document before any reconciler is touched.
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.kind_ref()) {
                return Err(Error::DuplicateIntegration(entry.kind_ref().to_string()));
            }
        }

        // The snapshot is published even when an install fails part-way:
        // whatever was activated this cycle stays visible.
        let mut active: Vec<IntegrationEntry> = Vec::new();
        let apply_result = self.apply(&mut reconcilers, &entries, &mut active).await;
        let snapshot_result = self.transformer.registry().set_snapshot(active);
        apply_result?;
        snapshot_result?;
        Ok(Action::await_change())
    }

    async fn apply(
        &self,
        reconcilers: &mut HashMap<String, ManagedReconciler>,
        entries: &[IntegrationEntry],
        active: &mut Vec<IntegrationEntry>,
    ) -> Result<()> {
        for entry in entries {
            let kind = entry.kind_ref();
            let key = kind.to_string();
            if reconcilers.contains_key(&key) {
                info!(controller = %key, "updated controller");
            } else {
                self.add_reconciler(reconcilers, &kind).await?;
            }
            active.push(entry.clone());
        }

        let declared: HashSet<String> = entries
            .iter()
            .map(|entry| entry.kind_ref().to_string())
            .collect();
        let removed: Vec<String> = reconcilers
            .keys()
            .filter(|key| !declared.contains(*key))
            .cloned()
            .collect();
        for key in removed {
            // The framework watch stays alive; its reconciles short-circuit
            // once the registry snapshot no longer carries the kind.
            info!(controller = %key, "removed controller");
            reconcilers.remove(&key);
        }
        Ok(())
    }

    async fn add_reconciler(
        &self,
        reconcilers: &mut HashMap<String, ManagedReconciler>,
        kind: &KindRef,
    ) -> Result<()> {
        let reporter_name = if kind.group.is_empty() {
            format!(
                "{}-{}-controller",
                kind.version.to_lowercase(),
                kind.kind.to_lowercase()
            )
        } else {
            format!(
                "{}-{}-{}-controller",
                kind.group.to_lowercase(),
                kind.version.to_lowercase(),
                kind.kind.to_lowercase()
            )
        };

        let reconciler = Arc::new(GenericReconciler::new(
            kind.clone(),
            self.generic_mutex.clone(),
            self.cluster.clone(),
            self.transformer.clone(),
            self.sink_factory.sink(&reporter_name),
            self.stateful.clone(),
        ));

        let handle = self.installer.install(reconciler.clone()).await.map_err(|err| {
            warn!(controller = %kind, error = %err, "unable to set up controller");
            err
        })?;
        info!(controller = %kind, "added controller");
        reconcilers.insert(
            kind.to_string(),
            ManagedReconciler {
                reconciler,
                _handle: handle,
            },
        );
        Ok(())
    }

    /// Kinds with a live reconcile loop, for introspection and tests.
    pub async fn managed_kinds(&self) -> Vec<KindRef> {
        let reconcilers = self.reconcilers.lock().await;
        let mut kinds: Vec<KindRef> = reconcilers
            .values()
            .map(|managed| managed.reconciler.gvk.clone())
            .collect();
        kinds.sort();
        kinds
    }
}
