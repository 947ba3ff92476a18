// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Cluster access seam. Every read and write of live objects goes through
//! [`ClusterClient`] so the reconcilers and the pipeline can run against an
//! in-memory store in tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::core::ErrorResponse;
use kube::discovery::ApiResource;
use kube::Client;
use tokio::sync::RwLock;
use tracing::debug;

use crate::api::KindRef;
use crate::config::OperatorConfig;
use crate::error::{Error, Result};

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetches one object; `Ok(None)` when it does not exist.
    async fn get(
        &self,
        kind: &KindRef,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Lists live objects of a kind, honoring the configured namespace set.
    async fn list(&self, kind: &KindRef) -> Result<Vec<DynamicObject>>;

    async fn create(
        &self,
        kind: &KindRef,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    async fn update(
        &self,
        kind: &KindRef,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Writes the status subresource. Returns [`Error::ObjectGone`] when the
    /// owner has already been deleted.
    async fn update_status(
        &self,
        kind: &KindRef,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ErrorResponse { reason, .. }) if reason == "NotFound")
}

/// Production client backed by kube, with a per-process cache of discovered
/// API resources.
pub struct KubeClusterClient {
    client: Client,
    config: OperatorConfig,
    resources: RwLock<HashMap<KindRef, ApiResource>>,
}

impl KubeClusterClient {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        KubeClusterClient {
            client,
            config,
            resources: RwLock::new(HashMap::new()),
        }
    }

    async fn api_resource(&self, kind: &KindRef) -> Result<ApiResource> {
        if let Some(ar) = self.resources.read().await.get(kind) {
            return Ok(ar.clone());
        }
        let (ar, _caps) = kube::discovery::pinned_kind(&self.client, &kind.to_gvk())
            .await
            .map_err(Error::Kube)?;
        debug!(kind = %kind, plural = %ar.plural, "discovered api resource");
        self.resources
            .write()
            .await
            .insert(kind.clone(), ar.clone());
        Ok(ar)
    }

    async fn namespaced_api(&self, kind: &KindRef, namespace: &str) -> Result<Api<DynamicObject>> {
        let ar = self.api_resource(kind).await?;
        Ok(Api::namespaced_with(self.client.clone(), namespace, &ar))
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        kind: &KindRef,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let api = self.namespaced_api(kind, namespace).await?;
        api.get_opt(name).await.map_err(Error::Kube)
    }

    async fn list(&self, kind: &KindRef) -> Result<Vec<DynamicObject>> {
        let ar = self.api_resource(kind).await?;
        let lp = ListParams::default();
        let mut items = Vec::new();
        match &self.config.watch_namespaces {
            Some(namespaces) => {
                for ns in namespaces {
                    let api: Api<DynamicObject> =
                        Api::namespaced_with(self.client.clone(), ns, &ar);
                    items.extend(api.list(&lp).await.map_err(Error::Kube)?.items);
                }
            }
            None => {
                let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
                items.extend(api.list(&lp).await.map_err(Error::Kube)?.items);
            }
        }
        Ok(items)
    }

    async fn create(
        &self,
        kind: &KindRef,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let api = self.namespaced_api(kind, namespace).await?;
        api.create(&PostParams::default(), obj)
            .await
            .map_err(Error::Kube)
    }

    async fn update(
        &self,
        kind: &KindRef,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let api = self.namespaced_api(kind, namespace).await?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        api.replace(&name, &PostParams::default(), obj)
            .await
            .map_err(Error::Kube)
    }

    async fn update_status(
        &self,
        kind: &KindRef,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let api = self.namespaced_api(kind, namespace).await?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        let payload = serde_json::to_vec(obj).map_err(|source| Error::Serialize {
            name: name.clone(),
            source,
        })?;
        match api
            .replace_status(&name, &PostParams::default(), payload)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(err) if is_not_found(&err) => Err(Error::ObjectGone),
            Err(err) => Err(Error::Kube(err)),
        }
    }
}
