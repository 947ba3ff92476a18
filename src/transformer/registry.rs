// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Hot-swappable table of per-kind integration rules. A reconcile sees the
//! old or the new snapshot, never a torn view: readers clone the snapshot
//! pointer under a reader lock, the integration controller swaps it under
//! the writer lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use serde_json::{Map, Value};
use tracing::debug;

use crate::api::{ContextProbe, IntegrationEntry, KindRef, ReferenceRule, TemplateHash, TemplateOperation};
use crate::dynamic;
use crate::error::{Error, Result};
use crate::transformer::blob::AmbientTokenSource;
use crate::transformer::functions;

/// HTTP client used by context probes. Injected so tests can stub responses.
#[async_trait]
pub trait ProbeClient: Send + Sync {
    async fn get(&self, probe_name: &str, url: &str) -> Result<Value>;
}

/// Default probe client: plain GET with ambient credentials, 2xx-only, JSON
/// body required.
pub struct HttpProbeClient {
    http: reqwest::Client,
    tokens: AmbientTokenSource,
}

impl HttpProbeClient {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        HttpProbeClient {
            tokens: AmbientTokenSource::new(http.clone()),
            http,
        }
    }
}

#[async_trait]
impl ProbeClient for HttpProbeClient {
    async fn get(&self, probe_name: &str, url: &str) -> Result<Value> {
        let mut request = self.http.get(url);
        if let Some(token) = self.tokens.token().await {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|source| Error::ProbeRequest {
            name: probe_name.to_string(),
            source,
        })?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|source| Error::ProbeRequest {
                name: probe_name.to_string(),
                source,
            })?;
        if !status.is_success() {
            return Err(Error::ProbeStatus {
                name: probe_name.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        serde_json::from_slice(&body).map_err(|source| Error::ProbeBody {
            name: probe_name.to_string(),
            source,
        })
    }
}

type Snapshot = Arc<Vec<IntegrationEntry>>;

pub struct IntegrationRegistry {
    snapshot: RwLock<Snapshot>,
    probe_client: Arc<dyn ProbeClient>,
}

impl IntegrationRegistry {
    pub fn new(probe_client: Arc<dyn ProbeClient>) -> Self {
        IntegrationRegistry {
            snapshot: RwLock::new(Arc::new(Vec::new())),
            probe_client,
        }
    }

    fn current(&self) -> Snapshot {
        self.snapshot
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Atomically replaces the visible rule set. At most one entry per
    /// `(group, version, kind)`; duplicates fail the whole document.
    pub fn set_snapshot(&self, entries: Vec<IntegrationEntry>) -> Result<()> {
        let mut seen = HashMap::new();
        for entry in &entries {
            let kind = entry.kind_ref();
            if seen.insert(kind.clone(), ()).is_some() {
                return Err(Error::DuplicateIntegration(kind.to_string()));
            }
        }
        if let Ok(mut guard) = self.snapshot.write() {
            *guard = Arc::new(entries);
        }
        Ok(())
    }

    pub fn has(&self, kind: &KindRef) -> bool {
        self.current()
            .iter()
            .any(|entry| &entry.kind_ref() == kind)
    }

    pub fn list(&self) -> Vec<KindRef> {
        self.current().iter().map(IntegrationEntry::kind_ref).collect()
    }

    fn find(&self, kind: &KindRef) -> Option<IntegrationEntry> {
        self.current()
            .iter()
            .find(|entry| &entry.kind_ref() == kind)
            .cloned()
    }

    /// Name paths and namespace paths for the references of a kind, keyed by
    /// the referenced kind.
    pub fn reference_paths(
        &self,
        kind: &KindRef,
    ) -> (HashMap<KindRef, String>, HashMap<KindRef, String>) {
        let mut names = HashMap::new();
        let mut namespaces = HashMap::new();
        if let Some(entry) = self.find(kind) {
            for rule in &entry.references {
                names.insert(rule.kind_ref(), rule.paths.name.clone());
                namespaces.insert(rule.kind_ref(), rule.paths.namespace.clone());
            }
        }
        (names, namespaces)
    }

    /// The complete reference rules of a kind, propagation flags included.
    pub fn reference_rules(&self, kind: &KindRef) -> Vec<ReferenceRule> {
        self.find(kind)
            .map(|entry| entry.references)
            .unwrap_or_default()
    }

    pub fn copy_paths(&self, kind: &KindRef) -> Vec<String> {
        self.paths(kind, TemplateOperation::Copy)
    }

    pub fn template_paths(&self, kind: &KindRef) -> Vec<String> {
        self.paths(kind, TemplateOperation::Template)
    }

    pub fn hashes(&self, kind: &KindRef) -> Vec<TemplateHash> {
        self.find(kind).map(|entry| entry.hashes).unwrap_or_default()
    }

    fn paths(&self, kind: &KindRef, operation: TemplateOperation) -> Vec<String> {
        self.find(kind)
            .map(|entry| {
                entry
                    .templates
                    .iter()
                    .filter(|rule| rule.operation == operation)
                    .map(|rule| rule.path.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Runs the kind's probes in declared order, merging each JSON result
    /// into the accumulator under the probe name. Probe URLs are rendered
    /// against the accumulator with the standard function library.
    pub async fn resolve_context(
        &self,
        obj: &DynamicObject,
        output: &mut Map<String, Value>,
    ) -> Result<()> {
        let kind = dynamic::kind_ref_of(obj);
        let entry = self
            .find(&kind)
            .ok_or_else(|| Error::MissingIntegration(kind.to_string()))?;
        if entry.context.is_empty() {
            return Ok(());
        }

        let engine = functions::engine();
        for probe in &entry.context {
            let url = self.render_probe_url(&engine, probe, output)?;
            debug!(probe = %probe.name, url = %url, "resolving context probe");
            let body = self.probe_client.get(&probe.name, &url).await?;
            output.insert(probe.name.clone(), body);
        }
        Ok(())
    }

    fn render_probe_url(
        &self,
        engine: &handlebars::Handlebars<'_>,
        probe: &ContextProbe,
        output: &Map<String, Value>,
    ) -> Result<String> {
        if probe.request.method != "GET" {
            return Err(Error::ProbeMethodUnsupported(probe.name.clone()));
        }
        engine
            .render_template(&probe.request.path, &Value::Object(output.clone()))
            .map_err(|source| Error::TemplateRender {
                path: probe.request.path.clone(),
                source: Box::new(source),
            })
    }
}
