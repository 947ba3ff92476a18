// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! In-memory fakes for the seams: cluster store, probe client, blob store,
//! filesystem provider and event sink.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::api::DynamicObject;
use serde_json::{json, Value};

use crate::api::{IntegrationEntry, KindRef, ReferencePaths, ReferenceRule, TemplateOperation, TemplateRule};
use crate::cluster::ClusterClient;
use crate::dynamic;
use crate::error::{Error, Result};
use crate::events::{EventSeverity, EventSink};
use crate::transformer::blob::{BlobEntry, BlobStore};
use crate::transformer::registry::{IntegrationRegistry, ProbeClient};
use crate::transformer::vfs::{FsProvider, VirtualFileSystem};

// --- object & registry builders -------------------------------------------

pub fn obj(kind: &KindRef, namespace: &str, name: &str) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": kind.api_version(),
        "kind": kind.kind,
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": format!("uid-{name}"),
        }
    }))
    .expect("static test object")
}

pub fn entry_for(kind: &KindRef) -> IntegrationEntry {
    IntegrationEntry {
        group: kind.group.clone(),
        version: kind.version.clone(),
        kind: kind.kind.clone(),
        ..IntegrationEntry::default()
    }
}

pub fn with_reference(
    mut entry: IntegrationEntry,
    target: &KindRef,
    name_path: &str,
    propagate_templates: bool,
) -> IntegrationEntry {
    entry.references.push(ReferenceRule {
        group: target.group.clone(),
        version: target.version.clone(),
        kind: target.kind.clone(),
        paths: ReferencePaths {
            name: name_path.to_string(),
            namespace: String::new(),
        },
        propagate_templates,
    });
    entry
}

pub fn with_template(mut entry: IntegrationEntry, path: &str) -> IntegrationEntry {
    entry.templates.push(TemplateRule {
        operation: TemplateOperation::Template,
        path: path.to_string(),
    });
    entry
}

pub fn with_copy(mut entry: IntegrationEntry, path: &str) -> IntegrationEntry {
    entry.templates.push(TemplateRule {
        operation: TemplateOperation::Copy,
        path: path.to_string(),
    });
    entry
}

pub fn registry_with(entries: Vec<IntegrationEntry>) -> IntegrationRegistry {
    let registry = IntegrationRegistry::new(Arc::new(StubProbeClient::default()));
    registry
        .set_snapshot(entries)
        .expect("test entries are unique");
    registry
}

// --- cluster --------------------------------------------------------------

fn store_key(kind: &KindRef, namespace: &str, name: &str) -> String {
    format!("{kind}|{namespace}/{name}")
}

/// In-memory cluster store. Creates assign UIDs and resource versions;
/// updates bump the resource version; status updates merge the status block.
#[derive(Default)]
pub struct FakeCluster {
    store: Mutex<BTreeMap<String, DynamicObject>>,
    uid_counter: AtomicU64,
    pub creates: Mutex<Vec<String>>,
    pub updates: Mutex<Vec<String>>,
    pub status_updates: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn insert(&self, obj: &DynamicObject) {
        let kind = dynamic::kind_ref_of(obj);
        let key = store_key(&kind, &dynamic::namespace_of(obj), &dynamic::name_of(obj));
        self.store
            .lock()
            .expect("fake store lock")
            .insert(key, obj.clone());
    }

    pub fn stored(&self, kind: &KindRef, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.store
            .lock()
            .expect("fake store lock")
            .get(&store_key(kind, namespace, name))
            .cloned()
    }

    pub fn remove(&self, kind: &KindRef, namespace: &str, name: &str) {
        self.store
            .lock()
            .expect("fake store lock")
            .remove(&store_key(kind, namespace, name));
    }

    pub fn into_arc(self) -> Arc<dyn ClusterClient> {
        Arc::new(self)
    }

    fn next_uid(&self) -> String {
        format!("uid-{}", self.uid_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(
        &self,
        kind: &KindRef,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.stored(kind, namespace, name))
    }

    async fn list(&self, kind: &KindRef) -> Result<Vec<DynamicObject>> {
        let prefix = format!("{kind}|");
        Ok(self
            .store
            .lock()
            .expect("fake store lock")
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(
        &self,
        kind: &KindRef,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut created = obj.clone();
        if created.metadata.uid.is_none() {
            created.metadata.uid = Some(self.next_uid());
        }
        created.metadata.resource_version = Some("1".to_string());
        let name = dynamic::name_of(&created);
        self.creates
            .lock()
            .expect("fake log lock")
            .push(format!("{}/{namespace}/{name}", kind.kind));
        self.store
            .lock()
            .expect("fake store lock")
            .insert(store_key(kind, namespace, &name), created.clone());
        Ok(created)
    }

    async fn update(
        &self,
        kind: &KindRef,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut updated = obj.clone();
        let name = dynamic::name_of(&updated);
        let version = updated
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        updated.metadata.resource_version = Some((version + 1).to_string());
        self.updates
            .lock()
            .expect("fake log lock")
            .push(format!("{}/{namespace}/{name}", kind.kind));
        self.store
            .lock()
            .expect("fake store lock")
            .insert(store_key(kind, namespace, &name), updated.clone());
        Ok(updated)
    }

    async fn update_status(
        &self,
        kind: &KindRef,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = dynamic::name_of(obj);
        let key = store_key(kind, namespace, &name);
        let mut store = self.store.lock().expect("fake store lock");
        let Some(existing) = store.get_mut(&key) else {
            return Err(Error::ObjectGone);
        };
        existing.data["status"] = obj.data.get("status").cloned().unwrap_or(Value::Null);
        self.status_updates
            .lock()
            .expect("fake log lock")
            .push(format!("{}/{namespace}/{name}", kind.kind));
        Ok(existing.clone())
    }
}

// --- probes ---------------------------------------------------------------

#[derive(Default)]
struct StubProbeInner {
    responses: Mutex<HashMap<String, std::result::Result<Value, (u16, String)>>>,
    requests: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
pub struct StubProbeClient {
    inner: Arc<StubProbeInner>,
}

impl StubProbeClient {
    pub fn respond(&self, url: &str, body: Value) {
        self.inner
            .responses
            .lock()
            .expect("stub probe lock")
            .insert(url.to_string(), Ok(body));
    }

    pub fn fail(&self, url: &str, status: u16, body: &str) {
        self.inner
            .responses
            .lock()
            .expect("stub probe lock")
            .insert(url.to_string(), Err((status, body.to_string())));
    }

    pub fn requests(&self) -> Vec<String> {
        self.inner.requests.lock().expect("stub probe lock").clone()
    }
}

#[async_trait]
impl ProbeClient for StubProbeClient {
    async fn get(&self, probe_name: &str, url: &str) -> Result<Value> {
        self.inner
            .requests
            .lock()
            .expect("stub probe lock")
            .push(url.to_string());
        match self
            .inner
            .responses
            .lock()
            .expect("stub probe lock")
            .get(url)
        {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err((status, body))) => Err(Error::ProbeStatus {
                name: probe_name.to_string(),
                status: *status,
                body: body.clone(),
            }),
            None => Err(Error::ProbeStatus {
                name: probe_name.to_string(),
                status: 404,
                body: format!("no stub response for {url}"),
            }),
        }
    }
}

// --- blob store -----------------------------------------------------------

#[derive(Default)]
pub struct StaticBlobStore {
    objects: Mutex<Vec<(String, BlobEntry, Vec<u8>)>>,
}

impl StaticBlobStore {
    pub fn put(&self, bucket: &str, name: &str, data: &[u8]) {
        self.objects.lock().expect("blob lock").push((
            bucket.to_string(),
            BlobEntry {
                name: name.to_string(),
                size: data.len() as u64,
            },
            data.to_vec(),
        ));
    }

    pub fn put_marker(&self, bucket: &str, name: &str) {
        self.objects.lock().expect("blob lock").push((
            bucket.to_string(),
            BlobEntry {
                name: name.to_string(),
                size: 0,
            },
            Vec::new(),
        ));
    }
}

#[async_trait]
impl BlobStore for StaticBlobStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<BlobEntry>> {
        Ok(self
            .objects
            .lock()
            .expect("blob lock")
            .iter()
            .filter(|(b, entry, _)| b == bucket && entry.name.starts_with(prefix))
            .map(|(_, entry, _)| entry.clone())
            .collect())
    }

    async fn fetch(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .expect("blob lock")
            .iter()
            .find(|(b, entry, _)| b == bucket && entry.name == name)
            .map(|(_, _, data)| data.clone())
            .ok_or_else(|| Error::BlobStore(format!("object {name:?} not found")))
    }
}

// --- filesystem provider --------------------------------------------------

/// Maps virtual URIs to pre-built filesystems, the way the original injected
/// its filesystem factory in tests.
#[derive(Default)]
pub struct StubFsProvider {
    routes: Mutex<HashMap<String, (Arc<dyn VirtualFileSystem>, String)>>,
}

impl StubFsProvider {
    pub fn route(&self, uri: &str, fs: Arc<dyn VirtualFileSystem>, root: &str) {
        self.routes
            .lock()
            .expect("fs route lock")
            .insert(uri.to_string(), (fs, root.to_string()));
    }
}

#[async_trait]
impl FsProvider for StubFsProvider {
    async fn resolve(&self, path: &str) -> Result<(Arc<dyn VirtualFileSystem>, String)> {
        self.routes
            .lock()
            .expect("fs route lock")
            .get(path)
            .cloned()
            .ok_or_else(|| Error::MalformedVirtualPath(path.to_string()))
    }
}

// --- events ---------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct CapturingEventSink {
    pub events: Mutex<Vec<RecordedEvent>>,
}

impl CapturingEventSink {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("event lock")
            .iter()
            .map(|event| event.reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for CapturingEventSink {
    async fn publish(
        &self,
        _obj: &DynamicObject,
        severity: EventSeverity,
        reason: &str,
        message: String,
    ) {
        self.events.lock().expect("event lock").push(RecordedEvent {
            severity,
            reason: reason.to_string(),
            message,
        });
    }
}
