// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Discovery of objects connected to a trigger: the objects it references
//! (children) and the objects referencing it (parents).

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::api::DynamicObject;

use crate::api::KindRef;
use crate::cluster::ClusterClient;
use crate::dynamic;
use crate::error::Result;
use crate::transformer::registry::IntegrationRegistry;

pub struct RelatedObjects {
    /// Objects the trigger points at.
    pub referenced: Vec<DynamicObject>,
    /// Objects pointing at the trigger.
    pub referencing: Vec<DynamicObject>,
}

pub type InstanceCache = BTreeMap<KindRef, BTreeMap<String, DynamicObject>>;

/// Lists every live object of every registered kind. Listing failures abort
/// the reconcile.
pub async fn populate_instance_cache(
    cluster: &Arc<dyn ClusterClient>,
    registry: &IntegrationRegistry,
) -> Result<InstanceCache> {
    let mut cache = InstanceCache::new();
    for kind in registry.list() {
        let mut instances = BTreeMap::new();
        for obj in cluster.list(&kind).await? {
            instances.insert(dynamic::object_key(&obj), obj);
        }
        cache.insert(kind, instances);
    }
    Ok(cache)
}

/// Partitions the cached instances around the trigger. Missing optional
/// reference paths are tolerated; only resolved, matching names connect.
pub async fn find_connected_resources(
    cluster: &Arc<dyn ClusterClient>,
    registry: &IntegrationRegistry,
    trigger: &DynamicObject,
) -> Result<RelatedObjects> {
    let cache = populate_instance_cache(cluster, registry).await?;
    Ok(classify(registry, trigger, &cache))
}

pub(crate) fn classify(
    registry: &IntegrationRegistry,
    trigger: &DynamicObject,
    cache: &InstanceCache,
) -> RelatedObjects {
    let trigger_key = dynamic::object_key(trigger);
    let trigger_kind = dynamic::kind_ref_of(trigger);
    let trigger_name = dynamic::name_of(trigger);

    let mut referenced: BTreeMap<String, DynamicObject> = BTreeMap::new();
    let mut referencing: BTreeMap<String, DynamicObject> = BTreeMap::new();

    for instances in cache.values() {
        for (instance_key, instance) in instances {
            if instance_key == &trigger_key {
                continue;
            }
            let instance_kind = dynamic::kind_ref_of(instance);

            // Parent side: does the instance reference the trigger?
            let (name_paths, _) = registry.reference_paths(&instance_kind);
            for (ref_kind, name_path) in &name_paths {
                if ref_kind.kind == trigger_kind.kind && ref_kind.group == trigger_kind.group {
                    if let Some(name) = dynamic::resolve_string_path(instance, name_path) {
                        if name == trigger_name {
                            referencing.insert(instance_key.clone(), instance.clone());
                        }
                    }
                }
            }

            // Child side: does the trigger reference the instance?
            let (name_paths, _) = registry.reference_paths(&trigger_kind);
            for (ref_kind, name_path) in &name_paths {
                if ref_kind.kind == instance_kind.kind && ref_kind.group == instance_kind.group {
                    if let Some(name) = dynamic::resolve_string_path(trigger, name_path) {
                        if name == dynamic::name_of(instance) {
                            referenced.insert(instance_key.clone(), instance.clone());
                        }
                    }
                }
            }
        }
    }

    RelatedObjects {
        referenced: referenced.into_values().collect(),
        referencing: referencing.into_values().collect(),
    }
}
