// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Dependency ordering for the render pipeline. Objects are sorted so that
//! every referenced object is visited before the objects referencing it.

use std::collections::{BTreeMap, VecDeque};

use kube::api::DynamicObject;

use crate::dynamic;
use crate::error::{Error, Result};
use crate::transformer::registry::IntegrationRegistry;

const DEFAULT_NAMESPACE: &str = "default";

/// Kahn's algorithm over the reference edges declared by the registry,
/// reversed at the end so dependencies appear before dependents. A set the
/// sort cannot fully consume has a cycle.
pub fn topological_sort(
    registry: &IntegrationRegistry,
    objects: Vec<DynamicObject>,
) -> Result<Vec<DynamicObject>> {
    let mut in_degree: BTreeMap<String, usize> = BTreeMap::new();
    let mut adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut object_map: BTreeMap<String, DynamicObject> = BTreeMap::new();

    for obj in &objects {
        let key = dynamic::object_key(obj);
        in_degree.insert(key.clone(), 0);
        adjacency.insert(key.clone(), Vec::new());
        object_map.insert(key, obj.clone());
    }

    for obj in &objects {
        let key = dynamic::object_key(obj);
        for referenced_key in referenced_object_keys(registry, obj, &object_map)? {
            if let Some(degree) = in_degree.get_mut(&referenced_key) {
                *degree += 1;
            }
            if let Some(edges) = adjacency.get_mut(&key) {
                edges.push(referenced_key);
            }
        }
    }

    let mut sources: VecDeque<String> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(key, _)| key.clone())
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(objects.len());
    while let Some(source) = sources.pop_front() {
        sorted.push(source.clone());
        if let Some(edges) = adjacency.get(&source) {
            for dependent in edges {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        sources.push_back(dependent.clone());
                    }
                }
            }
        }
    }

    if sorted.len() != objects.len() {
        return Err(Error::CycleDetected);
    }

    sorted.reverse();
    Ok(sorted
        .into_iter()
        .filter_map(|key| object_map.remove(&key))
        .collect())
}

/// Keys of the objects in the set that `obj` references, resolved through
/// the registry's name and namespace paths. A registered name path that the
/// object does not carry is a hard error.
fn referenced_object_keys(
    registry: &IntegrationRegistry,
    obj: &DynamicObject,
    object_map: &BTreeMap<String, DynamicObject>,
) -> Result<Vec<String>> {
    let kind = dynamic::kind_ref_of(obj);
    let (name_paths, namespace_paths) = registry.reference_paths(&kind);

    // BTree order keeps edge insertion deterministic run-to-run.
    let ordered: BTreeMap<_, _> = name_paths.into_iter().collect();

    let mut referenced = Vec::new();
    for (ref_kind, name_path) in ordered {
        let name = dynamic::resolve_string_path(obj, &name_path)
            .ok_or_else(|| Error::MissingReferencePath(name_path.clone()))?;
        let namespace = namespace_paths
            .get(&ref_kind)
            .filter(|path| !path.is_empty())
            .and_then(|path| dynamic::resolve_string_path(obj, path))
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let key = dynamic::key_for(&namespace, &name, &ref_kind);
        if object_map.contains_key(&key) {
            referenced.push(key);
        }
    }
    Ok(referenced)
}
