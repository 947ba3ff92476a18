// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Jobs compare on the pod template's service account and a simplified view
//! of its containers. A job without the expected nesting compares as empty
//! rather than failing: immutable server-side fields make a stricter check
//! useless here.

use kube::api::DynamicObject;
use serde_json::{json, Map, Value};

use crate::dynamic;
use crate::error::Result;

use super::{get_string, get_string_list, slice_of_maps, stringify, canonicalize_quantity};

pub(super) fn diff(existing: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
    Ok(details(existing) != details(desired))
}

fn details(obj: &DynamicObject) -> Value {
    let Some(pod_spec) = dynamic::nested_map(&obj.data, &["spec", "template", "spec"]) else {
        return json!({"serviceAccountName": "", "initContainers": [], "containers": []});
    };

    let init_containers: Vec<Value> = slice_of_maps(pod_spec, "initContainers")
        .into_iter()
        .map(simplified_container)
        .collect();

    let mut containers: Vec<Value> = slice_of_maps(pod_spec, "containers")
        .into_iter()
        .map(simplified_container)
        .collect();
    containers.sort_by(|a, b| stringify(&a["name"]).cmp(&stringify(&b["name"])));

    json!({
        "serviceAccountName": get_string(pod_spec, "serviceAccountName"),
        "initContainers": init_containers,
        "containers": containers,
    })
}

fn simplified_container(container: &Map<String, Value>) -> Value {
    let mut env: Vec<Value> = slice_of_maps(container, "env")
        .into_iter()
        .map(|entry| {
            json!({
                "name": get_string(entry, "name"),
                "value": get_string(entry, "value"),
            })
        })
        .collect();
    env.sort_by(|a, b| stringify(&a["name"]).cmp(&stringify(&b["name"])));

    let mut mounts: Vec<Value> = slice_of_maps(container, "volumeMounts")
        .into_iter()
        .map(|mount| {
            json!({
                "name": get_string(mount, "name"),
                "mountPath": get_string(mount, "mountPath"),
                "readOnly": mount.get("readOnly").and_then(Value::as_bool).unwrap_or(false),
            })
        })
        .collect();
    mounts.sort_by(|a, b| stringify(&a["name"]).cmp(&stringify(&b["name"])));

    let mut limits = Map::new();
    let mut requests = Map::new();
    if let Some(resources) = container.get("resources").and_then(Value::as_object) {
        for (target, cleaned) in [("limits", &mut limits), ("requests", &mut requests)] {
            if let Some(values) = resources.get(target).and_then(Value::as_object) {
                for (resource_name, quantity) in values {
                    cleaned.insert(
                        resource_name.clone(),
                        canonicalize_quantity(resource_name, quantity),
                    );
                }
            }
        }
    }

    json!({
        "name": get_string(container, "name"),
        "args": get_string_list(container, "args"),
        "env": env,
        "volumeMounts": mounts,
        "resources": {"limits": limits, "requests": requests},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(pod_spec: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "sync", "namespace": "default"},
            "spec": {"template": {"spec": pod_spec}}
        }))
        .unwrap()
    }

    #[test]
    fn identical_jobs_have_no_diff() {
        let spec = json!({
            "serviceAccountName": "runner",
            "containers": [{"name": "sync", "args": ["--from=gs://b/p"]}]
        });
        assert!(!diff(&job(spec.clone()), &job(spec)).unwrap());
    }

    #[test]
    fn service_account_change_is_a_diff() {
        let a = job(json!({"serviceAccountName": "runner", "containers": []}));
        let b = job(json!({"serviceAccountName": "other", "containers": []}));
        assert!(diff(&a, &b).unwrap());
    }

    #[test]
    fn container_order_does_not_matter() {
        let a = job(json!({
            "containers": [{"name": "b"}, {"name": "a"}]
        }));
        let b = job(json!({
            "containers": [{"name": "a"}, {"name": "b"}]
        }));
        assert!(!diff(&a, &b).unwrap());
    }

    #[test]
    fn a_job_without_pod_spec_compares_as_empty() {
        let bare: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "sync"},
        }))
        .unwrap();
        let empty = job(json!({"containers": []}));
        assert!(!diff(&bare, &empty).unwrap());
    }
}
