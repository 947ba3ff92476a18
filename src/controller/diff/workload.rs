// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Deployment-shaped workloads compare on a cleaned pod spec: only the
//! fields templates control, with quantities and orderings canonicalized.

use kube::api::DynamicObject;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::dynamic;
use crate::error::{Error, Result};

use super::{as_i64, get_string, get_string_list, slice_of_maps, stringify, canonicalize_quantity};

const TOLERATION_KEY_PREFIX: &str = "sandbox.gke.io/";

pub(super) fn diff(existing: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
    let existing_spec = pod_spec(existing)?;
    let desired_spec = pod_spec(desired)?;
    if existing_spec != desired_spec {
        debug!(kind = "Deployment", "found a difference in the pod spec");
        return Ok(true);
    }
    Ok(false)
}

fn pod_spec(obj: &DynamicObject) -> Result<Value> {
    let pod_spec = dynamic::nested_map(&obj.data, &["spec", "template", "spec"]).ok_or_else(|| {
        Error::MalformedDocument {
            kind: "Deployment".to_string(),
            reason: "missing spec.template.spec".to_string(),
        }
    })?;
    Ok(clean_pod_spec(pod_spec))
}

fn clean_pod_spec(pod_spec: &Map<String, Value>) -> Value {
    let mut containers: Vec<Value> = slice_of_maps(pod_spec, "containers")
        .into_iter()
        .map(clean_container)
        .collect();
    containers.sort_by(|a, b| stringify(&a["name"]).cmp(&stringify(&b["name"])));

    let init_containers: Vec<Value> = slice_of_maps(pod_spec, "initContainers")
        .into_iter()
        .map(clean_container)
        .collect();

    let mut volumes: Vec<Value> = slice_of_maps(pod_spec, "volumes")
        .into_iter()
        .map(clean_volume)
        .collect();
    volumes.sort_by(|a, b| stringify(&a["name"]).cmp(&stringify(&b["name"])));

    json!({
        "serviceAccountName": get_string(pod_spec, "serviceAccountName"),
        "volumes": volumes,
        "containers": containers,
        "initContainers": init_containers,
        "restartPolicy": get_string(pod_spec, "restartPolicy"),
        "tolerations": clean_tolerations(pod_spec),
        "securityContext": clean_security_context(pod_spec),
        "runtimeClassName": get_string(pod_spec, "runtimeClassName"),
        "nodeSelector": pod_spec.get("nodeSelector").cloned().unwrap_or(Value::Null),
    })
}

fn clean_container(container: &Map<String, Value>) -> Value {
    json!({
        "name": get_string(container, "name"),
        "image": get_string(container, "image"),
        "command": get_string_list(container, "command"),
        "args": get_string_list(container, "args"),
        "env": clean_env(container),
        "volumeMounts": clean_volume_mounts(container),
        "ports": clean_ports(container),
        "resources": clean_resources(container),
        "readinessProbe": clean_probe(container.get("readinessProbe")),
    })
}

/// Environment entries sorted by name; only `secretKeyRef`/`configMapKeyRef`
/// sources are preserved under `valueFrom`.
fn clean_env(container: &Map<String, Value>) -> Vec<Value> {
    let mut env: Vec<Value> = slice_of_maps(container, "env")
        .into_iter()
        .map(|entry| {
            let mut cleaned = Map::new();
            cleaned.insert("name".into(), Value::String(get_string(entry, "name")));
            cleaned.insert("value".into(), Value::String(get_string(entry, "value")));
            if let Some(value_from) = entry.get("valueFrom").and_then(Value::as_object) {
                let mut sources = Map::new();
                for source_key in ["secretKeyRef", "configMapKeyRef"] {
                    if let Some(source) = value_from.get(source_key).and_then(Value::as_object) {
                        sources.insert(
                            source_key.into(),
                            json!({
                                "name": get_string(source, "name"),
                                "key": get_string(source, "key"),
                            }),
                        );
                    }
                }
                cleaned.insert("valueFrom".into(), Value::Object(sources));
            }
            Value::Object(cleaned)
        })
        .collect();
    env.sort_by(|a, b| stringify(&a["name"]).cmp(&stringify(&b["name"])));
    env
}

fn clean_volume_mounts(container: &Map<String, Value>) -> Vec<Value> {
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
    mounts.sort_by(|a, b| {
        stringify(&a["name"])
            .cmp(&stringify(&b["name"]))
            .then(stringify(&a["mountPath"]).cmp(&stringify(&b["mountPath"])))
    });
    mounts
}

/// Ports sorted by container port, protocol defaulted to TCP the way the
/// server defaults it.
fn clean_ports(container: &Map<String, Value>) -> Vec<Value> {
    let mut ports: Vec<Value> = slice_of_maps(container, "ports")
        .into_iter()
        .map(|port| {
            let protocol = {
                let p = get_string(port, "protocol");
                if p.is_empty() {
                    "TCP".to_string()
                } else {
                    p
                }
            };
            json!({
                "name": get_string(port, "name"),
                "protocol": protocol,
                "containerPort": port.get("containerPort").map(as_i64).unwrap_or(0),
            })
        })
        .collect();
    ports.sort_by_key(|port| port["containerPort"].as_i64().unwrap_or(0));
    ports
}

fn clean_resources(container: &Map<String, Value>) -> Value {
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
    json!({"limits": limits, "requests": requests})
}

fn clean_probe(probe: Option<&Value>) -> Value {
    let Some(probe) = probe.and_then(Value::as_object) else {
        return Value::Null;
    };
    let mut cleaned = Map::new();
    cleaned.insert(
        "initialDelaySeconds".into(),
        Value::from(probe.get("initialDelaySeconds").map(as_i64).unwrap_or(0)),
    );
    cleaned.insert(
        "periodSeconds".into(),
        Value::from(probe.get("periodSeconds").map(as_i64).unwrap_or(0)),
    );
    if let Some(http_get) = probe.get("httpGet").and_then(Value::as_object) {
        cleaned.insert(
            "httpGet".into(),
            json!({
                "path": get_string(http_get, "path"),
                "port": http_get.get("port").map(stringify).unwrap_or_default(),
            }),
        );
    }
    Value::Object(cleaned)
}

/// Only tolerations under the sandbox prefix are user-controlled; the rest
/// are server-injected and ignored.
fn clean_tolerations(pod_spec: &Map<String, Value>) -> Vec<Value> {
    let mut tolerations: Vec<Value> = slice_of_maps(pod_spec, "tolerations")
        .into_iter()
        .filter(|toleration| get_string(toleration, "key").starts_with(TOLERATION_KEY_PREFIX))
        .map(|toleration| {
            let mut cleaned = Map::new();
            cleaned.insert("key".into(), Value::String(get_string(toleration, "key")));
            cleaned.insert(
                "operator".into(),
                Value::String(get_string(toleration, "operator")),
            );
            cleaned.insert("value".into(), Value::String(get_string(toleration, "value")));
            cleaned.insert(
                "effect".into(),
                Value::String(get_string(toleration, "effect")),
            );
            if let Some(seconds) = toleration.get("tolerationSeconds").and_then(Value::as_i64) {
                cleaned.insert("tolerationSeconds".into(), Value::from(seconds));
            }
            Value::Object(cleaned)
        })
        .collect();
    tolerations.sort_by(|a, b| stringify(&a["key"]).cmp(&stringify(&b["key"])));
    tolerations
}

fn clean_security_context(pod_spec: &Map<String, Value>) -> Value {
    let Some(psc) = pod_spec.get("securityContext").and_then(Value::as_object) else {
        return Value::Null;
    };
    let mut cleaned = Map::new();
    if let Some(run_as_non_root) = psc.get("runAsNonRoot").and_then(Value::as_bool) {
        cleaned.insert("runAsNonRoot".into(), Value::Bool(run_as_non_root));
    }
    if let Some(seccomp) = psc.get("seccompProfile").and_then(Value::as_object) {
        cleaned.insert(
            "seccompProfile".into(),
            json!({"type": get_string(seccomp, "type")}),
        );
    }
    Value::Object(cleaned)
}

fn clean_volume(volume: &Map<String, Value>) -> Value {
    let mut cleaned = Map::new();
    cleaned.insert("name".into(), Value::String(get_string(volume, "name")));
    if let Some(empty_dir) = volume.get("emptyDir") {
        let medium = empty_dir
            .as_object()
            .map(|m| get_string(m, "medium"))
            .unwrap_or_default();
        cleaned.insert("emptyDir".into(), json!({"medium": medium}));
    } else if let Some(secret) = volume.get("secret").and_then(Value::as_object) {
        cleaned.insert(
            "secret".into(),
            json!({
                "secretName": get_string(secret, "secretName"),
                "optional": secret.get("optional").and_then(Value::as_bool),
            }),
        );
    } else if let Some(config_map) = volume.get("configMap").and_then(Value::as_object) {
        cleaned.insert(
            "configMap".into(),
            json!({
                "name": get_string(config_map, "name"),
                "optional": config_map.get("optional").and_then(Value::as_bool),
            }),
        );
    } else if let Some(csi) = volume.get("csi").and_then(Value::as_object) {
        let attributes: Map<String, Value> = csi
            .get("volumeAttributes")
            .and_then(Value::as_object)
            .map(|attrs| {
                attrs
                    .iter()
                    .filter(|(_, v)| v.is_string())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        cleaned.insert(
            "csi".into(),
            json!({
                "driver": get_string(csi, "driver"),
                "readOnly": csi.get("readOnly").and_then(Value::as_bool),
                "volumeAttributes": attributes,
            }),
        );
    }
    Value::Object(cleaned)
}
