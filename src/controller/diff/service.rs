// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Services compare on `type`, `selector` and a cleaned port list.
//! Server-assigned fields (`clusterIP`, `nodePort`, traffic policies) are
//! ignored.

use kube::api::DynamicObject;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

use super::{normalize_numbers, stringify};

pub(super) fn diff(existing: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
    let existing_spec = spec_of(existing)?;
    let desired_spec = spec_of(desired)?;

    let cleaned_existing = clean_service_spec(&normalize_numbers(&Value::Object(existing_spec)));
    let cleaned_desired = clean_service_spec(&normalize_numbers(&Value::Object(desired_spec)));

    if cleaned_existing != cleaned_desired {
        debug!(kind = "Service", "found a difference in the service spec");
        return Ok(true);
    }
    Ok(false)
}

fn spec_of(obj: &DynamicObject) -> Result<Map<String, Value>> {
    obj.data
        .get("spec")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| Error::MalformedDocument {
            kind: "Service".to_string(),
            reason: "spec is not a dictionary".to_string(),
        })
}

fn clean_service_spec(spec: &Value) -> Value {
    let Some(spec) = spec.as_object() else {
        return Value::Null;
    };
    let mut cleaned = Map::new();
    if let Some(service_type) = spec.get("type") {
        cleaned.insert("type".into(), service_type.clone());
    }
    if let Some(selector) = spec.get("selector") {
        cleaned.insert("selector".into(), selector.clone());
    }
    cleaned.insert("ports".into(), cleaned_ports(spec));
    Value::Object(cleaned)
}

/// Only the fields templates control survive; `nodePort` and friends drop.
fn cleaned_ports(spec: &Map<String, Value>) -> Value {
    let Some(ports) = spec.get("ports").and_then(Value::as_array) else {
        return Value::Null;
    };
    let mut cleaned: Vec<Value> = ports
        .iter()
        .filter_map(Value::as_object)
        .map(|port| {
            let mut entry = Map::new();
            for key in ["name", "protocol", "port", "targetPort"] {
                if let Some(value) = port.get(key) {
                    entry.insert(key.to_string(), value.clone());
                }
            }
            Value::Object(entry)
        })
        .collect();
    cleaned.sort_by(|a, b| {
        stringify(a.get("name").unwrap_or(&Value::Null))
            .cmp(&stringify(b.get("name").unwrap_or(&Value::Null)))
    });
    Value::Array(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service(spec: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc", "namespace": "default"},
            "spec": spec
        }))
        .unwrap()
    }

    #[test]
    fn server_assigned_fields_are_ignored() {
        let observed = service(json!({
            "clusterIP": "10.0.0.123",
            "internalTrafficPolicy": "Cluster",
            "ports": [{"port": 80, "nodePort": 31234, "targetPort": 8080, "protocol": "TCP"}],
            "selector": {"app": "web"},
            "type": "ClusterIP"
        }));
        let desired = service(json!({
            "ports": [{"port": 80, "targetPort": 8080, "protocol": "TCP"}],
            "selector": {"app": "web"},
            "type": "ClusterIP"
        }));
        assert!(!diff(&observed, &desired).unwrap());
    }

    #[test]
    fn port_number_changes_are_a_diff() {
        let observed = service(json!({"ports": [{"port": 80}]}));
        let desired = service(json!({"ports": [{"port": 8080}]}));
        assert!(diff(&observed, &desired).unwrap());
    }

    #[test]
    fn port_order_is_stable_by_name() {
        let observed = service(json!({
            "ports": [
                {"name": "metrics", "port": 9090},
                {"name": "http", "port": 80}
            ]
        }));
        let desired = service(json!({
            "ports": [
                {"name": "http", "port": 80},
                {"name": "metrics", "port": 9090}
            ]
        }));
        assert!(!diff(&observed, &desired).unwrap());
    }

    #[test]
    fn non_map_spec_is_an_error() {
        let broken: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc"},
            "spec": 3
        }))
        .unwrap();
        let ok = service(json!({"ports": []}));
        assert!(diff(&broken, &ok).is_err());
    }
}
