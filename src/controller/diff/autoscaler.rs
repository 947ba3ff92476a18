// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Autoscalers compare on replica bounds and a normalized metric list.

use kube::api::DynamicObject;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

use super::{as_f64, as_i64, get_string, stringify};

pub(super) fn diff(existing: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
    Ok(details(existing)? != details(desired)?)
}

fn details(obj: &DynamicObject) -> Result<Value> {
    let spec = obj
        .data
        .get("spec")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::MalformedDocument {
            kind: "HorizontalPodAutoscaler".to_string(),
            reason: "spec is not a dictionary".to_string(),
        })?;
    Ok(json!({
        "minReplicas": spec.get("minReplicas").map(as_i64).unwrap_or(0),
        "maxReplicas": spec.get("maxReplicas").map(as_i64).unwrap_or(0),
        "metrics": normalized_metrics(spec),
    }))
}

/// Copies only the `type` plus the type-specific subtree for each metric,
/// normalizing `averageUtilization` to an integer and `averageValue` to a
/// string, then sorts by `(type, name)` for a stable comparison.
fn normalized_metrics(spec: &Map<String, Value>) -> Vec<Value> {
    let Some(metrics) = spec.get("metrics").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut extracted: Vec<Value> = metrics
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|metric| {
            let metric_type = metric.get("type").and_then(Value::as_str)?;
            let mut normalized = Map::new();
            normalized.insert("type".into(), Value::String(metric_type.to_string()));
            match metric_type {
                "Pods" => {
                    let pods = metric.get("pods").and_then(Value::as_object);
                    let name = pods
                        .and_then(|p| p.get("metric"))
                        .and_then(Value::as_object)
                        .map(|m| get_string(m, "name"))
                        .unwrap_or_default();
                    let target = pods
                        .and_then(|p| p.get("target"))
                        .and_then(Value::as_object);
                    let mut target_map = Map::new();
                    if let Some(target) = target {
                        target_map
                            .insert("type".into(), Value::String(get_string(target, "type")));
                        if let Some(average) = target.get("averageValue") {
                            target_map.insert(
                                "averageValue".into(),
                                Value::String(as_f64(average).to_string()),
                            );
                        }
                    }
                    normalized.insert(
                        "pods".into(),
                        json!({"metric": {"name": name}, "target": target_map}),
                    );
                }
                "Resource" => {
                    let resource = metric.get("resource").and_then(Value::as_object);
                    let name = resource.map(|r| get_string(r, "name")).unwrap_or_default();
                    let target = resource
                        .and_then(|r| r.get("target"))
                        .and_then(Value::as_object);
                    let mut target_map = Map::new();
                    if let Some(target) = target {
                        target_map
                            .insert("type".into(), Value::String(get_string(target, "type")));
                        if let Some(utilization) = target.get("averageUtilization") {
                            target_map.insert(
                                "averageUtilization".into(),
                                Value::from(as_i64(utilization)),
                            );
                        }
                    }
                    normalized.insert(
                        "resource".into(),
                        json!({"name": name, "target": target_map}),
                    );
                }
                _ => {}
            }
            Some(Value::Object(normalized))
        })
        .collect();

    extracted.sort_by(|a, b| {
        let type_a = stringify(&a["type"]);
        let type_b = stringify(&b["type"]);
        type_a
            .cmp(&type_b)
            .then_with(|| metric_name(a).cmp(&metric_name(b)))
    });
    extracted
}

fn metric_name(metric: &Value) -> String {
    match metric["type"].as_str() {
        Some("Pods") => stringify(&metric["pods"]["metric"]["name"]),
        Some("Resource") => stringify(&metric["resource"]["name"]),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hpa(spec: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "autoscaling/v2",
            "kind": "HorizontalPodAutoscaler",
            "metadata": {"name": "hpa", "namespace": "default"},
            "spec": spec
        }))
        .unwrap()
    }

    #[test]
    fn utilization_type_differences_are_normalized() {
        let observed = hpa(json!({
            "minReplicas": 1,
            "maxReplicas": 5,
            "metrics": [{
                "type": "Resource",
                "resource": {"name": "cpu", "target": {"type": "Utilization", "averageUtilization": 60}}
            }]
        }));
        let desired = hpa(json!({
            "minReplicas": 1,
            "maxReplicas": 5,
            "metrics": [{
                "type": "Resource",
                "resource": {"name": "cpu", "target": {"type": "Utilization", "averageUtilization": "60"}}
            }]
        }));
        assert!(!diff(&observed, &desired).unwrap());
    }

    #[test]
    fn metric_order_is_stable() {
        let observed = hpa(json!({
            "minReplicas": 1,
            "maxReplicas": 5,
            "metrics": [
                {"type": "Resource", "resource": {"name": "cpu", "target": {"type": "Utilization"}}},
                {"type": "Pods", "pods": {"metric": {"name": "queue"}, "target": {"type": "AverageValue", "averageValue": 100}}}
            ]
        }));
        let desired = hpa(json!({
            "minReplicas": 1,
            "maxReplicas": 5,
            "metrics": [
                {"type": "Pods", "pods": {"metric": {"name": "queue"}, "target": {"type": "AverageValue", "averageValue": "100"}}},
                {"type": "Resource", "resource": {"name": "cpu", "target": {"type": "Utilization"}}}
            ]
        }));
        assert!(!diff(&observed, &desired).unwrap());
    }

    #[test]
    fn replica_bound_changes_are_a_diff() {
        let observed = hpa(json!({"minReplicas": 1, "maxReplicas": 5}));
        let desired = hpa(json!({"minReplicas": 2, "maxReplicas": 5}));
        assert!(diff(&observed, &desired).unwrap());
    }
}
