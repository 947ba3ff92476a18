// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Monitors compare on endpoints, the label selector and target labels, with
//! numeric endpoint fields stringified so the serialization form does not
//! matter.

use kube::api::DynamicObject;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

use super::stringify;

pub(super) fn diff(existing: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
    Ok(details(existing)? != details(desired)?)
}

fn details(obj: &DynamicObject) -> Result<Value> {
    let spec = obj
        .data
        .get("spec")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::MalformedDocument {
            kind: "PodMonitoring".to_string(),
            reason: "spec is not a dictionary".to_string(),
        })?;
    Ok(json!({
        "endpoints": endpoints(spec),
        "selector": match_labels(spec),
        "targetLabels": target_labels(spec),
    }))
}

fn endpoints(spec: &Map<String, Value>) -> Value {
    let Some(endpoints) = spec.get("endpoints").and_then(Value::as_array) else {
        return Value::Null;
    };
    Value::Array(
        endpoints
            .iter()
            .filter_map(Value::as_object)
            .map(|endpoint| {
                let mut normalized = Map::new();
                for (key, value) in endpoint {
                    match key.as_str() {
                        "port" | "interval" | "path" => {
                            normalized.insert(key.clone(), Value::String(stringify(value)));
                        }
                        _ => {
                            normalized.insert(key.clone(), value.clone());
                        }
                    }
                }
                Value::Object(normalized)
            })
            .collect(),
    )
}

fn match_labels(spec: &Map<String, Value>) -> Value {
    let labels = spec
        .get("selector")
        .and_then(Value::as_object)
        .and_then(|selector| selector.get("matchLabels"))
        .and_then(Value::as_object);
    match labels {
        Some(labels) => Value::Object(
            labels
                .iter()
                .filter(|(_, v)| v.is_string())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => Value::Null,
    }
}

fn target_labels(spec: &Map<String, Value>) -> Value {
    let metadata = spec
        .get("targetLabels")
        .and_then(Value::as_object)
        .and_then(|labels| labels.get("metadata"))
        .and_then(Value::as_array);
    match metadata {
        Some(metadata) => {
            let mut labels: Vec<String> = metadata
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            labels.sort();
            json!({"metadata": labels})
        }
        None => Value::Null,
    }
}
