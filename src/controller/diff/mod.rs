// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Semantic comparison per dependent kind. Each function canonicalizes the
//! observed and desired specs so server-assigned defaults never show up as
//! spurious differences.

mod autoscaler;
mod config_map;
mod job;
mod monitor;
mod secret;
mod service;
mod workload;

use kube::api::DynamicObject;
use serde_json::{Map, Value};

use crate::error::Result;

pub type DiffFn = fn(&DynamicObject, &DynamicObject) -> Result<bool>;

/// Selects the diff for a dependent kind. The table is fixed at compile
/// time; unknown kinds are reported to the caller, which records an event
/// and passes the object through unchanged.
pub fn for_kind(kind: &str) -> Option<DiffFn> {
    match kind {
        "Deployment" => Some(workload::diff),
        "Service" => Some(service::diff),
        "Secret" => Some(secret::diff),
        "ConfigMap" => Some(config_map::diff),
        "Job" => Some(job::diff),
        "HorizontalPodAutoscaler" => Some(autoscaler::diff),
        "PodMonitoring" => Some(monitor::diff),
        _ => None,
    }
}

// --- shared canonicalization helpers --------------------------------------

pub(crate) fn get_string(map: &Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// String list with whitespace trimmed and CRLF normalized, the way command
/// lines read back from the server compare against freshly rendered ones.
pub(crate) fn get_string_list(map: &Map<String, Value>, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.replace("\r\n", "\n").trim().to_string())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn slice_of_maps<'a>(
    map: &'a Map<String, Value>,
    key: &str,
) -> Vec<&'a Map<String, Value>> {
    map.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

/// Collapses whole-valued floats into integers so a desired `80` compares
/// equal to an observed `80` regardless of the parser that produced it.
pub(crate) fn normalize_numbers(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize_numbers(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(normalize_numbers).collect()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    Value::from(f as i64)
                } else {
                    value.clone()
                }
            } else {
                value.clone()
            }
        }
        other => other.clone(),
    }
}

pub(crate) fn as_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| quantity_value(s))
            .unwrap_or(0),
        _ => 0,
    }
}

pub(crate) fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .or_else(|| quantity_value(s).map(|v| v as f64))
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Stringification matching a `%v`-style print: strings pass through,
/// everything else renders through its JSON form.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// --- resource quantities --------------------------------------------------

/// Whole-unit value of a quantity, rounded up. `1Gi` is 1073741824; `1.5`
/// is 2.
pub(crate) fn quantity_value(raw: &str) -> Option<i64> {
    let (number, multiplier) = split_quantity(raw.trim())?;
    Some((number * multiplier).ceil() as i64)
}

/// Millis of a quantity, rounded up. `1` is 1000; `100m` is 100.
pub(crate) fn quantity_milli_value(raw: &str) -> Option<i64> {
    let (number, multiplier) = split_quantity(raw.trim())?;
    Some((number * multiplier * 1000.0).ceil() as i64)
}

fn split_quantity(raw: &str) -> Option<(f64, f64)> {
    if raw.is_empty() {
        return None;
    }
    let split_at = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-' && c != '+' && c != 'e' && c != 'E')
        .unwrap_or(raw.len());
    // An exponent's 'e' must not be mistaken for a suffix start; quantities
    // with suffixes never carry exponents in practice.
    let (digits, suffix) = raw.split_at(split_at);
    let number: f64 = digits.parse().ok()?;
    let multiplier = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        _ => return None,
    };
    Some((number, multiplier))
}

/// Canonical form for a resource quantity value: CPU in millicores, memory
/// and GPU counts in whole units (bytes), other resources as-is.
pub(crate) fn canonicalize_quantity(resource_name: &str, value: &Value) -> Value {
    match resource_name {
        "cpu" => {
            let milli = match value {
                Value::String(s) => quantity_milli_value(s).unwrap_or(0),
                Value::Number(n) => (n.as_f64().unwrap_or(0.0) * 1000.0).ceil() as i64,
                _ => 0,
            };
            Value::String(format!("{milli}m"))
        }
        "memory" | "nvidia.com/gpu" | "ephemeral-storage" | "storage" => {
            let whole = match value {
                Value::String(s) => quantity_value(s).unwrap_or(0),
                Value::Number(n) => n.as_f64().map(|f| f.ceil() as i64).unwrap_or(0),
                _ => 0,
            };
            Value::String(whole.to_string())
        }
        _ => Value::String(stringify(value)),
    }
}
