// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Path navigation over dynamic documents. The core never assumes a concrete
//! schema; everything it reads or writes goes through these helpers.

use kube::api::DynamicObject;
use serde_json::{Map, Value};

use crate::api::KindRef;

/// The `(group, version, kind)` of a dynamic document, parsed from its
/// `apiVersion`/`kind` pair.
pub fn kind_ref_of(obj: &DynamicObject) -> KindRef {
    match &obj.types {
        Some(t) => {
            let (group, version) = match t.api_version.split_once('/') {
                Some((g, v)) => (g, v),
                None => ("", t.api_version.as_str()),
            };
            KindRef::new(group, version, &t.kind)
        }
        None => KindRef::new("", "", ""),
    }
}

pub fn name_of(obj: &DynamicObject) -> String {
    obj.metadata.name.clone().unwrap_or_default()
}

pub fn namespace_of(obj: &DynamicObject) -> String {
    obj.metadata.namespace.clone().unwrap_or_default()
}

pub fn uid_of(obj: &DynamicObject) -> String {
    obj.metadata.uid.clone().unwrap_or_default()
}

/// Graph/cache key: `namespace/name/group/version/kind`.
pub fn object_key(obj: &DynamicObject) -> String {
    key_for(&namespace_of(obj), &name_of(obj), &kind_ref_of(obj))
}

pub fn key_for(namespace: &str, name: &str, kind: &KindRef) -> String {
    format!("{namespace}/{name}/{kind}")
}

/// The complete document as a JSON value, `apiVersion`/`kind`/`metadata`
/// included. Used as template data and for path resolution.
pub fn full_value(obj: &DynamicObject) -> Value {
    serde_json::to_value(obj).unwrap_or(Value::Null)
}

/// Walks a dot-separated path into a value.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Resolves a dot-separated path on an object to a string. Non-string leaves
/// resolve to `None`, like a typed nested-string read.
pub fn resolve_string_path(obj: &DynamicObject, path: &str) -> Option<String> {
    let doc = full_value(obj);
    lookup(&doc, path)?.as_str().map(str::to_string)
}

pub fn nested<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in keys {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

pub fn nested_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    nested(value, keys)?.as_str()
}

pub fn nested_map<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Map<String, Value>> {
    nested(value, keys)?.as_object()
}

pub fn nested_slice<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Vec<Value>> {
    nested(value, keys)?.as_array()
}

pub fn nested_i64(value: &Value, keys: &[&str]) -> Option<i64> {
    nested(value, keys)?.as_i64()
}

pub fn nested_bool(value: &Value, keys: &[&str]) -> Option<bool> {
    nested(value, keys)?.as_bool()
}

/// Sets a nested field, creating intermediate objects along the way.
/// Intermediate non-object values are replaced.
pub fn set_nested(value: &mut Value, keys: &[&str], new_value: Value) {
    if keys.is_empty() {
        *value = new_value;
        return;
    }
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    if let Value::Object(map) = value {
        let entry = map
            .entry(keys[0].to_string())
            .or_insert(Value::Object(Map::new()));
        set_nested(entry, &keys[1..], new_value);
    }
}
