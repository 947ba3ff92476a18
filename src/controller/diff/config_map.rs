// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Config blobs compare on their string data; non-string values drop out.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use serde_json::Value;

use crate::error::Result;

pub(super) fn diff(existing: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
    Ok(string_data(existing) != string_data(desired))
}

fn string_data(obj: &DynamicObject) -> Option<BTreeMap<String, String>> {
    let data = obj.data.get("data")?.as_object()?;
    Some(
        data.iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
    )
}
