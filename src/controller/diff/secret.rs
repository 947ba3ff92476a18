// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Secrets compare on the decoded token value; any malformed or missing data
//! normalizes to an empty string.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use kube::api::DynamicObject;
use serde_json::Value;

use crate::error::Result;

const TOKEN_KEY: &str = "hf_token";

pub(super) fn diff(existing: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
    Ok(decoded_token(existing) != decoded_token(desired))
}

fn decoded_token(obj: &DynamicObject) -> String {
    let Some(encoded) = obj
        .data
        .get("data")
        .and_then(Value::as_object)
        .and_then(|data| data.get(TOKEN_KEY))
        .and_then(Value::as_str)
    else {
        return String::new();
    };
    BASE64_STANDARD
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secret(data: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "hf", "namespace": "default"},
            "data": data
        }))
        .unwrap()
    }

    #[test]
    fn equal_tokens_have_no_diff() {
        // Both sides decode to "token".
        let a = secret(json!({"hf_token": "dG9rZW4="}));
        let b = secret(json!({"hf_token": "dG9rZW4="}));
        assert!(!diff(&a, &b).unwrap());
    }

    #[test]
    fn changed_tokens_are_a_diff() {
        let a = secret(json!({"hf_token": "dG9rZW4="}));
        let b = secret(json!({"hf_token": "b3RoZXI="}));
        assert!(diff(&a, &b).unwrap());
    }

    #[test]
    fn malformed_base64_normalizes_to_empty() {
        let a = secret(json!({"hf_token": "%%%not-base64%%%"}));
        let b = secret(json!({}));
        assert!(!diff(&a, &b).unwrap());
    }
}
