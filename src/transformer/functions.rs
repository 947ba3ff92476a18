// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Pure helper functions exposed to the template engine. These are the only
//! functions templates can call besides `resolveModelData`, which is
//! registered per pipeline run because it reads the cluster.

use std::sync::OnceLock;

use handlebars::{
    handlebars_helper, Context, Handlebars, Helper, HelperDef, RenderContext, RenderError,
    RenderErrorReason, ScopedJson,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};

fn blob_uri_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*gs://(?P<bucket>[^/]+)/(?P<path>[^\s]+)\s*$")
            .expect("blob uri regex is valid")
    })
}

pub fn encode_base64(input: &str) -> String {
    BASE64_STANDARD.encode(input)
}

/// Finds the first entry of `args` with prefix `key=` and returns the
/// trimmed tail. Missing key or empty tail yield an empty string so template
/// fallback chains keep working.
pub fn extract_value_after_equals(args: &[Value], key: &str) -> String {
    let key_with_equals = format!("{key}=");
    for arg in args {
        let rendered = match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if let Some(tail) = rendered.strip_prefix(&key_with_equals) {
            return tail.trim().to_string();
        }
    }
    String::new()
}

pub fn extract_string_after_slash(input: &str) -> &str {
    match input.rfind('/') {
        Some(idx) => &input[idx + 1..],
        None => input,
    }
}

/// Directory part of the value of a `--flag=/some/path/file` argument;
/// falls back to `/config` when the flag has no value.
pub fn dirname_from_flag(flag: &str) -> String {
    match flag.split_once('=') {
        Some((_, value)) => match value.rsplit_once('/') {
            Some(("", _)) => "/".to_string(),
            Some((dir, _)) => dir.to_string(),
            None => ".".to_string(),
        },
        None => "/config".to_string(),
    }
}

fn parse_blob_uri(uri: &str) -> Result<Option<(String, String)>> {
    let trimmed = uri.trim();
    if trimmed.is_empty() || !trimmed.starts_with("gs://") {
        return Ok(None);
    }
    let captures = blob_uri_regex()
        .captures(trimmed)
        .ok_or_else(|| Error::MalformedBlobUri(uri.to_string()))?;
    Ok(Some((
        captures["bucket"].to_string(),
        captures["path"].to_string(),
    )))
}

pub fn blob_bucket_from_uri(uri: &str) -> Result<String> {
    Ok(parse_blob_uri(uri)?
        .map(|(bucket, _)| bucket)
        .unwrap_or_default())
}

pub fn blob_path_from_uri(uri: &str) -> Result<String> {
    Ok(parse_blob_uri(uri)?
        .map(|(_, path)| path.trim_end_matches('/').to_string())
        .unwrap_or_default())
}

const PERFORMANCE_KEY: &str = "outputTokensPerSecond";

/// Picks the option dictionary with the smallest advertised throughput among
/// `nvidia-` accelerators; null when none qualify.
pub fn min_performance_accelerator(options: &Value) -> Value {
    let Some(list) = options.as_array() else {
        return Value::Null;
    };
    let mut best: Option<(&Value, f64)> = None;
    for option in list {
        let Some(accelerator) = option.get("acceleratorType").and_then(Value::as_str) else {
            continue;
        };
        if !accelerator.starts_with("nvidia-") {
            continue;
        }
        let Some(performance) = option
            .get("performanceStats")
            .and_then(|stats| stats.get(PERFORMANCE_KEY))
            .and_then(Value::as_f64)
        else {
            continue;
        };
        if best.map(|(_, min)| performance < min).unwrap_or(true) {
            best = Some((option, performance));
        }
    }
    best.map(|(option, _)| option.clone()).unwrap_or(Value::Null)
}

/// Query-encodes a model name, with `+` replaced by `%20` so the result is
/// path-safe.
pub fn url_encode_model_name(input: &str) -> Result<String> {
    if input.trim().is_empty() {
        return Err(Error::EmptyModelName);
    }
    let encoded: String = url::form_urlencoded::byte_serialize(input.as_bytes()).collect();
    Ok(encoded.replace('+', "%20"))
}

/// Looks up `resources["kind/name"]` and asserts it is a dictionary.
pub fn find_resource<'a>(resources: &'a Value, kind: &str, name: &str) -> Result<&'a Value> {
    let key = format!("{kind}/{name}");
    let resource = resources
        .get(&key)
        .ok_or_else(|| Error::ResourceNotInMap(key.clone()))?;
    if !resource.is_object() {
        return Err(Error::ResourceNotDictionary(key));
    }
    Ok(resource)
}

fn render_error(err: Error) -> RenderError {
    RenderErrorReason::Other(err.to_string()).into()
}

fn string_param(h: &Helper<'_>, index: usize) -> String {
    h.param(index)
        .map(|p| match p.value() {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}

handlebars_helper!(EncodeBase64Helper: |s: String| encode_base64(&s));

handlebars_helper!(ExtractValueAfterEqualsHelper: |args: Json, key: String| {
    let list = args.as_array().cloned().unwrap_or_default();
    extract_value_after_equals(&list, &key)
});

handlebars_helper!(ExtractStringAfterSlashHelper: |s: String| {
    extract_string_after_slash(&s).to_string()
});

handlebars_helper!(DirnameFromFlagHelper: |flag: String| dirname_from_flag(&flag));

handlebars_helper!(MinPerformanceAcceleratorHelper: |options: Json| {
    min_performance_accelerator(options)
});

handlebars_helper!(LowerHelper: |s: String| s.to_lowercase());

handlebars_helper!(JoinHelper: |items: Json, sep: String| {
    items
        .as_array()
        .map(|list| {
            list.iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(&sep)
        })
        .unwrap_or_default()
});

struct BlobBucketHelper;

impl HelperDef for BlobBucketHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> std::result::Result<ScopedJson<'rc>, RenderError> {
        let bucket = blob_bucket_from_uri(&string_param(h, 0)).map_err(render_error)?;
        Ok(ScopedJson::Derived(Value::String(bucket)))
    }
}

struct BlobPathHelper;

impl HelperDef for BlobPathHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> std::result::Result<ScopedJson<'rc>, RenderError> {
        let path = blob_path_from_uri(&string_param(h, 0)).map_err(render_error)?;
        Ok(ScopedJson::Derived(Value::String(path)))
    }
}

struct UrlEncodeModelNameHelper;

impl HelperDef for UrlEncodeModelNameHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> std::result::Result<ScopedJson<'rc>, RenderError> {
        let encoded = url_encode_model_name(&string_param(h, 0)).map_err(render_error)?;
        Ok(ScopedJson::Derived(Value::String(encoded)))
    }
}

struct FindResourceHelper;

impl HelperDef for FindResourceHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> std::result::Result<ScopedJson<'rc>, RenderError> {
        let empty = Value::Null;
        let resources = h.param(0).map(|p| p.value()).unwrap_or(&empty);
        let kind = string_param(h, 1);
        let name = string_param(h, 2);
        let resource = find_resource(resources, &kind, &name).map_err(render_error)?;
        Ok(ScopedJson::Derived(resource.clone()))
    }
}

// First non-empty argument, for `(default a b "fallback")` pipelines.
struct DefaultHelper;

impl HelperDef for DefaultHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> std::result::Result<ScopedJson<'rc>, RenderError> {
        for param in h.params() {
            let value = param.value();
            let empty = match value {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                _ => false,
            };
            if !empty {
                return Ok(ScopedJson::Derived(value.clone()));
            }
        }
        Ok(ScopedJson::Derived(Value::Null))
    }
}

/// A render engine with the full function library registered and HTML
/// escaping disabled (output is YAML, not markup).
pub fn engine() -> Handlebars<'static> {
    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars.register_helper("encodeBase64", Box::new(EncodeBase64Helper));
    handlebars.register_helper(
        "extractValueAfterEquals",
        Box::new(ExtractValueAfterEqualsHelper),
    );
    handlebars.register_helper(
        "extractStringAfterSlash",
        Box::new(ExtractStringAfterSlashHelper),
    );
    handlebars.register_helper("dirnameFromFlag", Box::new(DirnameFromFlagHelper));
    handlebars.register_helper("blobBucketFromURI", Box::new(BlobBucketHelper));
    handlebars.register_helper("blobPathFromURI", Box::new(BlobPathHelper));
    handlebars.register_helper(
        "minPerformanceAccelerator",
        Box::new(MinPerformanceAcceleratorHelper),
    );
    handlebars.register_helper("urlEncodeModelName", Box::new(UrlEncodeModelNameHelper));
    handlebars.register_helper("findResource", Box::new(FindResourceHelper));
    handlebars.register_helper("lower", Box::new(LowerHelper));
    handlebars.register_helper("join", Box::new(JoinHelper));
    handlebars.register_helper("default", Box::new(DefaultHelper));
    handlebars
}
