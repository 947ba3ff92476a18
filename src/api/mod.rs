// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! The Integration document: which kinds the operator manages and how their
//! dependent objects are rendered.

use std::fmt;

use kube::core::GroupVersionKind;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A `(group, version, kind)` tuple, hashable and ordered so it can key
/// registries, caches and graph nodes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct KindRef {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl KindRef {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        KindRef {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// The `apiVersion` form, `group/version` or bare `version` for core kinds.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn to_gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

impl fmt::Display for KindRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.kind)
    }
}

/// Navigation paths that resolve a reference from one object to another.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReferencePaths {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// One inbound reference edge declared by an integration entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceRule {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub paths: ReferencePaths,
    #[serde(default)]
    pub propagate_templates: bool,
}

impl ReferenceRule {
    pub fn kind_ref(&self) -> KindRef {
        KindRef::new(&self.group, &self.version, &self.kind)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProbeRequest {
    pub method: String,
    pub path: String,
}

/// A named HTTP lookup whose JSON result is merged into the template context.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContextProbe {
    pub name: String,
    pub request: ProbeRequest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TemplateOperation {
    Copy,
    Template,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TemplateRule {
    pub operation: TemplateOperation,
    pub path: String,
}

/// Informational integrity digest for a template path. Carried, not enforced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TemplateHash {
    pub path: String,
    pub hash: String,
}

/// One managed kind: its references, probes and template operations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IntegrationEntry {
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ReferenceRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextProbe>,
    #[serde(default)]
    pub templates: Vec<TemplateRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hashes: Vec<TemplateHash>,
}

impl IntegrationEntry {
    pub fn kind_ref(&self) -> KindRef {
        KindRef::new(&self.group, &self.version, &self.kind)
    }
}

/// Integration is the schema for the integrations API. The spec is the
/// ordered sequence of integration entries.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(group = "loom.dev", version = "v1", kind = "Integration")]
#[kube(status = "IntegrationStatus", namespaced)]
#[serde(transparent)]
pub struct IntegrationSpec {
    pub entries: Vec<IntegrationEntry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct IntegrationStatus {
    pub ready: bool,
}
