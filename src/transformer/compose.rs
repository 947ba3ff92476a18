// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Composition seam. The pipeline hands a scratch tree plus a root manifest
//! to a [`Composer`] and gets back a flat list of documents; the stitching
//! engine itself is replaceable.

use kube::api::DynamicObject;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::transformer::vfs::{join_path, VirtualFileSystem};

pub const ROOT_MANIFEST: &str = "kustomization.yaml";

pub trait Composer: Send + Sync {
    /// Reads `<root>/kustomization.yaml` from the tree and emits the
    /// documents it composes, in manifest order.
    fn compose(&self, tree: &dyn VirtualFileSystem, root: &str) -> Result<Vec<DynamicObject>>;
}

#[derive(Deserialize)]
struct RootManifest {
    #[serde(default)]
    resources: Vec<String>,
}

/// Minimal built-in composer: inlines every document listed by the root
/// manifest, multi-document files included.
pub struct OverlayComposer;

impl Composer for OverlayComposer {
    fn compose(&self, tree: &dyn VirtualFileSystem, root: &str) -> Result<Vec<DynamicObject>> {
        let manifest_path = join_path(root, ROOT_MANIFEST);
        let raw = tree.read_file(&manifest_path)?;
        let manifest: RootManifest =
            serde_yaml::from_slice(&raw).map_err(|source| Error::ManifestParse {
                path: manifest_path.clone(),
                source,
            })?;

        let mut documents = Vec::new();
        for resource in &manifest.resources {
            let path = join_path(root, resource);
            let data = tree.read_file(&path)?;
            for document in parse_documents(&path, &data)? {
                documents.push(document);
            }
        }
        Ok(documents)
    }
}

fn parse_documents(path: &str, data: &[u8]) -> Result<Vec<DynamicObject>> {
    let mut documents = Vec::new();
    for deserializer in serde_yaml::Deserializer::from_slice(data) {
        let value = serde_yaml::Value::deserialize(deserializer).map_err(|source| {
            Error::ManifestParse {
                path: path.to_string(),
                source,
            }
        })?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(&value).map_err(|source| Error::Serialize {
            name: path.to_string(),
            source,
        })?;
        let obj: DynamicObject =
            serde_json::from_value(json).map_err(|source| Error::Serialize {
                name: path.to_string(),
                source,
            })?;
        documents.push(obj);
    }
    Ok(documents)
}
