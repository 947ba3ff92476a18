// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Errors produced by the transformer pipeline and the reconcilers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("missing integration for {0}")]
    MissingIntegration(String),

    #[error("duplicate integration for {0}")]
    DuplicateIntegration(String),

    #[error("could not find file system for scheme {scheme:?} in {path:?}")]
    UnsupportedScheme { scheme: String, path: String },

    #[error("unable to parse virtual path {0:?}")]
    MalformedVirtualPath(String),

    // Mutating operations on a read-only file system.
    #[error("not supported")]
    NotSupported,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("detected a cycle in the dependencies")]
    CycleDetected,

    #[error("name not found for path {0:?}")]
    MissingReferencePath(String),

    #[error("invalid request for probe {0:?}: only GET supported")]
    ProbeMethodUnsupported(String),

    #[error("probe {name:?} returned {status}: {body}")]
    ProbeStatus { name: String, status: u16, body: String },

    #[error("probe {name:?} request failed: {source}")]
    ProbeRequest {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("probe {name:?} returned invalid JSON: {source}")]
    ProbeBody {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to render template {path:?}: {source}")]
    TemplateRender {
        path: String,
        #[source]
        source: Box<handlebars::RenderError>,
    },

    #[error("invalid manifest {path:?}: {source}")]
    ManifestParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to parse Secret data string for {name:?}: {value:?}")]
    SecretDataParse { name: String, value: String },

    #[error("invalid blob URI format: {0}")]
    MalformedBlobUri(String),

    #[error("model name cannot be empty")]
    EmptyModelName,

    #[error("could not find resource with key {0:?} in the resource map")]
    ResourceNotInMap(String),

    #[error("resource with key {0:?} is not a dictionary")]
    ResourceNotDictionary(String),

    #[error("waiting for ModelData {0:?} to be created")]
    ModelDataMissing(String),

    #[error("waiting for ModelData {name:?} to reach phase 'Succeeded' (current phase: {phase:?})")]
    ModelDataNotReady { name: String, phase: String },

    #[error("ModelData {0:?} succeeded, but status.finalGcsPath is missing")]
    ModelDataPathMissing(String),

    #[error("unsupported resource kind: {0}")]
    UnsupportedDependentKind(String),

    #[error("{kind} {namespace}/{name} already has a different controller owner")]
    AlreadyOwned {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("malformed {kind} document: {reason}")]
    MalformedDocument { kind: String, reason: String },

    #[error("no pods found for completed job {0:?}")]
    JobPodsMissing(String),

    #[error("job {0:?} finished but could not find termination message")]
    TerminationMessageMissing(String),

    // Status write hit a deleted owner; callers treat this as benign.
    #[error("object not found")]
    ObjectGone,

    #[error("failed to serialize {name:?}: {source}")]
    Serialize {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("blob store error: {0}")]
    BlobStore(String),

    #[error("kubernetes api error: {0}")]
    Kube(#[source] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
