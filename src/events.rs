// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Event emission seam. The generic reconciler records framework events on
//! the trigger object for every major state change.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::DynamicObject;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::dynamic;

pub const SET_OWNER_REF_FAILED: &str = "SetOwnerRefFailed";
pub const OWNER_DELETED_DURING_STATUS_UPDATE: &str = "OwnerDeletedDuringStatusUpdate";
pub const STATUS_UPDATE_FAILED: &str = "StatusUpdateFailed";
pub const STATUS_UPDATED: &str = "StatusUpdated";
pub const TRANSFORMER_RUN_FAILED: &str = "TransformerRunFailed";
pub const UNSUPPORTED_DEPENDENT_KIND: &str = "UnsupportedDependentKind";
pub const DIFF_CHECK_FAILED: &str = "DiffCheckFailed";
pub const DEPENDENT_UPDATE_STARTED: &str = "DependentUpdateStarted";
pub const DEPENDENT_UPDATE_FAILED: &str = "DependentUpdateFailed";
pub const DEPENDENT_UPDATED: &str = "DependentUpdated";
pub const DEPENDENT_CREATE_FAILED: &str = "DependentCreateFailed";
pub const DEPENDENT_CREATED: &str = "DependentCreated";
pub const RECONCILIATION_SUCCESSFUL: &str = "ReconciliationSuccessful";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Records an event on the given object. Emission failures are logged,
    /// never propagated into the reconcile result.
    async fn publish(
        &self,
        obj: &DynamicObject,
        severity: EventSeverity,
        reason: &str,
        message: String,
    );
}

/// Records events through the cluster's event API under a per-controller
/// reporter name.
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, reporter_name: &str) -> Self {
        KubeEventSink {
            client,
            reporter: Reporter {
                controller: reporter_name.to_string(),
                instance: None,
            },
        }
    }

    fn object_reference(obj: &DynamicObject) -> ObjectReference {
        let kind = dynamic::kind_ref_of(obj);
        ObjectReference {
            api_version: Some(kind.api_version()),
            kind: Some(kind.kind),
            name: obj.metadata.name.clone(),
            namespace: obj.metadata.namespace.clone(),
            uid: obj.metadata.uid.clone(),
            ..ObjectReference::default()
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(
        &self,
        obj: &DynamicObject,
        severity: EventSeverity,
        reason: &str,
        message: String,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            Self::object_reference(obj),
        );
        let type_ = match severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(err) = recorder.publish(event).await {
            warn!(reason, error = %err, "failed to record event");
        }
    }
}
