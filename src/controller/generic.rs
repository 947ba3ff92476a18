// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! The per-kind reconcile loop: renders the desired child set, diffs each
//! child with kind-specific semantics, applies creates and updates, and
//! publishes a condition-based status on the trigger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::api::KindRef;
use crate::cluster::ClusterClient;
use crate::controller::diff;
use crate::controller::stateful::KindReconciler;
use crate::dynamic;
use crate::error::{Error, Result};
use crate::events::{self, EventSeverity, EventSink};
use crate::transformer::Transformer;

pub const READY_CONDITION: &str = "Ready";
pub const RECONCILIATION_FAILED: &str = "ReconciliationFailed";
pub const RECONCILIATION_SUCCEEDED: &str = "ReconciliationSucceeded";

const SUCCESS_REQUEUE: Duration = Duration::from_secs(5);

pub struct GenericReconciler {
    pub gvk: KindRef,
    // Process-wide: at most one reconcile mutates children at a time.
    mutex: Arc<Mutex<()>>,
    cluster: Arc<dyn ClusterClient>,
    transformer: Arc<Transformer>,
    events: Arc<dyn EventSink>,
    stateful: HashMap<String, Arc<dyn KindReconciler>>,
}

impl GenericReconciler {
    pub fn new(
        gvk: KindRef,
        mutex: Arc<Mutex<()>>,
        cluster: Arc<dyn ClusterClient>,
        transformer: Arc<Transformer>,
        events: Arc<dyn EventSink>,
        stateful: HashMap<String, Arc<dyn KindReconciler>>,
    ) -> Self {
        GenericReconciler {
            gvk,
            mutex,
            cluster,
            transformer,
            events,
            stateful,
        }
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        // The kind may have been removed from the Integration document while
        // this loop's watch is still alive.
        if !self.transformer.registry().has(&self.gvk) {
            return Ok(Action::await_change());
        }

        let _guard = self.mutex.lock().await;

        info!(namespace, name, kind = %self.gvk.kind, "reconciling resource");

        let Some(mut trigger) = self.cluster.get(&self.gvk, namespace, name).await? else {
            info!(namespace, name, "resource not found, end reconcile");
            return Ok(Action::await_change());
        };
        let original = trigger.clone();

        let mut reconcile_error: Option<Error> = None;
        let mut overall_failed = false;

        let desired = match self.transformer.run(&self.cluster, &trigger).await {
            Ok(objs) => Some(objs),
            Err(err) => {
                self.events
                    .publish(
                        &trigger,
                        EventSeverity::Warning,
                        events::TRANSFORMER_RUN_FAILED,
                        format!(
                            "Failed to generate desired state for {} {}: {err}",
                            dynamic::kind_ref_of(&trigger).kind,
                            name
                        ),
                    )
                    .await;
                reconcile_error = Some(err);
                overall_failed = true;
                None
            }
        };

        let mut dependents: Vec<Value> = Vec::new();
        if let Some(desired) = desired {
            let (records, first_error) = self.process_dependents(&trigger, desired).await;
            dependents = records;
            if let Some(err) = first_error {
                overall_failed = true;
                reconcile_error = Some(err);
            }
        }

        if let Some(stateful) = self.stateful.get(&self.gvk.kind) {
            match stateful.reconcile_stateful(&self.cluster, &mut trigger).await {
                Err(err) => {
                    let _ = self
                        .update_status(&original, &trigger, &dependents, true, Some(&err))
                        .await;
                    return Err(err);
                }
                Ok(Some(action)) => {
                    // The state machine is waiting; publish the phase it set
                    // and come back later.
                    let _ = self
                        .update_status(&original, &trigger, &dependents, false, None)
                        .await;
                    return Ok(action);
                }
                Ok(None) => {}
            }
        }

        if trigger.metadata.deletion_timestamp.is_some() {
            info!(namespace, name, "owner is being deleted, skipping status update");
            return match reconcile_error {
                Some(err) => Err(err),
                None => Ok(Action::await_change()),
            };
        }

        if let Err(err) = self
            .update_status(
                &original,
                &trigger,
                &dependents,
                overall_failed,
                reconcile_error.as_ref(),
            )
            .await
        {
            warn!(error = %err, "failed to update status");
            return Err(reconcile_error.unwrap_or(err));
        }

        if let Some(err) = reconcile_error {
            return Err(err);
        }

        self.events
            .publish(
                &trigger,
                EventSeverity::Normal,
                events::RECONCILIATION_SUCCESSFUL,
                format!(
                    "All dependent resources processed successfully for {} {name}",
                    self.gvk.kind
                ),
            )
            .await;
        Ok(Action::requeue(SUCCESS_REQUEUE))
    }

    /// Processes every desired child. The first failure becomes the overall
    /// reconcile error, but every child still gets a dependent record.
    async fn process_dependents(
        &self,
        trigger: &DynamicObject,
        desired: Vec<DynamicObject>,
    ) -> (Vec<Value>, Option<Error>) {
        let mut records = Vec::new();
        let mut first_error = None;
        for mut child in desired {
            let mut record = json!({
                "kind": child.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default(),
                "name": dynamic::name_of(&child),
                "namespace": dynamic::namespace_of(&child),
                "status": "Attempted",
            });

            let outcome = match self.adopt(trigger, &mut child).await {
                Err(err) => Err(err),
                Ok(()) => self.reconcile_child(trigger, child).await,
            };
            match outcome {
                Ok(final_child) => {
                    record["status"] = Value::String("Processed".to_string());
                    if let Some(final_child) = final_child {
                        let uid = dynamic::uid_of(&final_child);
                        if !uid.is_empty() {
                            record["uid"] = Value::String(uid);
                        }
                    }
                }
                Err(err) => {
                    record["status"] = Value::String(format!("Error: {err}"));
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
            records.push(record);
        }
        (records, first_error)
    }

    /// Sets the controller owner reference on a child, refusing to steal a
    /// child already controlled by a different owner.
    async fn adopt(&self, trigger: &DynamicObject, child: &mut DynamicObject) -> Result<()> {
        let result = set_controller_reference(trigger, child);
        if let Err(err) = &result {
            self.events
                .publish(
                    trigger,
                    EventSeverity::Warning,
                    events::SET_OWNER_REF_FAILED,
                    format!(
                        "Failed to set owner ref on {} {} for {} {}: {err}",
                        child.types.as_ref().map(|t| t.kind.as_str()).unwrap_or(""),
                        dynamic::name_of(child),
                        self.gvk.kind,
                        dynamic::name_of(trigger),
                    ),
                )
                .await;
        }
        result
    }

    /// Fetches the observed child, diffs and creates/updates as needed.
    /// Returns the live object, or `None` when the kind is unsupported and
    /// the child was passed through untouched.
    async fn reconcile_child(
        &self,
        trigger: &DynamicObject,
        child: DynamicObject,
    ) -> Result<Option<DynamicObject>> {
        let child_kind = dynamic::kind_ref_of(&child);
        let namespace = dynamic::namespace_of(&child);
        let name = dynamic::name_of(&child);

        let Some(diff_fn) = diff::for_kind(&child_kind.kind) else {
            info!(kind = %child_kind.kind, "unsupported dependent kind, skipping");
            self.events
                .publish(
                    trigger,
                    EventSeverity::Warning,
                    events::UNSUPPORTED_DEPENDENT_KIND,
                    format!(
                        "Skipping unsupported dependent kind {} {namespace}/{name} for {} {}",
                        child_kind.kind,
                        self.gvk.kind,
                        dynamic::name_of(trigger),
                    ),
                )
                .await;
            return Ok(None);
        };

        let existing = self.cluster.get(&child_kind, &namespace, &name).await?;
        match existing {
            None => {
                info!(kind = %child_kind.kind, %namespace, %name, "creating dependent resource");
                match self.cluster.create(&child_kind, &namespace, &child).await {
                    Ok(created) => {
                        self.events
                            .publish(
                                trigger,
                                EventSeverity::Normal,
                                events::DEPENDENT_CREATED,
                                format!(
                                    "Successfully created {} {namespace}/{name} (UID: {}) for {} {}",
                                    child_kind.kind,
                                    dynamic::uid_of(&created),
                                    self.gvk.kind,
                                    dynamic::name_of(trigger),
                                ),
                            )
                            .await;
                        Ok(Some(created))
                    }
                    Err(err) => {
                        self.events
                            .publish(
                                trigger,
                                EventSeverity::Warning,
                                events::DEPENDENT_CREATE_FAILED,
                                format!(
                                    "Failed to create {} {namespace}/{name} for {} {}: {err}",
                                    child_kind.kind,
                                    self.gvk.kind,
                                    dynamic::name_of(trigger),
                                ),
                            )
                            .await;
                        Err(err)
                    }
                }
            }
            Some(existing) => {
                let has_diff = match diff_fn(&existing, &child) {
                    Ok(has_diff) => has_diff,
                    Err(err) => {
                        self.events
                            .publish(
                                trigger,
                                EventSeverity::Warning,
                                events::DIFF_CHECK_FAILED,
                                format!(
                                    "Failed to compare desired state for dependent {} {namespace}/{name}: {err}",
                                    child_kind.kind
                                ),
                            )
                            .await;
                        return Err(err);
                    }
                };

                let needs_owner_update = owner_ref_differs(&existing, &child);
                if !has_diff && !needs_owner_update {
                    info!(kind = %child_kind.kind, %name, "resource is the same, no update needed");
                    return Ok(Some(existing));
                }

                info!(
                    kind = %child_kind.kind, %namespace, %name,
                    has_diff, needs_owner_update, "resource requires update"
                );
                self.events
                    .publish(
                        trigger,
                        EventSeverity::Normal,
                        events::DEPENDENT_UPDATE_STARTED,
                        format!(
                            "Starting update of {} {namespace}/{name} for {} {}",
                            child_kind.kind,
                            self.gvk.kind,
                            dynamic::name_of(trigger),
                        ),
                    )
                    .await;

                let mut updated = child;
                updated.metadata.resource_version = existing.metadata.resource_version.clone();
                match self.cluster.update(&child_kind, &namespace, &updated).await {
                    Ok(live) => {
                        self.events
                            .publish(
                                trigger,
                                EventSeverity::Normal,
                                events::DEPENDENT_UPDATED,
                                format!(
                                    "Successfully updated {} {namespace}/{name} for {} {}",
                                    child_kind.kind,
                                    self.gvk.kind,
                                    dynamic::name_of(trigger),
                                ),
                            )
                            .await;
                        Ok(Some(live))
                    }
                    Err(err) => {
                        self.events
                            .publish(
                                trigger,
                                EventSeverity::Warning,
                                events::DEPENDENT_UPDATE_FAILED,
                                format!(
                                    "Failed to update {} {namespace}/{name} for {} {}: {err}",
                                    child_kind.kind,
                                    self.gvk.kind,
                                    dynamic::name_of(trigger),
                                ),
                            )
                            .await;
                        Err(err)
                    }
                }
            }
        }
    }

    /// Builds and writes the new status block. A missing owner is benign;
    /// any other write failure requeues.
    async fn update_status(
        &self,
        original: &DynamicObject,
        trigger: &DynamicObject,
        dependents: &[Value],
        failed: bool,
        error: Option<&Error>,
    ) -> Result<()> {
        // Fields are layered onto whatever status the trigger already
        // carries, stateful-machine fields included.
        let mut status_target = trigger.clone();
        dynamic::set_nested(
            &mut status_target.data,
            &["status", "observedGeneration"],
            Value::from(trigger.metadata.generation.unwrap_or(0)),
        );
        dynamic::set_nested(
            &mut status_target.data,
            &["status", "conditions"],
            Value::Array(build_conditions(trigger, failed, error)),
        );
        dynamic::set_nested(
            &mut status_target.data,
            &["status", "dependentResources"],
            Value::Array(dependents.to_vec()),
        );
        dynamic::set_nested(
            &mut status_target.data,
            &["status", "createdResourceCount"],
            Value::from(dependents.len() as i64),
        );

        let original_status = original.data.get("status").cloned();
        if original_status.as_ref() == status_target.data.get("status") {
            info!("target status is already up-to-date");
            return Ok(());
        }

        let namespace = dynamic::namespace_of(trigger);
        match self
            .cluster
            .update_status(&self.gvk, &namespace, &status_target)
            .await
        {
            Ok(_) => {
                self.events
                    .publish(
                        trigger,
                        EventSeverity::Normal,
                        events::STATUS_UPDATED,
                        format!(
                            "Status updated for {} {}",
                            self.gvk.kind,
                            dynamic::name_of(trigger)
                        ),
                    )
                    .await;
                Ok(())
            }
            Err(Error::ObjectGone) => {
                info!("owner not found during status update, likely deleted; not re-queuing");
                self.events
                    .publish(
                        trigger,
                        EventSeverity::Warning,
                        events::OWNER_DELETED_DURING_STATUS_UPDATE,
                        format!(
                            "Owner {} {} was deleted before status could be updated.",
                            self.gvk.kind,
                            dynamic::name_of(trigger)
                        ),
                    )
                    .await;
                Ok(())
            }
            Err(err) => {
                self.events
                    .publish(
                        trigger,
                        EventSeverity::Warning,
                        events::STATUS_UPDATE_FAILED,
                        format!(
                            "Failed to update status for {} {}: {err}",
                            self.gvk.kind,
                            dynamic::name_of(trigger)
                        ),
                    )
                    .await;
                Err(err)
            }
        }
    }
}

/// Rebuilds the condition list: every existing condition is kept except
/// `Ready`, which is replaced. `lastTransitionTime` advances only when the
/// condition status flips.
fn build_conditions(trigger: &DynamicObject, failed: bool, error: Option<&Error>) -> Vec<Value> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
    let (status, reason, message) = if failed || error.is_some() {
        (
            "False",
            RECONCILIATION_FAILED,
            match error {
                Some(err) => format!("Failed to reconcile: {err}"),
                None => "One or more dependent resources failed to reconcile.".to_string(),
            },
        )
    } else {
        (
            "True",
            RECONCILIATION_SUCCEEDED,
            "All dependent resources successfully processed.".to_string(),
        )
    };

    let mut desired = json!({
        "type": READY_CONDITION,
        "status": status,
        "reason": reason,
        "message": message,
        "observedGeneration": trigger.metadata.generation.unwrap_or(0),
        "lastTransitionTime": now,
    });

    let existing = dynamic::nested_slice(&trigger.data, &["status", "conditions"])
        .cloned()
        .unwrap_or_default();

    let mut conditions = Vec::new();
    let mut replaced = false;
    for condition in existing {
        if condition.get("type").and_then(Value::as_str) == Some(READY_CONDITION) {
            replaced = true;
            let unchanged = condition.get("status") == desired.get("status")
                && condition.get("reason") == desired.get("reason")
                && condition.get("message") == desired.get("message")
                && condition.get("observedGeneration") == desired.get("observedGeneration");
            if unchanged {
                conditions.push(condition);
            } else {
                if condition.get("status") == desired.get("status") {
                    // Same status, different detail: the transition time holds.
                    if let Some(previous) = condition.get("lastTransitionTime") {
                        desired["lastTransitionTime"] = previous.clone();
                    }
                }
                conditions.push(desired.clone());
            }
        } else {
            conditions.push(condition);
        }
    }
    if !replaced {
        conditions.push(desired);
    }
    conditions
}

fn controller_ref(obj: &DynamicObject) -> Option<&OwnerReference> {
    obj.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|reference| reference.controller == Some(true))
}

/// The observed controller reference differs from the desired one by API
/// version, kind or UID.
fn owner_ref_differs(existing: &DynamicObject, desired: &DynamicObject) -> bool {
    let Some(desired_ref) = controller_ref(desired) else {
        return false;
    };
    match controller_ref(existing) {
        None => true,
        Some(existing_ref) => {
            existing_ref.api_version != desired_ref.api_version
                || existing_ref.kind != desired_ref.kind
                || existing_ref.uid != desired_ref.uid
        }
    }
}

/// Points the child's controller owner reference at the trigger.
pub fn set_controller_reference(owner: &DynamicObject, child: &mut DynamicObject) -> Result<()> {
    let owner_kind = dynamic::kind_ref_of(owner);
    let owner_uid = dynamic::uid_of(owner);
    if owner_uid.is_empty() {
        return Err(Error::MalformedDocument {
            kind: owner_kind.kind,
            reason: "owner has no uid".to_string(),
        });
    }

    if let Some(existing) = controller_ref(child) {
        if existing.uid != owner_uid {
            return Err(Error::AlreadyOwned {
                kind: dynamic::kind_ref_of(child).kind,
                namespace: dynamic::namespace_of(child),
                name: dynamic::name_of(child),
            });
        }
    }

    let reference = OwnerReference {
        api_version: owner_kind.api_version(),
        kind: owner_kind.kind,
        name: dynamic::name_of(owner),
        uid: owner_uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    };

    let references = child.metadata.owner_references.get_or_insert_with(Vec::new);
    references.retain(|existing| existing.controller != Some(true));
    references.push(reference);
    Ok(())
}
