// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! State machine for ModelData triggers: Pending → Syncing → Succeeded or
//! Failed, driven by the child synchronization Job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use serde_json::{Map, Value};
use tracing::info;

use crate::api::KindRef;
use crate::cluster::ClusterClient;
use crate::controller::stateful::KindReconciler;
use crate::dynamic;
use crate::error::{Error, Result};

const UPLOAD_CONTAINER: &str = "gcloud-upload";

pub struct ModelDataReconciler;

#[async_trait]
impl KindReconciler for ModelDataReconciler {
    async fn reconcile_stateful(
        &self,
        cluster: &Arc<dyn ClusterClient>,
        trigger: &mut DynamicObject,
    ) -> Result<Option<Action>> {
        let Some(status) = trigger.data.get("status").and_then(Value::as_object).cloned() else {
            // First pass: the download Job has not even been requested yet.
            set_status(trigger, "Pending", "Waiting for download job to be created.", None);
            return Ok(Some(Action::requeue(Duration::ZERO)));
        };

        let phase = status.get("phase").and_then(Value::as_str).unwrap_or_default();
        if phase == "Succeeded" || phase == "Failed" {
            info!(phase, "model data already terminal, nothing to do");
            return Ok(None);
        }

        let dependents = status
            .get("dependentResources")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if dependents.is_empty() {
            set_status(trigger, "Pending", "Waiting for download job to be created.", None);
            return Ok(Some(Action::requeue(Duration::from_secs(15))));
        }
        let job_name = dependents[0]
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let namespace = dynamic::namespace_of(trigger);
        let job_kind = KindRef::new("batch", "v1", "Job");
        let Some(job) = cluster.get(&job_kind, &namespace, &job_name).await? else {
            return Ok(Some(Action::requeue(Duration::from_secs(15))));
        };

        if job_condition_true(&job, "Failed") {
            set_status(trigger, "Failed", "The model synchronization Job failed.", None);
            return Ok(None);
        }

        if job_condition_true(&job, "Complete") {
            let git_hash = match hash_from_terminated_pod(cluster, &job).await {
                Ok(hash) => hash,
                Err(err) => {
                    set_status(
                        trigger,
                        "Failed",
                        &format!("Job succeeded but could not read result: {err}"),
                        None,
                    );
                    return Err(err);
                }
            };
            let final_path = final_blob_path(trigger, &git_hash);
            set_status(
                trigger,
                "Succeeded",
                "Model synchronization complete.",
                Some((git_hash, final_path)),
            );
            return Ok(None);
        }

        set_status(trigger, "Syncing", "Model synchronization Job is in progress.", None);
        Ok(Some(Action::requeue(Duration::from_secs(10))))
    }
}

fn set_status(trigger: &mut DynamicObject, phase: &str, message: &str, result: Option<(String, String)>) {
    let mut status = trigger
        .data
        .get("status")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);
    status.insert("phase".into(), Value::String(phase.to_string()));
    status.insert("message".into(), Value::String(message.to_string()));
    if let Some((git_hash, final_path)) = result {
        status.insert("resolvedRevision".into(), Value::String(git_hash));
        status.insert("finalGcsPath".into(), Value::String(final_path));
        status.insert(
            "lastSyncTime".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
    }
    trigger.data["status"] = Value::Object(status);
}

fn job_condition_true(job: &DynamicObject, condition_type: &str) -> bool {
    dynamic::nested_slice(&job.data, &["status", "conditions"])
        .map(|conditions| {
            conditions.iter().any(|condition| {
                condition.get("type").and_then(Value::as_str) == Some(condition_type)
                    && condition.get("status").and_then(Value::as_str) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// Finds the job's pod through the job selector labels and reads the upload
/// container's termination message as the resolved revision.
async fn hash_from_terminated_pod(
    cluster: &Arc<dyn ClusterClient>,
    job: &DynamicObject,
) -> Result<String> {
    let job_name = dynamic::name_of(job);
    let job_namespace = dynamic::namespace_of(job);
    let selector = dynamic::nested_map(&job.data, &["spec", "selector", "matchLabels"])
        .cloned()
        .unwrap_or_default();

    let pod_kind = KindRef::new("", "v1", "Pod");
    let pods: Vec<DynamicObject> = cluster
        .list(&pod_kind)
        .await?
        .into_iter()
        .filter(|pod| dynamic::namespace_of(pod) == job_namespace)
        .filter(|pod| {
            let labels = &pod.metadata.labels;
            selector.iter().all(|(key, expected)| {
                labels
                    .as_ref()
                    .and_then(|l| l.get(key))
                    .map(|actual| Some(actual.as_str()) == expected.as_str())
                    .unwrap_or(false)
            })
        })
        .collect();

    let Some(pod) = pods.first() else {
        return Err(Error::JobPodsMissing(job_name));
    };

    if let Some(statuses) = dynamic::nested_slice(&pod.data, &["status", "containerStatuses"]) {
        for container_status in statuses {
            if container_status.get("name").and_then(Value::as_str) == Some(UPLOAD_CONTAINER) {
                if let Some(message) =
                    dynamic::nested_str(container_status, &["state", "terminated", "message"])
                {
                    return Ok(message.trim().to_string());
                }
            }
        }
    }
    Err(Error::TerminationMessageMissing(job_name))
}

/// `gs://<bucket>/<prefix>/<hash>`, tolerant of a `gs://` prefix or trailing
/// slash on the configured bucket.
fn final_blob_path(trigger: &DynamicObject, git_hash: &str) -> String {
    let bucket = dynamic::nested_str(&trigger.data, &["spec", "destination", "gcsBucket"])
        .unwrap_or_default();
    let prefix = dynamic::nested_str(&trigger.data, &["spec", "destination", "prefix"])
        .unwrap_or_default();
    let clean_bucket = bucket
        .trim_start_matches("gs://")
        .trim_end_matches('/');
    let full_path = [prefix.trim_matches('/'), git_hash]
        .iter()
        .filter(|part| !part.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("/");
    format!("gs://{clean_bucket}/{full_path}")
}
