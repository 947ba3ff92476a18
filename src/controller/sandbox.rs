// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! State machine for AgenticSandbox triggers: Pending → Running, driven by
//! the child workload's availability and the child service's cluster IP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use serde_json::{Map, Value};
use tracing::info;

use crate::api::KindRef;
use crate::cluster::ClusterClient;
use crate::controller::stateful::KindReconciler;
use crate::dynamic;
use crate::error::Result;

pub struct AgenticSandboxReconciler;

#[async_trait]
impl KindReconciler for AgenticSandboxReconciler {
    async fn reconcile_stateful(
        &self,
        cluster: &Arc<dyn ClusterClient>,
        trigger: &mut DynamicObject,
    ) -> Result<Option<Action>> {
        if trigger.data.get("status").and_then(Value::as_object).is_none() {
            set_status(trigger, "Pending", None);
            return Ok(Some(Action::requeue(Duration::ZERO)));
        }

        let phase = dynamic::nested_str(&trigger.data, &["status", "phase"]).unwrap_or_default();
        if phase == "Running" {
            return Ok(None);
        }

        let name = dynamic::name_of(trigger);
        let namespace = dynamic::namespace_of(trigger);

        // The child workload shares the sandbox's name and namespace.
        let deployment_kind = KindRef::new("apps", "v1", "Deployment");
        let Some(deployment) = cluster.get(&deployment_kind, &namespace, &name).await? else {
            info!(%name, "waiting for child workload to be created");
            return Ok(Some(Action::requeue(Duration::from_secs(5))));
        };

        if !deployment_available(&deployment) {
            set_status(trigger, "Pending", None);
            return Ok(Some(Action::requeue(Duration::from_secs(10))));
        }

        let service_kind = KindRef::new("", "v1", "Service");
        let Some(service) = cluster.get(&service_kind, &namespace, &name).await? else {
            info!(%name, "waiting for child service to be created");
            return Ok(Some(Action::requeue(Duration::from_secs(5))));
        };

        set_status(trigger, "Running", connection_details(&service));
        Ok(None)
    }
}

fn deployment_available(deployment: &DynamicObject) -> bool {
    dynamic::nested_slice(&deployment.data, &["status", "conditions"])
        .map(|conditions| {
            conditions.iter().any(|condition| {
                condition.get("type").and_then(Value::as_str) == Some("Available")
                    && condition.get("status").and_then(Value::as_str) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// Cluster IP and first port of the service, when the IP is assigned.
fn connection_details(service: &DynamicObject) -> Option<(String, i64)> {
    let cluster_ip = dynamic::nested_str(&service.data, &["spec", "clusterIP"])?;
    if cluster_ip.is_empty() {
        return None;
    }
    let port = dynamic::nested_slice(&service.data, &["spec", "ports"])
        .and_then(|ports| ports.first())
        .and_then(|port| port.get("port"))
        .and_then(Value::as_i64)?;
    Some((cluster_ip.to_string(), port))
}

fn set_status(trigger: &mut DynamicObject, phase: &str, connection: Option<(String, i64)>) {
    let mut status = trigger
        .data
        .get("status")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);
    status.insert("phase".into(), Value::String(phase.to_string()));
    match connection {
        Some((ip, port)) => {
            status.insert("sandboxIP".into(), Value::String(ip));
            status.insert("serverPort".into(), Value::from(port));
        }
        None => {
            status.remove("sandboxIP");
            status.remove("serverPort");
        }
    }
    trigger.data["status"] = Value::Object(status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{obj, FakeCluster};
    use serde_json::json;

    fn sandbox() -> DynamicObject {
        let kind = KindRef::new("loom.dev", "v1", "AgenticSandbox");
        obj(&kind, "default", "box-1")
    }

    fn available_deployment() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "box-1", "namespace": "default"},
            "status": {"conditions": [{"type": "Available", "status": "True"}]}
        }))
        .unwrap()
    }

    fn service_with_ip() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "box-1", "namespace": "default"},
            "spec": {"clusterIP": "10.0.0.1", "ports": [{"port": 8888}]}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn first_pass_sets_pending() {
        let cluster = FakeCluster::default().into_arc();
        let mut trigger = sandbox();
        let action = AgenticSandboxReconciler
            .reconcile_stateful(&cluster, &mut trigger)
            .await
            .unwrap();
        assert!(action.is_some());
        assert_eq!(trigger.data["status"]["phase"], "Pending");
    }

    #[tokio::test]
    async fn unavailable_deployment_keeps_pending() {
        let fake = FakeCluster::default();
        let unavailable: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "box-1", "namespace": "default"},
            "status": {"conditions": [{"type": "Available", "status": "False"}]}
        }))
        .unwrap();
        fake.insert(&unavailable);
        let cluster = fake.into_arc();

        let mut trigger = sandbox();
        trigger.data["status"] = json!({"phase": "Pending"});
        let action = AgenticSandboxReconciler
            .reconcile_stateful(&cluster, &mut trigger)
            .await
            .unwrap();
        assert!(action.is_some());
        assert_eq!(trigger.data["status"]["phase"], "Pending");
    }

    #[tokio::test]
    async fn ready_children_move_the_sandbox_to_running() {
        let fake = FakeCluster::default();
        fake.insert(&available_deployment());
        fake.insert(&service_with_ip());
        let cluster = fake.into_arc();

        let mut trigger = sandbox();
        trigger.data["status"] = json!({"phase": "Pending"});
        let action = AgenticSandboxReconciler
            .reconcile_stateful(&cluster, &mut trigger)
            .await
            .unwrap();

        assert!(action.is_none());
        let status = &trigger.data["status"];
        assert_eq!(status["phase"], "Running");
        assert_eq!(status["sandboxIP"], "10.0.0.1");
        assert_eq!(status["serverPort"], 8888);
    }

    #[tokio::test]
    async fn running_sandbox_is_a_no_op() {
        let cluster = FakeCluster::default().into_arc();
        let mut trigger = sandbox();
        trigger.data["status"] =
            json!({"phase": "Running", "sandboxIP": "10.0.0.1", "serverPort": 8888});
        let before = trigger.data["status"].clone();
        let action = AgenticSandboxReconciler
            .reconcile_stateful(&cluster, &mut trigger)
            .await
            .unwrap();
        assert!(action.is_none());
        assert_eq!(trigger.data["status"], before);
    }

    #[tokio::test]
    async fn missing_service_requeues() {
        let fake = FakeCluster::default();
        fake.insert(&available_deployment());
        let cluster = fake.into_arc();

        let mut trigger = sandbox();
        trigger.data["status"] = json!({"phase": "Pending"});
        let action = AgenticSandboxReconciler
            .reconcile_stateful(&cluster, &mut trigger)
            .await
            .unwrap();
        assert!(action.is_some());
    }
}
