// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Plug-in point for kinds whose readiness depends on watching downstream
//! objects reach a specific state. Implementations mutate only the trigger's
//! status in memory; the generic reconciler persists it.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;

use crate::cluster::ClusterClient;
use crate::error::Result;

#[async_trait]
pub trait KindReconciler: Send + Sync {
    /// Drives the kind's state machine one step. `None` means the machine is
    /// settled; `Some(action)` asks the framework to come back later.
    async fn reconcile_stateful(
        &self,
        cluster: &Arc<dyn ClusterClient>,
        trigger: &mut DynamicObject,
    ) -> Result<Option<Action>>;
}
