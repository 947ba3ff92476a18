// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Reconcilers: the Integration controller, the per-kind generic reconciler,
//! kind-specific diffing and the stateful sub-reconcilers.

pub mod diff;
pub mod generic;
pub mod integration;
pub mod model_data;
pub mod sandbox;
pub mod stateful;

pub use generic::GenericReconciler;
pub use integration::IntegrationController;
