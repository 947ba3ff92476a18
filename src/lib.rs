// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Template-driven declarative operator. An Integration document maps each
//! kind of custom resource to rendering templates and cross-resource
//! reference rules; the operator watches those kinds and materializes the
//! dependent cluster objects the templates describe.

pub mod api;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod dynamic;
pub mod error;
pub mod events;
pub mod transformer;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::api::{Integration, IntegrationEntry, IntegrationSpec, KindRef};
pub use crate::error::{Error, Result};
pub use crate::transformer::Transformer;
