// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use std::env;
use std::time::Duration;

const WATCH_NAMESPACES_ENV: &str = "LOOM_WATCH_NAMESPACES";
const PROBE_TIMEOUT_ENV: &str = "LOOM_PROBE_TIMEOUT_SECS";

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-wide configuration read from the environment.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespaces the instance cache lists; `None` means cluster-wide.
    pub watch_namespaces: Option<Vec<String>>,
    /// Deadline applied to every context probe request.
    pub probe_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            watch_namespaces: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        let watch_namespaces = env::var(WATCH_NAMESPACES_ENV).ok().and_then(|raw| {
            let namespaces: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|ns| !ns.is_empty())
                .map(str::to_string)
                .collect();
            if namespaces.is_empty() {
                None
            } else {
                Some(namespaces)
            }
        });

        let probe_timeout = env::var(PROBE_TIMEOUT_ENV)
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PROBE_TIMEOUT);

        OperatorConfig {
            watch_namespaces,
            probe_timeout,
        }
    }
}
