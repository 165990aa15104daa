// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Agent configuration
//!
//! Values come from a TOML document (or the defaults) and are then overridden
//! by environment variables:
//! - `NIXL_TELEMETRY_ENABLE` -> `capture_telemetry`
//! - `NIXL_NUM_THREADS` -> `num_threads`

use crate::{NixlError, Params, DEFAULT_COMM_PORT};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;

pub const TELEMETRY_ENV: &str = "NIXL_TELEMETRY_ENABLE";
pub const NUM_THREADS_ENV: &str = "NIXL_NUM_THREADS";

/// Configuration applied when an agent is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Let the engine drive progress on its own thread
    pub enable_prog_thread: bool,
    /// Accept metadata pushed by peers
    pub enable_listen_thread: bool,
    /// Listening port; 0 means [`DEFAULT_COMM_PORT`]
    pub listen_port: u16,
    pub capture_telemetry: bool,
    /// Worker threads handed to backends that take them; 0 keeps their default
    pub num_threads: usize,
    /// Backends created with the agent
    pub backends: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enable_prog_thread: true,
            enable_listen_thread: false,
            listen_port: 0,
            capture_telemetry: false,
            num_threads: 0,
            backends: vec!["UCX".to_string()],
        }
    }
}

impl AgentConfig {
    /// A configuration that creates the given backends and nothing else
    pub fn with_backends<I, S>(backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            backends: backends.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self, NixlError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file and apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NixlError> {
        let content = fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_environment_overrides();
        tracing::debug!(path = %path.as_ref().display(), ?config, "Loaded agent configuration");
        Ok(config)
    }

    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    /// Apply overrides read through `lookup`; unparsable values are ignored
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(TELEMETRY_ENV) {
            match value.to_lowercase().as_str() {
                "1" | "y" | "yes" | "true" | "on" => self.capture_telemetry = true,
                "0" | "n" | "no" | "false" | "off" => self.capture_telemetry = false,
                _ => tracing::warn!(value = %value, "Ignoring invalid NIXL_TELEMETRY_ENABLE value"),
            }
        }
        if let Some(value) = lookup(NUM_THREADS_ENV) {
            match value.parse::<usize>() {
                Ok(threads) => self.num_threads = threads,
                Err(_) => tracing::warn!(value = %value, "Ignoring invalid NIXL_NUM_THREADS value"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), NixlError> {
        let mut seen = HashSet::new();
        for name in &self.backends {
            if name.trim().is_empty() {
                return Err(NixlError::Config("backend names must not be empty".to_string()));
            }
            if !seen.insert(name.as_str()) {
                return Err(NixlError::Config(format!("backend '{name}' listed twice")));
            }
        }
        Ok(())
    }

    /// Port the agent listens on, if listening is enabled
    pub fn effective_listen_port(&self) -> Option<u16> {
        self.enable_listen_thread.then_some(if self.listen_port == 0 {
            DEFAULT_COMM_PORT
        } else {
            self.listen_port
        })
    }

    /// Creation parameters the configuration adds for `plugin`
    pub fn init_params_for(&self, plugin: &str) -> Params {
        let mut params = Params::new();
        if self.num_threads > 0 {
            match plugin {
                "UCX" | "OBJ" => {
                    params.insert("num_threads", self.num_threads.to_string());
                }
                "GDS_MT" => {
                    params.insert("thread_count", self.num_threads.to_string());
                }
                _ => {}
            }
        }
        params
    }
}
