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

use super::*;
use crate::engine::BackendHandle;

/// A NIXL backend that can be used for data transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    name: String,
    handle: BackendHandle,
}

impl Backend {
    pub(crate) fn new(name: impl Into<String>, handle: BackendHandle) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> BackendHandle {
        self.handle
    }
}

/// Memory types and default parameters a plugin reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub mem_types: Vec<MemType>,
    pub params: Params,
}

/// A created backend with the capabilities it reported after creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRegistration {
    pub handle: BackendHandle,
    pub mem_types: Vec<MemType>,
    pub params: Params,
}

/// Plugins an agent can use and the backends it created, by name
#[derive(Debug, Default)]
pub(crate) struct BackendRegistry {
    plugins: Vec<(String, PluginInfo)>,
    backends: BTreeMap<String, BackendRegistration>,
}

impl BackendRegistry {
    pub(crate) fn insert_plugin(&mut self, name: impl Into<String>, info: PluginInfo) {
        let name = name.into();
        match self.plugins.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, existing)) => *existing = info,
            None => self.plugins.push((name, info)),
        }
    }

    /// Plugin names in the order the engine reported them
    pub(crate) fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|(name, _)| name.clone()).collect()
    }

    pub(crate) fn plugin(&self, name: &str) -> Option<&PluginInfo> {
        self.plugins
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, info)| info)
    }

    pub(crate) fn insert_backend(&mut self, name: impl Into<String>, registration: BackendRegistration) {
        self.backends.insert(name.into(), registration);
    }

    pub(crate) fn backend(&self, name: &str) -> Option<&BackendRegistration> {
        self.backends.get(name)
    }

    pub(crate) fn backend_names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Resolves backend names to handles, all or nothing
    ///
    /// An empty slice resolves to an empty scope, meaning no restriction.
    pub(crate) fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<BackendHandle>, NixlError> {
        names
            .iter()
            .map(|name| self.resolve_one(name.as_ref()))
            .collect()
    }

    pub(crate) fn resolve_one(&self, name: &str) -> Result<BackendHandle, NixlError> {
        self.backends
            .get(name)
            .map(|registration| registration.handle)
            .ok_or_else(|| {
                tracing::error!(backend = name, "Backend not found");
                NixlError::UnknownBackend {
                    name: name.to_string(),
                    available: self.backend_names(),
                }
            })
    }

    pub(crate) fn name_of(&self, handle: BackendHandle) -> Option<&str> {
        self.backends
            .iter()
            .find(|(_, registration)| registration.handle == handle)
            .map(|(name, _)| name.as_str())
    }
}
