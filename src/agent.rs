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
use crate::engine::{BackendHandle, RawDlistHandle, RawXferHandle, TransferEngine, XferArgs};
use crate::metadata::PeerTable;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) type SharedAgent = Arc<RwLock<AgentInner>>;

pub(crate) fn read_agent(agent: &SharedAgent) -> RwLockReadGuard<'_, AgentInner> {
    agent.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_agent(agent: &SharedAgent) -> RwLockWriteGuard<'_, AgentInner> {
    agent.write().unwrap_or_else(PoisonError::into_inner)
}

/// Optional arguments for transfers and notifications
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptArgs {
    backends: Vec<String>,
    notification: Option<Vec<u8>>,
    skip_desc_merge: bool,
}

impl OptArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the operation to a backend
    pub fn add_backend(&mut self, backend: &Backend) {
        self.backends.push(backend.name().to_string());
    }

    pub fn add_backend_name(&mut self, name: impl Into<String>) {
        self.backends.push(name.into());
    }

    pub fn backends(&self) -> &[String] {
        &self.backends
    }

    /// Set a notification message delivered to the peer on completion
    pub fn set_notification_message(&mut self, message: &[u8]) {
        self.notification = Some(message.to_vec());
    }

    pub fn get_notification_message(&self) -> Option<&[u8]> {
        self.notification.as_deref()
    }

    pub fn has_notification(&self) -> bool {
        self.notification.is_some()
    }

    pub fn clear_notification(&mut self) {
        self.notification = None;
    }

    pub fn set_skip_descriptor_merge(&mut self, skip_merge: bool) {
        self.skip_desc_merge = skip_merge;
    }

    pub fn skip_descriptor_merge(&self) -> bool {
        self.skip_desc_merge
    }

    pub fn with_backend(mut self, name: impl Into<String>) -> Self {
        self.add_backend_name(name);
        self
    }

    pub fn with_notification(mut self, message: &[u8]) -> Self {
        self.set_notification_message(message);
        self
    }
}

/// State shared by an agent and every handle it hands out
pub(crate) struct AgentInner {
    pub(crate) name: String,
    engine: Box<dyn TransferEngine>,
    backends: BackendRegistry,
    pub(crate) handles: HandleRegistry,
    notifs: NotificationMap,
    peers: PeerTable,
    config: AgentConfig,
}

impl AgentInner {
    fn create_backend(&mut self, plugin: &str, params: &Params) -> Result<Backend, NixlError> {
        if self.backends.plugin(plugin).is_none() {
            return Err(NixlError::UnknownPlugin {
                name: plugin.to_string(),
                available: self.backends.plugin_names(),
            });
        }
        tracing::trace!(agent.name = %self.name, backend = plugin, "Creating backend");
        let handle = self.engine.create_backend(plugin, params).map_err(|e| {
            tracing::error!(agent.name = %self.name, backend = plugin, error = ?e, "Failed to create backend");
            e
        })?;
        let (mem_types, params) = self.engine.backend_params(handle)?;
        self.backends.insert_backend(
            plugin,
            BackendRegistration {
                handle,
                mem_types,
                params,
            },
        );
        tracing::info!(agent.name = %self.name, backend = plugin, "Backend created");
        Ok(Backend::new(plugin, handle))
    }

    fn xfer_args(&self, opt_args: Option<&OptArgs>) -> Result<XferArgs, NixlError> {
        let Some(opt_args) = opt_args else {
            return Ok(XferArgs::default());
        };
        Ok(XferArgs {
            notif: opt_args.notification.clone(),
            backends: self.backends.resolve(opt_args.backends.as_slice())?,
            skip_desc_merge: opt_args.skip_desc_merge,
        })
    }

    fn check_dlist(&self, handle: &PreparedDlistHandle, agent: &SharedAgent) -> Result<(), NixlError> {
        if handle.is_released() {
            return Err(NixlError::HandleReleased {
                handle: handle.raw().0,
            });
        }
        if !handle.belongs_to(agent) {
            return Err(NixlError::ForeignHandle {
                handle: handle.raw().0,
                agent: self.name.clone(),
            });
        }
        Ok(())
    }

    fn check_xfer(&self, req: &XferRequest, agent: &SharedAgent) -> Result<(), NixlError> {
        if req.is_released() {
            return Err(NixlError::HandleReleased {
                handle: req.raw().0,
            });
        }
        if !req.belongs_to(agent) {
            return Err(NixlError::ForeignHandle {
                handle: req.raw().0,
                agent: self.name.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn release_dlist(&mut self, raw: RawDlistHandle) -> Result<(), NixlError> {
        tracing::trace!(agent.name = %self.name, handle = raw.0, "Releasing prepared list");
        self.engine
            .release_dlist(raw)
            .map_err(|e| NixlError::ReleaseFailed {
                handle: raw.0,
                source: Box::new(e),
            })?;
        self.handles.forget_dlist(raw);
        Ok(())
    }

    pub(crate) fn release_xfer(&mut self, raw: RawXferHandle) -> Result<(), NixlError> {
        tracing::trace!(agent.name = %self.name, handle = raw.0, "Releasing transfer request");
        self.engine
            .release_xfer_req(raw)
            .map_err(|e| NixlError::ReleaseFailed {
                handle: raw.0,
                source: Box::new(e),
            })?;
        self.handles.forget_xfer(raw);
        Ok(())
    }

    /// Retries every leaked transfer request once, returning how many were released
    fn drain_leaks(&mut self, keep_failures: bool) -> usize {
        let mut recovered = 0;
        for raw in self.handles.take_leaks() {
            match self.engine.release_xfer_req(raw) {
                Ok(()) => {
                    self.handles.forget_xfer(raw);
                    recovered += 1;
                    tracing::info!(agent.name = %self.name, handle = raw.0, "Recovered leaked transfer request");
                }
                Err(e) => {
                    tracing::error!(
                        agent.name = %self.name,
                        handle = raw.0,
                        error = ?e,
                        "Failed to release leaked transfer request"
                    );
                    if keep_failures {
                        self.handles.record_leak(raw);
                    }
                }
            }
        }
        recovered
    }

    fn poll_notifs(&mut self, scope: &[BackendHandle]) -> Result<NotificationMap, NixlError> {
        Ok(self.engine.get_notifs(scope)?.into_iter().collect())
    }

    /// Brings the peer table in line with what the engine has loaded
    fn sync_peers(&mut self) -> Result<(), NixlError> {
        let loaded = self.engine.loaded_remotes()?;
        self.peers.sync(&loaded);
        Ok(())
    }
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        tracing::trace!(agent.name = %self.name, "Dropping agent");
        if self.handles.leaked_count() > 0 {
            self.drain_leaks(false);
        }
        if let Err(e) = self.sync_peers() {
            tracing::debug!(agent.name = %self.name, error = ?e, "Failed to list loaded peers");
        }
        for peer in self.peers.names() {
            if let Err(e) = self.engine.invalidate_remote_md(&peer) {
                tracing::debug!(agent.name = %self.name, remote_agent = %peer, error = ?e, "Failed to invalidate remote metadata");
            }
        }
        let (dlists, xfers) = self.handles.live_counts();
        tracing::trace!(dlists, xfers, "Agent dropped");
    }
}

/// Transport failures of posting or polling are reported as a failed transfer
fn status_or_error(result: Result<XferStatus, NixlError>, agent: &str) -> Result<XferStatus, NixlError> {
    match result {
        Ok(status) => Ok(status),
        Err(e) if e.kind() == ErrorKind::Transport => {
            tracing::error!(agent.name = agent, error = ?e, "Transfer failed");
            Ok(XferStatus::Error)
        }
        Err(e) => Err(e),
    }
}

/// A NIXL agent that can create backends and manage memory
#[derive(Clone)]
pub struct Agent {
    inner: SharedAgent,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent").field("name", &self.name()).finish()
    }
}

impl Agent {
    /// Creates an agent with the default configuration, which creates a UCX backend
    pub fn new(name: &str, engine: impl TransferEngine + 'static) -> Result<Self, NixlError> {
        Self::with_options(name, engine, None, false)
    }

    /// Creates an agent with the backends and options of `config`
    pub fn with_config(
        name: &str,
        engine: impl TransferEngine + 'static,
        config: AgentConfig,
    ) -> Result<Self, NixlError> {
        Self::with_options(name, engine, Some(config), false)
    }

    /// Creates an agent with one backend for every available plugin
    pub fn with_all_plugins(name: &str, engine: impl TransferEngine + 'static) -> Result<Self, NixlError> {
        Self::with_options(name, engine, None, true)
    }

    /// Creates an agent from an optional config
    ///
    /// `instantiate_all` creates a backend for every available plugin. It is
    /// ignored when a config is given, since the config names the backends.
    pub fn with_options(
        name: &str,
        engine: impl TransferEngine + 'static,
        config: Option<AgentConfig>,
        instantiate_all: bool,
    ) -> Result<Self, NixlError> {
        tracing::trace!(agent.name = name, "Creating new NIXL agent");
        if name.is_empty() {
            return Err(NixlError::InvalidParam);
        }
        let instantiate_all = match (instantiate_all, config.is_some()) {
            (true, true) => {
                tracing::warn!(agent.name = name, "Ignoring instantiate_all because a config was given");
                false
            }
            (flag, _) => flag,
        };
        let mut engine: Box<dyn TransferEngine> = Box::new(engine);
        let config = config.unwrap_or_default();
        config.validate()?;

        engine.init(name, &config).map_err(|e| {
            tracing::error!(agent.name = name, error = ?e, "Failed to create agent");
            e
        })?;

        let plugins = engine.available_plugins()?;
        if plugins.is_empty() {
            tracing::error!(agent.name = name, "No plugins available");
            return Err(NixlError::NoPlugins);
        }
        let mut backends = BackendRegistry::default();
        for plugin in &plugins {
            let (mem_types, params) = engine.plugin_params(plugin)?;
            backends.insert_plugin(plugin.as_str(), PluginInfo { mem_types, params });
        }

        let mut inner = AgentInner {
            name: name.to_string(),
            engine,
            backends,
            handles: HandleRegistry::default(),
            notifs: NotificationMap::new(),
            peers: PeerTable::default(),
            config,
        };

        let wanted = if instantiate_all {
            plugins
        } else {
            inner.config.backends.clone()
        };
        for plugin in &wanted {
            if inner.backends.plugin(plugin).is_none() {
                tracing::warn!(agent.name = name, backend = %plugin, "Skipping backend, plugin not available");
                continue;
            }
            let params = inner.config.init_params_for(plugin);
            inner.create_backend(plugin, &params)?;
        }
        if inner.backends.is_empty() {
            tracing::warn!(agent.name = name, "Agent created without any backend");
        }

        tracing::info!(agent.name = name, backends = ?inner.backends.backend_names(), "Agent created");
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, AgentInner> {
        read_agent(&self.inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, AgentInner> {
        write_agent(&self.inner)
    }

    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    pub fn config(&self) -> AgentConfig {
        self.read().config.clone()
    }

    /// Gets the list of available plugins
    pub fn get_plugin_list(&self) -> Vec<String> {
        self.read().backends.plugin_names()
    }

    fn plugin_info(&self, plugin: &str) -> Result<PluginInfo, NixlError> {
        let inner = self.read();
        inner
            .backends
            .plugin(plugin)
            .cloned()
            .ok_or_else(|| NixlError::UnknownPlugin {
                name: plugin.to_string(),
                available: inner.backends.plugin_names(),
            })
    }

    pub fn get_plugin_mem_types(&self, plugin: &str) -> Result<Vec<MemType>, NixlError> {
        Ok(self.plugin_info(plugin)?.mem_types)
    }

    /// Gets the default parameters of a plugin
    pub fn get_plugin_params(&self, plugin: &str) -> Result<Params, NixlError> {
        Ok(self.plugin_info(plugin)?.params)
    }

    fn backend_registration(&self, backend: &str) -> Result<BackendRegistration, NixlError> {
        let inner = self.read();
        inner.backends.resolve_one(backend)?;
        inner
            .backends
            .backend(backend)
            .cloned()
            .ok_or(NixlError::InvalidParam)
    }

    pub fn get_backend_mem_types(&self, backend: &str) -> Result<Vec<MemType>, NixlError> {
        Ok(self.backend_registration(backend)?.mem_types)
    }

    /// Gets the effective parameters of a created backend
    pub fn get_backend_params(&self, backend: &str) -> Result<Params, NixlError> {
        Ok(self.backend_registration(backend)?.params)
    }

    pub fn get_backend(&self, backend: &str) -> Option<Backend> {
        self.read()
            .backends
            .backend(backend)
            .map(|registration| Backend::new(backend, registration.handle))
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.read().backends.backend_names()
    }

    /// Creates a new backend for the given plugin
    pub fn create_backend(&self, plugin: &str, params: &Params) -> Result<Backend, NixlError> {
        self.write().create_backend(plugin, params)
    }

    /// Builds a transfer descriptor list from any accepted region description
    pub fn get_xfer_descs<'a>(&self, input: impl Into<DescriptorInput<'a>>) -> Result<XferDescList, NixlError> {
        input.into().into_xfer_list()
    }

    /// Builds a registration descriptor list from any accepted region description
    pub fn get_reg_descs<'a>(&self, input: impl Into<DescriptorInput<'a>>) -> Result<RegDescList, NixlError> {
        input.into().into_reg_list()
    }

    /// Registers memory with the given backends, or every capable one when empty
    pub fn register_memory<'a>(
        &self,
        input: impl Into<DescriptorInput<'a>>,
        backends: &[&str],
    ) -> Result<RegDescList, NixlError> {
        let descs = input.into().into_reg_list()?;
        let mut inner = self.write();
        let scope = inner.backends.resolve(backends)?;
        tracing::trace!(
            agent.name = %inner.name,
            mem_type = %descs.mem_type(),
            count = descs.len(),
            "Registering memory"
        );
        inner.engine.register_mem(&descs, &scope).map_err(|e| {
            tracing::error!(error = ?e, "Failed to register memory");
            e
        })?;
        Ok(descs)
    }

    pub fn deregister_memory(&self, descs: &RegDescList, backends: &[&str]) -> Result<(), NixlError> {
        let mut inner = self.write();
        let scope = inner.backends.resolve(backends)?;
        tracing::trace!(agent.name = %inner.name, count = descs.len(), "Deregistering memory");
        inner.engine.deregister_mem(descs, &scope).map_err(|e| {
            tracing::error!(error = ?e, "Failed to deregister memory");
            e
        })
    }

    /// Per-descriptor information from `backend`; `None` where nothing is known
    pub fn query_memory<'a>(
        &self,
        input: impl Into<DescriptorInput<'a>>,
        backend: &str,
    ) -> Result<Vec<Option<Params>>, NixlError> {
        let descs = input.into().into_reg_list()?;
        let inner = self.read();
        let handle = inner.backends.resolve_one(backend)?;
        inner.engine.query_mem(&descs, handle)
    }

    /// Prepares a list so transfers can select descriptors by index
    pub fn prep_xfer_dlist<'a>(
        &self,
        role: DlistRole,
        input: impl Into<DescriptorInput<'a>>,
        backends: &[&str],
    ) -> Result<PreparedDlistHandle, NixlError> {
        let descs = input.into().into_xfer_list()?;
        let mut inner = self.write();
        let scope = inner.backends.resolve(backends)?;
        let engine_agent = role.engine_agent(&inner.name).to_string();
        tracing::trace!(agent.name = %inner.name, role = ?role, count = descs.len(), "Preparing descriptor list");
        let raw = inner
            .engine
            .prep_xfer_dlist(&engine_agent, &descs, &scope)
            .map_err(|e| {
                tracing::error!(role = ?role, error = ?e, "Failed to prepare descriptor list");
                e
            })?;
        inner.handles.track_dlist(raw, descs.len());
        Ok(PreparedDlistHandle::new(self.inner.clone(), raw, descs.len(), role))
    }

    /// Creates a transfer between descriptors selected from two prepared lists
    pub fn make_prepped_xfer(
        &self,
        op: XferOp,
        local: &PreparedDlistHandle,
        local_indices: &[usize],
        remote: &PreparedDlistHandle,
        remote_indices: &[usize],
        opt_args: Option<&OptArgs>,
    ) -> Result<XferRequest, NixlError> {
        let mut inner = self.write();
        inner.check_dlist(local, &self.inner)?;
        inner.check_dlist(remote, &self.inner)?;
        if local_indices.len() != remote_indices.len() {
            return Err(NixlError::IndexCountMismatch {
                local: local_indices.len(),
                remote: remote_indices.len(),
            });
        }
        inner.handles.check_indices(local.raw(), local_indices)?;
        inner.handles.check_indices(remote.raw(), remote_indices)?;
        let args = inner.xfer_args(opt_args)?;

        tracing::trace!(agent.name = %inner.name, op = %op, count = local_indices.len(), "Creating prepared transfer");
        let raw = inner
            .engine
            .make_xfer_req(op, local.raw(), local_indices, remote.raw(), remote_indices, &args)
            .map_err(|e| {
                tracing::error!(error = ?e, "Failed to create transfer request");
                e
            })?;
        inner.handles.track_xfer(raw);
        Ok(XferRequest::new(self.inner.clone(), raw))
    }

    /// Creates a transfer between two descriptor lists in one step
    pub fn initialize_xfer<'a, 'b>(
        &self,
        op: XferOp,
        local: impl Into<DescriptorInput<'a>>,
        remote: impl Into<DescriptorInput<'b>>,
        remote_agent: &str,
        opt_args: Option<&OptArgs>,
    ) -> Result<XferRequest, NixlError> {
        let local = local.into().into_xfer_list()?;
        let remote = remote.into().into_xfer_list()?;
        let mut inner = self.write();
        let args = inner.xfer_args(opt_args)?;

        tracing::trace!(agent.name = %inner.name, remote_agent, op = %op, "Creating transfer");
        let raw = inner
            .engine
            .create_xfer_req(op, &local, &remote, remote_agent, &args)
            .map_err(|e| {
                tracing::error!(remote_agent, error = ?e, "Failed to create transfer request");
                e
            })?;
        inner.handles.track_xfer(raw);
        Ok(XferRequest::new(self.inner.clone(), raw))
    }

    /// Posts a transfer; `notif` replaces any message given at creation
    pub fn transfer(&self, req: &mut XferRequest, notif: Option<&[u8]>) -> Result<XferStatus, NixlError> {
        let mut inner = self.write();
        inner.check_xfer(req, &self.inner)?;
        tracing::trace!(agent.name = %inner.name, handle = req.raw().0, "Posting transfer request");
        let result = inner.engine.post_xfer_req(req.raw(), notif);
        let status = status_or_error(result, &inner.name)?;
        req.reposted();
        Ok(req.observe(status))
    }

    /// Polls a transfer; once terminal the same status is always returned
    pub fn check_xfer_state(&self, req: &mut XferRequest) -> Result<XferStatus, NixlError> {
        let mut inner = self.write();
        inner.check_xfer(req, &self.inner)?;
        if let Some(status) = req.terminal_status() {
            return Ok(status);
        }
        let result = inner.engine.xfer_status(req.raw());
        let status = status_or_error(result, &inner.name)?;
        Ok(req.observe(status))
    }

    pub fn release_xfer_handle(&self, req: &mut XferRequest) -> Result<(), NixlError> {
        if req.is_released() {
            return Ok(());
        }
        self.read().check_xfer(req, &self.inner)?;
        req.release()
    }

    pub fn release_dlist_handle(&self, handle: &mut PreparedDlistHandle) -> Result<(), NixlError> {
        if handle.is_released() {
            return Ok(());
        }
        self.read().check_dlist(handle, &self.inner)?;
        handle.release()
    }

    pub fn estimate_xfer_cost(&self, req: &XferRequest) -> Result<CostEstimate, NixlError> {
        let inner = self.read();
        inner.check_xfer(req, &self.inner)?;
        inner.engine.estimate_xfer_cost(req.raw())
    }

    /// Telemetry of a posted transfer; requires `capture_telemetry`
    pub fn get_xfer_telemetry(&self, req: &XferRequest) -> Result<XferTelemetry, NixlError> {
        let inner = self.read();
        inner.check_xfer(req, &self.inner)?;
        if !inner.config.capture_telemetry {
            tracing::warn!(agent.name = %inner.name, "Telemetry is not enabled");
        }
        inner.engine.xfer_telemetry(req.raw())
    }

    /// Name of the backend the engine chose for a transfer
    pub fn query_xfer_backend(&self, req: &XferRequest) -> Result<String, NixlError> {
        let inner = self.read();
        inner.check_xfer(req, &self.inner)?;
        let handle = inner.engine.query_xfer_backend(req.raw())?;
        inner
            .backends
            .name_of(handle)
            .map(str::to_string)
            .ok_or_else(|| NixlError::BackendError(format!("unknown backend handle {}", handle.0)))
    }

    /// Only the notifications received through `backends` since the last poll
    pub fn get_new_notifs(&self, backends: &[&str]) -> Result<NotificationMap, NixlError> {
        let mut inner = self.write();
        let scope = inner.backends.resolve(backends)?;
        inner.poll_notifs(&scope)
    }

    /// Polls and appends new notifications to a caller-held map
    pub fn get_notifications(&self, notifs: &mut NotificationMap, backends: &[&str]) -> Result<(), NixlError> {
        let mut inner = self.write();
        let scope = inner.backends.resolve(backends)?;
        notifs.merge(inner.poll_notifs(&scope)?);
        Ok(())
    }

    /// Polls into the agent's own mailbox and returns a snapshot of it
    pub fn update_notifs(&self, backends: &[&str]) -> Result<NotificationMap, NixlError> {
        let mut inner = self.write();
        let scope = inner.backends.resolve(backends)?;
        let delta = inner.poll_notifs(&scope)?;
        inner.notifs.merge(delta);
        Ok(inner.notifs.clone())
    }

    /// Consumes the first queued notification from `remote_agent` matching `tag`
    pub fn check_remote_xfer_done(
        &self,
        remote_agent: &str,
        tag: &[u8],
        mode: TagMatch,
        backends: &[&str],
    ) -> Result<bool, NixlError> {
        let mut inner = self.write();
        let scope = inner.backends.resolve(backends)?;
        let delta = inner.poll_notifs(&scope)?;
        inner.notifs.merge(delta);
        Ok(inner.notifs.take_first_match(remote_agent, tag, mode).is_some())
    }

    /// Sends a notification to a peer without any transfer
    pub fn send_notification(&self, remote_agent: &str, message: &[u8], backend: Option<&str>) -> Result<(), NixlError> {
        let mut inner = self.write();
        let backend = backend
            .map(|name| inner.backends.resolve_one(name))
            .transpose()?;
        inner.engine.gen_notif(remote_agent, message, backend).map_err(|e| {
            tracing::error!(remote_agent, error = ?e, "Failed to send notification");
            e
        })
    }

    /// Exports this agent's full metadata
    pub fn get_local_md(&self) -> Result<Vec<u8>, NixlError> {
        self.read().engine.get_local_md()
    }

    /// Exports metadata covering only `descs`, optionally with connection info
    pub fn get_local_partial_md(
        &self,
        descs: &RegDescList,
        include_conn_info: bool,
        backends: &[&str],
    ) -> Result<Vec<u8>, NixlError> {
        let inner = self.read();
        let scope = inner.backends.resolve(backends)?;
        inner.engine.get_local_partial_md(descs, include_conn_info, &scope)
    }

    /// Loads metadata of a remote agent and returns its name
    pub fn load_remote_md(&self, metadata: &[u8]) -> Result<String, NixlError> {
        let mut inner = self.write();
        let remote_agent = inner.engine.load_remote_md(metadata).map_err(|e| {
            tracing::error!(error = ?e, "Failed to load remote metadata");
            e
        })?;
        inner.peers.loaded(&remote_agent);
        tracing::info!(agent.name = %inner.name, remote_agent = %remote_agent, "Loaded remote metadata");
        Ok(remote_agent)
    }

    pub fn invalidate_remote_md(&self, remote_agent: &str) -> Result<(), NixlError> {
        let mut inner = self.write();
        inner.peers.invalidate(remote_agent);
        inner.engine.invalidate_remote_md(remote_agent).map_err(|e| {
            tracing::error!(remote_agent, error = ?e, "Failed to invalidate remote metadata");
            e
        })
    }

    /// Invalidates every loaded peer; failures are logged and skipped
    pub fn invalidate_all_remotes(&self) {
        let mut inner = self.write();
        if let Err(e) = inner.sync_peers() {
            tracing::warn!(agent.name = %inner.name, error = ?e, "Failed to list loaded peers");
        }
        for peer in inner.peers.names() {
            if let Err(e) = inner.engine.invalidate_remote_md(&peer) {
                tracing::warn!(remote_agent = %peer, error = ?e, "Failed to invalidate remote metadata");
            }
        }
        inner.peers.clear();
    }

    /// Establishes a connection to a loaded peer ahead of the first transfer
    pub fn make_connection(&self, remote_agent: &str, backends: &[&str]) -> Result<(), NixlError> {
        let mut inner = self.write();
        let scope = inner.backends.resolve(backends)?;
        inner.engine.make_connection(remote_agent, &scope)?;
        inner.peers.connected(remote_agent);
        Ok(())
    }

    pub fn send_local_md(&self, target: &MetadataTarget) -> Result<(), NixlError> {
        let mut inner = self.write();
        tracing::trace!(agent.name = %inner.name, target = %target, "Sending local metadata");
        inner.engine.send_local_md(target)
    }

    pub fn send_local_partial_md(
        &self,
        descs: &RegDescList,
        include_conn_info: bool,
        backends: &[&str],
        target: &MetadataTarget,
    ) -> Result<(), NixlError> {
        let mut inner = self.write();
        let scope = inner.backends.resolve(backends)?;
        inner
            .engine
            .send_local_partial_md(descs, include_conn_info, &scope, target)
    }

    /// Requests a peer's metadata; poll [`Agent::check_remote_metadata`] for arrival
    pub fn fetch_remote_md(&self, remote_agent: &str, target: &MetadataTarget) -> Result<(), NixlError> {
        let mut inner = self.write();
        tracing::trace!(agent.name = %inner.name, remote_agent, target = %target, "Fetching remote metadata");
        inner.engine.fetch_remote_md(remote_agent, target)
    }

    pub fn invalidate_local_md(&self, target: &MetadataTarget) -> Result<(), NixlError> {
        self.write().engine.invalidate_local_md(target)
    }

    /// Whether metadata of `remote_agent`, and optionally of `descs`, is available
    pub fn check_remote_metadata(
        &self,
        remote_agent: &str,
        descs: Option<&XferDescList>,
    ) -> Result<bool, NixlError> {
        let mut inner = self.write();
        let available = inner.engine.check_remote_md(remote_agent, descs)?;
        inner.sync_peers()?;
        Ok(available)
    }

    /// What this agent knows about `remote_agent`, including metadata pushed by peers
    pub fn peer_state(&self, remote_agent: &str) -> Result<Option<PeerState>, NixlError> {
        let mut inner = self.write();
        inner.sync_peers()?;
        Ok(inner.peers.get(remote_agent))
    }

    /// Names of peers whose metadata is loaded
    pub fn remote_agents(&self) -> Result<Vec<String>, NixlError> {
        let mut inner = self.write();
        inner.sync_peers()?;
        Ok(inner.peers.names())
    }

    /// Retries releasing transfer requests whose release failed when dropped
    ///
    /// Returns the number released. Requests that still fail stay recorded.
    pub fn recover_leaked_handles(&self) -> usize {
        self.write().drain_leaks(true)
    }

    pub fn leaked_handle_count(&self) -> usize {
        self.read().handles.leaked_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{InMemoryFabric, PluginSpec};

    fn agent(fabric: &InMemoryFabric, name: &str) -> Agent {
        Agent::new(name, fabric.engine()).expect("Failed to create agent")
    }

    #[test]
    fn test_agent_creation() {
        let fabric = InMemoryFabric::new();
        let agent = agent(&fabric, "test_agent");
        assert_eq!(agent.name(), "test_agent");
        assert_eq!(agent.backend_names(), vec!["UCX".to_string()]);
        assert!(agent.get_plugin_list().contains(&"POSIX".to_string()));
    }

    #[test]
    fn test_empty_name_rejected() {
        let fabric = InMemoryFabric::new();
        assert!(matches!(
            Agent::new("", fabric.engine()),
            Err(NixlError::InvalidParam)
        ));
    }

    #[test]
    fn test_no_plugins() {
        let fabric = InMemoryFabric::with_plugins(Vec::<PluginSpec>::new());
        assert!(matches!(
            Agent::new("lonely", fabric.engine()),
            Err(NixlError::NoPlugins)
        ));
    }

    #[test]
    fn test_config_skips_missing_plugins() {
        let fabric = InMemoryFabric::new();
        let config = AgentConfig::with_backends(["POSIX", "LIBFABRIC", "GDS_MT"]);
        let agent = Agent::with_config("configured", fabric.engine(), config).unwrap();
        assert_eq!(
            agent.backend_names(),
            vec!["GDS_MT".to_string(), "POSIX".to_string()]
        );
    }

    #[test]
    fn test_num_threads_reaches_backend() {
        let fabric = InMemoryFabric::new();
        let config = AgentConfig {
            num_threads: 6,
            backends: vec!["UCX".to_string(), "GDS_MT".to_string()],
            ..AgentConfig::default()
        };
        let agent = Agent::with_config("threads", fabric.engine(), config).unwrap();
        assert_eq!(
            agent.get_backend_params("UCX").unwrap().get("num_threads"),
            Some("6")
        );
        assert_eq!(
            agent.get_backend_params("GDS_MT").unwrap().get("thread_count"),
            Some("6")
        );
    }

    #[test]
    fn test_instantiate_all() {
        let fabric = InMemoryFabric::new();
        let agent = Agent::with_all_plugins("everything", fabric.engine()).unwrap();
        assert_eq!(agent.backend_names().len(), agent.get_plugin_list().len());

        let config = AgentConfig::with_backends(["POSIX"]);
        let agent = Agent::with_options("configured", fabric.engine(), Some(config), true).unwrap();
        assert_eq!(agent.backend_names(), vec!["POSIX".to_string()]);
    }

    #[test]
    fn test_plugin_and_backend_introspection() {
        let fabric = InMemoryFabric::new();
        let agent = agent(&fabric, "introspect");

        assert_eq!(
            agent.get_plugin_mem_types("POSIX").unwrap(),
            vec![MemType::Dram, MemType::File]
        );
        assert_eq!(agent.get_plugin_params("GDS").unwrap().get("batch_limit"), Some("128"));
        assert!(matches!(
            agent.get_plugin_params("NOPE"),
            Err(NixlError::UnknownPlugin { .. })
        ));
        assert!(matches!(
            agent.get_backend_params("POSIX"),
            Err(NixlError::UnknownBackend { .. })
        ));

        let posix = agent.create_backend("POSIX", &Params::new()).unwrap();
        assert_eq!(posix.name(), "POSIX");
        assert_eq!(agent.get_backend("POSIX"), Some(posix));
        assert_eq!(
            agent.get_backend_mem_types("POSIX").unwrap(),
            vec![MemType::Dram, MemType::File]
        );
    }

    #[test]
    fn test_opt_args() {
        let mut args = OptArgs::new();
        assert!(!args.has_notification());
        args.set_notification_message(b"test notification");
        assert_eq!(args.get_notification_message(), Some(b"test notification".as_slice()));
        args.clear_notification();
        assert!(!args.has_notification());

        args.set_skip_descriptor_merge(true);
        assert!(args.skip_descriptor_merge());

        let args = OptArgs::new().with_backend("UCX").with_notification(b"x");
        assert_eq!(args.backends(), &["UCX".to_string()]);
    }

    #[test]
    fn test_register_and_query_memory() {
        let fabric = InMemoryFabric::new();
        let agent = agent(&fabric, "memory");
        let storage = SystemStorage::new(1024).unwrap();

        let descs = agent.register_memory(&storage, &[]).unwrap();
        assert_eq!(descs.len(), 1);

        let info = agent.query_memory(descs.clone(), "UCX").unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].as_ref().unwrap().get("size"), Some("1024"));

        agent.deregister_memory(&descs, &[]).unwrap();
        assert!(agent.query_memory(descs.clone(), "UCX").unwrap()[0].is_none());
        assert!(agent.deregister_memory(&descs, &[]).is_err());
    }

    #[test]
    fn test_register_with_unknown_backend_does_nothing() {
        let fabric = InMemoryFabric::new();
        let agent = agent(&fabric, "scoped");
        let storage = SystemStorage::new(64).unwrap();

        let err = agent.register_memory(&storage, &["UCX", "BOGUS"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownBackend);
        let descs = agent.get_reg_descs(&storage).unwrap();
        assert!(agent.query_memory(descs, "UCX").unwrap()[0].is_none());
    }

    #[test]
    fn test_invalidate_all_remotes() {
        let fabric = InMemoryFabric::new();
        let local = agent(&fabric, "local");
        for name in ["peer-a", "peer-b"] {
            let peer = agent(&fabric, name);
            assert_eq!(local.load_remote_md(&peer.get_local_md().unwrap()).unwrap(), name);
        }
        assert_eq!(local.remote_agents().unwrap().len(), 2);

        local.invalidate_all_remotes();
        assert!(local.remote_agents().unwrap().is_empty());
        assert!(!local.check_remote_metadata("peer-a", None).unwrap());
    }
}
