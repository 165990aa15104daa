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

//! In-process engine for tests and demos
//!
//! Engines created from the same [`InMemoryFabric`] can exchange metadata and
//! notifications and run transfers against each other's registered memory.
//! No bytes are moved: a posted transfer completes after a configurable number
//! of status polls, at which point its notification is delivered.

use super::{
    BackendHandle, RawDlistHandle, RawXferHandle, TransferEngine, XferArgs, NIXL_INIT_AGENT,
};
use crate::{
    AgentConfig, CostEstimate, CostMethod, MemType, MetadataTarget, NixlError, Params, RegDesc,
    RegDescList, XferDesc, XferDescList, XferOp, XferStatus, XferTelemetry,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Bandwidth assumed by cost estimates, in bytes per second
const SIMULATED_BANDWIDTH: f64 = 25.0e9;

/// A plugin offered by the fabric
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    pub mem_types: Vec<MemType>,
    pub params: Params,
}

impl PluginSpec {
    pub fn new<'a>(
        name: impl Into<String>,
        mem_types: impl IntoIterator<Item = MemType>,
        params: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        Self {
            name: name.into(),
            mem_types: mem_types.into_iter().collect(),
            params: params.into_iter().collect(),
        }
    }
}

fn default_plugins() -> Vec<PluginSpec> {
    vec![
        PluginSpec::new(
            "UCX",
            [MemType::Dram, MemType::Vram],
            [("num_threads", "0"), ("device_list", "all")],
        ),
        PluginSpec::new("POSIX", [MemType::Dram, MemType::File], [("use_aio", "false")]),
        PluginSpec::new("GDS", [MemType::Vram, MemType::File], [("batch_limit", "128")]),
        PluginSpec::new("GDS_MT", [MemType::Vram, MemType::File], [("thread_count", "1")]),
        PluginSpec::new(
            "OBJ",
            [MemType::Dram, MemType::Object],
            [("bucket", "nixl"), ("num_threads", "0")],
        ),
    ]
}

#[derive(Debug, Clone, Copy)]
struct Knobs {
    polls_to_complete: u32,
    fail_transfers: bool,
    cancellable: bool,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            polls_to_complete: 1,
            fail_transfers: false,
            cancellable: true,
        }
    }
}

#[derive(Debug)]
enum MdEvent {
    Load(Vec<u8>),
    Invalidate(String),
}

#[derive(Debug)]
struct Delivered {
    from: String,
    backend: String,
    msg: Vec<u8>,
}

#[derive(Debug, Default)]
struct FabricState {
    plugins: Vec<PluginSpec>,
    knobs: Knobs,
    agents: BTreeSet<String>,
    /// Latest full metadata of every agent, served to peer fetches
    published: HashMap<String, Vec<u8>>,
    /// Central metadata store keyed by agent name or label
    registry: HashMap<String, Vec<u8>>,
    listeners: HashMap<SocketAddr, String>,
    md_inbox: HashMap<String, Vec<MdEvent>>,
    notif_inbox: HashMap<String, Vec<Delivered>>,
}

/// Shared medium connecting in-memory engines
#[derive(Debug, Clone)]
pub struct InMemoryFabric {
    state: Arc<Mutex<FabricState>>,
}

impl Default for InMemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFabric {
    /// A fabric offering the UCX, POSIX, GDS, GDS_MT and OBJ plugins
    pub fn new() -> Self {
        Self::with_plugins(default_plugins())
    }

    pub fn with_plugins(plugins: impl IntoIterator<Item = PluginSpec>) -> Self {
        let state = FabricState {
            plugins: plugins.into_iter().collect(),
            ..FabricState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A new, uninitialized engine attached to this fabric
    pub fn engine(&self) -> InMemoryEngine {
        InMemoryEngine::new(self.clone())
    }

    /// Address an agent listening on `port` is reachable at
    pub fn listen_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Status polls a posted transfer needs before it completes; 0 completes on post
    pub fn set_polls_to_complete(&self, polls: u32) {
        self.lock().knobs.polls_to_complete = polls;
    }

    /// Make every subsequently posted transfer fail
    pub fn set_fail_transfers(&self, fail: bool) {
        self.lock().knobs.fail_transfers = fail;
    }

    /// Whether releasing an in-progress transfer cancels it or fails
    pub fn set_cancellable(&self, cancellable: bool) {
        self.lock().knobs.cancellable = cancellable;
    }

    pub fn registry_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().registry.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Notifications delivered to `agent` and not yet collected
    pub fn pending_notifications(&self, agent: &str) -> usize {
        self.lock().notif_inbox.get(agent).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataBlob {
    agent: String,
    /// Full exports replace what a peer knows; partial ones add to it
    full: bool,
    conn_info: bool,
    backends: Vec<String>,
    regions: Vec<(MemType, XferDesc)>,
}

#[derive(Debug)]
struct BackendState {
    plugin: String,
    mem_types: Vec<MemType>,
    params: Params,
}

#[derive(Debug, Default)]
struct RemoteView {
    backends: Vec<String>,
    regions: Vec<(MemType, XferDesc)>,
}

#[derive(Debug)]
struct PreppedDlist {
    agent: String,
    descs: XferDescList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XferPhase {
    Created,
    Posted { polls_left: u32 },
    Done,
    Failed,
}

#[derive(Debug)]
struct XferState {
    remote_agent: String,
    backend: BackendHandle,
    bytes: u64,
    desc_count: usize,
    notif: Option<Vec<u8>>,
    phase: XferPhase,
    posted_at: Option<Instant>,
    telemetry: XferTelemetry,
}

/// One agent's view of an [`InMemoryFabric`]
#[derive(Debug)]
pub struct InMemoryEngine {
    fabric: InMemoryFabric,
    name: String,
    initialized: bool,
    capture_telemetry: bool,
    listen_addr: Option<SocketAddr>,
    next_handle: u64,
    backends: BTreeMap<BackendHandle, BackendState>,
    registered: Vec<(BackendHandle, MemType, RegDesc)>,
    remotes: HashMap<String, RemoteView>,
    connected: HashSet<String>,
    dlists: HashMap<RawDlistHandle, PreppedDlist>,
    xfers: HashMap<RawXferHandle, XferState>,
    pending_fetches: Vec<(String, MetadataTarget)>,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

fn first_uncovered<'a>(
    list: &'a XferDescList,
    regions: &[(MemType, XferDesc)],
) -> Option<&'a XferDesc> {
    list.iter().find(|desc| {
        !regions
            .iter()
            .any(|(mem_type, region)| *mem_type == list.mem_type() && region.contains(desc))
    })
}

fn not_registered(owner: &str, desc: &XferDesc) -> NixlError {
    NixlError::BackendError(format!(
        "region {:#x}+{} on device {} is not registered by '{owner}'",
        desc.addr, desc.len, desc.dev_id
    ))
}

fn lookup_md(fabric: &FabricState, remote: &str, target: &MetadataTarget) -> Option<Vec<u8>> {
    match target {
        MetadataTarget::Peer { addr, port } => {
            let listener = fabric.listeners.get(&SocketAddr::new(*addr, *port))?;
            if listener != remote {
                return None;
            }
            fabric.published.get(remote).cloned()
        }
        MetadataTarget::Registry { label } => {
            let key = if label.is_empty() { remote } else { label.as_str() };
            fabric.registry.get(key).cloned()
        }
    }
}

impl InMemoryEngine {
    pub fn new(fabric: InMemoryFabric) -> Self {
        Self {
            fabric,
            name: String::new(),
            initialized: false,
            capture_telemetry: false,
            listen_addr: None,
            next_handle: 0,
            backends: BTreeMap::new(),
            registered: Vec::new(),
            remotes: HashMap::new(),
            connected: HashSet::new(),
            dlists: HashMap::new(),
            xfers: HashMap::new(),
            pending_fetches: Vec::new(),
        }
    }

    /// Address this engine accepts pushed metadata on, if listening
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    fn next_id(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn in_scope(scope: &[BackendHandle], handle: &BackendHandle) -> bool {
        scope.is_empty() || scope.contains(handle)
    }

    fn backend_names(&self, scope: &[BackendHandle]) -> Vec<String> {
        self.backends
            .iter()
            .filter(|(handle, _)| Self::in_scope(scope, handle))
            .map(|(_, backend)| backend.plugin.clone())
            .collect()
    }

    /// Backends in `scope` able to handle `mem_type`
    fn backends_for(
        &self,
        mem_type: MemType,
        scope: &[BackendHandle],
    ) -> Result<Vec<BackendHandle>, NixlError> {
        if let Some(unknown) = scope.iter().find(|h| !self.backends.contains_key(*h)) {
            return Err(NixlError::BackendError(format!(
                "backend handle {} does not belong to '{}'",
                unknown.0, self.name
            )));
        }
        let mut supported = Vec::new();
        for (handle, backend) in &self.backends {
            if !Self::in_scope(scope, handle) {
                continue;
            }
            if backend.mem_types.contains(&mem_type) {
                supported.push(*handle);
            } else if !scope.is_empty() {
                return Err(NixlError::NotSupported);
            }
        }
        if supported.is_empty() {
            return Err(NixlError::BackendError(format!(
                "no backend supports {mem_type} memory"
            )));
        }
        Ok(supported)
    }

    fn registered_regions(&self, scope: &[BackendHandle]) -> Vec<(MemType, XferDesc)> {
        let mut regions: Vec<(MemType, XferDesc)> = Vec::new();
        for (handle, mem_type, desc) in &self.registered {
            let region = (*mem_type, desc.as_xfer());
            if Self::in_scope(scope, handle) && !regions.contains(&region) {
                regions.push(region);
            }
        }
        regions
    }

    fn encode(
        &self,
        full: bool,
        conn_info: bool,
        scope: &[BackendHandle],
        regions: Vec<(MemType, XferDesc)>,
    ) -> Result<Vec<u8>, NixlError> {
        let blob = MetadataBlob {
            agent: self.name.clone(),
            full,
            conn_info,
            backends: self.backend_names(scope),
            regions,
        };
        Ok(bincode::serialize(&blob)?)
    }

    fn full_md(&self) -> Result<Vec<u8>, NixlError> {
        self.encode(true, true, &[], self.registered_regions(&[]))
    }

    fn partial_md(
        &self,
        descs: &RegDescList,
        include_conn_info: bool,
        backends: &[BackendHandle],
    ) -> Result<Vec<u8>, NixlError> {
        if descs.is_empty() && !include_conn_info {
            return Err(NixlError::InvalidParam);
        }
        let registered = self.registered_regions(backends);
        let trimmed = descs.trim();
        if let Some(desc) = first_uncovered(&trimmed, &registered) {
            return Err(not_registered(&self.name, desc));
        }
        let regions = trimmed
            .iter()
            .map(|desc| (trimmed.mem_type(), *desc))
            .collect();
        self.encode(false, include_conn_info, backends, regions)
    }

    /// Refreshes the metadata peers fetch from this agent
    fn publish(&self) {
        match self.full_md() {
            Ok(blob) => {
                self.fabric.lock().published.insert(self.name.clone(), blob);
            }
            Err(e) => tracing::error!(error = ?e, "Failed to publish local metadata"),
        }
    }

    fn load_blob(&mut self, md: &[u8]) -> Result<String, NixlError> {
        let blob: MetadataBlob = bincode::deserialize(md)?;
        if blob.agent == self.name {
            return Err(NixlError::InvalidParam);
        }
        match self.remotes.get_mut(&blob.agent) {
            Some(view) => {
                if blob.conn_info {
                    view.backends = blob.backends;
                }
                if blob.full {
                    view.regions = blob.regions;
                } else {
                    for region in blob.regions {
                        if !view.regions.contains(&region) {
                            view.regions.push(region);
                        }
                    }
                }
            }
            None if blob.conn_info => {
                self.remotes.insert(
                    blob.agent.clone(),
                    RemoteView {
                        backends: blob.backends,
                        regions: blob.regions,
                    },
                );
            }
            None => {
                return Err(NixlError::Metadata(format!(
                    "no connection info loaded for '{}'",
                    blob.agent
                )))
            }
        }
        Ok(blob.agent)
    }

    /// Applies metadata pushed by peers and resolves pending fetches
    fn progress(&mut self) {
        let (events, fetched) = {
            let mut fabric = self.fabric.lock();
            let events = fabric.md_inbox.remove(&self.name).unwrap_or_default();
            let mut fetched = Vec::new();
            self.pending_fetches
                .retain(|(remote, target)| match lookup_md(&fabric, remote, target) {
                    Some(blob) => {
                        fetched.push(blob);
                        false
                    }
                    None => true,
                });
            (events, fetched)
        };

        for event in events {
            match event {
                MdEvent::Load(blob) => {
                    if let Err(e) = self.load_blob(&blob) {
                        tracing::warn!(error = ?e, "Dropping metadata pushed by a peer");
                    }
                }
                MdEvent::Invalidate(remote) => {
                    self.remotes.remove(&remote);
                    self.connected.remove(&remote);
                }
            }
        }
        for blob in fetched {
            if let Err(e) = self.load_blob(&blob) {
                tracing::warn!(error = ?e, "Dropping fetched metadata");
            }
        }
    }

    fn deliver_md(&self, target: &MetadataTarget, blob: Vec<u8>) -> Result<(), NixlError> {
        let mut fabric = self.fabric.lock();
        match target {
            MetadataTarget::Peer { addr, port } => {
                let addr = SocketAddr::new(*addr, *port);
                let peer = fabric
                    .listeners
                    .get(&addr)
                    .cloned()
                    .ok_or_else(|| NixlError::Metadata(format!("no agent listening on {addr}")))?;
                fabric
                    .md_inbox
                    .entry(peer)
                    .or_default()
                    .push(MdEvent::Load(blob));
            }
            MetadataTarget::Registry { label } => {
                let key = if label.is_empty() { &self.name } else { label };
                fabric.registry.insert(key.clone(), blob);
            }
        }
        Ok(())
    }

    fn remote_backends(&self, remote_agent: &str) -> Result<Vec<String>, NixlError> {
        if remote_agent == self.name {
            return Ok(self.backend_names(&[]));
        }
        self.remotes
            .get(remote_agent)
            .map(|view| view.backends.clone())
            .ok_or_else(|| NixlError::UnknownRemote(remote_agent.to_string()))
    }

    fn remote_regions(&self, remote_agent: &str) -> Result<Vec<(MemType, XferDesc)>, NixlError> {
        if remote_agent == self.name {
            return Ok(self.registered_regions(&[]));
        }
        self.remotes
            .get(remote_agent)
            .map(|view| view.regions.clone())
            .ok_or_else(|| NixlError::UnknownRemote(remote_agent.to_string()))
    }

    fn select_backend(
        &self,
        mem_type: MemType,
        remote_agent: &str,
        scope: &[BackendHandle],
    ) -> Result<BackendHandle, NixlError> {
        let remote_backends = self.remote_backends(remote_agent)?;
        self.backends_for(mem_type, scope)?
            .into_iter()
            .find(|handle| {
                self.backends
                    .get(handle)
                    .is_some_and(|backend| remote_backends.contains(&backend.plugin))
            })
            .ok_or_else(|| {
                NixlError::BackendError(format!(
                    "no backend shared with '{remote_agent}' supports {mem_type} memory"
                ))
            })
    }

    fn new_request(
        &mut self,
        local: &XferDescList,
        remote: &XferDescList,
        remote_agent: &str,
        args: &XferArgs,
    ) -> Result<RawXferHandle, NixlError> {
        if local.len() != remote.len()
            || local.iter().zip(remote.iter()).any(|(l, r)| l.len != r.len)
        {
            return Err(NixlError::InvalidParam);
        }
        let backend = self.select_backend(local.mem_type(), remote_agent, &args.backends)?;
        let handle = RawXferHandle(self.next_id());
        self.xfers.insert(
            handle,
            XferState {
                remote_agent: remote_agent.to_string(),
                backend,
                bytes: local.total_bytes(),
                desc_count: local.len(),
                notif: args.notif.clone(),
                phase: XferPhase::Created,
                posted_at: None,
                telemetry: XferTelemetry::default(),
            },
        );
        Ok(handle)
    }

    /// Records completion and delivers the transfer's notification
    fn finish(&mut self, req: RawXferHandle) {
        let Some(state) = self.xfers.get_mut(&req) else {
            return;
        };
        if let Some(posted_at) = state.posted_at {
            state.telemetry.xfer_duration = posted_at.elapsed();
        }
        let Some(msg) = state.notif.clone() else {
            return;
        };
        let backend = self
            .backends
            .get(&state.backend)
            .map(|backend| backend.plugin.clone())
            .unwrap_or_default();
        self.fabric
            .lock()
            .notif_inbox
            .entry(state.remote_agent.clone())
            .or_default()
            .push(Delivered {
                from: self.name.clone(),
                backend,
                msg,
            });
    }

    fn xfer(&self, req: RawXferHandle) -> Result<&XferState, NixlError> {
        self.xfers.get(&req).ok_or(NixlError::InvalidParam)
    }
}

impl Drop for InMemoryEngine {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }
        let mut fabric = self.fabric.lock();
        fabric.agents.remove(&self.name);
        fabric.published.remove(&self.name);
        fabric.md_inbox.remove(&self.name);
        fabric.notif_inbox.remove(&self.name);
        if let Some(addr) = self.listen_addr {
            fabric.listeners.remove(&addr);
        }
    }
}

impl TransferEngine for InMemoryEngine {
    fn init(&mut self, agent_name: &str, config: &AgentConfig) -> Result<(), NixlError> {
        {
            let mut fabric = self.fabric.lock();
            if fabric.agents.contains(agent_name) {
                return Err(NixlError::BackendError(format!(
                    "agent '{agent_name}' already exists on this fabric"
                )));
            }
            if let Some(port) = config.effective_listen_port() {
                let addr = InMemoryFabric::listen_addr(port);
                if fabric.listeners.contains_key(&addr) {
                    return Err(NixlError::BackendError(format!("{addr} is already in use")));
                }
                fabric.listeners.insert(addr, agent_name.to_string());
                self.listen_addr = Some(addr);
            }
            fabric.agents.insert(agent_name.to_string());
        }
        self.name = agent_name.to_string();
        self.initialized = true;
        self.capture_telemetry = config.capture_telemetry;
        self.publish();
        Ok(())
    }

    fn available_plugins(&self) -> Result<Vec<String>, NixlError> {
        Ok(self
            .fabric
            .lock()
            .plugins
            .iter()
            .map(|plugin| plugin.name.clone())
            .collect())
    }

    fn plugin_params(&self, plugin: &str) -> Result<(Vec<MemType>, Params), NixlError> {
        let fabric = self.fabric.lock();
        fabric
            .plugins
            .iter()
            .find(|spec| spec.name == plugin)
            .map(|spec| (spec.mem_types.clone(), spec.params.clone()))
            .ok_or_else(|| NixlError::UnknownPlugin {
                name: plugin.to_string(),
                available: fabric.plugins.iter().map(|p| p.name.clone()).collect(),
            })
    }

    fn create_backend(
        &mut self,
        plugin: &str,
        params: &Params,
    ) -> Result<BackendHandle, NixlError> {
        let (mem_types, defaults) = self.plugin_params(plugin)?;
        if self.backends.values().any(|backend| backend.plugin == plugin) {
            return Err(NixlError::BackendError(format!(
                "backend {plugin} was already created"
            )));
        }
        let handle = BackendHandle(self.next_id());
        self.backends.insert(
            handle,
            BackendState {
                plugin: plugin.to_string(),
                mem_types,
                params: defaults.merged_with(params),
            },
        );
        self.publish();
        Ok(handle)
    }

    fn backend_params(&self, backend: BackendHandle) -> Result<(Vec<MemType>, Params), NixlError> {
        self.backends
            .get(&backend)
            .map(|state| (state.mem_types.clone(), state.params.clone()))
            .ok_or(NixlError::InvalidParam)
    }

    fn register_mem(
        &mut self,
        descs: &RegDescList,
        backends: &[BackendHandle],
    ) -> Result<(), NixlError> {
        let targets = self.backends_for(descs.mem_type(), backends)?;
        for backend in targets {
            for desc in descs.iter() {
                self.registered
                    .push((backend, descs.mem_type(), desc.clone()));
            }
        }
        self.publish();
        Ok(())
    }

    fn deregister_mem(
        &mut self,
        descs: &RegDescList,
        backends: &[BackendHandle],
    ) -> Result<(), NixlError> {
        let mem_type = descs.mem_type();
        let targets = self.backends_for(mem_type, backends)?;
        for desc in descs.iter() {
            let found = self.registered.iter().any(|(handle, registered_type, registered)| {
                *registered_type == mem_type && registered == desc && targets.contains(handle)
            });
            if !found {
                return Err(not_registered(&self.name, &desc.as_xfer()));
            }
        }
        self.registered.retain(|(handle, registered_type, registered)| {
            !(*registered_type == mem_type
                && targets.contains(handle)
                && descs.iter().any(|desc| desc == registered))
        });
        self.publish();
        Ok(())
    }

    fn query_mem(
        &self,
        descs: &RegDescList,
        backend: BackendHandle,
    ) -> Result<Vec<Option<Params>>, NixlError> {
        let state = self.backends.get(&backend).ok_or(NixlError::InvalidParam)?;
        if !state.mem_types.contains(&descs.mem_type()) {
            return Err(NixlError::NotSupported);
        }
        Ok(descs
            .iter()
            .map(|desc| {
                self.registered
                    .iter()
                    .find(|(handle, mem_type, registered)| {
                        *handle == backend
                            && *mem_type == descs.mem_type()
                            && registered.as_xfer().contains(&desc.as_xfer())
                    })
                    .map(|(_, mem_type, registered)| {
                        let mut info = Params::new();
                        info.insert("mem_type", mem_type.to_string());
                        info.insert("size", registered.len.to_string());
                        info.insert("backend", state.plugin.clone());
                        info
                    })
            })
            .collect())
    }

    fn prep_xfer_dlist(
        &mut self,
        agent: &str,
        descs: &XferDescList,
        backends: &[BackendHandle],
    ) -> Result<RawDlistHandle, NixlError> {
        let (owner, regions) = if agent == NIXL_INIT_AGENT || agent == self.name {
            (self.name.clone(), self.registered_regions(backends))
        } else {
            (agent.to_string(), self.remote_regions(agent)?)
        };
        if let Some(desc) = first_uncovered(descs, &regions) {
            return Err(not_registered(&owner, desc));
        }
        let handle = RawDlistHandle(self.next_id());
        self.dlists.insert(
            handle,
            PreppedDlist {
                agent: agent.to_string(),
                descs: descs.clone(),
            },
        );
        Ok(handle)
    }

    fn release_dlist(&mut self, handle: RawDlistHandle) -> Result<(), NixlError> {
        self.dlists
            .remove(&handle)
            .map(|_| ())
            .ok_or(NixlError::InvalidParam)
    }

    fn make_xfer_req(
        &mut self,
        _op: XferOp,
        local: RawDlistHandle,
        local_indices: &[usize],
        remote: RawDlistHandle,
        remote_indices: &[usize],
        args: &XferArgs,
    ) -> Result<RawXferHandle, NixlError> {
        let local_list = self.dlists.get(&local).ok_or(NixlError::InvalidParam)?;
        let remote_list = self.dlists.get(&remote).ok_or(NixlError::InvalidParam)?;
        if local_list.agent != NIXL_INIT_AGENT {
            return Err(NixlError::InvalidParam);
        }
        if local_indices.len() != remote_indices.len() {
            return Err(NixlError::IndexCountMismatch {
                local: local_indices.len(),
                remote: remote_indices.len(),
            });
        }

        let select = |list: &XferDescList, indices: &[usize]| {
            indices
                .iter()
                .map(|&index| {
                    list.get(index).copied().ok_or(NixlError::IndexOutOfRange {
                        index,
                        len: list.len(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(|descs| XferDescList::from_descs(list.mem_type(), descs))
        };
        let local_descs = select(&local_list.descs, local_indices)?;
        let remote_descs = select(&remote_list.descs, remote_indices)?;
        let remote_agent = if remote_list.agent == NIXL_INIT_AGENT {
            self.name.clone()
        } else {
            remote_list.agent.clone()
        };
        self.new_request(&local_descs, &remote_descs, &remote_agent, args)
    }

    fn create_xfer_req(
        &mut self,
        _op: XferOp,
        local: &XferDescList,
        remote: &XferDescList,
        remote_agent: &str,
        args: &XferArgs,
    ) -> Result<RawXferHandle, NixlError> {
        if let Some(desc) = first_uncovered(local, &self.registered_regions(&args.backends)) {
            return Err(not_registered(&self.name, desc));
        }
        if let Some(desc) = first_uncovered(remote, &self.remote_regions(remote_agent)?) {
            return Err(not_registered(remote_agent, desc));
        }
        self.new_request(local, remote, remote_agent, args)
    }

    fn post_xfer_req(
        &mut self,
        req: RawXferHandle,
        notif: Option<&[u8]>,
    ) -> Result<XferStatus, NixlError> {
        let knobs = self.fabric.lock().knobs;
        let state = self.xfers.get_mut(&req).ok_or(NixlError::InvalidParam)?;
        if matches!(state.phase, XferPhase::Posted { .. }) {
            tracing::error!(handle = req.0, "Transfer is already in progress");
            return Err(NixlError::InvalidParam);
        }
        if let Some(notif) = notif {
            state.notif = Some(notif.to_vec());
        }

        let started = Instant::now();
        state.posted_at = Some(started);
        state.telemetry = XferTelemetry {
            start_time_us: now_us(),
            total_bytes: state.bytes,
            desc_count: state.desc_count,
            ..XferTelemetry::default()
        };
        state.phase = if knobs.fail_transfers {
            XferPhase::Failed
        } else if knobs.polls_to_complete == 0 {
            XferPhase::Done
        } else {
            XferPhase::Posted {
                polls_left: knobs.polls_to_complete,
            }
        };
        state.telemetry.post_duration = started.elapsed();

        let phase = state.phase;
        match phase {
            XferPhase::Done => {
                self.finish(req);
                Ok(XferStatus::Success)
            }
            XferPhase::Failed => Ok(XferStatus::Error),
            _ => Ok(XferStatus::InProgress),
        }
    }

    fn xfer_status(&mut self, req: RawXferHandle) -> Result<XferStatus, NixlError> {
        let state = self.xfers.get_mut(&req).ok_or(NixlError::InvalidParam)?;
        let phase = state.phase;
        match phase {
            XferPhase::Created => Err(NixlError::InvalidParam),
            XferPhase::Posted { polls_left } if polls_left > 1 => {
                state.phase = XferPhase::Posted {
                    polls_left: polls_left - 1,
                };
                Ok(XferStatus::InProgress)
            }
            XferPhase::Posted { .. } => {
                state.phase = XferPhase::Done;
                self.finish(req);
                Ok(XferStatus::Success)
            }
            XferPhase::Done => Ok(XferStatus::Success),
            XferPhase::Failed => Ok(XferStatus::Error),
        }
    }

    fn release_xfer_req(&mut self, req: RawXferHandle) -> Result<(), NixlError> {
        let cancellable = self.fabric.lock().knobs.cancellable;
        let state = self.xfer(req)?;
        if matches!(state.phase, XferPhase::Posted { .. }) && !cancellable {
            return Err(NixlError::BackendError(
                "transfer is in progress and cannot be cancelled".to_string(),
            ));
        }
        self.xfers.remove(&req);
        Ok(())
    }

    fn estimate_xfer_cost(&self, req: RawXferHandle) -> Result<CostEstimate, NixlError> {
        let state = self.xfer(req)?;
        let plugin = self
            .backends
            .get(&state.backend)
            .map(|backend| backend.plugin.as_str());
        if plugin != Some("UCX") {
            return Ok(CostEstimate {
                duration: Duration::ZERO,
                err_margin: Duration::ZERO,
                method: CostMethod::Unknown,
            });
        }
        let duration = Duration::from_secs_f64(state.bytes as f64 / SIMULATED_BANDWIDTH);
        Ok(CostEstimate {
            duration,
            err_margin: duration / 10,
            method: CostMethod::AnalyticalBackend,
        })
    }

    fn xfer_telemetry(&self, req: RawXferHandle) -> Result<XferTelemetry, NixlError> {
        if !self.capture_telemetry {
            return Err(NixlError::NotSupported);
        }
        let state = self.xfer(req)?;
        if state.posted_at.is_none() {
            return Err(NixlError::BackendError(
                "transfer was never posted".to_string(),
            ));
        }
        Ok(state.telemetry)
    }

    fn query_xfer_backend(&self, req: RawXferHandle) -> Result<BackendHandle, NixlError> {
        Ok(self.xfer(req)?.backend)
    }

    fn get_notifs(
        &mut self,
        backends: &[BackendHandle],
    ) -> Result<Vec<(String, Vec<u8>)>, NixlError> {
        self.progress();
        let names = self.backend_names(backends);
        let mut fabric = self.fabric.lock();
        let Some(inbox) = fabric.notif_inbox.get_mut(&self.name) else {
            return Ok(Vec::new());
        };
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(inbox)
            .into_iter()
            .partition(|notif| backends.is_empty() || names.contains(&notif.backend));
        *inbox = kept;
        Ok(taken
            .into_iter()
            .map(|notif| (notif.from, notif.msg))
            .collect())
    }

    fn gen_notif(
        &mut self,
        remote_agent: &str,
        msg: &[u8],
        backend: Option<BackendHandle>,
    ) -> Result<(), NixlError> {
        self.progress();
        if remote_agent != self.name && !self.remotes.contains_key(remote_agent) {
            return Err(NixlError::UnknownRemote(remote_agent.to_string()));
        }
        let plugin = match backend {
            Some(handle) => self.backends.get(&handle).ok_or(NixlError::InvalidParam)?,
            None => self.backends.values().next().ok_or_else(|| {
                NixlError::BackendError("no backend available to notify through".to_string())
            })?,
        }
        .plugin
        .clone();
        self.fabric
            .lock()
            .notif_inbox
            .entry(remote_agent.to_string())
            .or_default()
            .push(Delivered {
                from: self.name.clone(),
                backend: plugin,
                msg: msg.to_vec(),
            });
        Ok(())
    }

    fn get_local_md(&self) -> Result<Vec<u8>, NixlError> {
        self.full_md()
    }

    fn get_local_partial_md(
        &self,
        descs: &RegDescList,
        include_conn_info: bool,
        backends: &[BackendHandle],
    ) -> Result<Vec<u8>, NixlError> {
        self.partial_md(descs, include_conn_info, backends)
    }

    fn load_remote_md(&mut self, md: &[u8]) -> Result<String, NixlError> {
        self.load_blob(md)
    }

    fn check_remote_md(
        &mut self,
        remote_agent: &str,
        descs: Option<&XferDescList>,
    ) -> Result<bool, NixlError> {
        self.progress();
        let Some(view) = self.remotes.get(remote_agent) else {
            return Ok(false);
        };
        Ok(descs.map_or(true, |descs| first_uncovered(descs, &view.regions).is_none()))
    }

    fn invalidate_remote_md(&mut self, remote_agent: &str) -> Result<(), NixlError> {
        self.connected.remove(remote_agent);
        self.remotes
            .remove(remote_agent)
            .map(|_| ())
            .ok_or_else(|| NixlError::UnknownRemote(remote_agent.to_string()))
    }

    fn loaded_remotes(&mut self) -> Result<Vec<String>, NixlError> {
        self.progress();
        let mut names: Vec<String> = self.remotes.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn make_connection(
        &mut self,
        remote_agent: &str,
        _backends: &[BackendHandle],
    ) -> Result<(), NixlError> {
        self.progress();
        if !self.remotes.contains_key(remote_agent) {
            return Err(NixlError::UnknownRemote(remote_agent.to_string()));
        }
        self.connected.insert(remote_agent.to_string());
        Ok(())
    }

    fn send_local_md(&mut self, target: &MetadataTarget) -> Result<(), NixlError> {
        let blob = self.full_md()?;
        self.deliver_md(target, blob)
    }

    fn send_local_partial_md(
        &mut self,
        descs: &RegDescList,
        include_conn_info: bool,
        backends: &[BackendHandle],
        target: &MetadataTarget,
    ) -> Result<(), NixlError> {
        if matches!(target, MetadataTarget::Registry { label } if label.is_empty()) {
            return Err(NixlError::InvalidParam);
        }
        let blob = self.partial_md(descs, include_conn_info, backends)?;
        self.deliver_md(target, blob)
    }

    fn fetch_remote_md(
        &mut self,
        remote_agent: &str,
        target: &MetadataTarget,
    ) -> Result<(), NixlError> {
        if remote_agent == self.name {
            return Err(NixlError::InvalidParam);
        }
        self.pending_fetches
            .push((remote_agent.to_string(), target.clone()));
        self.progress();
        Ok(())
    }

    fn invalidate_local_md(&mut self, target: &MetadataTarget) -> Result<(), NixlError> {
        let mut fabric = self.fabric.lock();
        match target {
            MetadataTarget::Peer { addr, port } => {
                let addr = SocketAddr::new(*addr, *port);
                let peer = fabric
                    .listeners
                    .get(&addr)
                    .cloned()
                    .ok_or_else(|| NixlError::Metadata(format!("no agent listening on {addr}")))?;
                fabric
                    .md_inbox
                    .entry(peer)
                    .or_default()
                    .push(MdEvent::Invalidate(self.name.clone()));
            }
            MetadataTarget::Registry { label } if label.is_empty() => {
                fabric.registry.remove(&self.name);
                let peers: Vec<String> = fabric
                    .agents
                    .iter()
                    .filter(|agent| **agent != self.name)
                    .cloned()
                    .collect();
                for peer in peers {
                    fabric
                        .md_inbox
                        .entry(peer)
                        .or_default()
                        .push(MdEvent::Invalidate(self.name.clone()));
                }
            }
            MetadataTarget::Registry { label } => {
                fabric.registry.remove(label);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(fabric: &InMemoryFabric, name: &str) -> InMemoryEngine {
        let mut engine = fabric.engine();
        engine.init(name, &AgentConfig::default()).unwrap();
        engine
    }

    fn dram_regions(regions: &[(usize, usize)]) -> RegDescList {
        RegDescList::from_descs(
            MemType::Dram,
            regions
                .iter()
                .map(|&(addr, len)| RegDesc::new(addr, len, 0, Vec::new())),
        )
    }

    #[test]
    fn test_duplicate_agent_name_rejected() {
        let fabric = InMemoryFabric::new();
        let _first = engine(&fabric, "agent");
        let mut second = fabric.engine();
        assert!(second.init("agent", &AgentConfig::default()).is_err());
    }

    #[test]
    fn test_unknown_plugin() {
        let fabric = InMemoryFabric::new();
        let mut engine = engine(&fabric, "agent");
        let err = engine.create_backend("RDMA9000", &Params::new()).unwrap_err();
        assert!(matches!(err, NixlError::UnknownPlugin { ref available, .. } if available.len() == 5));
    }

    #[test]
    fn test_backend_params_merge_defaults() {
        let fabric = InMemoryFabric::new();
        let mut engine = engine(&fabric, "agent");
        let overrides: Params = [("num_threads", "4")].into_iter().collect();
        let ucx = engine.create_backend("UCX", &overrides).unwrap();

        let (mem_types, params) = engine.backend_params(ucx).unwrap();
        assert_eq!(mem_types, vec![MemType::Dram, MemType::Vram]);
        assert_eq!(params.get("num_threads"), Some("4"));
        assert_eq!(params.get("device_list"), Some("all"));
        assert!(engine.create_backend("UCX", &Params::new()).is_err());
    }

    #[test]
    fn test_loading_own_metadata_rejected() {
        let fabric = InMemoryFabric::new();
        let mut engine = engine(&fabric, "agent");
        let md = engine.get_local_md().unwrap();
        assert!(matches!(engine.load_remote_md(&md), Err(NixlError::InvalidParam)));
    }

    #[test]
    fn test_partial_metadata_needs_connection_info_first() {
        let fabric = InMemoryFabric::new();
        let mut target = engine(&fabric, "target");
        let mut initiator = engine(&fabric, "initiator");
        target.create_backend("UCX", &Params::new()).unwrap();
        initiator.create_backend("UCX", &Params::new()).unwrap();

        let regions = dram_regions(&[(0x1000, 256)]);
        target.register_mem(&regions, &[]).unwrap();

        let without_conn = target.get_local_partial_md(&regions, false, &[]).unwrap();
        assert!(matches!(
            initiator.load_remote_md(&without_conn),
            Err(NixlError::Metadata(_))
        ));

        let with_conn = target.get_local_partial_md(&regions, true, &[]).unwrap();
        assert_eq!(initiator.load_remote_md(&with_conn).unwrap(), "target");
        assert!(initiator
            .check_remote_md("target", Some(&regions.trim()))
            .unwrap());

        let unregistered = dram_regions(&[(0x9000, 16)]);
        assert!(target.get_local_partial_md(&unregistered, true, &[]).is_err());
    }

    #[test]
    fn test_transfer_completes_after_polls() {
        let fabric = InMemoryFabric::new();
        fabric.set_polls_to_complete(3);
        let mut target = engine(&fabric, "target");
        let mut initiator = engine(&fabric, "initiator");
        target.create_backend("UCX", &Params::new()).unwrap();
        initiator.create_backend("UCX", &Params::new()).unwrap();

        let remote = dram_regions(&[(0x1000, 64)]);
        let local = dram_regions(&[(0x8000, 64)]);
        target.register_mem(&remote, &[]).unwrap();
        initiator.register_mem(&local, &[]).unwrap();
        initiator
            .load_remote_md(&target.get_local_md().unwrap())
            .unwrap();

        let args = XferArgs {
            notif: Some(b"done".to_vec()),
            ..XferArgs::default()
        };
        let req = initiator
            .create_xfer_req(XferOp::Write, &local.trim(), &remote.trim(), "target", &args)
            .unwrap();

        assert_eq!(initiator.post_xfer_req(req, None).unwrap(), XferStatus::InProgress);
        assert_eq!(initiator.xfer_status(req).unwrap(), XferStatus::InProgress);
        assert_eq!(initiator.xfer_status(req).unwrap(), XferStatus::InProgress);
        assert_eq!(fabric.pending_notifications("target"), 0);
        assert_eq!(initiator.xfer_status(req).unwrap(), XferStatus::Success);
        assert_eq!(initiator.xfer_status(req).unwrap(), XferStatus::Success);
        assert_eq!(fabric.pending_notifications("target"), 1);

        let notifs = target.get_notifs(&[]).unwrap();
        assert_eq!(notifs, vec![("initiator".to_string(), b"done".to_vec())]);
    }

    #[test]
    fn test_in_progress_release_honors_cancellability() {
        let fabric = InMemoryFabric::new();
        fabric.set_polls_to_complete(5);
        fabric.set_cancellable(false);
        let mut agent = engine(&fabric, "solo");
        agent.create_backend("UCX", &Params::new()).unwrap();
        let regions = dram_regions(&[(0x1000, 64), (0x2000, 64)]);
        agent.register_mem(&regions, &[]).unwrap();

        let list = regions.trim();
        let src = XferDescList::from_descs(MemType::Dram, list.get(0).copied());
        let dst = XferDescList::from_descs(MemType::Dram, list.get(1).copied());
        let req = agent
            .create_xfer_req(XferOp::Write, &src, &dst, "solo", &XferArgs::default())
            .unwrap();
        agent.post_xfer_req(req, None).unwrap();

        assert!(agent.release_xfer_req(req).is_err());
        fabric.set_cancellable(true);
        assert!(agent.release_xfer_req(req).is_ok());
        assert!(agent.release_xfer_req(req).is_err());
    }

    #[test]
    fn test_notifications_filtered_by_backend() {
        let fabric = InMemoryFabric::new();
        let mut sender = engine(&fabric, "sender");
        let mut receiver = engine(&fabric, "receiver");
        sender.create_backend("UCX", &Params::new()).unwrap();
        let sender_posix = sender.create_backend("POSIX", &Params::new()).unwrap();
        let ucx = receiver.create_backend("UCX", &Params::new()).unwrap();
        let posix = receiver.create_backend("POSIX", &Params::new()).unwrap();
        sender
            .load_remote_md(&receiver.get_local_md().unwrap())
            .unwrap();

        sender.gen_notif("receiver", b"via-posix", Some(sender_posix)).unwrap();
        assert!(receiver.get_notifs(&[ucx]).unwrap().is_empty());
        let notifs = receiver.get_notifs(&[posix]).unwrap();
        assert_eq!(notifs.len(), 1);
        assert_eq!(notifs[0].1, b"via-posix".to_vec());
    }

    #[test]
    fn test_registry_round_trip() {
        let fabric = InMemoryFabric::new();
        let mut target = engine(&fabric, "target");
        let mut initiator = engine(&fabric, "initiator");
        target.create_backend("UCX", &Params::new()).unwrap();

        let registry = MetadataTarget::registry("");
        target.send_local_md(&registry).unwrap();
        assert_eq!(fabric.registry_keys(), vec!["target".to_string()]);

        initiator.fetch_remote_md("target", &registry).unwrap();
        assert!(initiator.check_remote_md("target", None).unwrap());

        target.invalidate_local_md(&registry).unwrap();
        assert!(fabric.registry_keys().is_empty());
        assert!(!initiator.check_remote_md("target", None).unwrap());
    }
}
