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

//! The transfer engine the agent orchestrates
//!
//! An engine owns the transports: it creates backends, registers memory,
//! moves bytes and carries notifications and metadata between agents. The
//! agent only ever sees the opaque handles defined here.

use crate::{
    AgentConfig, CostEstimate, MemType, MetadataTarget, NixlError, Params, RegDescList,
    XferDescList, XferOp, XferStatus, XferTelemetry,
};

pub mod memory;

/// Agent name used when preparing a list for the local initiator side
pub const NIXL_INIT_AGENT: &str = "";

/// Opaque handle to a backend created by an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendHandle(pub u64);

/// Opaque handle to a prepared descriptor list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawDlistHandle(pub u64);

/// Opaque handle to a transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawXferHandle(pub u64);

/// Optional arguments for creating a transfer request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XferArgs {
    /// Message delivered to the remote agent once the transfer completes
    pub notif: Option<Vec<u8>>,
    /// Backends the engine may choose from; empty means any
    pub backends: Vec<BackendHandle>,
    pub skip_desc_merge: bool,
}

/// Operations an agent needs from its transfer engine
///
/// A failed transfer is reported as [`XferStatus::Error`], not as an `Err`.
pub trait TransferEngine: Send + Sync {
    /// Called once when the owning agent is created
    fn init(&mut self, agent_name: &str, config: &AgentConfig) -> Result<(), NixlError>;

    fn available_plugins(&self) -> Result<Vec<String>, NixlError>;

    /// Memory types and default parameters of a plugin
    fn plugin_params(&self, plugin: &str) -> Result<(Vec<MemType>, Params), NixlError>;

    fn create_backend(&mut self, plugin: &str, params: &Params)
        -> Result<BackendHandle, NixlError>;

    /// Memory types and effective parameters of a created backend
    fn backend_params(&self, backend: BackendHandle) -> Result<(Vec<MemType>, Params), NixlError>;

    fn register_mem(
        &mut self,
        descs: &RegDescList,
        backends: &[BackendHandle],
    ) -> Result<(), NixlError>;

    fn deregister_mem(
        &mut self,
        descs: &RegDescList,
        backends: &[BackendHandle],
    ) -> Result<(), NixlError>;

    /// Per-descriptor information, `None` where the backend knows nothing
    fn query_mem(
        &self,
        descs: &RegDescList,
        backend: BackendHandle,
    ) -> Result<Vec<Option<Params>>, NixlError>;

    /// Prepares a list for `agent`, which is [`NIXL_INIT_AGENT`] for the initiator side
    fn prep_xfer_dlist(
        &mut self,
        agent: &str,
        descs: &XferDescList,
        backends: &[BackendHandle],
    ) -> Result<RawDlistHandle, NixlError>;

    fn release_dlist(&mut self, handle: RawDlistHandle) -> Result<(), NixlError>;

    fn make_xfer_req(
        &mut self,
        op: XferOp,
        local: RawDlistHandle,
        local_indices: &[usize],
        remote: RawDlistHandle,
        remote_indices: &[usize],
        args: &XferArgs,
    ) -> Result<RawXferHandle, NixlError>;

    fn create_xfer_req(
        &mut self,
        op: XferOp,
        local: &XferDescList,
        remote: &XferDescList,
        remote_agent: &str,
        args: &XferArgs,
    ) -> Result<RawXferHandle, NixlError>;

    /// Starts a transfer; `notif` replaces the message given at creation
    fn post_xfer_req(
        &mut self,
        req: RawXferHandle,
        notif: Option<&[u8]>,
    ) -> Result<XferStatus, NixlError>;

    fn xfer_status(&mut self, req: RawXferHandle) -> Result<XferStatus, NixlError>;

    /// Releases a request, cancelling it if it is still in progress
    fn release_xfer_req(&mut self, req: RawXferHandle) -> Result<(), NixlError>;

    fn estimate_xfer_cost(&self, req: RawXferHandle) -> Result<CostEstimate, NixlError>;

    fn xfer_telemetry(&self, req: RawXferHandle) -> Result<XferTelemetry, NixlError>;

    fn query_xfer_backend(&self, req: RawXferHandle) -> Result<BackendHandle, NixlError>;

    /// Drains notifications received through the given backends, in arrival order
    fn get_notifs(&mut self, backends: &[BackendHandle])
        -> Result<Vec<(String, Vec<u8>)>, NixlError>;

    fn gen_notif(
        &mut self,
        remote_agent: &str,
        msg: &[u8],
        backend: Option<BackendHandle>,
    ) -> Result<(), NixlError>;

    fn get_local_md(&self) -> Result<Vec<u8>, NixlError>;

    fn get_local_partial_md(
        &self,
        descs: &RegDescList,
        include_conn_info: bool,
        backends: &[BackendHandle],
    ) -> Result<Vec<u8>, NixlError>;

    /// Loads a metadata blob and returns the name of the agent it describes
    fn load_remote_md(&mut self, md: &[u8]) -> Result<String, NixlError>;

    /// Whether metadata for `remote_agent`, and optionally for `descs`, is loaded
    fn check_remote_md(
        &mut self,
        remote_agent: &str,
        descs: Option<&XferDescList>,
    ) -> Result<bool, NixlError>;

    fn invalidate_remote_md(&mut self, remote_agent: &str) -> Result<(), NixlError>;

    /// Agents whose metadata is loaded, including metadata pushed or
    /// invalidated by peers since the last call
    fn loaded_remotes(&mut self) -> Result<Vec<String>, NixlError>;

    fn make_connection(
        &mut self,
        remote_agent: &str,
        backends: &[BackendHandle],
    ) -> Result<(), NixlError>;

    fn send_local_md(&mut self, target: &MetadataTarget) -> Result<(), NixlError>;

    fn send_local_partial_md(
        &mut self,
        descs: &RegDescList,
        include_conn_info: bool,
        backends: &[BackendHandle],
        target: &MetadataTarget,
    ) -> Result<(), NixlError>;

    /// Requests metadata of `remote_agent`; it becomes available asynchronously
    fn fetch_remote_md(
        &mut self,
        remote_agent: &str,
        target: &MetadataTarget,
    ) -> Result<(), NixlError>;

    fn invalidate_local_md(&mut self, target: &MetadataTarget) -> Result<(), NixlError>;
}
