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

//! Prepared list and transfer request handles
//!
//! Both handle kinds are released exactly once. Dropping an unreleased handle
//! releases it on a best-effort basis; a transfer request whose release fails
//! at that point is remembered by its agent and retried later.

use super::*;
use crate::agent::{write_agent, SharedAgent};
use crate::engine::{RawDlistHandle, RawXferHandle, NIXL_INIT_AGENT};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Whose memory a prepared list describes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DlistRole {
    /// Local memory this agent initiates transfers from
    Initiator,
    /// Memory of a peer whose metadata has been loaded
    Remote(String),
    /// Local memory used as the target of a local transfer
    Loopback,
}

impl DlistRole {
    /// The agent name the engine expects when preparing the list
    pub(crate) fn engine_agent<'a>(&'a self, own_name: &'a str) -> &'a str {
        match self {
            DlistRole::Initiator => NIXL_INIT_AGENT,
            DlistRole::Remote(peer) => peer,
            DlistRole::Loopback => own_name,
        }
    }
}

/// Live handles of one agent plus the transfer requests whose release failed
#[derive(Debug, Default)]
pub(crate) struct HandleRegistry {
    dlists: HashMap<RawDlistHandle, usize>,
    xfers: HashSet<RawXferHandle>,
    leaked: BTreeSet<RawXferHandle>,
}

impl HandleRegistry {
    pub(crate) fn track_dlist(&mut self, raw: RawDlistHandle, len: usize) {
        self.dlists.insert(raw, len);
    }

    pub(crate) fn forget_dlist(&mut self, raw: RawDlistHandle) {
        self.dlists.remove(&raw);
    }

    pub(crate) fn track_xfer(&mut self, raw: RawXferHandle) {
        self.xfers.insert(raw);
    }

    pub(crate) fn forget_xfer(&mut self, raw: RawXferHandle) {
        self.xfers.remove(&raw);
        self.leaked.remove(&raw);
    }

    /// Checks every index against the prepared list's length
    pub(crate) fn check_indices(
        &self,
        raw: RawDlistHandle,
        indices: &[usize],
    ) -> Result<(), NixlError> {
        let len = *self
            .dlists
            .get(&raw)
            .ok_or(NixlError::HandleReleased { handle: raw.0 })?;
        match indices.iter().find(|&&index| index >= len) {
            Some(&index) => Err(NixlError::IndexOutOfRange { index, len }),
            None => Ok(()),
        }
    }

    pub(crate) fn record_leak(&mut self, raw: RawXferHandle) {
        self.leaked.insert(raw);
    }

    pub(crate) fn leaked_count(&self) -> usize {
        self.leaked.len()
    }

    pub(crate) fn take_leaks(&mut self) -> Vec<RawXferHandle> {
        std::mem::take(&mut self.leaked).into_iter().collect()
    }

    pub(crate) fn live_counts(&self) -> (usize, usize) {
        (self.dlists.len(), self.xfers.len())
    }
}

/// A descriptor list prepared for transfers
#[must_use = "prepared lists should be released with `release`"]
pub struct PreparedDlistHandle {
    agent: SharedAgent,
    raw: RawDlistHandle,
    len: usize,
    role: DlistRole,
    released: bool,
}

impl PreparedDlistHandle {
    pub(crate) fn new(agent: SharedAgent, raw: RawDlistHandle, len: usize, role: DlistRole) -> Self {
        Self {
            agent,
            raw,
            len,
            role,
            released: false,
        }
    }

    pub fn raw(&self) -> RawDlistHandle {
        self.raw
    }

    /// Number of descriptors in the prepared list
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn role(&self) -> &DlistRole {
        &self.role
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn belongs_to(&self, agent: &SharedAgent) -> bool {
        Arc::ptr_eq(&self.agent, agent)
    }

    /// Releases the prepared list; releasing twice is a no-op
    pub fn release(&mut self) -> Result<(), NixlError> {
        if self.released {
            return Ok(());
        }
        write_agent(&self.agent).release_dlist(self.raw)?;
        self.released = true;
        Ok(())
    }
}

impl fmt::Debug for PreparedDlistHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedDlistHandle")
            .field("raw", &self.raw)
            .field("len", &self.len)
            .field("role", &self.role)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for PreparedDlistHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(handle = self.raw.0, "Dropping unreleased prepared list handle");
        if let Err(e) = self.release() {
            tracing::error!(handle = self.raw.0, error = ?e, "Failed to release prepared list");
        }
    }
}

/// A handle to a transfer request
#[must_use = "transfer requests should be released with `release`"]
pub struct XferRequest {
    agent: SharedAgent,
    raw: RawXferHandle,
    released: bool,
    terminal: Option<XferStatus>,
}

impl XferRequest {
    pub(crate) fn new(agent: SharedAgent, raw: RawXferHandle) -> Self {
        Self {
            agent,
            raw,
            released: false,
            terminal: None,
        }
    }

    pub fn raw(&self) -> RawXferHandle {
        self.raw
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn belongs_to(&self, agent: &SharedAgent) -> bool {
        Arc::ptr_eq(&self.agent, agent)
    }

    /// The terminal status last observed, if any
    pub fn terminal_status(&self) -> Option<XferStatus> {
        self.terminal
    }

    /// Records a polled status; once terminal, later polls report the same value
    pub(crate) fn observe(&mut self, status: XferStatus) -> XferStatus {
        if let Some(terminal) = self.terminal {
            return terminal;
        }
        if status.is_terminal() {
            self.terminal = Some(status);
        }
        status
    }

    /// Forget the previous outcome before the request is posted again
    pub(crate) fn reposted(&mut self) {
        self.terminal = None;
    }

    /// Releases the request, cancelling it if still in progress
    ///
    /// Releasing twice is a no-op. If cancellation fails the request stays
    /// unreleased and the error is returned.
    pub fn release(&mut self) -> Result<(), NixlError> {
        if self.released {
            return Ok(());
        }
        write_agent(&self.agent).release_xfer(self.raw)?;
        self.released = true;
        Ok(())
    }
}

impl fmt::Debug for XferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XferRequest")
            .field("raw", &self.raw)
            .field("released", &self.released)
            .field("terminal", &self.terminal)
            .finish()
    }
}

impl Drop for XferRequest {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(handle = self.raw.0, "Dropping unreleased transfer request");
        if let Err(e) = self.release() {
            tracing::error!(
                handle = self.raw.0,
                error = ?e,
                "Failed to release transfer request, deferring to leak recovery"
            );
            write_agent(&self.agent).handles.record_leak(self.raw);
        }
    }
}
