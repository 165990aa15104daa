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

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Port peers listen on for metadata when none is configured
pub const DEFAULT_COMM_PORT: u16 = 8888;

/// Where local metadata is sent to or remote metadata is fetched from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetadataTarget {
    /// A peer agent listening at `addr:port`
    Peer { addr: IpAddr, port: u16 },
    /// A central metadata store; an empty label means the agent's own name
    Registry { label: String },
}

impl MetadataTarget {
    /// A peer on the default communication port
    pub fn peer(addr: IpAddr) -> Self {
        MetadataTarget::Peer {
            addr,
            port: DEFAULT_COMM_PORT,
        }
    }

    pub fn registry(label: impl Into<String>) -> Self {
        MetadataTarget::Registry {
            label: label.into(),
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            MetadataTarget::Peer { addr, port } => Some(SocketAddr::new(*addr, *port)),
            MetadataTarget::Registry { .. } => None,
        }
    }
}

impl fmt::Display for MetadataTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataTarget::Peer { addr, port } => write!(f, "peer {}", SocketAddr::new(*addr, *port)),
            MetadataTarget::Registry { label } if label.is_empty() => f.write_str("registry"),
            MetadataTarget::Registry { label } => write!(f, "registry '{label}'"),
        }
    }
}

/// What an agent knows about one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerState {
    pub metadata_loaded: bool,
    pub connected: bool,
}

/// Peers whose metadata has been loaded, by name
#[derive(Debug, Default)]
pub(crate) struct PeerTable {
    peers: BTreeMap<String, PeerState>,
}

impl PeerTable {
    /// Records a loaded or refreshed peer; loading twice is a refresh
    pub(crate) fn loaded(&mut self, name: &str) {
        self.peers.entry(name.to_string()).or_default().metadata_loaded = true;
    }

    pub(crate) fn connected(&mut self, name: &str) {
        self.peers.entry(name.to_string()).or_default().connected = true;
    }

    /// Forgets a peer, returning whether it was known
    pub(crate) fn invalidate(&mut self, name: &str) -> bool {
        self.peers.remove(name).is_some()
    }

    /// Makes the table match the engine's loaded peers, keeping connection state
    pub(crate) fn sync(&mut self, loaded: &[String]) {
        self.peers.retain(|name, _| loaded.contains(name));
        for name in loaded {
            self.loaded(name);
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<PeerState> {
        self.peers.get(name).copied()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.peers.clear();
    }
}
