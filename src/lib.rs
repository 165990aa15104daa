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

//! Agent orchestration layer for NIXL
//!
//! This crate manages descriptor lists, the lifecycle of the opaque handles a
//! transfer engine hands out, completion notifications between peer agents and
//! the metadata exchange that makes peer-to-peer transfers possible.
//!
//! The transfer engine itself is an external collaborator reached through the
//! [`engine::TransferEngine`] trait. [`engine::memory`] provides a simulated
//! in-process engine for tests and demos.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

mod agent;
mod backend;
pub mod config;
mod descriptor;
pub mod engine;
mod handle;
pub mod logging;
mod metadata;
mod notify;

pub use agent::*;
pub use backend::*;
pub use config::AgentConfig;
pub use descriptor::*;
pub use handle::*;
pub use metadata::*;
pub use notify::*;

/// Errors that can occur when using NIXL
#[derive(Error, Debug)]
pub enum NixlError {
    #[error("Invalid parameter provided to NIXL")]
    InvalidParam,
    #[error("Backend error occurred: {0}")]
    BackendError(String),
    #[error("Operation not supported by the backend")]
    NotSupported,
    #[error("No plugins available, cannot start transfers")]
    NoPlugins,
    #[error("Invalid descriptor input: {0}")]
    InvalidDescriptorInput(#[from] DescriptorError),
    #[error("Expected a {expected} descriptor list, got a {found} list")]
    WrongListKind { expected: ListKind, found: ListKind },
    #[error("Backend '{name}' not found. Available backends: {available:?}")]
    UnknownBackend { name: String, available: Vec<String> },
    #[error("Plugin '{name}' not available. Available plugins: {available:?}")]
    UnknownPlugin { name: String, available: Vec<String> },
    #[error("Handle {handle:#x} was already released")]
    HandleReleased { handle: u64 },
    #[error("Handle {handle:#x} does not belong to agent '{agent}'")]
    ForeignHandle { handle: u64, agent: String },
    #[error("Failed to release handle {handle:#x}: {source}")]
    ReleaseFailed {
        handle: u64,
        #[source]
        source: Box<NixlError>,
    },
    #[error("Index {index} out of range for prepared list of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Local and remote index counts differ ({local} vs {remote})")]
    IndexCountMismatch { local: usize, remote: usize },
    #[error("Unknown memory type '{0}'")]
    UnknownMemType(String),
    #[error("Unknown transfer operation '{0}'")]
    UnknownOperation(String),
    #[error("Remote agent '{0}' is not known")]
    UnknownRemote(String),
    #[error("Metadata error: {0}")]
    Metadata(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`NixlError`] values
///
/// Validation errors can be fixed by the caller and retried; transport errors
/// should not be retried blindly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    UnknownBackend,
    HandleState,
    IndexOutOfRange,
    Transport,
    Metadata,
    Config,
    Serialization,
}

impl ErrorKind {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ErrorKind::Validation | ErrorKind::UnknownBackend | ErrorKind::IndexOutOfRange
        )
    }
}

impl NixlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NixlError::InvalidDescriptorInput(_)
            | NixlError::WrongListKind { .. }
            | NixlError::IndexCountMismatch { .. }
            | NixlError::UnknownMemType(_)
            | NixlError::UnknownOperation(_)
            | NixlError::InvalidParam => ErrorKind::Validation,
            NixlError::UnknownBackend { .. } | NixlError::UnknownPlugin { .. } => {
                ErrorKind::UnknownBackend
            }
            NixlError::HandleReleased { .. }
            | NixlError::ForeignHandle { .. }
            | NixlError::ReleaseFailed { .. } => ErrorKind::HandleState,
            NixlError::IndexOutOfRange { .. } => ErrorKind::IndexOutOfRange,
            NixlError::BackendError(_) | NixlError::NotSupported | NixlError::NoPlugins => {
                ErrorKind::Transport
            }
            NixlError::UnknownRemote(_) | NixlError::Metadata(_) => ErrorKind::Metadata,
            NixlError::ConfigParse(_) | NixlError::Config(_) | NixlError::Io(_) => {
                ErrorKind::Config
            }
            NixlError::Serialization(_) => ErrorKind::Serialization,
        }
    }
}

/// Memory segment type shared by every region of a descriptor list
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum MemType {
    Dram,
    Vram,
    Block,
    Object,
    File,
    Unknown,
}

impl fmt::Display for MemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemType::Dram => "DRAM",
            MemType::Vram => "VRAM",
            MemType::Block => "BLOCK",
            MemType::Object => "OBJ",
            MemType::File => "FILE",
            MemType::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

impl FromStr for MemType {
    type Err = NixlError;

    /// Accepts the segment names plus the `cpu`/`cuda` device aliases
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAM" | "cpu" => Ok(MemType::Dram),
            "VRAM" | "cuda" => Ok(MemType::Vram),
            "BLOCK" => Ok(MemType::Block),
            "OBJ" => Ok(MemType::Object),
            "FILE" => Ok(MemType::File),
            _ => Err(NixlError::UnknownMemType(s.to_string())),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XferOp {
    Read,
    Write,
}

impl fmt::Display for XferOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XferOp::Read => f.write_str("READ"),
            XferOp::Write => f.write_str("WRITE"),
        }
    }
}

impl FromStr for XferOp {
    type Err = NixlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READ" => Ok(XferOp::Read),
            "WRITE" => Ok(XferOp::Write),
            _ => Err(NixlError::UnknownOperation(s.to_string())),
        }
    }
}

/// Observed state of a posted transfer request
///
/// `Error` is an expected terminal outcome and is reported as data rather
/// than through [`NixlError`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum XferStatus {
    Success,
    InProgress,
    Error,
}

impl XferStatus {
    pub fn is_success(&self) -> bool {
        *self == XferStatus::Success
    }

    pub fn is_terminal(&self) -> bool {
        *self != XferStatus::InProgress
    }
}

impl fmt::Display for XferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XferStatus::Success => f.write_str("DONE"),
            XferStatus::InProgress => f.write_str("PROC"),
            XferStatus::Error => f.write_str("ERR"),
        }
    }
}

/// How a transfer cost estimate was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CostMethod {
    AnalyticalBackend,
    Unknown,
}

impl fmt::Display for CostMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CostMethod::AnalyticalBackend => f.write_str("ANALYTICAL_BACKEND"),
            CostMethod::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// Estimated duration of a transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostEstimate {
    pub duration: Duration,
    pub err_margin: Duration,
    pub method: CostMethod,
}

/// Telemetry captured for a single transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XferTelemetry {
    /// Microseconds since the unix epoch at which the request was posted
    pub start_time_us: u64,
    pub post_duration: Duration,
    pub xfer_duration: Duration,
    pub total_bytes: u64,
    pub desc_count: usize,
}

/// Backend and plugin parameters as ordered key-value pairs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    inner: BTreeMap<String, String>,
}

/// A key-value pair in the parameters
#[derive(Debug, PartialEq, Eq)]
pub struct ParamPair<'a> {
    pub key: &'a str,
    pub value: &'a str,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the parameters are empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.inner.insert(key.into(), value.into())
    }

    /// Returns an iterator over the parameter key-value pairs
    pub fn iter(&self) -> impl Iterator<Item = ParamPair<'_>> {
        self.inner.iter().map(|(key, value)| ParamPair { key, value })
    }

    /// Returns a copy of `self` with every entry of `overrides` applied on top
    pub fn merged_with(&self, overrides: &Params) -> Params {
        let mut merged = self.clone();
        for (key, value) in &overrides.inner {
            merged.inner.insert(key.clone(), value.clone());
        }
        merged
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}
