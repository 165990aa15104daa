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

//! Descriptor lists and the normalization of region input into them

use super::*;
use ndarray::{ArrayViewD, Ix2};
use serde::de::DeserializeOwned;

/// The two canonical descriptor list kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Xfer,
    Reg,
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListKind::Xfer => f.write_str("transfer"),
            ListKind::Reg => f.write_str("registration"),
        }
    }
}

/// The rule that was violated while building a descriptor list
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("a memory type must be specified when not using buffers")]
    MissingMemType,
    #[error("region {index} has {found} fields, a {kind} list needs {expected}-field regions")]
    WrongArity {
        index: usize,
        expected: usize,
        found: usize,
        kind: ListKind,
    },
    #[error("buffer {index} is not contiguous")]
    NonContiguous { index: usize },
    #[error("buffer {index} is {found} memory but the first buffer is {first} memory")]
    MixedDevices {
        index: usize,
        first: MemType,
        found: MemType,
    },
    #[error("an Nx3 array is required, got shape {shape:?}")]
    WrongShape { shape: Vec<usize> },
    #[error("no buffers were given")]
    EmptyInput,
    #[error("row {row} value {value:#x} does not fit in an address")]
    AddressOverflow { row: usize, value: u64 },
}

/// A transfer descriptor: one memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XferDesc {
    pub addr: usize,
    pub len: usize,
    pub dev_id: u64,
}

impl XferDesc {
    pub fn new(addr: usize, len: usize, dev_id: u64) -> Self {
        Self { addr, len, dev_id }
    }

    pub fn end(&self) -> usize {
        self.addr.saturating_add(self.len)
    }

    /// True if `other` lies entirely inside this region on the same device
    pub fn contains(&self, other: &XferDesc) -> bool {
        self.dev_id == other.dev_id && self.addr <= other.addr && other.end() <= self.end()
    }

    fn of(descriptor: &dyn NixlDescriptor) -> Self {
        // SAFETY: the pointer is only turned into an address, never dereferenced
        let addr = unsafe { descriptor.as_ptr() } as usize;
        Self::new(addr, descriptor.size(), descriptor.device_id())
    }
}

/// A registration descriptor: a region plus opaque metadata such as a file path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegDesc {
    pub addr: usize,
    pub len: usize,
    pub dev_id: u64,
    pub metadata: Vec<u8>,
}

impl RegDesc {
    pub fn new(addr: usize, len: usize, dev_id: u64, metadata: impl Into<Vec<u8>>) -> Self {
        Self {
            addr,
            len,
            dev_id,
            metadata: metadata.into(),
        }
    }

    /// The region without its metadata
    pub fn as_xfer(&self) -> XferDesc {
        XferDesc::new(self.addr, self.len, self.dev_id)
    }
}

fn any_overlap(mut descs: Vec<XferDesc>) -> bool {
    descs.sort_by_key(|desc| (desc.dev_id, desc.addr));
    descs
        .windows(2)
        .any(|pair| pair[0].dev_id == pair[1].dev_id && pair[1].addr < pair[0].end())
}

/// An ordered list of transfer descriptors sharing one memory type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XferDescList {
    mem_type: MemType,
    descs: Vec<XferDesc>,
}

impl XferDescList {
    /// Creates a new transfer descriptor list for the given memory type
    pub fn new(mem_type: MemType) -> Self {
        Self {
            mem_type,
            descs: Vec::new(),
        }
    }

    pub fn from_descs(mem_type: MemType, descs: impl IntoIterator<Item = XferDesc>) -> Self {
        Self {
            mem_type,
            descs: descs.into_iter().collect(),
        }
    }

    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    /// Adds a descriptor to the list
    pub fn add_desc(&mut self, addr: usize, len: usize, dev_id: u64) {
        self.descs.push(XferDesc::new(addr, len, dev_id));
    }

    /// Add a descriptor from a type implementing NixlDescriptor
    pub fn add_storage_desc(&mut self, desc: &dyn NixlDescriptor) -> Result<(), NixlError> {
        check_storage_desc(self.mem_type, self.descs.len(), desc)?;
        self.descs.push(XferDesc::of(desc));
        Ok(())
    }

    /// Returns true if the list is empty
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Returns the number of descriptors in the list
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn get(&self, index: usize) -> Option<&XferDesc> {
        self.descs.get(index)
    }

    /// Removes the descriptor at `index`, shifting later ones down
    pub fn remove(&mut self, index: usize) -> Option<XferDesc> {
        (index < self.descs.len()).then(|| self.descs.remove(index))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, XferDesc> {
        self.descs.iter()
    }

    pub fn descs(&self) -> &[XferDesc] {
        &self.descs
    }

    /// Returns true if any descriptors in the list overlap
    pub fn has_overlaps(&self) -> bool {
        any_overlap(self.descs.clone())
    }

    /// Clears all descriptors from the list
    pub fn clear(&mut self) {
        self.descs.clear();
    }

    /// Total number of bytes covered by the descriptors
    pub fn total_bytes(&self) -> u64 {
        self.descs.iter().map(|desc| desc.len as u64).sum()
    }
}

/// An ordered list of registration descriptors sharing one memory type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegDescList {
    mem_type: MemType,
    descs: Vec<RegDesc>,
}

impl RegDescList {
    /// Creates a new registration descriptor list for the given memory type
    pub fn new(mem_type: MemType) -> Self {
        Self {
            mem_type,
            descs: Vec::new(),
        }
    }

    pub fn from_descs(mem_type: MemType, descs: impl IntoIterator<Item = RegDesc>) -> Self {
        Self {
            mem_type,
            descs: descs.into_iter().collect(),
        }
    }

    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    /// Adds a descriptor to the list
    pub fn add_desc(&mut self, addr: usize, len: usize, dev_id: u64, metadata: impl Into<Vec<u8>>) {
        self.descs.push(RegDesc::new(addr, len, dev_id, metadata));
    }

    /// Add a descriptor from a type implementing NixlDescriptor, with empty metadata
    pub fn add_storage_desc(&mut self, desc: &dyn NixlDescriptor) -> Result<(), NixlError> {
        check_storage_desc(self.mem_type, self.descs.len(), desc)?;
        let region = XferDesc::of(desc);
        self.add_desc(region.addr, region.len, region.dev_id, Vec::new());
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn get(&self, index: usize) -> Option<&RegDesc> {
        self.descs.get(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<RegDesc> {
        (index < self.descs.len()).then(|| self.descs.remove(index))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RegDesc> {
        self.descs.iter()
    }

    pub fn descs(&self) -> &[RegDesc] {
        &self.descs
    }

    pub fn has_overlaps(&self) -> bool {
        any_overlap(self.descs.iter().map(RegDesc::as_xfer).collect())
    }

    pub fn clear(&mut self) {
        self.descs.clear();
    }

    /// Drops the metadata, producing a transfer list over the same regions
    pub fn trim(&self) -> XferDescList {
        XferDescList::from_descs(self.mem_type, self.descs.iter().map(RegDesc::as_xfer))
    }
}

fn check_storage_desc(
    list_mem_type: MemType,
    index: usize,
    desc: &dyn NixlDescriptor,
) -> Result<(), DescriptorError> {
    if desc.mem_type() != list_mem_type {
        return Err(DescriptorError::MixedDevices {
            index,
            first: list_mem_type,
            found: desc.mem_type(),
        });
    }
    if !desc.is_contiguous() {
        return Err(DescriptorError::NonContiguous { index });
    }
    Ok(())
}

/// Serialize a descriptor list (or any serde value) into bytes
pub fn serialize_descs<T: Serialize>(descs: &T) -> Result<Vec<u8>, NixlError> {
    Ok(bincode::serialize(descs)?)
}

/// Reconstruct a descriptor list serialized with [`serialize_descs`]
pub fn deserialize_descs<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, NixlError> {
    Ok(bincode::deserialize(bytes)?)
}

/// A trait for storage types that can be used with NIXL
pub trait MemoryRegion: std::fmt::Debug + Send + Sync {
    /// Get a raw pointer to the storage
    ///
    /// # Safety
    /// The caller must ensure:
    /// - The pointer is not used after the storage is dropped
    /// - Access patterns respect the storage's thread safety model
    unsafe fn as_ptr(&self) -> *const u8;

    /// Returns the total size of the storage in bytes
    fn size(&self) -> usize;
}

/// A trait for types that can be added to NIXL descriptor lists
pub trait NixlDescriptor: MemoryRegion {
    /// Get the memory type for this descriptor
    fn mem_type(&self) -> MemType;

    /// Get the device ID for this memory region
    fn device_id(&self) -> u64;

    /// Whether the region is one contiguous span of `size()` bytes
    fn is_contiguous(&self) -> bool {
        true
    }
}

/// System memory storage implementation using a Vec<u8>
#[derive(Debug)]
pub struct SystemStorage {
    data: Vec<u8>,
}

impl SystemStorage {
    /// Create a new system storage with the given size
    pub fn new(size: usize) -> Result<Self, NixlError> {
        let data = vec![0; size];
        Ok(Self { data })
    }

    /// Fill the storage with a specific byte value
    pub fn memset(&mut self, value: u8) {
        self.data.fill(value);
    }

    /// Get a slice of the underlying data
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl MemoryRegion for SystemStorage {
    fn size(&self) -> usize {
        self.data.len()
    }

    unsafe fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl NixlDescriptor for SystemStorage {
    fn mem_type(&self) -> MemType {
        MemType::Dram
    }

    fn device_id(&self) -> u64 {
        0
    }
}

/// A view of memory owned elsewhere, such as a device allocation or a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalBuffer {
    addr: usize,
    len: usize,
    mem_type: MemType,
    dev_id: u64,
    contiguous: bool,
}

impl ExternalBuffer {
    pub fn new(addr: usize, len: usize, mem_type: MemType, dev_id: u64) -> Self {
        Self {
            addr,
            len,
            mem_type,
            dev_id,
            contiguous: true,
        }
    }

    /// Marks the view as strided, so it cannot be described by one region
    pub fn strided(mut self) -> Self {
        self.contiguous = false;
        self
    }
}

impl MemoryRegion for ExternalBuffer {
    unsafe fn as_ptr(&self) -> *const u8 {
        self.addr as *const u8
    }

    fn size(&self) -> usize {
        self.len
    }
}

impl NixlDescriptor for ExternalBuffer {
    fn mem_type(&self) -> MemType {
        self.mem_type
    }

    fn device_id(&self) -> u64 {
        self.dev_id
    }

    fn is_contiguous(&self) -> bool {
        self.contiguous
    }
}

/// One explicitly described region: 3 fields for transfers, 4 for registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionTuple {
    Xfer(usize, usize, u64),
    Reg(usize, usize, u64, Vec<u8>),
}

impl RegionTuple {
    pub fn arity(&self) -> usize {
        match self {
            RegionTuple::Xfer(..) => 3,
            RegionTuple::Reg(..) => 4,
        }
    }
}

impl From<(usize, usize, u64)> for RegionTuple {
    fn from((addr, len, dev_id): (usize, usize, u64)) -> Self {
        RegionTuple::Xfer(addr, len, dev_id)
    }
}

impl From<(usize, usize, u64, Vec<u8>)> for RegionTuple {
    fn from((addr, len, dev_id, metadata): (usize, usize, u64, Vec<u8>)) -> Self {
        RegionTuple::Reg(addr, len, dev_id, metadata)
    }
}

impl From<(usize, usize, u64, &str)> for RegionTuple {
    fn from((addr, len, dev_id, metadata): (usize, usize, u64, &str)) -> Self {
        RegionTuple::Reg(addr, len, dev_id, metadata.as_bytes().to_vec())
    }
}

/// Every accepted way of describing a set of regions
#[derive(Debug)]
pub enum DescriptorInput<'a> {
    /// Explicit region tuples; the memory type is required
    Tuples(Vec<RegionTuple>, Option<MemType>),
    /// A single buffer; memory type and device come from the buffer
    Buffer(&'a dyn NixlDescriptor),
    /// Several buffers that must share one memory type
    Buffers(Vec<&'a dyn NixlDescriptor>),
    /// An Nx3 array of `(addr, len, dev_id)` rows; the memory type is required
    Array(ArrayViewD<'a, u64>, Option<MemType>),
    Xfer(XferDescList),
    Reg(RegDescList),
}

impl<'a> DescriptorInput<'a> {
    pub fn tuples<T: Into<RegionTuple>>(
        regions: impl IntoIterator<Item = T>,
        mem_type: MemType,
    ) -> Self {
        DescriptorInput::Tuples(regions.into_iter().map(Into::into).collect(), Some(mem_type))
    }

    pub fn array(array: ArrayViewD<'a, u64>, mem_type: MemType) -> Self {
        DescriptorInput::Array(array, Some(mem_type))
    }

    pub fn kind(&self) -> Option<ListKind> {
        match self {
            DescriptorInput::Xfer(_) => Some(ListKind::Xfer),
            DescriptorInput::Reg(_) => Some(ListKind::Reg),
            _ => None,
        }
    }

    /// Normalize into a transfer descriptor list
    pub fn into_xfer_list(self) -> Result<XferDescList, NixlError> {
        match self {
            DescriptorInput::Xfer(list) => Ok(list),
            DescriptorInput::Reg(_) => {
                tracing::error!("RegList type detected for transfer, please use XferList");
                Err(NixlError::WrongListKind {
                    expected: ListKind::Xfer,
                    found: ListKind::Reg,
                })
            }
            DescriptorInput::Tuples(regions, mem_type) => {
                let mem_type = mem_type.ok_or(DescriptorError::MissingMemType)?;
                let mut list = XferDescList::new(mem_type);
                for (index, region) in regions.into_iter().enumerate() {
                    match region {
                        RegionTuple::Xfer(addr, len, dev_id) => list.add_desc(addr, len, dev_id),
                        other => {
                            return Err(wrong_arity(index, &other, ListKind::Xfer).into());
                        }
                    }
                }
                Ok(list)
            }
            DescriptorInput::Buffer(buffer) => {
                let (mem_type, descs) = buffer_descs(&[buffer])?;
                Ok(XferDescList::from_descs(mem_type, descs))
            }
            DescriptorInput::Buffers(buffers) => {
                let (mem_type, descs) = buffer_descs(&buffers)?;
                Ok(XferDescList::from_descs(mem_type, descs))
            }
            DescriptorInput::Array(array, mem_type) => {
                let mem_type = mem_type.ok_or(DescriptorError::MissingMemType)?;
                Ok(XferDescList::from_descs(mem_type, array_descs(&array)?))
            }
        }
    }

    /// Normalize into a registration descriptor list
    ///
    /// Regions described by buffers or arrays get empty metadata.
    pub fn into_reg_list(self) -> Result<RegDescList, NixlError> {
        match self {
            DescriptorInput::Reg(list) => Ok(list),
            DescriptorInput::Xfer(_) => {
                tracing::error!("XferList type detected for registration, please use RegList");
                Err(NixlError::WrongListKind {
                    expected: ListKind::Reg,
                    found: ListKind::Xfer,
                })
            }
            DescriptorInput::Tuples(regions, mem_type) => {
                let mem_type = mem_type.ok_or(DescriptorError::MissingMemType)?;
                let mut list = RegDescList::new(mem_type);
                for (index, region) in regions.into_iter().enumerate() {
                    match region {
                        RegionTuple::Reg(addr, len, dev_id, metadata) => {
                            list.add_desc(addr, len, dev_id, metadata)
                        }
                        other => {
                            return Err(wrong_arity(index, &other, ListKind::Reg).into());
                        }
                    }
                }
                Ok(list)
            }
            DescriptorInput::Buffer(buffer) => {
                let (mem_type, descs) = buffer_descs(&[buffer])?;
                Ok(reg_list_without_metadata(mem_type, descs))
            }
            DescriptorInput::Buffers(buffers) => {
                let (mem_type, descs) = buffer_descs(&buffers)?;
                Ok(reg_list_without_metadata(mem_type, descs))
            }
            DescriptorInput::Array(array, mem_type) => {
                let mem_type = mem_type.ok_or(DescriptorError::MissingMemType)?;
                Ok(reg_list_without_metadata(mem_type, array_descs(&array)?))
            }
        }
    }
}

fn wrong_arity(index: usize, region: &RegionTuple, kind: ListKind) -> DescriptorError {
    let expected = match kind {
        ListKind::Xfer => 3,
        ListKind::Reg => 4,
    };
    DescriptorError::WrongArity {
        index,
        expected,
        found: region.arity(),
        kind,
    }
}

fn reg_list_without_metadata(mem_type: MemType, descs: Vec<XferDesc>) -> RegDescList {
    RegDescList::from_descs(
        mem_type,
        descs
            .into_iter()
            .map(|desc| RegDesc::new(desc.addr, desc.len, desc.dev_id, Vec::new())),
    )
}

fn buffer_descs(
    buffers: &[&dyn NixlDescriptor],
) -> Result<(MemType, Vec<XferDesc>), DescriptorError> {
    let first = buffers.first().ok_or(DescriptorError::EmptyInput)?;
    let mem_type = first.mem_type();
    let mut descs = Vec::with_capacity(buffers.len());
    for (index, buffer) in buffers.iter().enumerate() {
        check_storage_desc(mem_type, index, *buffer)?;
        descs.push(XferDesc::of(*buffer));
    }
    Ok((mem_type, descs))
}

fn array_descs(array: &ArrayViewD<'_, u64>) -> Result<Vec<XferDesc>, DescriptorError> {
    let wrong_shape = || DescriptorError::WrongShape {
        shape: array.shape().to_vec(),
    };
    let matrix = array
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| wrong_shape())?;
    if matrix.ncols() != 3 {
        return Err(wrong_shape());
    }
    matrix
        .rows()
        .into_iter()
        .enumerate()
        .map(|(index, row)| -> Result<XferDesc, DescriptorError> {
            Ok(XferDesc::new(
                row_usize(index, row[0])?,
                row_usize(index, row[1])?,
                row[2],
            ))
        })
        .collect()
}

fn row_usize(row: usize, value: u64) -> Result<usize, DescriptorError> {
    usize::try_from(value).map_err(|_| DescriptorError::AddressOverflow { row, value })
}

impl From<XferDescList> for DescriptorInput<'_> {
    fn from(list: XferDescList) -> Self {
        DescriptorInput::Xfer(list)
    }
}

impl From<RegDescList> for DescriptorInput<'_> {
    fn from(list: RegDescList) -> Self {
        DescriptorInput::Reg(list)
    }
}

impl<'a, D: NixlDescriptor + 'a> From<&'a D> for DescriptorInput<'a> {
    fn from(buffer: &'a D) -> Self {
        DescriptorInput::Buffer(buffer)
    }
}
