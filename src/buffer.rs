// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer descriptors moving through the component.

use crate::omx::BufferFlags;

/// Maximum number of planes of a single buffer.
pub const MAX_PLANES: usize = 3;

/// Identifier of a buffer header owned by the framework.
///
/// The framework keeps ownership of its buffer headers; the component only borrows them while a
/// buffer is being processed and hands the id back with the completed descriptor.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHeaderId(pub u64);

/// One plane of a buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Plane {
    /// Address or dma-buf fd identifying the plane memory. Only compared, never dereferenced.
    pub handle: u64,
    /// Allocated size of the plane in bytes.
    pub alloc_len: u32,
    /// Number of valid bytes in the plane.
    pub data_len: u32,
}

impl Plane {
    pub fn new(handle: u64, alloc_len: u32) -> Self {
        Self {
            handle,
            alloc_len,
            data_len: 0,
        }
    }
}

/// One in-flight unit of media data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub planes: Vec<Plane>,
    /// Total allocated size.
    pub alloc_size: u32,
    /// Number of valid bytes.
    pub data_len: u32,
    /// Number of bytes already consumed.
    pub used_len: u32,
    /// Number of bytes left to deliver.
    pub remain_len: u32,
    pub flags: BufferFlags,
    /// Presentation timestamp in microseconds.
    pub timestamp: i64,
    /// The framework header this descriptor came from.
    pub header: Option<BufferHeaderId>,
    /// Index in the port's codec buffer pool, in COPY mode.
    pub codec_index: Option<usize>,
}

impl BufferDescriptor {
    /// Creates a descriptor for a framework buffer with a single plane.
    pub fn from_header(header: BufferHeaderId, handle: u64, alloc_size: u32) -> Self {
        Self {
            planes: vec![Plane::new(handle, alloc_size)],
            alloc_size,
            header: Some(header),
            ..Default::default()
        }
    }

    /// Sets the valid payload of the buffer.
    pub fn with_payload(mut self, data_len: u32, timestamp: i64, flags: BufferFlags) -> Self {
        self.data_len = data_len;
        self.remain_len = data_len;
        self.timestamp = timestamp;
        self.flags = flags;
        if let Some(plane) = self.planes.first_mut() {
            plane.data_len = data_len;
        }
        self
    }

    /// Handle of the first plane, used to match buffers returned by the hardware.
    pub fn plane0_handle(&self) -> Option<u64> {
        self.planes.first().map(|plane| plane.handle).filter(|h| *h != 0)
    }

    /// Whether this buffer carries nothing but the end-of-stream flag.
    pub fn is_eos_only(&self) -> bool {
        self.data_len == 0 && self.flags.contains(BufferFlags::EOS)
    }

    /// Clears payload and metadata before the descriptor is reused for a new fill.
    pub fn reset_payload(&mut self) {
        self.data_len = 0;
        self.used_len = 0;
        self.remain_len = 0;
        self.flags = BufferFlags::empty();
        self.timestamp = 0;
        for plane in self.planes.iter_mut() {
            plane.data_len = 0;
        }
    }
}
