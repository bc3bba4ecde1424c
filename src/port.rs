// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Port state: definition snapshots, buffer queues and codec buffer pools.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::align_up;
use crate::backend::MfcBackend;
use crate::buffer::BufferDescriptor;
use crate::buffer::Plane;
use crate::encoder::Codec;
use crate::omx::OmxError;
use crate::omx::OmxResult;
use crate::omx::PortIndex;
use crate::signal::Semaphore;
use crate::signal::SignalResult;
use crate::ColorFormat;
use crate::Rect;
use crate::Resolution;
use crate::Rotation;

/// How the buffers of a port reach the hardware.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BufferProcessMode {
    /// Data is copied between framework buffers and a pool of codec-allocated buffers.
    Copy,
    /// Framework buffers are handed to the hardware directly.
    #[default]
    Share,
}

/// What a framework buffer of the port actually contains.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MetadataType {
    /// The buffer holds the media data itself.
    #[default]
    None,
    /// The buffer holds a native handle referencing the data.
    NativeHandle,
    /// The buffer holds a graphic buffer reference.
    GraphicBuffer,
}

/// What flows through a port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortFormat {
    Raw(ColorFormat),
    Coded(Codec),
}

/// Negotiated configuration of a port. Instances are immutable and replaced as a whole when a
/// setting changes, so a stage reading a snapshot never sees a half-updated geometry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortDefinition {
    pub index: PortIndex,
    pub format: PortFormat,
    pub buffer_count_actual: usize,
    pub buffer_count_min: usize,
    /// Size of one framework buffer.
    pub buffer_size: u32,
    pub resolution: Resolution,
    pub stride: u32,
    pub slice_height: u32,
    /// Framerate in Q16 frames per second.
    pub framerate: u32,
    /// Target bitrate, output port only.
    pub bitrate: u32,
    /// Area of the input frame to encode.
    pub crop: Rect,
    pub rotation: Rotation,
}

impl PortDefinition {
    pub fn new_input(resolution: Resolution, color_format: ColorFormat) -> Self {
        let stride = align_up(resolution.width, 16);
        Self {
            index: PortIndex::Input,
            format: PortFormat::Raw(color_format),
            buffer_count_actual: 4,
            buffer_count_min: 4,
            buffer_size: raw_frame_size(stride, resolution.height),
            resolution,
            stride,
            slice_height: resolution.height,
            framerate: 30 << 16,
            bitrate: 0,
            crop: Rect::from(resolution),
            rotation: Rotation::Deg0,
        }
    }

    pub fn new_output(resolution: Resolution, codec: Codec) -> Self {
        Self {
            index: PortIndex::Output,
            format: PortFormat::Coded(codec),
            buffer_count_actual: 4,
            buffer_count_min: 2,
            buffer_size: bitstream_buffer_size(resolution),
            resolution,
            stride: 0,
            slice_height: 0,
            framerate: 0,
            bitrate: 0,
            crop: Rect::from(resolution),
            rotation: Rotation::Deg0,
        }
    }

    /// Changes the frame size, resetting the crop area and recomputing the derived sizes.
    pub fn set_resolution(&mut self, resolution: Resolution) {
        self.resolution = resolution;
        self.crop = Rect::from(resolution);
        match self.format {
            PortFormat::Raw(_) => {
                self.stride = align_up(resolution.width, 16);
                self.slice_height = resolution.height;
                self.buffer_size = raw_frame_size(self.stride, resolution.height);
            }
            PortFormat::Coded(_) => self.buffer_size = bitstream_buffer_size(resolution),
        }
    }

    pub fn color_format(&self) -> Option<ColorFormat> {
        match self.format {
            PortFormat::Raw(format) => Some(format),
            PortFormat::Coded(_) => None,
        }
    }
}

/// Largest frame the hardware encodes, in either orientation.
pub const MAX_RESOLUTION: Resolution = Resolution {
    width: 8192,
    height: 8192,
};

/// Size of a 4:2:0 frame with the given luma stride.
pub fn raw_frame_size(stride: u32, height: u32) -> u32 {
    let height = align_up(height, 16);
    stride * height * 3 / 2
}

/// Worst-case size of one encoded frame.
pub fn bitstream_buffer_size(resolution: Resolution) -> u32 {
    raw_frame_size(align_up(resolution.width, 16), resolution.height)
}

/// Bounded FIFO paired with a counting semaphore tracking its length.
pub struct PortQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Semaphore,
    capacity: usize,
}

impl<T> PortQueue<T> {
    pub fn new(capacity: usize) -> SignalResult<Self> {
        Ok(Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Semaphore::new()?,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, item: T) -> OmxResult<()> {
        {
            let mut items = self.items.lock().unwrap();
            if items.len() >= self.capacity {
                log::error!("port queue overflow (capacity {})", self.capacity);
                return Err(OmxError::InsufficientResources);
            }
            items.push_back(item);
        }
        self.available.post()?;
        Ok(())
    }

    /// Waits up to `timeout` for an item.
    pub fn pop_timeout(&self, timeout: Duration) -> OmxResult<Option<T>> {
        if !self.available.wait_timeout(timeout)? {
            return Ok(None);
        }
        Ok(self.pop_counted())
    }

    pub fn try_pop(&self) -> OmxResult<Option<T>> {
        if !self.available.try_wait()? {
            return Ok(None);
        }
        Ok(self.pop_counted())
    }

    fn pop_counted(&self) -> Option<T> {
        let item = self.items.lock().unwrap().pop_front();
        if item.is_none() {
            // A concurrent drain took the item before its count.
            log::trace!("port queue count without item");
        }
        item
    }

    /// Removes every queued item.
    pub fn drain(&self) -> OmxResult<Vec<T>> {
        let mut items = self.items.lock().unwrap();
        self.available.reset()?;
        Ok(items.drain(..).collect())
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A buffer allocated by the codec for COPY mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecBuffer {
    pub planes: Vec<Plane>,
    pub alloc_size: u32,
}

/// Codec-allocated buffers of a COPY mode port, with the queue of those currently free.
pub struct CodecBufferPool {
    buffers: Vec<CodecBuffer>,
    free: PortQueue<usize>,
}

impl CodecBufferPool {
    pub fn allocate<B: MfcBackend>(
        backend: &B,
        count: usize,
        plane_sizes: &[u32],
    ) -> OmxResult<Self> {
        let free = PortQueue::new(count)?;
        let mut buffers: Vec<CodecBuffer> = Vec::with_capacity(count);
        for index in 0..count {
            let planes = match backend.alloc_buffer(plane_sizes) {
                Ok(planes) => planes,
                Err(err) => {
                    log::error!("failed to allocate codec buffer {index}: {err}");
                    for buffer in &buffers {
                        let _ = backend.free_buffer(&buffer.planes);
                    }
                    return Err(OmxError::InsufficientResources);
                }
            };
            buffers.push(CodecBuffer {
                planes,
                alloc_size: plane_sizes.iter().sum(),
            });
            free.push(index)?;
        }

        Ok(Self { buffers, free })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CodecBuffer> {
        self.buffers.get(index)
    }

    /// Finds the buffer whose first plane is `handle`.
    pub fn find(&self, handle: u64) -> Option<usize> {
        self.buffers
            .iter()
            .position(|buffer| buffer.planes.first().map(|p| p.handle) == Some(handle))
    }

    /// Takes a free buffer, waiting up to `timeout` for one.
    pub fn acquire(&self, timeout: Duration) -> OmxResult<Option<usize>> {
        self.free.pop_timeout(timeout)
    }

    pub fn release(&self, index: usize) -> OmxResult<()> {
        if index >= self.buffers.len() {
            return Err(OmxError::BadParameter);
        }
        self.free.push(index)
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    /// Marks every buffer free again.
    pub fn reset(&self) -> OmxResult<()> {
        self.free.drain()?;
        for index in 0..self.buffers.len() {
            self.free.push(index)?;
        }
        Ok(())
    }

    /// Builds a descriptor pointing at buffer `index`.
    pub fn descriptor(&self, index: usize) -> Option<BufferDescriptor> {
        let buffer = self.buffers.get(index)?;
        Some(BufferDescriptor {
            planes: buffer.planes.clone(),
            alloc_size: buffer.alloc_size,
            codec_index: Some(index),
            ..Default::default()
        })
    }

    pub fn free_all<B: MfcBackend>(&self, backend: &B) {
        for buffer in &self.buffers {
            if let Err(err) = backend.free_buffer(&buffer.planes) {
                log::warn!("failed to free codec buffer: {err}");
            }
        }
    }
}

/// Static configuration of a port, fixed when the codec session is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortConfig {
    pub mode: BufferProcessMode,
    pub metadata: MetadataType,
    pub definition: PortDefinition,
}

/// One direction of the component.
pub struct Port {
    index: PortIndex,
    mode: BufferProcessMode,
    metadata: MetadataType,
    definition: Mutex<Arc<PortDefinition>>,
    enabled: AtomicBool,
    populated: AtomicBool,
    queue: Mutex<Arc<PortQueue<BufferDescriptor>>>,
    pool: Option<CodecBufferPool>,
}

impl Port {
    pub fn new(config: &PortConfig, pool: Option<CodecBufferPool>) -> OmxResult<Self> {
        let definition = config.definition.clone();
        let queue = PortQueue::new(definition.buffer_count_actual)?;
        Ok(Self {
            index: definition.index,
            mode: config.mode,
            metadata: config.metadata,
            definition: Mutex::new(Arc::new(definition)),
            enabled: AtomicBool::new(true),
            populated: AtomicBool::new(false),
            queue: Mutex::new(Arc::new(queue)),
            pool,
        })
    }

    pub fn index(&self) -> PortIndex {
        self.index
    }

    pub fn mode(&self) -> BufferProcessMode {
        self.mode
    }

    pub fn metadata(&self) -> MetadataType {
        self.metadata
    }

    /// Current definition snapshot.
    pub fn definition(&self) -> Arc<PortDefinition> {
        Arc::clone(&self.definition.lock().unwrap())
    }

    /// Replaces the definition with an updated copy.
    pub fn update_definition<F>(&self, update: F) -> Arc<PortDefinition>
    where
        F: FnOnce(&mut PortDefinition),
    {
        let mut current = self.definition.lock().unwrap();
        let mut next = PortDefinition::clone(&current);
        update(&mut next);
        *current = Arc::new(next);
        Arc::clone(&current)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }

    pub fn set_populated(&self, populated: bool) {
        self.populated.store(populated, Ordering::Release);
    }

    pub fn queue(&self) -> Arc<PortQueue<BufferDescriptor>> {
        Arc::clone(&self.queue.lock().unwrap())
    }

    pub fn pool(&self) -> Option<&CodecBufferPool> {
        self.pool.as_ref()
    }

    /// Disables the port and returns every framework buffer it still held.
    pub fn disable(&self) -> OmxResult<Vec<BufferDescriptor>> {
        self.enabled.store(false, Ordering::Release);
        self.populated.store(false, Ordering::Release);
        self.queue().drain()
    }

    /// Recreates the buffer queue from the current definition and enables the port.
    pub fn enable(&self) -> OmxResult<()> {
        let capacity = self.definition().buffer_count_actual;
        *self.queue.lock().unwrap() = Arc::new(PortQueue::new(capacity)?);
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferHeaderId;

    fn input_config(count: usize) -> PortConfig {
        let mut definition =
            PortDefinition::new_input(Resolution::from((320, 240)), ColorFormat::NV12);
        definition.buffer_count_actual = count;
        PortConfig {
            mode: BufferProcessMode::Share,
            metadata: MetadataType::None,
            definition,
        }
    }

    #[test]
    fn queue_is_fifo_and_bounded() {
        let queue = PortQueue::new(2).unwrap();
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.push(3), Err(OmxError::InsufficientResources));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop_timeout(Duration::from_millis(5)).unwrap(), Some(1));
        assert_eq!(queue.try_pop().unwrap(), Some(2));
        assert_eq!(queue.try_pop().unwrap(), None);
        assert_eq!(queue.pop_timeout(Duration::from_millis(5)).unwrap(), None);
    }

    #[test]
    fn drained_queue_has_no_stale_count() {
        let queue = PortQueue::new(4).unwrap();
        queue.push('a').unwrap();
        queue.push('b').unwrap();
        assert_eq!(queue.drain().unwrap(), vec!['a', 'b']);
        assert_eq!(queue.try_pop().unwrap(), None);
        queue.push('c').unwrap();
        assert_eq!(queue.try_pop().unwrap(), Some('c'));
    }

    #[test]
    fn definition_snapshots_are_not_mutated_in_place() {
        let port = Port::new(&input_config(4), None).unwrap();
        let before = port.definition();
        port.update_definition(|def| def.rotation = Rotation::Deg90);
        assert_eq!(before.rotation, Rotation::Deg0);
        assert_eq!(port.definition().rotation, Rotation::Deg90);
    }

    #[test]
    fn disable_returns_buffers_and_enable_recreates_queue() {
        let port = Port::new(&input_config(2), None).unwrap();
        let desc = BufferDescriptor::from_header(BufferHeaderId(7), 0x1000, 16);
        port.queue().push(desc.clone()).unwrap();
        port.set_populated(true);

        let returned = port.disable().unwrap();
        assert_eq!(returned, vec![desc]);
        assert!(!port.is_enabled());
        assert!(!port.is_populated());

        port.update_definition(|def| def.buffer_count_actual = 6);
        port.enable().unwrap();
        assert!(port.is_enabled());
        assert_eq!(port.queue().capacity(), 6);
        assert!(port.queue().is_empty());
    }

    #[test]
    fn resolution_change_recomputes_sizes() {
        let mut definition =
            PortDefinition::new_input(Resolution::from((320, 240)), ColorFormat::NV12);
        definition.crop = Rect {
            left: 8,
            top: 8,
            width: 100,
            height: 100,
        };
        definition.set_resolution(Resolution::from((1000, 500)));
        assert_eq!(definition.stride, 1008);
        assert_eq!(definition.slice_height, 500);
        assert_eq!(definition.crop, Rect::from(Resolution::from((1000, 500))));
        assert_eq!(definition.buffer_size, raw_frame_size(1008, 500));

        let mut definition = PortDefinition::new_output(Resolution::from((320, 240)), Codec::Vp8);
        definition.set_resolution(Resolution::from((640, 480)));
        assert_eq!(definition.buffer_size, bitstream_buffer_size(Resolution::from((640, 480))));
        assert_eq!(definition.stride, 0);
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(raw_frame_size(320, 240), 320 * 240 * 3 / 2);
        // Height is padded to a macroblock multiple.
        assert_eq!(raw_frame_size(1920, 1080), 1920 * 1088 * 3 / 2);
        assert_eq!(bitstream_buffer_size(Resolution::from((100, 100))), 112 * 112 * 3 / 2);
    }
}
