// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the encoder
//! run so we can test it in isolation.
//!
//! [`DummyMfc`] behaves like the hardware as far as buffer flow is concerned: raw frames are
//! released as soon as they are queued, frames are held in a reorder window when B frames are
//! enabled, and every coded frame carries the tag of the raw frame it came from. Buffer memory is
//! emulated by a map keyed by the handle of the first plane.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use nix::errno::Errno;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::BufferOps;
use crate::backend::EncoderOps;
use crate::backend::FrameType;
use crate::backend::Geometry;
use crate::backend::HwBuffer;
use crate::backend::MfcBackend;
use crate::backend::MfcDevice;
use crate::backend::OpenParams;
use crate::backend::INDEX_AFTER_DRC;
use crate::backend::INDEX_HEADER_DATA;
use crate::buffer::Plane;
use crate::encoder::HeaderMode;
use crate::encoder::QpRange;
use crate::encoder::RoiInfo;
use crate::encoder::TemporalLayers;
use crate::omx::PortIndex;
use crate::utils::START_CODE;

/// Header data emitted when the bitstream queue starts: two parameter sets.
pub const DUMMY_HEADER: [u8; 16] = [
    0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1f, 0x00, 0x00, 0x00, 0x01, 0x68, 0xce, 0x3c, 0x80,
];

/// Size of every coded frame.
pub const DUMMY_FRAME_LEN: u32 = 17;

/// First handle given to allocated buffers.
const ALLOC_HANDLE_BASE: u64 = 0x4000_0000;

/// Calls made on the dummy, in order. Queries, dequeues and memory management are not recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DummyEvent {
    SetGeometry(PortIndex, Geometry),
    Shareable(PortIndex),
    Cacheable(PortIndex),
    Setup(PortIndex, usize),
    Run(PortIndex),
    Stop(PortIndex),
    ClearQueue(PortIndex),
    ClearRegistered(PortIndex),
    Cleanup(PortIndex),
    InputEnqueue { tag: i32 },
    FrameType(FrameType),
    IdrPeriod(u32),
    Bitrate(u32),
    Framerate(u32),
    QpRange(QpRange),
    TemporalLayers(TemporalLayers),
    Roi(RoiInfo),
    Priority(u32),
    DropControl(bool),
    DynamicFramerate(bool),
    OperatingRate(u32),
    HeaderMode(HeaderMode),
    Close,
}

/// A frame waiting to be written into a bitstream buffer.
#[derive(Copy, Clone, Debug)]
struct CodedEntry {
    tag: i32,
    frame_type: FrameType,
    timestamp: i64,
}

impl CodedEntry {
    fn header() -> Self {
        Self {
            tag: INDEX_HEADER_DATA,
            frame_type: FrameType::NotCoded,
            timestamp: 0,
        }
    }

    fn payload(&self) -> Vec<u8> {
        if self.tag == INDEX_HEADER_DATA {
            return DUMMY_HEADER.to_vec();
        }
        let mut payload = START_CODE.to_vec();
        payload.push(if self.frame_type.is_intra() { 0x65 } else { 0x41 });
        payload.extend_from_slice(&self.tag.to_le_bytes());
        payload.extend_from_slice(&self.timestamp.to_le_bytes());
        payload
    }
}

#[derive(Default)]
struct QueueState {
    geometry: Geometry,
    streaming: bool,
    started: bool,
    queued: VecDeque<HwBuffer>,
    done: VecDeque<HwBuffer>,
}

struct DummyState {
    b_frames: usize,
    header_mode: HeaderMode,
    input: QueueState,
    output: QueueState,
    /// Frames held in the reorder window.
    held: Vec<CodedEntry>,
    coded: VecDeque<CodedEntry>,
    frames_in_stream: u64,
    force_intra: bool,
    header_pending: bool,
    hw_timestamps: bool,
    fail_geometry: bool,
    fail_input_enqueue: bool,
    fail_output_enqueue: bool,
    fail_output_dequeue: bool,
    fail_export: bool,
    events: Vec<DummyEvent>,
    memory: HashMap<u64, Vec<u8>>,
    allocated: HashSet<u64>,
    next_handle: u64,
    copies: usize,
    closed: bool,
}

impl DummyState {
    fn queue(&mut self, port: PortIndex) -> &mut QueueState {
        match port {
            PortIndex::Input => &mut self.input,
            PortIndex::Output => &mut self.output,
        }
    }

    fn record(&mut self, event: DummyEvent) {
        self.events.push(event);
    }

    fn release_held_as_b(&mut self) {
        for mut entry in self.held.drain(..) {
            entry.frame_type = FrameType::B;
            self.coded.push_back(entry);
        }
    }

    fn encode(&mut self, buffer: HwBuffer) {
        let mut entry = CodedEntry {
            tag: buffer.tag,
            frame_type: FrameType::P,
            timestamp: buffer.timestamp,
        };
        let eos = buffer.eos;
        self.input.done.push_back(buffer);

        let first = self.frames_in_stream == 0;
        self.frames_in_stream += 1;
        if first || std::mem::take(&mut self.force_intra) {
            if !first && self.header_mode == HeaderMode::WithEveryIdr {
                self.coded.push_back(CodedEntry::header());
            }
            entry.frame_type = FrameType::I;
            self.coded.push_back(entry);
            self.release_held_as_b();
        } else if eos || self.held.len() >= self.b_frames {
            self.coded.push_back(entry);
            self.release_held_as_b();
        } else {
            self.held.push(entry);
        }
    }

    fn run(&mut self, port: PortIndex) {
        self.record(DummyEvent::Run(port));
        match port {
            PortIndex::Input => {
                if self.input.started {
                    // A restarted stream begins with new header data.
                    self.coded.push_back(CodedEntry::header());
                }
                self.input.started = true;
                self.input.streaming = true;
                while let Some(buffer) = self.input.queued.pop_front() {
                    self.encode(buffer);
                }
            }
            PortIndex::Output => {
                self.output.streaming = true;
                self.header_pending = true;
            }
        }
    }

    fn stop(&mut self, port: PortIndex) {
        self.record(DummyEvent::Stop(port));
        match port {
            PortIndex::Input => {
                self.input.streaming = false;
                // Frames still in the reorder window are dropped.
                for mut entry in self.held.drain(..) {
                    entry.tag = INDEX_AFTER_DRC;
                    entry.frame_type = FrameType::B;
                    self.coded.push_back(entry);
                }
                self.frames_in_stream = 0;
                let queued: Vec<_> = self.input.queued.drain(..).collect();
                self.input.done.extend(queued);
            }
            PortIndex::Output => {
                self.output.streaming = false;
                self.header_pending = false;
                self.coded.clear();
                let queued: Vec<_> = self
                    .output
                    .queued
                    .drain(..)
                    .map(|mut buffer| {
                        buffer.data_size = 0;
                        buffer
                    })
                    .collect();
                self.output.done.extend(queued);
            }
        }
    }

    fn dequeue_output(&mut self) -> BackendResult<HwBuffer> {
        if std::mem::take(&mut self.fail_output_dequeue) {
            return Err(BackendError::Io(Errno::EIO));
        }
        if let Some(buffer) = self.output.done.pop_front() {
            return Ok(buffer);
        }
        if !self.output.streaming || self.output.queued.is_empty() {
            return Err(BackendError::NotReady);
        }
        let entry = if std::mem::take(&mut self.header_pending) {
            CodedEntry::header()
        } else {
            self.coded.pop_front().ok_or(BackendError::NotReady)?
        };
        let mut buffer = self
            .output
            .queued
            .pop_front()
            .ok_or(BackendError::NotReady)?;

        let payload = entry.payload();
        buffer.data_size = payload.len() as u32;
        buffer.tag = entry.tag;
        buffer.frame_type = entry.frame_type;
        buffer.timestamp = if self.hw_timestamps {
            entry.timestamp
        } else {
            0
        };
        if let Some(plane) = buffer.planes.first_mut() {
            plane.data_len = buffer.data_size;
            self.memory.insert(plane.handle, payload);
        }

        Ok(buffer)
    }
}

/// One direction of the dummy codec.
#[derive(Clone)]
struct DummyQueue {
    state: Arc<Mutex<DummyState>>,
    port: PortIndex,
}

impl BufferOps for DummyQueue {
    fn setup(&self, num_buffers: usize) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(DummyEvent::Setup(self.port, num_buffers));
        Ok(())
    }

    fn run(&self) -> BackendResult<()> {
        self.state.lock().unwrap().run(self.port);
        Ok(())
    }

    fn stop(&self) -> BackendResult<()> {
        self.state.lock().unwrap().stop(self.port);
        Ok(())
    }

    fn clear_queue(&self) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(DummyEvent::ClearQueue(self.port));
        state.queue(self.port).queued.clear();
        Ok(())
    }

    fn enqueue(&self, buffer: HwBuffer) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        match self.port {
            PortIndex::Input => {
                if std::mem::take(&mut state.fail_input_enqueue) {
                    return Err(BackendError::Io(Errno::EIO));
                }
                state.record(DummyEvent::InputEnqueue { tag: buffer.tag });
                if state.input.streaming {
                    state.encode(buffer);
                } else {
                    state.input.queued.push_back(buffer);
                }
            }
            PortIndex::Output => {
                if std::mem::take(&mut state.fail_output_enqueue) {
                    return Err(BackendError::Io(Errno::EIO));
                }
                state.output.queued.push_back(buffer);
            }
        }
        Ok(())
    }

    fn dequeue(&self) -> BackendResult<HwBuffer> {
        let mut state = self.state.lock().unwrap();
        match self.port {
            PortIndex::Input => state.input.done.pop_front().ok_or(BackendError::NotReady),
            PortIndex::Output => state.dequeue_output(),
        }
    }

    fn set_geometry(&self, geometry: &Geometry) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_geometry {
            return Err(BackendError::Io(Errno::EINVAL));
        }
        state.record(DummyEvent::SetGeometry(self.port, *geometry));
        state.queue(self.port).geometry = *geometry;
        Ok(())
    }

    fn get_geometry(&self) -> BackendResult<Geometry> {
        Ok(self.state.lock().unwrap().queue(self.port).geometry)
    }

    fn set_shareable(&self) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(DummyEvent::Shareable(self.port));
        Ok(())
    }

    fn enable_cacheable(&self) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(DummyEvent::Cacheable(self.port));
        Ok(())
    }

    fn clear_registered_buffer(&self) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(DummyEvent::ClearRegistered(self.port));
        Ok(())
    }

    fn cleanup_buffer(&self) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(DummyEvent::Cleanup(self.port));
        Ok(())
    }

    fn export(&self, buffer: &HwBuffer) -> BackendResult<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_export) {
            return Err(BackendError::Io(Errno::EFAULT));
        }
        let handle = buffer.planes.first().map(|plane| plane.handle).unwrap_or(0);
        let data = state
            .memory
            .get(&handle)
            .ok_or_else(|| anyhow::anyhow!("no memory behind buffer {handle:#x}"))?;
        let len = data.len().min(buffer.data_size as usize);
        Ok(data[..len].to_vec())
    }
}

#[derive(Clone)]
struct DummyEncoder(Arc<Mutex<DummyState>>);

impl DummyEncoder {
    fn record(&self, event: DummyEvent) -> BackendResult<()> {
        self.0.lock().unwrap().record(event);
        Ok(())
    }
}

impl EncoderOps for DummyEncoder {
    fn set_frame_type(&self, frame_type: FrameType) -> BackendResult<()> {
        if frame_type.is_intra() {
            self.0.lock().unwrap().force_intra = true;
        }
        self.record(DummyEvent::FrameType(frame_type))
    }

    fn set_idr_period(&self, period: u32) -> BackendResult<()> {
        self.record(DummyEvent::IdrPeriod(period))
    }

    fn set_bitrate(&self, bitrate: u32) -> BackendResult<()> {
        self.record(DummyEvent::Bitrate(bitrate))
    }

    fn set_framerate(&self, framerate: u32) -> BackendResult<()> {
        self.record(DummyEvent::Framerate(framerate))
    }

    fn set_qp_range(&self, range: &QpRange) -> BackendResult<()> {
        self.record(DummyEvent::QpRange(*range))
    }

    fn set_temporal_layers(&self, layers: &TemporalLayers) -> BackendResult<()> {
        self.record(DummyEvent::TemporalLayers(layers.clone()))
    }

    fn set_roi(&self, roi: &RoiInfo) -> BackendResult<()> {
        self.record(DummyEvent::Roi(roi.clone()))
    }

    fn set_priority(&self, priority: u32) -> BackendResult<()> {
        self.record(DummyEvent::Priority(priority))
    }

    fn set_drop_control(&self, enable: bool) -> BackendResult<()> {
        self.record(DummyEvent::DropControl(enable))
    }

    fn set_dynamic_framerate(&self, enable: bool) -> BackendResult<()> {
        self.record(DummyEvent::DynamicFramerate(enable))
    }

    fn set_operating_rate(&self, rate: u32) -> BackendResult<()> {
        self.record(DummyEvent::OperatingRate(rate))
    }

    fn set_header_mode(&self, mode: HeaderMode) -> BackendResult<()> {
        self.0.lock().unwrap().header_mode = mode;
        self.record(DummyEvent::HeaderMode(mode))
    }
}

/// Dummy codec instance. Clones share the same state, so a test can keep one to inspect what
/// the session did with the other.
#[derive(Clone)]
pub struct DummyMfc {
    state: Arc<Mutex<DummyState>>,
    encoder: DummyEncoder,
    input: DummyQueue,
    output: DummyQueue,
}

impl DummyMfc {
    pub fn new(params: &OpenParams) -> Self {
        let state = Arc::new(Mutex::new(DummyState {
            b_frames: params.b_frames as usize,
            header_mode: params.header_mode,
            input: Default::default(),
            output: Default::default(),
            held: Vec::new(),
            coded: VecDeque::new(),
            frames_in_stream: 0,
            force_intra: false,
            header_pending: false,
            hw_timestamps: false,
            fail_geometry: false,
            fail_input_enqueue: false,
            fail_output_enqueue: false,
            fail_output_dequeue: false,
            fail_export: false,
            events: Vec::new(),
            memory: HashMap::new(),
            allocated: HashSet::new(),
            next_handle: ALLOC_HANDLE_BASE,
            copies: 0,
            closed: false,
        }));
        Self {
            encoder: DummyEncoder(Arc::clone(&state)),
            input: DummyQueue {
                state: Arc::clone(&state),
                port: PortIndex::Input,
            },
            output: DummyQueue {
                state: Arc::clone(&state),
                port: PortIndex::Output,
            },
            state,
        }
    }

    pub fn events(&self) -> Vec<DummyEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().unwrap().events.clear();
    }

    /// Makes `set_geometry` fail until called again with `false`.
    pub fn fail_geometry(&self, fail: bool) {
        self.state.lock().unwrap().fail_geometry = fail;
    }

    /// Makes the next raw frame enqueue fail.
    pub fn fail_next_input_enqueue(&self) {
        self.state.lock().unwrap().fail_input_enqueue = true;
    }

    /// Makes the next bitstream dequeue fail with an I/O error.
    pub fn fail_output_dequeue(&self) {
        self.state.lock().unwrap().fail_output_dequeue = true;
    }

    /// Makes the next bitstream buffer enqueue fail.
    pub fn fail_next_output_enqueue(&self) {
        self.state.lock().unwrap().fail_output_enqueue = true;
    }

    /// Makes the next export of a buffer's content fail.
    pub fn fail_next_export(&self) {
        self.state.lock().unwrap().fail_export = true;
    }

    /// Returns `buffer` from the next dequeue on `port`, as if the hardware was done with it.
    pub fn inject_done(&self, port: PortIndex, buffer: HwBuffer) {
        self.state.lock().unwrap().queue(port).done.push_back(buffer);
    }

    /// Appends a coded frame with an arbitrary tag to the bitstream.
    pub fn inject_output(&self, tag: i32, frame_type: FrameType, timestamp: i64) {
        self.state.lock().unwrap().coded.push_back(CodedEntry {
            tag,
            frame_type,
            timestamp,
        });
    }

    /// Reports the timestamp of the source frame on coded buffers instead of 0.
    pub fn set_hardware_timestamps(&self, enable: bool) {
        self.state.lock().unwrap().hw_timestamps = enable;
    }

    pub fn num_copies(&self) -> usize {
        self.state.lock().unwrap().copies
    }

    /// Number of buffers allocated and not freed yet.
    pub fn num_allocated(&self) -> usize {
        self.state.lock().unwrap().allocated.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn write_memory(&self, handle: u64, data: &[u8]) {
        self.state.lock().unwrap().memory.insert(handle, data.to_vec());
    }

    pub fn read_memory(&self, handle: u64) -> Option<Vec<u8>> {
        self.state.lock().unwrap().memory.get(&handle).cloned()
    }
}

impl MfcBackend for DummyMfc {
    fn encoder(&self) -> &dyn EncoderOps {
        &self.encoder
    }

    fn input(&self) -> &dyn BufferOps {
        &self.input
    }

    fn output(&self) -> &dyn BufferOps {
        &self.output
    }

    fn alloc_buffer(&self, sizes: &[u32]) -> BackendResult<Vec<Plane>> {
        let mut state = self.state.lock().unwrap();
        let planes: Vec<_> = sizes
            .iter()
            .map(|size| {
                let handle = state.next_handle;
                state.next_handle += 0x10_0000;
                Plane::new(handle, *size)
            })
            .collect();
        if let Some(plane) = planes.first() {
            state.allocated.insert(plane.handle);
        }
        Ok(planes)
    }

    fn free_buffer(&self, planes: &[Plane]) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        for plane in planes {
            state.memory.remove(&plane.handle);
        }
        match planes.first() {
            Some(plane) if state.allocated.remove(&plane.handle) => Ok(()),
            _ => Err(BackendError::Io(Errno::EINVAL)),
        }
    }

    fn copy_planes(&self, src: &[Plane], dst: &[Plane], len: u32) -> BackendResult<()> {
        let (Some(src), Some(dst)) = (src.first(), dst.first()) else {
            return Err(BackendError::Io(Errno::EINVAL));
        };
        let mut state = self.state.lock().unwrap();
        let len = len as usize;
        let data = match state.memory.get(&src.handle) {
            Some(data) => data[..len.min(data.len())].to_vec(),
            None => vec![0; len],
        };
        state.memory.insert(dst.handle, data);
        state.copies += 1;
        Ok(())
    }

    fn close(&self) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.record(DummyEvent::Close);
        Ok(())
    }
}

/// Opens [`DummyMfc`] instances.
#[derive(Default)]
pub struct DummyDevice {
    last_opened: Arc<Mutex<Option<DummyMfc>>>,
    fail_open: bool,
}

impl DummyDevice {
    pub fn new() -> Self {
        Default::default()
    }

    /// A device whose `open` always fails.
    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Default::default()
        }
    }

    /// Handle on the instances opened by this device, valid after the device is moved away.
    pub fn opened(&self) -> Arc<Mutex<Option<DummyMfc>>> {
        Arc::clone(&self.last_opened)
    }
}

impl MfcDevice for DummyDevice {
    type Backend = DummyMfc;

    fn open(&mut self, params: &OpenParams) -> BackendResult<DummyMfc> {
        if self.fail_open {
            return Err(BackendError::Unsupported("no codec device"));
        }
        let mfc = DummyMfc::new(params);
        *self.last_opened.lock().unwrap() = Some(mfc.clone());
        Ok(mfc)
    }
}
