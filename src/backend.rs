// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the hardware codec.
//!
//! A backend is one opened instance of the MFC codec. It exposes the encoder parameter setters
//! ([`EncoderOps`]) and two buffer operation sets ([`BufferOps`]), one for the raw frame queue
//! and one for the bitstream queue. The component never talks to the driver directly, which lets
//! [`dummy`] stand in for the hardware in tests.

#[cfg(any(test, feature = "dummy"))]
pub mod dummy;

use nix::errno::Errno;
use thiserror::Error;

use crate::buffer::BufferHeaderId;
use crate::buffer::Plane;
use crate::encoder::params::ProfileLevel;
use crate::encoder::Codec;
use crate::encoder::EncodeParams;
use crate::encoder::HeaderMode;
use crate::encoder::QpRange;
use crate::encoder::RoiInfo;
use crate::encoder::TemporalLayers;
use crate::ColorFormat;
use crate::Resolution;

/// Frame tag reported for bitstream buffers whose source frame was dropped by a reconfiguration.
pub const INDEX_AFTER_DRC: i32 = 0x00D0_0000;
/// Frame tag reported for bitstream buffers holding codec header data.
pub const INDEX_HEADER_DATA: i32 = 0x00C0_0000;

#[derive(Debug, Error)]
pub enum BackendError {
    /// No buffer is ready yet. Not an error for callers polling the hardware.
    #[error("no buffer ready")]
    NotReady,
    #[error("device I/O failure: {0}")]
    Io(Errno),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Coding type of a frame, as requested from or reported by the hardware.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameType {
    #[default]
    NotCoded,
    I,
    P,
    B,
    Skipped,
    Other,
}

impl FrameType {
    pub fn is_intra(&self) -> bool {
        matches!(self, FrameType::I)
    }
}

/// Layout of the buffers of one hardware queue.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Geometry {
    pub resolution: Resolution,
    /// Line stride of the first plane, in bytes.
    pub stride: u32,
    /// Pixel layout for raw frame queues, `None` for bitstream queues.
    pub color_format: Option<ColorFormat>,
    /// Size of a single bitstream buffer, for bitstream queues.
    pub buffer_size: u32,
}

/// A buffer as exchanged with the hardware queues.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HwBuffer {
    pub planes: Vec<Plane>,
    /// Number of valid bytes over all planes.
    pub data_size: u32,
    /// Opaque frame tag. Set on raw frames at enqueue time and reported back on the bitstream
    /// buffer that holds the coded frame.
    pub tag: i32,
    /// Timestamp reported by the hardware, 0 if the hardware does not track timestamps.
    pub timestamp: i64,
    /// Coding type reported for bitstream buffers.
    pub frame_type: FrameType,
    /// Framework buffer carried along by the hardware, in SHARE mode.
    pub private: Option<BufferHeaderId>,
    /// Marks the last raw frame of the stream. The hardware flushes its reorder window after
    /// coding it.
    pub eos: bool,
}

/// Operations on one hardware buffer queue.
pub trait BufferOps: Send + Sync {
    /// Allocates `num_buffers` hardware buffer slots.
    fn setup(&self, num_buffers: usize) -> BackendResult<()>;
    /// Starts streaming.
    fn run(&self) -> BackendResult<()>;
    /// Stops streaming. Buffers still queued become available to [`BufferOps::dequeue`].
    fn stop(&self) -> BackendResult<()>;
    /// Drops every buffer still owned by the queue.
    fn clear_queue(&self) -> BackendResult<()>;
    fn enqueue(&self, buffer: HwBuffer) -> BackendResult<()>;
    /// Returns a processed buffer, or [`BackendError::NotReady`] if none is available yet.
    fn dequeue(&self) -> BackendResult<HwBuffer>;
    fn set_geometry(&self, geometry: &Geometry) -> BackendResult<()>;
    fn get_geometry(&self) -> BackendResult<Geometry>;
    /// Lets the queue share memory with the framework instead of copying.
    fn set_shareable(&self) -> BackendResult<()>;
    fn enable_cacheable(&self) -> BackendResult<()>;
    /// Forgets every buffer registered through previous enqueues.
    fn clear_registered_buffer(&self) -> BackendResult<()>;
    /// Releases the hardware buffer slots allocated by [`BufferOps::setup`].
    fn cleanup_buffer(&self) -> BackendResult<()>;
    /// Maps `buffer` and returns its valid contents.
    fn export(&self, buffer: &HwBuffer) -> BackendResult<Vec<u8>>;
}

/// Encoder parameter setters.
pub trait EncoderOps: Send + Sync {
    /// Requests the coding type of the next submitted frame.
    fn set_frame_type(&self, frame_type: FrameType) -> BackendResult<()>;
    fn set_idr_period(&self, period: u32) -> BackendResult<()>;
    fn set_bitrate(&self, bitrate: u32) -> BackendResult<()>;
    /// Framerate in frames per second.
    fn set_framerate(&self, framerate: u32) -> BackendResult<()>;
    fn set_qp_range(&self, range: &QpRange) -> BackendResult<()>;
    fn set_temporal_layers(&self, layers: &TemporalLayers) -> BackendResult<()>;
    fn set_roi(&self, roi: &RoiInfo) -> BackendResult<()>;
    fn set_priority(&self, priority: u32) -> BackendResult<()>;
    fn set_drop_control(&self, enable: bool) -> BackendResult<()>;
    fn set_dynamic_framerate(&self, enable: bool) -> BackendResult<()>;
    /// Operating rate in frames per second, used by the driver as a QoS hint.
    fn set_operating_rate(&self, rate: u32) -> BackendResult<()>;
    fn set_header_mode(&self, mode: HeaderMode) -> BackendResult<()>;
}

/// An opened hardware codec instance.
pub trait MfcBackend: Send + Sync + 'static {
    fn encoder(&self) -> &dyn EncoderOps;
    /// Raw frame queue.
    fn input(&self) -> &dyn BufferOps;
    /// Bitstream queue.
    fn output(&self) -> &dyn BufferOps;
    /// Allocates a codec-owned buffer with one plane per entry of `sizes`, for COPY mode pools.
    fn alloc_buffer(&self, sizes: &[u32]) -> BackendResult<Vec<Plane>>;
    fn free_buffer(&self, planes: &[Plane]) -> BackendResult<()>;
    /// Copies `len` bytes between buffers, converting layouts if needed.
    fn copy_planes(&self, src: &[Plane], dst: &[Plane], len: u32) -> BackendResult<()>;
    /// Closes the codec instance. No other method is called afterwards.
    fn close(&self) -> BackendResult<()>;
}

/// Static parameters used to open a codec instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenParams {
    pub codec: Codec,
    pub b_frames: u32,
    pub idr_period: u32,
    pub header_mode: HeaderMode,
    pub profile_level: Option<ProfileLevel>,
    pub params: EncodeParams,
}

/// Opens codec instances.
pub trait MfcDevice: Send + 'static {
    type Backend: MfcBackend;

    fn open(&mut self, params: &OpenParams) -> BackendResult<Self::Backend>;
}
