// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The codec session.
//!
//! An [`EncoderSession`] is created when the component goes from Loaded to Idle and destroyed
//! when it goes back. It owns the opened hardware instance, both ports, and every structure the
//! four pipeline stages share: the timestamp slots, the bypass queue and the dynamic config queue.
//! Each of these carries its own lock, so the stages ([`EncoderSession::src_in`],
//! [`EncoderSession::src_out`], [`EncoderSession::dst_in`], [`EncoderSession::dst_out`]) can be
//! called concurrently from different threads through a shared reference.

pub mod bypass;
pub mod destination;
pub mod drc;
pub mod dynamic_config;
pub mod params;
pub mod source;
pub mod timestamp;

use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use crate::align_up;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::Geometry;
use crate::backend::HwBuffer;
use crate::backend::MfcBackend;
use crate::backend::OpenParams;
use crate::buffer::BufferDescriptor;
use crate::encoder::bypass::BypassQueue;
use crate::encoder::dynamic_config::DynamicConfigQueue;
use crate::encoder::params::ProfileLevel;
use crate::encoder::timestamp::TimestampSlots;
use crate::omx::OmxError;
use crate::omx::OmxResult;
use crate::omx::PortIndex;
use crate::port::BufferProcessMode;
use crate::port::CodecBufferPool;
use crate::port::MetadataType;
use crate::port::Port;
use crate::port::PortConfig;
use crate::port::PortDefinition;
use crate::signal::Gate;
use crate::signal::Signal;
use crate::ColorFormat;
use crate::Rect;
use crate::Resolution;

/// Longest a worker waits on its start gate before checking for an exit request again.
const START_WAIT: Duration = Duration::from_millis(100);

/// Coding standard of the output port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Codec {
    #[default]
    Avc,
    Hevc,
    Vp8,
    Vp9,
}

impl Codec {
    pub const ALL: [Codec; 4] = [Codec::Avc, Codec::Hevc, Codec::Vp8, Codec::Vp9];

    /// OMX component role of an encoder for this codec.
    pub fn role(&self) -> &'static str {
        match self {
            Codec::Avc => "video_encoder.avc",
            Codec::Hevc => "video_encoder.hevc",
            Codec::Vp8 => "video_encoder.vp8",
            Codec::Vp9 => "video_encoder.vp9",
        }
    }

    pub fn from_role(role: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|codec| codec.role() == role)
    }

    /// Largest quantization parameter accepted by the codec.
    pub fn max_qp(&self) -> u32 {
        match self {
            Codec::Avc | Codec::Hevc => 51,
            Codec::Vp8 | Codec::Vp9 => 127,
        }
    }
}

impl FromStr for Codec {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avc" | "h264" | "H264" => Ok(Codec::Avc),
            "hevc" | "h265" | "H265" => Ok(Codec::Hevc),
            "vp8" | "VP8" => Ok(Codec::Vp8),
            "vp9" | "VP9" => Ok(Codec::Vp9),
            _ => Err("unrecognized codec. Valid values: avc, hevc, vp8, vp9"),
        }
    }
}

/// Inclusive bounds of the quantization parameter for one frame type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QpBounds {
    pub min: u32,
    pub max: u32,
}

impl QpBounds {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }
}

/// Quantization parameter bounds per frame type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QpRange {
    pub i_frame: QpBounds,
    pub p_frame: QpBounds,
    pub b_frame: QpBounds,
}

impl QpRange {
    /// The same bounds for every frame type.
    pub fn uniform(min: u32, max: u32) -> Self {
        let bounds = QpBounds::new(min, max);
        Self {
            i_frame: bounds,
            p_frame: bounds,
            b_frame: bounds,
        }
    }

    pub fn validate(&self, codec: Codec) -> OmxResult<()> {
        for bounds in [self.i_frame, self.p_frame, self.b_frame] {
            if bounds.min > bounds.max || bounds.max > codec.max_qp() {
                log::error!("invalid QP range {bounds:?} for {codec:?}");
                return Err(OmxError::BadParameter);
            }
        }
        Ok(())
    }
}

impl Default for QpRange {
    fn default() -> Self {
        Self::uniform(0, Codec::Avc.max_qp())
    }
}

/// Maximum number of temporal layers.
pub const MAX_TEMPORAL_LAYERS: usize = 7;

/// Temporal scalability layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemporalLayers {
    /// Share of the total bitrate given to each layer, in percent, base layer first.
    pub bitrate_ratios: Vec<u32>,
}

impl TemporalLayers {
    /// A single layer carrying the whole bitrate.
    pub fn single() -> Self {
        Self {
            bitrate_ratios: vec![100],
        }
    }

    pub fn num_layers(&self) -> usize {
        self.bitrate_ratios.len()
    }

    pub fn validate(&self) -> OmxResult<()> {
        let num_layers = self.num_layers();
        if num_layers == 0 || num_layers > MAX_TEMPORAL_LAYERS {
            log::error!("unsupported number of temporal layers: {num_layers}");
            return Err(OmxError::BadParameter);
        }
        if self.bitrate_ratios.iter().sum::<u32>() != 100 {
            log::error!("temporal layer ratios do not add up: {:?}", self.bitrate_ratios);
            return Err(OmxError::BadParameter);
        }
        Ok(())
    }
}

/// A region of interest and the QP offset applied inside it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RoiRegion {
    pub rect: Rect,
    pub qp_delta: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoiInfo {
    pub regions: Vec<RoiRegion>,
}

/// When the hardware emits codec header data.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum HeaderMode {
    /// Only once, in its own buffer, when the stream (re)starts.
    #[default]
    Separate,
    /// In front of every IDR frame.
    WithEveryIdr,
}

/// Encoding parameters that can be changed during the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodeParams {
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    /// Framerate in Q16 frames per second.
    pub framerate: u32,
    pub qp_range: QpRange,
    /// `None` while temporal scalability is disabled.
    pub temporal_layers: Option<TemporalLayers>,
    /// `None` while ROI encoding is disabled.
    pub roi: Option<RoiInfo>,
    /// Operating rate in Q16 frames per second, 0 if unset.
    pub operating_rate: u32,
    pub priority: u32,
    pub drop_control: bool,
    pub dynamic_framerate: bool,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            bitrate: 200_000,
            framerate: 30 << 16,
            qp_range: Default::default(),
            temporal_layers: None,
            roi: None,
            operating_rate: 0,
            priority: 0,
            drop_control: false,
            dynamic_framerate: true,
        }
    }
}

/// Static configuration of a session, negotiated while the component is Loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderConfig {
    pub codec: Codec,
    pub input: PortConfig,
    pub output: PortConfig,
    pub b_frames: u32,
    pub idr_period: u32,
    pub header_mode: HeaderMode,
    pub profile_level: Option<ProfileLevel>,
    pub params: EncodeParams,
}

impl EncoderConfig {
    pub fn new(codec: Codec, resolution: Resolution, color_format: ColorFormat) -> Self {
        let params = EncodeParams::default();
        let mut output = PortDefinition::new_output(resolution, codec);
        output.bitrate = params.bitrate;
        Self {
            codec,
            input: PortConfig {
                mode: BufferProcessMode::Share,
                metadata: MetadataType::None,
                definition: PortDefinition::new_input(resolution, color_format),
            },
            output: PortConfig {
                mode: BufferProcessMode::Share,
                metadata: MetadataType::None,
                definition: output,
            },
            b_frames: 0,
            idr_period: 30,
            header_mode: Default::default(),
            profile_level: None,
            params,
        }
    }

    pub fn open_params(&self) -> OpenParams {
        OpenParams {
            codec: self.codec,
            b_frames: self.b_frames,
            idr_period: self.idr_period,
            header_mode: self.header_mode,
            profile_level: self.profile_level,
            params: self.params.clone(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::new(Codec::Avc, Resolution::from((1280, 720)), ColorFormat::NV12)
    }
}

/// Codec header data (parameter sets) emitted by the hardware.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderData {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

/// The four pipeline stages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    SrcIn,
    SrcOut,
    DstIn,
    DstOut,
}

/// Geometry of the input queue for `definition`: the crop area, rotated.
pub(crate) fn input_geometry(definition: &PortDefinition) -> Geometry {
    let mut resolution = definition.crop.resolution();
    if definition.rotation.is_transposing() {
        resolution = resolution.transposed();
    }
    Geometry {
        resolution,
        stride: align_up(resolution.width, 16),
        color_format: definition.color_format(),
        buffer_size: definition.buffer_size,
    }
}

fn output_geometry(definition: &PortDefinition) -> Geometry {
    Geometry {
        resolution: definition.resolution,
        stride: 0,
        color_format: None,
        buffer_size: definition.buffer_size,
    }
}

/// Plane sizes of a codec-allocated raw frame buffer.
fn input_plane_sizes(definition: &PortDefinition) -> Vec<u32> {
    let height = align_up(definition.slice_height.max(definition.resolution.height), 16);
    let luma = definition.stride * height;
    match definition.color_format() {
        Some(ColorFormat::NV12) | Some(ColorFormat::NV21) => vec![luma, luma / 2],
        Some(ColorFormat::I420) => vec![luma, luma / 4, luma / 4],
        _ => vec![definition.buffer_size],
    }
}

fn allocate_pool<B: MfcBackend>(
    backend: &B,
    config: &PortConfig,
    plane_sizes: &[u32],
) -> OmxResult<Option<CodecBufferPool>> {
    match config.mode {
        BufferProcessMode::Share => Ok(None),
        BufferProcessMode::Copy => {
            let count = config.definition.buffer_count_actual;
            CodecBufferPool::allocate(backend, count, plane_sizes).map(Some)
        }
    }
}

/// One opened hardware codec instance and the state of its buffer pipeline.
pub struct EncoderSession<B: MfcBackend> {
    backend: B,
    codec: Codec,
    b_frames: u32,
    idr_period: u32,
    header_mode: HeaderMode,
    profile_level: Option<ProfileLevel>,

    input: Port,
    output: Port,
    params: Mutex<EncodeParams>,

    slots: TimestampSlots,
    bypass: BypassQueue,
    configs: DynamicConfigQueue,
    header: Mutex<Option<HeaderData>>,

    input_configured: AtomicBool,
    output_configured: AtomicBool,
    input_streaming: AtomicBool,
    output_streaming: AtomicBool,
    /// The next bitstream buffer is the header emitted at stream start.
    awaiting_header: AtomicBool,
    reconfiguring: AtomicBool,
    /// One-shot: keep the payload of the next end-of-stream output.
    expected_eos: AtomicBool,
    terminated: AtomicBool,

    source_start: Gate,
    dst_in_start: Gate,
    dst_out_start: Gate,
    /// Raised by SrcOut once the input queue is empty during a reconfiguration.
    drc_sync: Signal,
    exit: Gate,
}

impl<B: MfcBackend> EncoderSession<B> {
    /// Creates the session around an opened codec instance.
    pub fn open(backend: B, config: &EncoderConfig) -> OmxResult<Self> {
        let input_pool = allocate_pool(
            &backend,
            &config.input,
            &input_plane_sizes(&config.input.definition),
        )?;
        let output_pool = match allocate_pool(
            &backend,
            &config.output,
            &[config.output.definition.buffer_size],
        ) {
            Ok(pool) => pool,
            Err(err) => {
                if let Some(pool) = &input_pool {
                    pool.free_all(&backend);
                }
                return Err(err);
            }
        };

        let session = Self {
            codec: config.codec,
            b_frames: config.b_frames,
            idr_period: config.idr_period,
            header_mode: config.header_mode,
            profile_level: config.profile_level,
            input: Port::new(&config.input, input_pool)?,
            output: Port::new(&config.output, output_pool)?,
            params: Mutex::new(config.params.clone()),
            slots: TimestampSlots::new(),
            bypass: BypassQueue::new(),
            configs: DynamicConfigQueue::new(),
            header: Mutex::new(None),
            input_configured: AtomicBool::new(false),
            output_configured: AtomicBool::new(false),
            input_streaming: AtomicBool::new(false),
            output_streaming: AtomicBool::new(false),
            awaiting_header: AtomicBool::new(false),
            reconfiguring: AtomicBool::new(false),
            expected_eos: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            source_start: Gate::new()?,
            dst_in_start: Gate::new()?,
            dst_out_start: Gate::new()?,
            drc_sync: Signal::new()?,
            exit: Gate::new()?,
            backend,
        };
        log::debug!(
            "opened {:?} session: input {:?}, output {:?}, b_frames={}",
            session.codec,
            config.input.mode,
            config.output.mode,
            session.b_frames
        );

        Ok(session)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn port(&self, index: PortIndex) -> &Port {
        match index {
            PortIndex::Input => &self.input,
            PortIndex::Output => &self.output,
        }
    }

    pub fn input_port(&self) -> &Port {
        &self.input
    }

    pub fn output_port(&self) -> &Port {
        &self.output
    }

    pub fn params(&self) -> EncodeParams {
        self.params.lock().unwrap().clone()
    }

    pub fn header_data(&self) -> Option<HeaderData> {
        self.header.lock().unwrap().clone()
    }

    pub fn slots(&self) -> &TimestampSlots {
        &self.slots
    }

    pub fn is_input_configured(&self) -> bool {
        self.input_configured.load(Ordering::Acquire)
    }

    pub fn is_output_configured(&self) -> bool {
        self.output_configured.load(Ordering::Acquire)
    }

    /// The current configuration, as negotiated and then changed by runtime configs.
    pub fn current_config(&self) -> EncoderConfig {
        EncoderConfig {
            codec: self.codec,
            input: PortConfig {
                mode: self.input.mode(),
                metadata: self.input.metadata(),
                definition: PortDefinition::clone(&self.input.definition()),
            },
            output: PortConfig {
                mode: self.output.mode(),
                metadata: self.output.metadata(),
                definition: PortDefinition::clone(&self.output.definition()),
            },
            b_frames: self.b_frames,
            idr_period: self.idr_period,
            header_mode: self.header_mode,
            profile_level: self.profile_level,
            params: self.params(),
        }
    }

    fn start_gate(&self, stage: Stage) -> Option<&Gate> {
        match stage {
            Stage::SrcIn => None,
            Stage::SrcOut => Some(&self.source_start),
            Stage::DstIn => Some(&self.dst_in_start),
            Stage::DstOut => Some(&self.dst_out_start),
        }
    }

    /// Blocks until `stage` may start processing. Returns `false` if an exit was requested first.
    pub fn wait_for_start(&self, stage: Stage) -> OmxResult<bool> {
        let Some(gate) = self.start_gate(stage) else {
            return Ok(!self.exit_requested());
        };
        loop {
            if self.exit_requested() {
                return Ok(false);
            }
            if gate.is_open() {
                return Ok(true);
            }
            gate.wait_timeout(START_WAIT)?;
        }
    }

    pub fn is_started(&self, stage: Stage) -> bool {
        self.start_gate(stage).map(Gate::is_open).unwrap_or(true)
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.is_open()
    }

    /// Asks the worker loops to exit and wakes all of them.
    pub fn request_exit(&self) -> OmxResult<()> {
        self.exit.open()?;
        self.source_start.wake()?;
        self.dst_in_start.wake()?;
        self.dst_out_start.wake()?;
        Ok(())
    }

    /// Clears a previous exit request so that workers can be started again.
    pub fn resume(&self) -> OmxResult<()> {
        self.exit.close()?;
        self.source_start.rearm()?;
        self.dst_in_start.rearm()?;
        self.dst_out_start.rearm()?;
        Ok(())
    }

    /// Sleeps up to `timeout`, returning early if an exit is requested.
    pub fn idle_wait(&self, timeout: Duration) -> OmxResult<()> {
        self.exit.wait_timeout(timeout)?;
        Ok(())
    }

    fn push_params(&self) -> BackendResult<()> {
        let params = self.params();
        let encoder = self.backend.encoder();
        encoder.set_idr_period(self.idr_period)?;
        encoder.set_bitrate(params.bitrate)?;
        encoder.set_framerate(params.framerate >> 16)?;
        encoder.set_qp_range(&params.qp_range)?;
        if let Some(layers) = &params.temporal_layers {
            encoder.set_temporal_layers(layers)?;
        }
        if let Some(roi) = &params.roi {
            encoder.set_roi(roi)?;
        }
        encoder.set_priority(params.priority)?;
        encoder.set_drop_control(params.drop_control)?;
        encoder.set_dynamic_framerate(params.dynamic_framerate)?;
        if params.operating_rate != 0 {
            encoder.set_operating_rate(params.operating_rate >> 16)?;
        }
        encoder.set_header_mode(self.header_mode)
    }

    /// One-time setup of the raw frame queue, then starts it.
    pub(crate) fn setup_input(&self) -> OmxResult<()> {
        let definition = self.input.definition();
        let geometry = input_geometry(&definition);
        log::debug!("configuring input queue: {geometry:?}");

        let queue = self.backend.input();
        let result = queue
            .set_geometry(&geometry)
            .and_then(|()| match self.input.mode() {
                BufferProcessMode::Share => queue.set_shareable(),
                BufferProcessMode::Copy => queue.enable_cacheable(),
            })
            .and_then(|()| self.push_params())
            .and_then(|()| queue.setup(definition.buffer_count_actual));
        if let Err(err) = result {
            log::error!("failed to configure input queue: {err}");
            return Err(OmxError::InsufficientResources);
        }
        self.input_configured.store(true, Ordering::Release);

        self.start_input_stream()
    }

    pub(crate) fn start_input_stream(&self) -> OmxResult<()> {
        self.backend.input().run().map_err(|err| {
            log::error!("failed to start input stream: {err}");
            OmxError::from(err)
        })?;
        self.input_streaming.store(true, Ordering::Release);
        // SrcOut has to poll as soon as buffers can come back, reconfigurations included.
        self.source_start.open()?;
        Ok(())
    }

    /// One-time setup of the bitstream queue. The stream itself is started by DstIn.
    pub(crate) fn setup_output(&self) -> OmxResult<()> {
        let definition = self.output.definition();
        let geometry = output_geometry(&definition);
        log::debug!("configuring output queue: {geometry:?}");

        let queue = self.backend.output();
        let result = queue
            .set_geometry(&geometry)
            .and_then(|()| match self.output.mode() {
                BufferProcessMode::Share => queue.set_shareable(),
                BufferProcessMode::Copy => queue.enable_cacheable(),
            })
            .and_then(|()| queue.setup(definition.buffer_count_actual));
        if let Err(err) = result {
            log::error!("failed to configure output queue: {err}");
            return Err(OmxError::InsufficientResources);
        }
        self.output_configured.store(true, Ordering::Release);

        Ok(())
    }

    pub(crate) fn start_output_stream(&self) -> OmxResult<()> {
        // Set first: the header may be dequeued as soon as the stream runs.
        self.awaiting_header.store(true, Ordering::Release);
        if let Err(err) = self.backend.output().run() {
            self.awaiting_header.store(false, Ordering::Release);
            log::error!("failed to start output stream: {err}");
            return Err(err.into());
        }
        self.output_streaming.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops the hardware queue of `port` and returns every framework buffer the port held.
    ///
    /// Must not run concurrently with the pipeline stages.
    pub fn flush(&self, port: PortIndex) -> OmxResult<Vec<BufferDescriptor>> {
        let returned = match port {
            PortIndex::Input => self.flush_input()?,
            PortIndex::Output => self.flush_output()?,
        };
        log::debug!("flushed {port:?} port, returning {} buffers", returned.len());
        Ok(returned)
    }

    fn drain_queue<F>(&self, port: PortIndex, mut reclaim: F) -> OmxResult<Vec<BufferDescriptor>>
    where
        F: FnMut(HwBuffer) -> OmxResult<BufferDescriptor>,
    {
        let queue = match port {
            PortIndex::Input => self.backend.input(),
            PortIndex::Output => self.backend.output(),
        };
        let mut returned = Vec::new();
        loop {
            match queue.dequeue() {
                Ok(buffer) => {
                    let desc = reclaim(buffer)?;
                    if desc.header.is_some() {
                        returned.push(desc);
                    }
                }
                Err(BackendError::NotReady) => break,
                Err(err) => return Err(err.into()),
            }
        }
        if self.port_configured(port) {
            queue.clear_queue()?;
        }

        Ok(returned)
    }

    fn port_configured(&self, port: PortIndex) -> bool {
        match port {
            PortIndex::Input => self.is_input_configured(),
            PortIndex::Output => self.is_output_configured(),
        }
    }

    fn flush_input(&self) -> OmxResult<Vec<BufferDescriptor>> {
        if self.input_streaming.swap(false, Ordering::AcqRel) {
            self.backend.input().stop()?;
        }
        let mut returned = self.drain_queue(PortIndex::Input, |buffer| self.reclaim_input(buffer))?;
        returned.extend(self.input.queue().drain()?);
        if let Some(pool) = self.input.pool() {
            pool.reset()?;
        }
        self.slots.reset();
        self.bypass.clear();
        self.expected_eos.store(false, Ordering::Release);

        Ok(returned)
    }

    fn flush_output(&self) -> OmxResult<Vec<BufferDescriptor>> {
        if self.output_streaming.swap(false, Ordering::AcqRel) {
            self.backend.output().stop()?;
        }
        self.awaiting_header.store(false, Ordering::Release);
        let mut returned = self.drain_queue(PortIndex::Output, |buffer| {
            let mut desc = self.output_descriptor(&buffer)?;
            desc.reset_payload();
            Ok(desc)
        })?;
        returned.extend(self.output.queue().drain()?);
        if let Some(pool) = self.output.pool() {
            pool.reset()?;
        }

        Ok(returned)
    }

    /// Flushes both ports and closes the start gates. Used when leaving Executing.
    pub fn stop(&self) -> OmxResult<(Vec<BufferDescriptor>, Vec<BufferDescriptor>)> {
        let inputs = self.flush(PortIndex::Input)?;
        let outputs = self.flush(PortIndex::Output)?;
        self.source_start.close()?;
        self.dst_in_start.close()?;
        self.dst_out_start.close()?;
        Ok((inputs, outputs))
    }

    /// Releases the hardware. The session is unusable afterwards.
    pub fn terminate(&self) -> OmxResult<()> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::debug!("terminating {:?} session", self.codec);

        if self.input_streaming.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.backend.input().stop() {
                log::warn!("failed to stop input stream: {err}");
            }
        }
        if self.output_streaming.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.backend.output().stop() {
                log::warn!("failed to stop output stream: {err}");
            }
        }
        self.bypass.clear();
        self.request_exit()?;
        self.source_start.close()?;
        self.dst_in_start.close()?;
        self.dst_out_start.close()?;
        self.drc_sync.reset()?;
        for port in [&self.input, &self.output] {
            if let Some(pool) = port.pool() {
                pool.free_all(&self.backend);
            }
        }
        self.backend.close().map_err(|err| {
            log::error!("failed to close codec: {err}");
            OmxError::from(err)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::dummy::DummyMfc;
    use crate::buffer::BufferHeaderId;
    use crate::omx::BufferFlags;

    pub(crate) fn open_session(config: &EncoderConfig) -> (EncoderSession<DummyMfc>, DummyMfc) {
        let mfc = DummyMfc::new(&config.open_params());
        let session = EncoderSession::open(mfc.clone(), config).unwrap();
        (session, mfc)
    }

    pub(crate) fn test_config() -> EncoderConfig {
        EncoderConfig::new(Codec::Avc, Resolution::from((320, 240)), ColorFormat::NV12)
    }

    pub(crate) fn input_frame(id: u64, timestamp: i64, flags: BufferFlags) -> BufferDescriptor {
        let size = 320 * 240 * 3 / 2;
        BufferDescriptor::from_header(BufferHeaderId(id), 0x10_0000 + id * 0x1000, size)
            .with_payload(size, timestamp, flags)
    }

    pub(crate) fn output_buffer(id: u64) -> BufferDescriptor {
        BufferDescriptor::from_header(BufferHeaderId(id), 0x80_0000 + id * 0x1000, 64 * 1024)
    }

    #[test]
    fn codec_roles() {
        for codec in Codec::ALL {
            assert_eq!(Codec::from_role(codec.role()), Some(codec));
        }
        assert_eq!(Codec::from_role("video_decoder.avc"), None);
        assert_eq!("h265".parse::<Codec>(), Ok(Codec::Hevc));
    }

    #[test]
    fn qp_range_validation() {
        assert!(QpRange::uniform(10, 40).validate(Codec::Avc).is_ok());
        assert_eq!(QpRange::uniform(40, 10).validate(Codec::Avc), Err(OmxError::BadParameter));
        assert_eq!(QpRange::uniform(0, 100).validate(Codec::Hevc), Err(OmxError::BadParameter));
        assert!(QpRange::uniform(0, 100).validate(Codec::Vp9).is_ok());
    }

    #[test]
    fn temporal_layer_validation() {
        assert!(TemporalLayers::single().validate().is_ok());
        let layers = TemporalLayers {
            bitrate_ratios: vec![50, 30, 20],
        };
        assert!(layers.validate().is_ok());
        let layers = TemporalLayers {
            bitrate_ratios: vec![50, 30],
        };
        assert_eq!(layers.validate(), Err(OmxError::BadParameter));
        let layers = TemporalLayers {
            bitrate_ratios: vec![],
        };
        assert_eq!(layers.validate(), Err(OmxError::BadParameter));
    }

    #[test]
    fn input_geometry_follows_crop_and_rotation() {
        let mut definition =
            PortDefinition::new_input(Resolution::from((1920, 1080)), ColorFormat::NV12);
        definition.crop = Rect::from(Resolution::from((1000, 600)));
        let geometry = input_geometry(&definition);
        assert_eq!(geometry.resolution, Resolution::from((1000, 600)));
        assert_eq!(geometry.stride, 1008);

        definition.rotation = crate::Rotation::Deg270;
        let geometry = input_geometry(&definition);
        assert_eq!(geometry.resolution, Resolution::from((600, 1000)));
        assert_eq!(geometry.stride, 608);
    }

    #[test]
    fn copy_mode_allocates_pools_and_frees_them_on_terminate() {
        let mut config = test_config();
        config.input.mode = BufferProcessMode::Copy;
        config.output.mode = BufferProcessMode::Copy;
        let (session, mfc) = open_session(&config);

        let input_pool = session.input_port().pool().unwrap();
        assert_eq!(input_pool.len(), 4);
        assert_eq!(input_pool.get(0).unwrap().planes.len(), 2);
        assert_eq!(session.output_port().pool().unwrap().len(), 4);
        assert_eq!(mfc.num_allocated(), 8);

        session.terminate().unwrap();
        assert_eq!(mfc.num_allocated(), 0);
        assert!(mfc.is_closed());
        // Terminating twice is harmless.
        session.terminate().unwrap();
    }

    #[test]
    fn workers_wait_for_start_or_exit() {
        let (session, _mfc) = open_session(&test_config());
        assert!(!session.is_started(Stage::DstOut));
        assert!(session.is_started(Stage::SrcIn));

        session.request_exit().unwrap();
        assert!(!session.wait_for_start(Stage::DstOut).unwrap());
        assert!(!session.wait_for_start(Stage::SrcIn).unwrap());

        session.resume().unwrap();
        session.dst_out_start.open().unwrap();
        assert!(session.wait_for_start(Stage::DstOut).unwrap());
    }
}
