// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed parameter and config access.
//!
//! Parameters are the static settings negotiated while the component is Loaded and are stored in
//! [`EncoderConfig`]. Configs can also be changed while encoding: on an open session a successful
//! [`EncoderSession::set_config`] updates the requested state right away and queues a
//! [`DynamicConfig`] that pushes the change to the hardware before the next frame.

use std::sync::atomic::Ordering;

use crate::backend::MfcBackend;
use crate::encoder::dynamic_config::DynamicConfig;
use crate::encoder::Codec;
use crate::encoder::EncoderConfig;
use crate::encoder::EncoderSession;
use crate::encoder::HeaderData;
use crate::encoder::QpRange;
use crate::encoder::RoiInfo;
use crate::encoder::TemporalLayers;
use crate::omx::OmxError;
use crate::omx::OmxResult;
use crate::omx::PortIndex;
use crate::omx::VendorIndex;
use crate::port::MAX_RESOLUTION;
use crate::port::PortConfig;
use crate::port::PortDefinition;
use crate::port::PortFormat;
use crate::ColorFormat;
use crate::Resolution;
use crate::Rotation;

/// Largest number of consecutive B frames the hardware can reorder.
pub const MAX_B_FRAMES: u32 = 2;

/// Raw formats accepted on the input port, in enumeration order.
const INPUT_FORMATS: [ColorFormat; 4] = [
    ColorFormat::NV12,
    ColorFormat::NV21,
    ColorFormat::I420,
    ColorFormat::Opaque,
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Profile {
    AvcBaseline,
    AvcConstrainedBaseline,
    AvcMain,
    AvcHigh,
    HevcMain,
    Vp8Main,
    Vp9Profile0,
}

impl Profile {
    pub fn codec(&self) -> Codec {
        match self {
            Profile::AvcBaseline
            | Profile::AvcConstrainedBaseline
            | Profile::AvcMain
            | Profile::AvcHigh => Codec::Avc,
            Profile::HevcMain => Codec::Hevc,
            Profile::Vp8Main => Codec::Vp8,
            Profile::Vp9Profile0 => Codec::Vp9,
        }
    }
}

/// A profile and the highest level supported with it. Levels are given times ten, e.g. 42 for
/// level 4.2.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProfileLevel {
    pub profile: Profile,
    pub level: u32,
}

impl ProfileLevel {
    const fn new(profile: Profile, level: u32) -> Self {
        Self { profile, level }
    }
}

const AVC_PROFILE_LEVELS: &[ProfileLevel] = &[
    ProfileLevel::new(Profile::AvcBaseline, 42),
    ProfileLevel::new(Profile::AvcConstrainedBaseline, 42),
    ProfileLevel::new(Profile::AvcMain, 42),
    ProfileLevel::new(Profile::AvcHigh, 42),
];
const HEVC_PROFILE_LEVELS: &[ProfileLevel] = &[ProfileLevel::new(Profile::HevcMain, 51)];
const VP8_PROFILE_LEVELS: &[ProfileLevel] = &[ProfileLevel::new(Profile::Vp8Main, 0)];
const VP9_PROFILE_LEVELS: &[ProfileLevel] = &[ProfileLevel::new(Profile::Vp9Profile0, 41)];

/// Profiles supported for `codec`, with their highest level.
pub fn supported_profile_levels(codec: Codec) -> &'static [ProfileLevel] {
    match codec {
        Codec::Avc => AVC_PROFILE_LEVELS,
        Codec::Hevc => HEVC_PROFILE_LEVELS,
        Codec::Vp8 => VP8_PROFILE_LEVELS,
        Codec::Vp9 => VP9_PROFILE_LEVELS,
    }
}

/// Role number `index` of an encoder for `codec`. Enumeration ends with `NoMore`.
pub fn component_role_enum(codec: Codec, index: usize) -> OmxResult<&'static str> {
    match index {
        0 => Ok(codec.role()),
        _ => Err(OmxError::NoMore),
    }
}

/// B frame count and IDR period of the AVC and HEVC parameters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GopSettings {
    pub b_frames: u32,
    pub idr_period: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParamIndex {
    PortDefinition(PortIndex),
    PortFormat { port: PortIndex, index: usize },
    ComponentRole,
    VideoBitrate,
    Avc,
    Hevc,
    /// Enumerates the supported profiles. Ends with `NoMore`.
    ProfileLevelQuery { index: usize },
    ProfileLevelCurrent,
    QpRange,
    EnableTemporalSvc,
    TemporalLayers,
    EnableRoi,
    DropControl,
    DisableDfr,
    /// Header data emitted by the hardware. Read-only.
    HeaderData,
}

impl ParamIndex {
    /// Parameter reached through a vendor extension index.
    pub fn from_vendor(index: VendorIndex) -> OmxResult<Self> {
        match index {
            VendorIndex::EnableTemporalSvc => Ok(ParamIndex::EnableTemporalSvc),
            VendorIndex::TemporalSvc => Ok(ParamIndex::TemporalLayers),
            VendorIndex::EnableRoiInfo => Ok(ParamIndex::EnableRoi),
            VendorIndex::QpRange => Ok(ParamIndex::QpRange),
            VendorIndex::DropControl => Ok(ParamIndex::DropControl),
            VendorIndex::DisableDfr => Ok(ParamIndex::DisableDfr),
            VendorIndex::HeaderData => Ok(ParamIndex::HeaderData),
            _ => Err(OmxError::UnsupportedIndex),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Parameter {
    PortDefinition(PortDefinition),
    PortFormat(PortFormat),
    ComponentRole(String),
    VideoBitrate(u32),
    Gop(GopSettings),
    ProfileLevel(ProfileLevel),
    QpRange(QpRange),
    EnableTemporalSvc(bool),
    TemporalLayers(TemporalLayers),
    EnableRoi(bool),
    DropControl(bool),
    DisableDfr(bool),
    HeaderData(HeaderData),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigIndex {
    Bitrate,
    Framerate,
    IntraRefresh,
    QpRange,
    TemporalLayers,
    Roi,
    Resolution,
    OperatingRate,
    Rotation,
    ExpectedEos,
    Priority,
}

impl ConfigIndex {
    /// Config reached through a vendor extension index.
    pub fn from_vendor(index: VendorIndex) -> OmxResult<Self> {
        match index {
            VendorIndex::TemporalSvc => Ok(ConfigIndex::TemporalLayers),
            VendorIndex::RoiInfo => Ok(ConfigIndex::Roi),
            VendorIndex::QpRange => Ok(ConfigIndex::QpRange),
            VendorIndex::OperatingRate => Ok(ConfigIndex::OperatingRate),
            VendorIndex::ExpectedEos => Ok(ConfigIndex::ExpectedEos),
            _ => Err(OmxError::UnsupportedIndex),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Config {
    Bitrate(u32),
    /// Q16 frames per second.
    Framerate(u32),
    /// Requests an I frame for the next input.
    IntraRefresh(bool),
    QpRange(QpRange),
    TemporalLayers(TemporalLayers),
    Roi(RoiInfo),
    /// Input frame size.
    Resolution(Resolution),
    /// Q16 frames per second.
    OperatingRate(u32),
    Rotation(Rotation),
    /// Keep the payload of the next end-of-stream output.
    ExpectedEos(bool),
    Priority(u32),
}

/// Frame size of the output for `input` frames rotated by `rotation`.
fn check_resolution(resolution: Resolution) -> OmxResult<()> {
    if resolution.width == 0
        || resolution.height == 0
        || !MAX_RESOLUTION.can_contain(resolution)
    {
        log::error!("unsupported resolution {resolution:?}");
        return Err(OmxError::BadParameter);
    }
    Ok(())
}

fn output_resolution(input: Resolution, rotation: Rotation) -> Resolution {
    if rotation.is_transposing() {
        input.transposed()
    } else {
        input
    }
}

impl EncoderConfig {
    fn port_config(&self, port: PortIndex) -> &PortConfig {
        match port {
            PortIndex::Input => &self.input,
            PortIndex::Output => &self.output,
        }
    }

    fn gop(&self) -> GopSettings {
        GopSettings {
            b_frames: self.b_frames,
            idr_period: self.idr_period,
        }
    }

    fn set_input_resolution(&mut self, resolution: Resolution) {
        self.input.definition.set_resolution(resolution);
        let rotation = self.input.definition.rotation;
        self.output
            .definition
            .set_resolution(output_resolution(resolution, rotation));
    }

    pub fn get_parameter(&self, index: ParamIndex) -> OmxResult<Parameter> {
        let params = &self.params;
        let parameter = match index {
            ParamIndex::PortDefinition(port) => {
                Parameter::PortDefinition(self.port_config(port).definition.clone())
            }
            ParamIndex::PortFormat {
                port: PortIndex::Input,
                index,
            } => {
                let format = INPUT_FORMATS.get(index).ok_or(OmxError::NoMore)?;
                Parameter::PortFormat(PortFormat::Raw(*format))
            }
            ParamIndex::PortFormat {
                port: PortIndex::Output,
                index,
            } => match index {
                0 => Parameter::PortFormat(PortFormat::Coded(self.codec)),
                _ => return Err(OmxError::NoMore),
            },
            ParamIndex::ComponentRole => Parameter::ComponentRole(self.codec.role().to_string()),
            ParamIndex::VideoBitrate => Parameter::VideoBitrate(params.bitrate),
            ParamIndex::Avc if self.codec == Codec::Avc => Parameter::Gop(self.gop()),
            ParamIndex::Hevc if self.codec == Codec::Hevc => Parameter::Gop(self.gop()),
            ParamIndex::Avc | ParamIndex::Hevc => return Err(OmxError::UnsupportedIndex),
            ParamIndex::ProfileLevelQuery { index } => {
                let levels = supported_profile_levels(self.codec);
                Parameter::ProfileLevel(*levels.get(index).ok_or(OmxError::NoMore)?)
            }
            ParamIndex::ProfileLevelCurrent => {
                let current = match self.profile_level {
                    Some(current) => current,
                    None => supported_profile_levels(self.codec)[0],
                };
                Parameter::ProfileLevel(current)
            }
            ParamIndex::QpRange => Parameter::QpRange(params.qp_range),
            ParamIndex::EnableTemporalSvc => {
                Parameter::EnableTemporalSvc(params.temporal_layers.is_some())
            }
            ParamIndex::TemporalLayers => Parameter::TemporalLayers(
                params
                    .temporal_layers
                    .clone()
                    .unwrap_or_else(TemporalLayers::single),
            ),
            ParamIndex::EnableRoi => Parameter::EnableRoi(params.roi.is_some()),
            ParamIndex::DropControl => Parameter::DropControl(params.drop_control),
            ParamIndex::DisableDfr => Parameter::DisableDfr(!params.dynamic_framerate),
            // Only known once the hardware emitted it.
            ParamIndex::HeaderData => return Err(OmxError::NotReady),
        };

        Ok(parameter)
    }

    pub fn set_parameter(&mut self, parameter: Parameter) -> OmxResult<()> {
        match parameter {
            Parameter::PortDefinition(definition) => self.set_port_definition(definition)?,
            Parameter::PortFormat(PortFormat::Raw(format)) => {
                self.input.definition.format = PortFormat::Raw(format);
            }
            Parameter::PortFormat(PortFormat::Coded(codec)) => {
                if codec != self.codec {
                    log::error!("{codec:?} output requested from a {:?} encoder", self.codec);
                    return Err(OmxError::UnsupportedSetting);
                }
            }
            Parameter::ComponentRole(role) => {
                let codec = Codec::from_role(&role).ok_or_else(|| {
                    log::error!("unknown role {role}");
                    OmxError::BadParameter
                })?;
                self.codec = codec;
                self.output.definition.format = PortFormat::Coded(codec);
                self.profile_level = None;
            }
            Parameter::VideoBitrate(bitrate) => {
                if bitrate == 0 {
                    return Err(OmxError::BadParameter);
                }
                self.params.bitrate = bitrate;
                self.output.definition.bitrate = bitrate;
            }
            Parameter::Gop(gop) => {
                if gop.b_frames > MAX_B_FRAMES {
                    log::error!("{} B frames requested, at most {MAX_B_FRAMES}", gop.b_frames);
                    return Err(OmxError::BadParameter);
                }
                if gop.b_frames > 0 && matches!(self.codec, Codec::Vp8 | Codec::Vp9) {
                    return Err(OmxError::UnsupportedSetting);
                }
                self.b_frames = gop.b_frames;
                self.idr_period = gop.idr_period;
            }
            Parameter::ProfileLevel(requested) => {
                let supported = supported_profile_levels(self.codec)
                    .iter()
                    .any(|pl| pl.profile == requested.profile && requested.level <= pl.level);
                if !supported {
                    log::error!("unsupported profile/level {requested:?} for {:?}", self.codec);
                    return Err(OmxError::BadParameter);
                }
                self.profile_level = Some(requested);
            }
            Parameter::QpRange(range) => {
                range.validate(self.codec)?;
                self.params.qp_range = range;
            }
            Parameter::EnableTemporalSvc(enable) => {
                self.params.temporal_layers = match (enable, self.params.temporal_layers.take()) {
                    (true, Some(layers)) => Some(layers),
                    (true, None) => Some(TemporalLayers::single()),
                    (false, _) => None,
                };
            }
            Parameter::TemporalLayers(layers) => {
                layers.validate()?;
                self.params.temporal_layers = Some(layers);
            }
            Parameter::EnableRoi(enable) => {
                self.params.roi = match (enable, self.params.roi.take()) {
                    (true, roi) => Some(roi.unwrap_or_default()),
                    (false, _) => None,
                };
            }
            Parameter::DropControl(enable) => self.params.drop_control = enable,
            Parameter::DisableDfr(disable) => self.params.dynamic_framerate = !disable,
            Parameter::HeaderData(_) => return Err(OmxError::UnsupportedSetting),
        }

        Ok(())
    }

    fn set_port_definition(&mut self, definition: PortDefinition) -> OmxResult<()> {
        if definition.buffer_count_actual < definition.buffer_count_min {
            log::error!("invalid port definition {definition:?}");
            return Err(OmxError::BadParameter);
        }
        check_resolution(definition.resolution)?;
        let min_buffers = self.port_config(definition.index).definition.buffer_count_min;
        if definition.buffer_count_actual < min_buffers {
            log::error!(
                "{:?} port needs at least {min_buffers} buffers",
                definition.index
            );
            return Err(OmxError::BadParameter);
        }

        match (definition.index, definition.format) {
            (PortIndex::Input, PortFormat::Raw(_)) => {
                let resolution_changed = definition.resolution != self.input.definition.resolution;
                self.input.definition = PortDefinition {
                    buffer_count_min: min_buffers,
                    ..definition
                };
                if resolution_changed {
                    self.set_input_resolution(self.input.definition.resolution);
                }
                self.params.framerate = self.input.definition.framerate;
            }
            (PortIndex::Output, PortFormat::Coded(codec)) if codec == self.codec => {
                let output = &mut self.output.definition;
                output.buffer_count_actual = definition.buffer_count_actual;
                output.buffer_size = output.buffer_size.max(definition.buffer_size);
                if definition.bitrate != 0 {
                    output.bitrate = definition.bitrate;
                    self.params.bitrate = definition.bitrate;
                }
            }
            (index, format) => {
                log::error!("format {format:?} not supported on {index:?} port");
                return Err(OmxError::UnsupportedSetting);
            }
        }

        Ok(())
    }

    pub fn get_config(&self, index: ConfigIndex) -> OmxResult<Config> {
        let params = &self.params;
        let config = match index {
            ConfigIndex::Bitrate => Config::Bitrate(params.bitrate),
            ConfigIndex::Framerate => Config::Framerate(params.framerate),
            ConfigIndex::IntraRefresh => Config::IntraRefresh(false),
            ConfigIndex::QpRange => Config::QpRange(params.qp_range),
            ConfigIndex::TemporalLayers => Config::TemporalLayers(
                params
                    .temporal_layers
                    .clone()
                    .ok_or(OmxError::IncorrectStateOperation)?,
            ),
            ConfigIndex::Roi => {
                Config::Roi(params.roi.clone().ok_or(OmxError::IncorrectStateOperation)?)
            }
            ConfigIndex::Resolution => Config::Resolution(self.input.definition.resolution),
            ConfigIndex::OperatingRate => Config::OperatingRate(params.operating_rate),
            ConfigIndex::Rotation => Config::Rotation(self.input.definition.rotation),
            ConfigIndex::ExpectedEos => Config::ExpectedEos(false),
            ConfigIndex::Priority => Config::Priority(params.priority),
        };

        Ok(config)
    }

    /// Validates `config` and records it.
    pub fn set_config(&mut self, config: Config) -> OmxResult<()> {
        match config {
            Config::Bitrate(0) | Config::Framerate(0) => return Err(OmxError::BadParameter),
            Config::Bitrate(bitrate) => {
                self.params.bitrate = bitrate;
                self.output.definition.bitrate = bitrate;
            }
            Config::Framerate(framerate) => {
                self.params.framerate = framerate;
                self.input.definition.framerate = framerate;
            }
            Config::IntraRefresh(_) | Config::ExpectedEos(_) => (),
            Config::QpRange(range) => {
                range.validate(self.codec)?;
                self.params.qp_range = range;
            }
            Config::TemporalLayers(layers) => {
                if self.params.temporal_layers.is_none() {
                    log::error!("temporal layers set while temporal SVC is disabled");
                    return Err(OmxError::IncorrectStateOperation);
                }
                layers.validate()?;
                self.params.temporal_layers = Some(layers);
            }
            Config::Roi(roi) => {
                if self.params.roi.is_none() {
                    log::error!("ROI set while ROI encoding is disabled");
                    return Err(OmxError::IncorrectStateOperation);
                }
                self.params.roi = Some(roi);
            }
            Config::Resolution(resolution) => {
                check_resolution(resolution)?;
                self.set_input_resolution(resolution);
            }
            Config::OperatingRate(rate) => self.params.operating_rate = rate,
            Config::Rotation(rotation) => {
                self.input.definition.rotation = rotation;
                let resolution = self.input.definition.resolution;
                self.output
                    .definition
                    .set_resolution(output_resolution(resolution, rotation));
            }
            Config::Priority(priority) => self.params.priority = priority,
        }

        Ok(())
    }
}

impl<B: MfcBackend> EncoderSession<B> {
    pub fn get_parameter(&self, index: ParamIndex) -> OmxResult<Parameter> {
        match index {
            ParamIndex::HeaderData => self
                .header_data()
                .map(Parameter::HeaderData)
                .ok_or(OmxError::NotReady),
            index => self.current_config().get_parameter(index),
        }
    }

    pub fn get_config(&self, index: ConfigIndex) -> OmxResult<Config> {
        match index {
            ConfigIndex::ExpectedEos => {
                Ok(Config::ExpectedEos(self.expected_eos.load(Ordering::Acquire)))
            }
            index => self.current_config().get_config(index),
        }
    }

    /// Changes a runtime setting.
    ///
    /// Settings the hardware needs are queued and applied before the next input frame is
    /// submitted; [`EncoderSession::get_config`] reports the requested value right away.
    pub fn set_config(&self, config: Config) -> OmxResult<()> {
        let mut requested = self.current_config();
        requested.set_config(config.clone())?;

        match config {
            Config::Bitrate(bitrate) => self.queue_config(DynamicConfig::Bitrate(bitrate)),
            Config::Framerate(framerate) => {
                self.queue_config(DynamicConfig::Framerate(framerate))
            }
            Config::IntraRefresh(true) => self.queue_config(DynamicConfig::IntraRefresh),
            Config::IntraRefresh(false) => (),
            Config::QpRange(range) => self.queue_config(DynamicConfig::QpRange(range)),
            Config::TemporalLayers(layers) => {
                self.queue_config(DynamicConfig::TemporalLayers(layers))
            }
            Config::Roi(roi) => self.queue_config(DynamicConfig::Roi(roi)),
            Config::Resolution(resolution) => {
                self.queue_config(DynamicConfig::Resolution(resolution))
            }
            Config::OperatingRate(rate) => self.queue_config(DynamicConfig::OperatingRate(rate)),
            Config::Rotation(rotation) => {
                log::debug!("rotation set to {rotation:?}");
                let input = requested.input.definition.clone();
                let output = requested.output.definition.clone();
                self.input.update_definition(|def| *def = input);
                self.output.update_definition(|def| *def = output);
            }
            Config::ExpectedEos(expected) => {
                log::debug!("expected EOS {}", if expected { "armed" } else { "cleared" });
                self.expected_eos.store(expected, Ordering::Release);
            }
            Config::Priority(priority) => {
                self.backend.encoder().set_priority(priority).map_err(|err| {
                    log::error!("failed to set priority {priority}: {err}");
                    OmxError::from(err)
                })?;
            }
        }
        *self.params.lock().unwrap() = requested.params;

        Ok(())
    }
}
