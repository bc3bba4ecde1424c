// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runtime parameter changes.
//!
//! A successful `set_config` while the session is open queues a [`DynamicConfig`]. The queue is
//! drained by SrcIn before the next frame is submitted, so a change always applies to every frame
//! submitted after it was requested and to none submitted before.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::backend::FrameType;
use crate::backend::MfcBackend;
use crate::encoder::EncoderSession;
use crate::encoder::QpRange;
use crate::encoder::RoiInfo;
use crate::encoder::TemporalLayers;
use crate::omx::OmxError;
use crate::omx::OmxResult;
use crate::Resolution;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DynamicConfig {
    Bitrate(u32),
    /// Q16 frames per second.
    Framerate(u32),
    /// Code the next frame as an I frame.
    IntraRefresh,
    QpRange(QpRange),
    TemporalLayers(TemporalLayers),
    Roi(RoiInfo),
    /// New input frame size. Triggers a reconfiguration.
    Resolution(Resolution),
    /// Q16 frames per second.
    OperatingRate(u32),
}

#[derive(Default)]
pub struct DynamicConfigQueue(Mutex<VecDeque<DynamicConfig>>);

impl DynamicConfigQueue {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push(&self, config: DynamicConfig) {
        self.0.lock().unwrap().push_back(config);
    }

    pub fn pop(&self) -> Option<DynamicConfig> {
        self.0.lock().unwrap().pop_front()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<B: MfcBackend> EncoderSession<B> {
    /// Queues `config` for the next SrcIn.
    pub fn queue_config(&self, config: DynamicConfig) {
        log::debug!("queueing {config:?}");
        self.configs.push(config);
    }

    pub fn num_pending_configs(&self) -> usize {
        self.configs.len()
    }

    /// Applies queued configs in order.
    ///
    /// Stops after a resolution change and returns `true`: the configs queued after it stay
    /// queued and are applied on the next call.
    pub(crate) fn apply_dynamic_configs(&self) -> OmxResult<bool> {
        while let Some(config) = self.configs.pop() {
            if self.apply_config(config)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Applies a single config. Returns whether it reconfigured the input.
    fn apply_config(&self, config: DynamicConfig) -> OmxResult<bool> {
        log::debug!("applying {config:?}");
        let encoder = self.backend.encoder();
        let result = match &config {
            DynamicConfig::Bitrate(bitrate) => {
                self.output.update_definition(|def| def.bitrate = *bitrate);
                encoder.set_bitrate(*bitrate)
            }
            DynamicConfig::Framerate(framerate) => {
                self.input.update_definition(|def| def.framerate = *framerate);
                encoder.set_framerate(framerate >> 16)
            }
            DynamicConfig::IntraRefresh => encoder.set_frame_type(FrameType::I),
            DynamicConfig::QpRange(range) => encoder.set_qp_range(range),
            DynamicConfig::TemporalLayers(layers) => encoder.set_temporal_layers(layers),
            DynamicConfig::Roi(roi) => encoder.set_roi(roi),
            DynamicConfig::OperatingRate(rate) => encoder.set_operating_rate(rate >> 16),
            DynamicConfig::Resolution(resolution) => {
                self.reconfigure(*resolution)?;
                return Ok(true);
            }
        };
        result.map_err(|err| {
            log::error!("failed to apply {config:?}: {err}");
            OmxError::from(err)
        })?;

        Ok(false)
    }
}
