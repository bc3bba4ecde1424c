// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! OpenMAX IL encoder component for MFC-style hardware codecs.
//!
//! The component translates OMX IL calls into operations on a hardware codec instance (see
//! [`backend`]) and drives the buffer pipeline between the two: raw frames flow from the input
//! port into the hardware, encoded bitstream buffers flow from the hardware to the output port,
//! and timestamps/flags are reattached on the way out using a tag slot table.
//!
//! The entry point is [`component::Component`].

pub mod backend;
pub mod buffer;
pub mod component;
pub mod encoder;
pub mod omx;
pub mod port;
pub mod signal;
pub mod utils;

use std::str::FromStr;

/// Rounds `value` up to the next multiple of `alignment`.
pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Returns the resolution with width and height exchanged.
    pub fn transposed(&self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }

    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

/// A rectangle inside a frame, as carried by the crop configuration of a port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.width, self.height))
    }
}

impl From<Resolution> for Rect {
    fn from(value: Resolution) -> Self {
        Self {
            left: 0,
            top: 0,
            width: value.width,
            height: value.height,
        }
    }
}

/// Clockwise rotation applied by the hardware to the input frames.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Whether the rotation swaps width and height.
    pub fn is_transposing(&self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }

    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

impl TryFrom<u32> for Rotation {
    type Error = u32;

    fn try_from(degrees: u32) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(other),
        }
    }
}

/// Raw frame layouts accepted on the input port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    #[default]
    NV12,
    NV21,
    I420,
    /// Opaque handle to a platform-allocated buffer, resolved by the backend.
    Opaque,
}

impl ColorFormat {
    /// Number of planes the hardware expects for this format.
    pub fn num_planes(&self) -> usize {
        match self {
            ColorFormat::NV12 | ColorFormat::NV21 => 2,
            ColorFormat::I420 => 3,
            ColorFormat::Opaque => 1,
        }
    }
}

impl FromStr for ColorFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(ColorFormat::NV12),
            "nv21" | "NV21" => Ok(ColorFormat::NV21),
            "i420" | "I420" => Ok(ColorFormat::I420),
            "opaque" => Ok(ColorFormat::Opaque),
            _ => Err("unrecognized color format. Valid values: nv12, nv21, i420, opaque"),
        }
    }
}
