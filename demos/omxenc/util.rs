// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use argh::FromArgs;

use omx_mfc::encoder::Codec;

/// Encodes synthetic frames with the dummy codec through the OMX component
#[derive(Debug, FromArgs)]
pub struct Args {
    /// input frames width
    #[argh(option, default = "320")]
    pub width: u32,

    /// input frames height
    #[argh(option, default = "240")]
    pub height: u32,

    /// number of frames to encode
    #[argh(option, default = "30")]
    pub count: usize,

    /// codec: avc, hevc, vp8 or vp9
    #[argh(option, default = "Codec::Avc")]
    pub codec: Codec,

    /// framerate
    #[argh(option, default = "30")]
    pub framerate: u32,

    /// bitrate
    #[argh(option, default = "200000")]
    pub bitrate: u32,

    /// number of B frames between reference frames
    #[argh(option, default = "0")]
    pub b_frames: u32,

    /// distance between IDR frames
    #[argh(option, default = "30")]
    pub idr_period: u32,

    /// output file to write the coded stream to
    #[argh(option)]
    pub output: Option<PathBuf>,
}

/// Luma ramp shifted by `index`, with flat chroma.
pub fn synthetic_frame(index: usize, width: u32, size: usize) -> Vec<u8> {
    let width = width.max(1) as usize;
    let luma = size * 2 / 3;
    (0..size)
        .map(|offset| {
            if offset < luma {
                ((offset % width + index) & 0xff) as u8
            } else {
                0x80
            }
        })
        .collect()
}
