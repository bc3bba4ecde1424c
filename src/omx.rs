// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! OpenMAX IL vocabulary shared by the component and its callers.
//!
//! Numerical values follow the Khronos OMX IL 1.1.2 headers so that a C shim in front of this
//! crate can forward codes unchanged.

use bitflags::bitflags;
use enumn::N;
use thiserror::Error;

use crate::backend::BackendError;

/// OMX error codes. This is not a very "Rust-y" way of doing error handling, but it keeps the FFI
/// side trivial.
#[derive(Debug, Error, N, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OmxError {
    #[error("insufficient resources")]
    InsufficientResources = 0x8000_1000,
    #[error("undefined error")]
    Undefined = 0x8000_1001,
    #[error("invalid component")]
    InvalidComponent = 0x8000_1004,
    #[error("bad parameter")]
    BadParameter = 0x8000_1005,
    #[error("not implemented")]
    NotImplemented = 0x8000_1006,
    #[error("hardware error")]
    Hardware = 0x8000_1009,
    #[error("invalid state")]
    InvalidState = 0x8000_100A,
    #[error("no more items")]
    NoMore = 0x8000_100E,
    #[error("not ready")]
    NotReady = 0x8000_1010,
    #[error("timeout")]
    Timeout = 0x8000_1011,
    #[error("component already in requested state")]
    SameState = 0x8000_1012,
    #[error("incorrect state transition")]
    IncorrectStateTransition = 0x8000_1017,
    #[error("operation not allowed in current state")]
    IncorrectStateOperation = 0x8000_1018,
    #[error("unsupported setting")]
    UnsupportedSetting = 0x8000_1019,
    #[error("unsupported index")]
    UnsupportedIndex = 0x8000_101A,
    #[error("bad port index")]
    BadPortIndex = 0x8000_101B,
    #[error("port unpopulated")]
    PortUnpopulated = 0x8000_101C,
    #[error("codec initialization failed")]
    CodecInit = 0x9000_0003,
    #[error("codec failed to encode")]
    CodecEncode = 0x9000_0005,
}

impl OmxError {
    pub fn code(&self) -> u32 {
        *self as u32
    }
}

impl From<BackendError> for OmxError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Io(_) => OmxError::Hardware,
            BackendError::Unsupported(_) => OmxError::UnsupportedSetting,
            BackendError::NotReady | BackendError::Other(_) => OmxError::Undefined,
        }
    }
}

pub type OmxResult<T> = Result<T, OmxError>;

bitflags! {
    /// `OMX_BUFFERFLAG_*` values.
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct BufferFlags: u32 {
        const EOS = 0x0000_0001;
        const START_TIME = 0x0000_0002;
        const DECODE_ONLY = 0x0000_0004;
        const DATA_CORRUPT = 0x0000_0008;
        const END_OF_FRAME = 0x0000_0010;
        const SYNC_FRAME = 0x0000_0020;
        const EXTRA_DATA = 0x0000_0040;
        const CODEC_CONFIG = 0x0000_0080;
    }
}

/// The two ports of an encoder component.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, N)]
#[repr(u32)]
pub enum PortIndex {
    /// Raw frames coming from the framework.
    Input = 0,
    /// Encoded bitstream going back to the framework.
    Output = 1,
}

impl PortIndex {
    pub const ALL: [PortIndex; 2] = [PortIndex::Input, PortIndex::Output];
}

impl TryFrom<u32> for PortIndex {
    type Error = OmxError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        PortIndex::n(value).ok_or(OmxError::BadPortIndex)
    }
}

/// Target of a port command, `OMX_ALL` being `All`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortSelector {
    One(PortIndex),
    All,
}

impl PortSelector {
    pub fn ports(&self) -> Vec<PortIndex> {
        match self {
            PortSelector::One(port) => vec![*port],
            PortSelector::All => PortIndex::ALL.to_vec(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum State {
    Invalid = 0,
    Loaded = 1,
    Idle = 2,
    Executing = 3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    StateSet(State),
    Flush(PortSelector),
    PortDisable(PortSelector),
    PortEnable(PortSelector),
}

/// Asynchronous notifications sent to the framework.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A command completed. Port commands complete once per affected port.
    CmdComplete(CommandCompletion),
    /// A component-level error.
    Error(OmxError),
    /// The settings of a port changed and the framework should query them again.
    PortSettingsChanged(PortIndex),
    /// A buffer carrying one of the notable flags (EOS) was returned on a port.
    BufferFlag(PortIndex, BufferFlags),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandCompletion {
    StateSet(State),
    Flush(PortIndex),
    PortDisable(PortIndex),
    PortEnable(PortIndex),
}

/// First index of the vendor index space.
pub const INDEX_VENDOR_START: u32 = 0x7F00_0000;

/// Vendor extension indices reachable through `GetExtensionIndex`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, N)]
#[repr(u32)]
pub enum VendorIndex {
    EnableTemporalSvc = INDEX_VENDOR_START + 0x10,
    TemporalSvc = INDEX_VENDOR_START + 0x11,
    EnableRoiInfo = INDEX_VENDOR_START + 0x12,
    RoiInfo = INDEX_VENDOR_START + 0x13,
    QpRange = INDEX_VENDOR_START + 0x14,
    IFrameRatio = INDEX_VENDOR_START + 0x15,
    OperatingRate = INDEX_VENDOR_START + 0x16,
    ExpectedEos = INDEX_VENDOR_START + 0x17,
    DropControl = INDEX_VENDOR_START + 0x18,
    DisableDfr = INDEX_VENDOR_START + 0x19,
    HeaderData = INDEX_VENDOR_START + 0x1A,
}

const VENDOR_EXTENSIONS: &[(&str, VendorIndex)] = &[
    ("OMX.SEC.index.enableTemporalSVC", VendorIndex::EnableTemporalSvc),
    ("OMX.SEC.index.TemporalSVC", VendorIndex::TemporalSvc),
    ("OMX.SEC.index.enableRoiInfo", VendorIndex::EnableRoiInfo),
    ("OMX.SEC.index.RoiInfo", VendorIndex::RoiInfo),
    ("OMX.SEC.index.QpRange", VendorIndex::QpRange),
    ("OMX.SEC.index.IFrameRatio", VendorIndex::IFrameRatio),
    ("OMX.SEC.index.OperatingRate", VendorIndex::OperatingRate),
    ("OMX.SEC.index.ExpectedEOS", VendorIndex::ExpectedEos),
    ("OMX.SEC.index.DropControl", VendorIndex::DropControl),
    ("OMX.SEC.index.DisableDFR", VendorIndex::DisableDfr),
    ("OMX.SEC.index.HeaderData", VendorIndex::HeaderData),
];

impl VendorIndex {
    /// Looks up the vendor index registered for `name`.
    pub fn from_extension_name(name: &str) -> OmxResult<Self> {
        VENDOR_EXTENSIONS
            .iter()
            .find(|(ext, _)| *ext == name)
            .map(|(_, index)| *index)
            .ok_or(OmxError::UnsupportedIndex)
    }

    pub fn extension_name(&self) -> &'static str {
        VENDOR_EXTENSIONS
            .iter()
            .find(|(_, index)| index == self)
            .map(|(name, _)| *name)
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip_through_raw_values() {
        assert_eq!(OmxError::n(0x8000_1005), Some(OmxError::BadParameter));
        assert_eq!(OmxError::CodecEncode.code(), 0x9000_0005);
        assert_eq!(OmxError::n(0x1234), None);
    }

    #[test]
    fn vendor_extension_lookup() {
        assert_eq!(
            VendorIndex::from_extension_name("OMX.SEC.index.QpRange"),
            Ok(VendorIndex::QpRange)
        );
        assert_eq!(
            VendorIndex::from_extension_name("OMX.SEC.index.DoesNotExist"),
            Err(OmxError::UnsupportedIndex)
        );
        for (name, index) in VENDOR_EXTENSIONS {
            assert_eq!(index.extension_name(), *name);
            assert_eq!(VendorIndex::n(*index as u32), Some(*index));
        }
    }

    #[test]
    fn port_index_from_raw() {
        assert_eq!(PortIndex::try_from(1), Ok(PortIndex::Output));
        assert_eq!(PortIndex::try_from(2), Err(OmxError::BadPortIndex));
        assert_eq!(PortSelector::All.ports(), vec![PortIndex::Input, PortIndex::Output]);
    }

    #[test]
    fn buffer_flags_match_omx_values() {
        assert_eq!(BufferFlags::EOS.bits(), 0x1);
        assert_eq!(BufferFlags::CODEC_CONFIG.bits(), 0x80);
        let flags = BufferFlags::from_bits_truncate(0x31);
        assert!(flags.contains(
            BufferFlags::EOS | BufferFlags::END_OF_FRAME | BufferFlags::SYNC_FRAME
        ));
    }
}
