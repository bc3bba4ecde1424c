// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.

use crate::encoder::HeaderData;

/// 4-byte Annex B start code.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Returns the position of the first 4-byte start code at or after `offset`.
pub fn find_start_code(data: &[u8], offset: usize) -> Option<usize> {
    data.get(offset..)?
        .windows(START_CODE.len())
        .position(|window| window == START_CODE)
        .map(|pos| pos + offset)
}

/// Splits the header data emitted by the hardware into its two parameter sets.
///
/// The second parameter set starts at the first start code found past the one opening the
/// buffer. If there is none, the whole buffer is taken as the first parameter set.
pub fn split_header(data: &[u8]) -> HeaderData {
    match find_start_code(data, START_CODE.len()) {
        Some(pos) => HeaderData {
            sps: data[..pos].to_vec(),
            pps: data[pos..].to_vec(),
        },
        None => HeaderData {
            sps: data.to_vec(),
            pps: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_code_search() {
        let data = [0, 0, 0, 1, 0x67, 0, 0, 0, 1, 0x68];
        assert_eq!(find_start_code(&data, 0), Some(0));
        assert_eq!(find_start_code(&data, 1), Some(5));
        assert_eq!(find_start_code(&data, 6), None);
        assert_eq!(find_start_code(&data, 100), None);
        // 3-byte start codes are not matched.
        assert_eq!(find_start_code(&[0, 0, 1, 0x67], 0), None);
    }

    #[test]
    fn header_split() {
        let data = [0, 0, 0, 1, 0x67, 0x42, 0x80, 0, 0, 0, 1, 0x68, 0xce];
        let header = split_header(&data);
        assert_eq!(header.sps, vec![0, 0, 0, 1, 0x67, 0x42, 0x80]);
        assert_eq!(header.pps, vec![0, 0, 0, 1, 0x68, 0xce]);

        let header = split_header(&data[..7]);
        assert_eq!(header.sps.len(), 7);
        assert!(header.pps.is_empty());
    }
}
