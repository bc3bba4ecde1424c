// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Inputs that never reach the hardware.
//!
//! An input carrying nothing but the end-of-stream flag is not submitted. Its flags and timestamp
//! are queued here instead, and the destination side stamps them on the next output buffer it
//! obtains, so the end of stream is still delivered.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::buffer::BufferDescriptor;
use crate::omx::BufferFlags;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BypassRecord {
    pub flags: BufferFlags,
    pub timestamp: i64,
}

impl BypassRecord {
    /// Turns `output` into the empty buffer carrying this record.
    pub fn stamp(&self, output: &mut BufferDescriptor) {
        output.reset_payload();
        output.flags = self.flags;
        output.timestamp = self.timestamp;
    }
}

#[derive(Default)]
pub struct BypassQueue(Mutex<VecDeque<BypassRecord>>);

impl BypassQueue {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push(&self, record: BypassRecord) {
        self.0.lock().unwrap().push_back(record);
    }

    pub fn pop(&self) -> Option<BypassRecord> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferHeaderId;

    #[test]
    fn records_stamp_empty_buffers_in_order() {
        let queue = BypassQueue::new();
        queue.push(BypassRecord {
            flags: BufferFlags::EOS,
            timestamp: 10,
        });
        queue.push(BypassRecord {
            flags: BufferFlags::EOS,
            timestamp: 20,
        });
        assert_eq!(queue.len(), 2);

        let mut output = BufferDescriptor::from_header(BufferHeaderId(3), 0x4000, 1024)
            .with_payload(100, 5, BufferFlags::SYNC_FRAME);
        queue.pop().unwrap().stamp(&mut output);
        assert_eq!(output.timestamp, 10);
        assert_eq!(output.flags, BufferFlags::EOS);
        assert_eq!(output.data_len, 0);
        assert_eq!(output.remain_len, 0);
        assert_eq!(output.header, Some(BufferHeaderId(3)));

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }
}
