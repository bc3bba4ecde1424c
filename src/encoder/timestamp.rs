// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tag to timestamp re-association.
//!
//! The hardware only carries an opaque integer tag from a raw frame to the bitstream buffer
//! holding its coded data. Each tag is an index in a fixed table recording the timestamp and
//! flags of the frame submitted with it, so that they can be reattached when the coded frame
//! comes out, possibly reordered.

use std::sync::Mutex;

use crate::backend::INDEX_AFTER_DRC;
use crate::backend::INDEX_HEADER_DATA;
use crate::omx::BufferFlags;

/// Number of slots, i.e. the number of tags in flight before they wrap.
pub const MAX_TIMESTAMP: usize = 40;

/// Classification of a tag reported by the hardware on a bitstream buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameTag {
    /// Index of a slot.
    ValidSlot(usize),
    /// The source frame was dropped by a reconfiguration.
    AfterDrc,
    /// The buffer holds codec header data.
    HeaderData,
    /// Anything else.
    Unknown(i32),
}

impl FrameTag {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            INDEX_AFTER_DRC => FrameTag::AfterDrc,
            INDEX_HEADER_DATA => FrameTag::HeaderData,
            raw if raw >= 0 && (raw as usize) < MAX_TIMESTAMP => FrameTag::ValidSlot(raw as usize),
            raw => FrameTag::Unknown(raw),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct Slot {
    timestamp: i64,
    flags: BufferFlags,
    in_use: bool,
}

struct SlotTable {
    slots: [Slot; MAX_TIMESTAMP],
    /// Tag handed out to the next submitted frame.
    next_tag: usize,
    /// Last valid tag seen on a bitstream buffer.
    last_output_tag: usize,
}

/// Timestamp and flags of a submitted frame, looked up by tag.
pub struct TimestampSlots(Mutex<SlotTable>);

impl Default for TimestampSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampSlots {
    pub fn new() -> Self {
        Self(Mutex::new(SlotTable {
            slots: [Slot::default(); MAX_TIMESTAMP],
            next_tag: 0,
            last_output_tag: 0,
        }))
    }

    /// Records a frame about to be submitted and returns the tag to attach to it.
    pub fn assign(&self, timestamp: i64, flags: BufferFlags) -> usize {
        let mut table = self.0.lock().unwrap();
        let tag = table.next_tag;
        if table.slots[tag].in_use {
            log::warn!(
                "overwriting timestamp slot {tag} still in use (timestamp={})",
                table.slots[tag].timestamp
            );
        }
        table.slots[tag] = Slot {
            timestamp,
            flags,
            in_use: true,
        };
        table.next_tag = (tag + 1) % MAX_TIMESTAMP;
        log::trace!("assigned tag={tag} timestamp={timestamp} flags={flags:?}");
        tag
    }

    pub fn is_in_use(&self, tag: usize) -> bool {
        self.0
            .lock()
            .unwrap()
            .slots
            .get(tag)
            .map(|slot| slot.in_use)
            .unwrap_or(false)
    }

    pub fn flags(&self, tag: usize) -> BufferFlags {
        self.0
            .lock()
            .unwrap()
            .slots
            .get(tag)
            .map(|slot| slot.flags)
            .unwrap_or_default()
    }

    /// Returns the timestamp and flags of `tag` and releases the slot.
    ///
    /// The flags are consumed: taking the slot again only yields its timestamp.
    pub fn take(&self, tag: usize) -> Option<(i64, BufferFlags)> {
        let mut table = self.0.lock().unwrap();
        let slot = table.slots.get_mut(tag)?;
        slot.in_use = false;
        Some((slot.timestamp, std::mem::take(&mut slot.flags)))
    }

    /// Timestamp of `tag` without releasing it.
    pub fn peek_timestamp(&self, tag: usize) -> Option<i64> {
        self.0.lock().unwrap().slots.get(tag).map(|slot| slot.timestamp)
    }

    /// Moves the end-of-stream flag from `tag` to the slot submitted just before it.
    ///
    /// The move only happens if that earlier slot is still waiting for its coded frame. Returns
    /// whether the flag moved.
    pub fn migrate_eos_backward(&self, tag: usize) -> bool {
        let mut table = self.0.lock().unwrap();
        if tag >= MAX_TIMESTAMP || !table.slots[tag].flags.contains(BufferFlags::EOS) {
            return false;
        }
        let previous = (tag + MAX_TIMESTAMP - 1) % MAX_TIMESTAMP;
        if !table.slots[previous].in_use {
            log::debug!("not moving EOS from slot {tag}: slot {previous} already delivered");
            return false;
        }
        table.slots[tag].flags.remove(BufferFlags::EOS);
        table.slots[previous].flags.insert(BufferFlags::EOS);
        log::debug!("moved EOS from slot {tag} to slot {previous}");
        true
    }

    pub fn last_output_tag(&self) -> usize {
        self.0.lock().unwrap().last_output_tag
    }

    pub fn set_last_output_tag(&self, tag: usize) {
        self.0.lock().unwrap().last_output_tag = tag % MAX_TIMESTAMP;
    }

    /// Marks every slot unused. Tag assignment continues where it was.
    pub fn clear(&self) {
        let mut table = self.0.lock().unwrap();
        for slot in table.slots.iter_mut() {
            slot.in_use = false;
        }
    }

    /// Marks every slot unused and restarts tag assignment from zero.
    pub fn reset(&self) {
        let mut table = self.0.lock().unwrap();
        table.slots = [Slot::default(); MAX_TIMESTAMP];
        table.next_tag = 0;
        table.last_output_tag = 0;
    }

    pub fn num_in_use(&self) -> usize {
        self.0.lock().unwrap().slots.iter().filter(|slot| slot.in_use).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_classification() {
        assert_eq!(FrameTag::from_raw(0), FrameTag::ValidSlot(0));
        assert_eq!(
            FrameTag::from_raw(MAX_TIMESTAMP as i32 - 1),
            FrameTag::ValidSlot(MAX_TIMESTAMP - 1)
        );
        assert_eq!(FrameTag::from_raw(MAX_TIMESTAMP as i32), FrameTag::Unknown(40));
        assert_eq!(FrameTag::from_raw(-1), FrameTag::Unknown(-1));
        assert_eq!(FrameTag::from_raw(INDEX_AFTER_DRC), FrameTag::AfterDrc);
        assert_eq!(FrameTag::from_raw(INDEX_HEADER_DATA), FrameTag::HeaderData);
    }

    #[test]
    fn tags_round_trip_timestamps() {
        let slots = TimestampSlots::new();
        let tags: Vec<_> = (0..5).map(|i| slots.assign(i * 1000, BufferFlags::empty())).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4]);

        // Out of order retrieval.
        for &tag in [3usize, 0, 4, 1, 2].iter() {
            assert!(slots.is_in_use(tag));
            let (timestamp, _) = slots.take(tag).unwrap();
            assert_eq!(timestamp, tag as i64 * 1000);
            assert!(!slots.is_in_use(tag));
        }
        assert_eq!(slots.num_in_use(), 0);
    }

    #[test]
    fn tags_wrap_without_leaking_stale_timestamps() {
        let slots = TimestampSlots::new();
        for frame in 0..(MAX_TIMESTAMP as i64 * 2 + 3) {
            let tag = slots.assign(frame, BufferFlags::empty());
            assert_eq!(tag, frame as usize % MAX_TIMESTAMP);
            assert_eq!(slots.take(tag), Some((frame, BufferFlags::empty())));
        }
        assert_eq!(slots.num_in_use(), 0);
    }

    #[test]
    fn eos_moves_to_previous_pending_slot() {
        let slots = TimestampSlots::new();
        let i = slots.assign(0, BufferFlags::empty());
        let b1 = slots.assign(1, BufferFlags::empty());
        let b2 = slots.assign(2, BufferFlags::empty());
        let p = slots.assign(3, BufferFlags::EOS);
        slots.take(i);

        assert!(slots.migrate_eos_backward(p));
        assert!(!slots.flags(p).contains(BufferFlags::EOS));
        assert!(slots.flags(b2).contains(BufferFlags::EOS));
        assert!(!slots.flags(b1).contains(BufferFlags::EOS));
    }

    #[test]
    fn eos_migration_wraps_and_requires_pending_slot() {
        let slots = TimestampSlots::new();
        for ts in 0..MAX_TIMESTAMP as i64 - 1 {
            let tag = slots.assign(ts, BufferFlags::empty());
            slots.take(tag);
        }
        let last = slots.assign(100, BufferFlags::empty());
        assert_eq!(last, MAX_TIMESTAMP - 1);
        let first = slots.assign(101, BufferFlags::EOS);
        assert_eq!(first, 0);

        assert!(slots.migrate_eos_backward(first));
        assert!(slots.flags(last).contains(BufferFlags::EOS));

        // The previous slot was already delivered: keep EOS where it is.
        slots.take(last);
        let eos = slots.assign(102, BufferFlags::EOS);
        slots.take(first);
        assert!(!slots.migrate_eos_backward(eos));
        assert!(slots.flags(eos).contains(BufferFlags::EOS));
    }

    #[test]
    fn flags_are_only_taken_once() {
        let slots = TimestampSlots::new();
        let tag = slots.assign(42, BufferFlags::EOS);
        assert_eq!(slots.take(tag), Some((42, BufferFlags::EOS)));
        assert_eq!(slots.take(tag), Some((42, BufferFlags::empty())));
    }

    #[test]
    fn clear_releases_all_slots() {
        let slots = TimestampSlots::new();
        for ts in 0..10 {
            slots.assign(ts, BufferFlags::empty());
        }
        slots.set_last_output_tag(7);
        slots.clear();
        assert_eq!(slots.num_in_use(), 0);
        assert_eq!(slots.last_output_tag(), 7);
        // Assignment continues after the last handed out tag.
        assert_eq!(slots.assign(0, BufferFlags::empty()), 10);
    }
}
