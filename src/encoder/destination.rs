// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Destination side of the pipeline: empty bitstream buffers into the hardware (DstIn) and coded
//! frames back out of it (DstOut).
//!
//! Every coded frame carries the tag of the raw frame it was coded from. DstOut resolves the tag
//! against the timestamp slots to restore the timestamp and flags of that frame, whatever order
//! the hardware emits frames in.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::backend::BackendError;
use crate::backend::FrameType;
use crate::backend::HwBuffer;
use crate::backend::MfcBackend;
use crate::buffer::BufferDescriptor;
use crate::encoder::bypass::BypassRecord;
use crate::encoder::timestamp::FrameTag;
use crate::encoder::EncoderSession;
use crate::omx::BufferFlags;
use crate::omx::OmxError;
use crate::omx::OmxResult;
use crate::port::BufferProcessMode;
use crate::port::MetadataType;
use crate::utils::split_header;

/// How long DstIn waits for a free codec buffer in COPY mode.
const CODEC_BUFFER_WAIT: Duration = Duration::from_millis(10);

/// Flags of a buffer holding codec header data.
const HEADER_FLAGS: BufferFlags = BufferFlags::CODEC_CONFIG.union(BufferFlags::END_OF_FRAME);

/// What DstOut obtained from the hardware.
#[derive(Debug, PartialEq, Eq)]
pub enum DstOutput {
    /// Header data or a coded frame, ready to be returned to the framework.
    Frame(BufferDescriptor),
    /// Nothing was ready.
    NoData,
    /// The buffer holds nothing deliverable and has to be given back to the hardware.
    Reuse(BufferDescriptor),
    /// Processing the buffer failed. It is returned empty to whoever provided it.
    Failed(OmxError, BufferDescriptor),
}

fn set_payload(desc: &mut BufferDescriptor, len: u32) {
    desc.data_len = len;
    desc.used_len = 0;
    desc.remain_len = len;
    if let Some(plane) = desc.planes.first_mut() {
        plane.data_len = len;
    }
}

impl<B: MfcBackend> EncoderSession<B> {
    /// Takes the oldest empty end-of-stream input that bypassed the hardware, if any.
    pub fn pop_bypass(&self) -> Option<BypassRecord> {
        self.bypass.pop()
    }

    pub fn has_bypass(&self) -> bool {
        !self.bypass.is_empty()
    }

    /// Takes a free codec bitstream buffer. Always `None` outside of COPY mode.
    pub fn acquire_output_codec_buffer(&self) -> OmxResult<Option<BufferDescriptor>> {
        let Some(pool) = self.output.pool() else {
            return Ok(None);
        };
        Ok(pool
            .acquire(CODEC_BUFFER_WAIT)?
            .and_then(|index| pool.descriptor(index)))
    }

    pub fn release_output_codec_buffer(&self, desc: &BufferDescriptor) -> OmxResult<()> {
        match (self.output.pool(), desc.codec_index) {
            (Some(pool), Some(index)) => pool.release(index),
            _ => Ok(()),
        }
    }

    fn output_alloc_len(&self, desc: &BufferDescriptor) -> u32 {
        match (self.output.mode(), self.output.metadata()) {
            // Metadata buffers only carry a handle to the real memory.
            (BufferProcessMode::Share, MetadataType::NativeHandle)
            | (BufferProcessMode::Share, MetadataType::GraphicBuffer) => {
                self.output.definition().buffer_size
            }
            _ => desc.alloc_size,
        }
    }

    /// Hands the empty bitstream buffer in `output` to the hardware.
    ///
    /// Returns `false` without taking the buffer if the output queue is not configured yet, which
    /// happens until the first raw frame has been submitted. Starts the output stream on first
    /// use.
    pub fn dst_in(&self, output: &mut Option<BufferDescriptor>) -> OmxResult<bool> {
        let Some(desc) = output.as_ref() else {
            return Err(OmxError::BadParameter);
        };
        let Some(handle) = desc.plane0_handle() else {
            log::error!("bitstream buffer {:?} has no memory", desc.header);
            return Err(OmxError::BadParameter);
        };
        if !self.is_output_configured() {
            log::trace!("output queue not configured, holding buffer {handle:#x}");
            return Ok(false);
        }
        if !self.output_streaming.load(Ordering::Acquire) {
            self.start_output_stream()?;
        }

        let mut planes = desc.planes.clone();
        if let Some(plane) = planes.first_mut() {
            plane.alloc_len = self.output_alloc_len(desc);
            plane.data_len = 0;
        }
        let buffer = HwBuffer {
            planes,
            private: desc.header,
            ..Default::default()
        };
        log::trace!("enqueueing bitstream buffer {handle:#x}");
        self.backend.output().enqueue(buffer).map_err(|err| {
            log::error!("failed to enqueue bitstream buffer {handle:#x}: {err}");
            OmxError::from(err)
        })?;
        self.dst_out_start.open()?;
        output.take();

        Ok(true)
    }

    /// Retrieves the next coded buffer from the hardware and restores its metadata.
    pub fn dst_out(&self) -> OmxResult<DstOutput> {
        if !self.dst_out_start.is_open() {
            return Ok(DstOutput::NoData);
        }
        let buffer = match self.backend.output().dequeue() {
            Ok(buffer) => buffer,
            Err(BackendError::NotReady) => return Ok(DstOutput::NoData),
            Err(err) => {
                log::error!("failed to dequeue bitstream buffer: {err}");
                return Err(err.into());
            }
        };
        let mut desc = self.output_descriptor(&buffer)?;
        set_payload(&mut desc, buffer.data_size);

        if self.awaiting_header.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.store_header(&buffer) {
                return Ok(DstOutput::Failed(err, desc));
            }
            desc.flags = HEADER_FLAGS;
            desc.timestamp = 0;
            log::debug!("stream header, {} bytes", buffer.data_size);
            return Ok(DstOutput::Frame(desc));
        }

        let tag = match FrameTag::from_raw(buffer.tag) {
            FrameTag::ValidSlot(tag) => {
                if !self.slots.is_in_use(tag) {
                    log::debug!("tag {tag} is not in use, recycling bitstream buffer");
                    return Ok(DstOutput::Reuse(desc));
                }
                self.slots.set_last_output_tag(tag);
                tag
            }
            FrameTag::AfterDrc => {
                log::debug!("frame dropped by reconfiguration, recycling bitstream buffer");
                return Ok(DstOutput::Reuse(desc));
            }
            FrameTag::HeaderData => {
                if let Err(err) = self.store_header(&buffer) {
                    return Ok(DstOutput::Failed(err, desc));
                }
                desc.flags = HEADER_FLAGS;
                desc.timestamp = self
                    .slots
                    .peek_timestamp(self.slots.last_output_tag())
                    .unwrap_or(0);
                log::debug!("header data, {} bytes", buffer.data_size);
                return Ok(DstOutput::Frame(desc));
            }
            FrameTag::Unknown(raw) => {
                let tag = self.slots.last_output_tag();
                log::warn!("invalid tag {raw:#x} on bitstream buffer, using tag {tag}");
                tag
            }
        };

        // With B frames the P frame closing a group is emitted before the B frames submitted
        // ahead of it, so the end of stream belongs to the last of those.
        if self.b_frames > 0 && buffer.frame_type == FrameType::P {
            self.slots.migrate_eos_backward(tag);
        }
        let (slot_timestamp, slot_flags) = self.slots.take(tag).unwrap_or_default();

        desc.timestamp = if buffer.timestamp != 0 {
            buffer.timestamp
        } else {
            slot_timestamp
        };
        desc.flags = (slot_flags & BufferFlags::EOS) | BufferFlags::END_OF_FRAME;
        if buffer.frame_type.is_intra() {
            desc.flags |= BufferFlags::SYNC_FRAME;
        }
        if desc.flags.contains(BufferFlags::EOS) && !self.expected_eos.swap(false, Ordering::AcqRel)
        {
            log::debug!("end of stream reached, dropping the last payload");
            desc.remain_len = 0;
        }
        log::trace!(
            "coded frame tag={tag} type={:?} timestamp={} len={} flags={:?}",
            buffer.frame_type,
            desc.timestamp,
            desc.remain_len,
            desc.flags
        );

        Ok(DstOutput::Frame(desc))
    }

    fn store_header(&self, buffer: &HwBuffer) -> OmxResult<()> {
        let data = self.backend.output().export(buffer).map_err(|err| {
            log::error!("failed to read header data: {err}");
            OmxError::from(err)
        })?;
        let header = split_header(&data);
        log::debug!(
            "header data: {} + {} bytes",
            header.sps.len(),
            header.pps.len()
        );
        *self.header.lock().unwrap() = Some(header);
        Ok(())
    }

    /// Maps a buffer returned by the bitstream queue back to its origin.
    pub(crate) fn output_descriptor(&self, buffer: &HwBuffer) -> OmxResult<BufferDescriptor> {
        let handle = buffer.planes.first().map(|plane| plane.handle).unwrap_or(0);
        match self.output.pool() {
            Some(pool) => {
                let Some(index) = pool.find(handle) else {
                    log::error!("cannot find codec bitstream buffer {handle:#x}");
                    return Err(OmxError::Undefined);
                };
                pool.descriptor(index).ok_or(OmxError::Undefined)
            }
            None => Ok(BufferDescriptor {
                alloc_size: buffer.planes.iter().map(|plane| plane.alloc_len).sum(),
                planes: buffer.planes.clone(),
                header: buffer.private,
                ..Default::default()
            }),
        }
    }

    /// Gives a buffer DstOut reported as [`DstOutput::Reuse`] back to the hardware.
    ///
    /// `output` is taken once the buffer is back with the hardware or the codec pool. A
    /// framework buffer stays in `output` when it has to be held until the hardware can take
    /// it, and when queueing it failed.
    pub fn reuse_output(&self, output: &mut Option<BufferDescriptor>) -> OmxResult<()> {
        match self.output.mode() {
            BufferProcessMode::Copy => match output.take() {
                Some(desc) => self.release_output_codec_buffer(&desc),
                None => Ok(()),
            },
            BufferProcessMode::Share => {
                let Some(desc) = output.as_mut() else {
                    return Ok(());
                };
                desc.reset_payload();
                self.dst_in(output).map(|_| ())
            }
        }
    }

    /// Copies the coded data of a codec buffer into the framework buffer `target`.
    ///
    /// The codec buffer is released whether the copy succeeds or not.
    pub fn copy_output(
        &self,
        coded: &BufferDescriptor,
        target: &mut BufferDescriptor,
    ) -> OmxResult<()> {
        let len = coded.remain_len;
        let result = if len > target.alloc_size {
            log::error!(
                "{len} bytes of coded data do not fit in {} bytes",
                target.alloc_size
            );
            Err(OmxError::BadParameter)
        } else if len > 0 {
            self.backend
                .copy_planes(&coded.planes, &target.planes, len)
                .map_err(|err| {
                    log::error!("failed to copy coded data: {err}");
                    OmxError::from(err)
                })
        } else {
            Ok(())
        };
        self.release_output_codec_buffer(coded)?;
        result?;

        set_payload(target, len);
        target.flags = coded.flags;
        target.timestamp = coded.timestamp;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyMfc;
    use crate::backend::dummy::DUMMY_FRAME_LEN;
    use crate::backend::dummy::DUMMY_HEADER;
    use crate::buffer::BufferHeaderId;
    use crate::buffer::Plane;
    use crate::encoder::dynamic_config::DynamicConfig;
    use crate::encoder::params::ParamIndex;
    use crate::encoder::tests::input_frame;
    use crate::encoder::tests::open_session;
    use crate::encoder::tests::output_buffer;
    use crate::encoder::tests::test_config;
    use crate::encoder::HeaderMode;
    use crate::omx::PortIndex;

    fn submit(session: &EncoderSession<DummyMfc>, id: u64, timestamp: i64, flags: BufferFlags) {
        let mut input = Some(input_frame(id, timestamp, flags));
        session.src_in(&mut input).unwrap();
        assert!(input.is_none());
    }

    fn queue_outputs(session: &EncoderSession<DummyMfc>, ids: std::ops::RangeInclusive<u64>) {
        for id in ids {
            assert!(session.dst_in(&mut Some(output_buffer(id))).unwrap());
        }
    }

    fn next_frame(session: &EncoderSession<DummyMfc>) -> BufferDescriptor {
        match session.dst_out().unwrap() {
            DstOutput::Frame(desc) => desc,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn first_output_is_header_data() {
        let (session, _mfc) = open_session(&test_config());
        assert_eq!(session.dst_out().unwrap(), DstOutput::NoData);
        let mut held = Some(output_buffer(1));
        assert!(!session.dst_in(&mut held).unwrap());
        assert!(held.is_some());

        submit(&session, 1, 5000, BufferFlags::empty());
        queue_outputs(&session, 1..=2);

        let header = next_frame(&session);
        assert_eq!(header.flags, HEADER_FLAGS);
        assert_eq!(header.timestamp, 0);
        assert_eq!(header.header, Some(BufferHeaderId(1)));
        assert_eq!(header.remain_len as usize, DUMMY_HEADER.len());
        let data = session.header_data().unwrap();
        assert_eq!(data.sps, DUMMY_HEADER[..8]);
        assert_eq!(data.pps, DUMMY_HEADER[8..]);

        let frame = next_frame(&session);
        assert_eq!(frame.timestamp, 5000);
        assert_eq!(frame.flags, BufferFlags::END_OF_FRAME | BufferFlags::SYNC_FRAME);
        assert_eq!(frame.header, Some(BufferHeaderId(2)));
        assert_eq!(frame.remain_len, DUMMY_FRAME_LEN);
        assert_eq!(session.dst_out().unwrap(), DstOutput::NoData);
    }

    #[test]
    fn tags_wrap_around_the_slot_table() {
        let (session, _mfc) = open_session(&test_config());
        for id in 0..45u64 {
            submit(&session, id, id as i64 * 10 + 1, BufferFlags::empty());
            queue_outputs(&session, id..=id);
            if id == 0 {
                session.dst_in(&mut Some(output_buffer(100))).unwrap();
                assert!(next_frame(&session).flags.contains(BufferFlags::CODEC_CONFIG));
            }
            let frame = next_frame(&session);
            assert_eq!(frame.timestamp, id as i64 * 10 + 1);
        }
        assert_eq!(session.slots().num_in_use(), 0);
    }

    #[test]
    fn end_of_stream_moves_to_the_last_b_frame() {
        let mut config = test_config();
        config.b_frames = 2;
        let (session, _mfc) = open_session(&config);
        submit(&session, 1, 0, BufferFlags::empty());
        submit(&session, 2, 33, BufferFlags::empty());
        submit(&session, 3, 66, BufferFlags::empty());
        submit(&session, 4, 100, BufferFlags::EOS);
        queue_outputs(&session, 1..=5);

        let frames: Vec<_> = (0..5).map(|_| next_frame(&session)).collect();
        let timestamps: Vec<_> = frames[1..].iter().map(|frame| frame.timestamp).collect();
        // Coding order: I, then P ahead of the two B frames it closes.
        assert_eq!(timestamps, vec![0, 100, 33, 66]);

        let eos: Vec<_> = frames
            .iter()
            .filter(|frame| frame.flags.contains(BufferFlags::EOS))
            .collect();
        assert_eq!(eos.len(), 1);
        assert_eq!(eos[0].timestamp, 66);
        // The last input carried a payload, so the last output keeps its payload too.
        assert_eq!(eos[0].remain_len, DUMMY_FRAME_LEN);
        assert_eq!(session.slots().num_in_use(), 0);
    }

    #[test]
    fn end_of_stream_payload_is_kept_only_when_expected() {
        let (session, _mfc) = open_session(&test_config());
        submit(&session, 1, 7, BufferFlags::EOS);
        queue_outputs(&session, 1..=2);
        next_frame(&session);
        let frame = next_frame(&session);
        assert!(frame.flags.contains(BufferFlags::EOS));
        assert_eq!(frame.remain_len, DUMMY_FRAME_LEN);

        let (session, _mfc) = open_session(&test_config());
        submit(&session, 1, 7, BufferFlags::EOS);
        session.expected_eos.store(false, Ordering::Release);
        queue_outputs(&session, 1..=2);
        next_frame(&session);
        let frame = next_frame(&session);
        assert!(frame.flags.contains(BufferFlags::EOS));
        assert_eq!(frame.timestamp, 7);
        assert_eq!(frame.remain_len, 0);
    }

    #[test]
    fn hardware_timestamp_takes_precedence() {
        let mut config = test_config();
        config.b_frames = 1;
        let (session, mfc) = open_session(&config);
        mfc.set_hardware_timestamps(true);
        submit(&session, 1, 10, BufferFlags::empty());
        // Held in the reorder window.
        submit(&session, 2, 20, BufferFlags::empty());
        mfc.inject_output(1, FrameType::B, 900);
        queue_outputs(&session, 1..=3);

        next_frame(&session);
        assert_eq!(next_frame(&session).timestamp, 10);
        let frame = next_frame(&session);
        assert_eq!(frame.timestamp, 900);
        assert!(!session.slots().is_in_use(1));
    }

    #[test]
    fn unknown_tag_falls_back_to_last_output_tag() {
        let mut config = test_config();
        config.b_frames = 1;
        let (session, mfc) = open_session(&config);
        submit(&session, 1, 10, BufferFlags::empty());
        submit(&session, 2, 20, BufferFlags::empty());
        queue_outputs(&session, 1..=3);
        next_frame(&session);
        assert_eq!(next_frame(&session).timestamp, 10);

        mfc.inject_output(-5, FrameType::P, 0);
        let frame = next_frame(&session);
        assert_eq!(frame.timestamp, 10);
        assert_eq!(frame.flags, BufferFlags::END_OF_FRAME);
    }

    #[test]
    fn unknown_tag_after_end_of_stream_does_not_repeat_it() {
        let (session, mfc) = open_session(&test_config());
        submit(&session, 1, 10, BufferFlags::EOS);
        queue_outputs(&session, 1..=3);
        next_frame(&session);
        let frame = next_frame(&session);
        assert!(frame.flags.contains(BufferFlags::EOS));

        mfc.inject_output(-5, FrameType::P, 0);
        let frame = next_frame(&session);
        assert_eq!(frame.timestamp, 10);
        assert_eq!(frame.flags, BufferFlags::END_OF_FRAME);
    }

    #[test]
    fn failed_requeue_leaves_the_buffer_with_the_caller() {
        let (session, mfc) = open_session(&test_config());
        submit(&session, 1, 10, BufferFlags::empty());
        queue_outputs(&session, 1..=3);
        next_frame(&session);
        next_frame(&session);

        mfc.inject_output(5, FrameType::P, 0);
        let DstOutput::Reuse(desc) = session.dst_out().unwrap() else {
            panic!("expected buffer to reuse");
        };
        mfc.fail_next_output_enqueue();
        let mut reused = Some(desc);
        assert_eq!(session.reuse_output(&mut reused), Err(OmxError::Hardware));
        let desc = reused.expect("buffer was dropped");
        assert_eq!(desc.header, Some(BufferHeaderId(3)));
        assert_eq!(desc.remain_len, 0);
    }

    #[test]
    fn header_export_failure_returns_the_buffer() {
        let (session, mfc) = open_session(&test_config());
        submit(&session, 1, 10, BufferFlags::empty());
        queue_outputs(&session, 1..=2);
        mfc.fail_next_export();
        match session.dst_out().unwrap() {
            DstOutput::Failed(err, desc) => {
                assert_eq!(err, OmxError::Hardware);
                assert_eq!(desc.header, Some(BufferHeaderId(1)));
            }
            other => panic!("expected a failed buffer, got {other:?}"),
        }
        assert_eq!(session.get_parameter(ParamIndex::HeaderData), Err(OmxError::NotReady));
        assert_eq!(next_frame(&session).timestamp, 10);
    }

    #[test]
    fn header_before_idr_is_stamped_with_the_last_timestamp() {
        let mut config = test_config();
        config.header_mode = HeaderMode::WithEveryIdr;
        let (session, _mfc) = open_session(&config);
        submit(&session, 1, 10, BufferFlags::empty());
        submit(&session, 2, 20, BufferFlags::empty());
        session.queue_config(DynamicConfig::IntraRefresh);
        submit(&session, 3, 30, BufferFlags::empty());
        queue_outputs(&session, 1..=5);

        assert_eq!(next_frame(&session).timestamp, 0);
        assert_eq!(next_frame(&session).timestamp, 10);
        assert_eq!(next_frame(&session).timestamp, 20);
        let header = next_frame(&session);
        assert_eq!(header.flags, HEADER_FLAGS);
        assert_eq!(header.timestamp, 20);
        let frame = next_frame(&session);
        assert_eq!(frame.timestamp, 30);
        assert!(frame.flags.contains(BufferFlags::SYNC_FRAME));
    }

    #[test]
    fn dequeue_failure_is_hardware_error() {
        let (session, mfc) = open_session(&test_config());
        submit(&session, 1, 0, BufferFlags::empty());
        queue_outputs(&session, 1..=1);
        mfc.fail_output_dequeue();
        assert_eq!(session.dst_out(), Err(OmxError::Hardware));
    }

    #[test]
    fn stale_tag_buffer_is_queued_again() {
        let (session, mfc) = open_session(&test_config());
        submit(&session, 1, 10, BufferFlags::empty());
        queue_outputs(&session, 1..=3);
        next_frame(&session);
        next_frame(&session);

        mfc.inject_output(5, FrameType::P, 0);
        let DstOutput::Reuse(desc) = session.dst_out().unwrap() else {
            panic!("expected buffer to reuse");
        };
        assert_eq!(desc.header, Some(BufferHeaderId(3)));
        let mut reused = Some(desc);
        session.reuse_output(&mut reused).unwrap();
        assert!(reused.is_none());

        submit(&session, 2, 50, BufferFlags::empty());
        let frame = next_frame(&session);
        assert_eq!(frame.header, Some(BufferHeaderId(3)));
        assert_eq!(frame.timestamp, 50);
    }

    #[test]
    fn metadata_buffers_use_the_port_buffer_size() {
        let mut config = test_config();
        config.output.metadata = MetadataType::NativeHandle;
        let (session, _mfc) = open_session(&config);
        submit(&session, 1, 0, BufferFlags::empty());
        queue_outputs(&session, 1..=1);
        let header = next_frame(&session);
        assert_eq!(
            header.alloc_size,
            session.output_port().definition().buffer_size
        );
    }

    #[test]
    fn unknown_codec_bitstream_buffer_is_an_error() {
        let mut config = test_config();
        config.output.mode = BufferProcessMode::Copy;
        let (session, mfc) = open_session(&config);
        submit(&session, 1, 10, BufferFlags::empty());
        let desc = session.acquire_output_codec_buffer().unwrap().unwrap();
        assert!(session.dst_in(&mut Some(desc)).unwrap());

        mfc.inject_done(
            PortIndex::Output,
            HwBuffer {
                planes: vec![Plane::new(0xdead_0000, 4096)],
                data_size: 16,
                ..Default::default()
            },
        );
        assert_eq!(session.dst_out(), Err(OmxError::Undefined));
        let header = next_frame(&session);
        assert_eq!(header.flags, HEADER_FLAGS);
        assert!(header.codec_index.is_some());
    }

    #[test]
    fn copy_mode_copies_into_framework_buffers() {
        let mut config = test_config();
        config.output.mode = BufferProcessMode::Copy;
        let (session, mfc) = open_session(&config);
        let pool = session.output_port().pool().unwrap();
        submit(&session, 1, 10, BufferFlags::empty());
        for _ in 0..2 {
            let desc = session.acquire_output_codec_buffer().unwrap().unwrap();
            assert!(session.dst_in(&mut Some(desc)).unwrap());
        }
        assert_eq!(pool.num_free(), 2);

        let header = next_frame(&session);
        assert_eq!(header.header, None);
        assert!(header.codec_index.is_some());
        let mut target = output_buffer(1);
        session.copy_output(&header, &mut target).unwrap();
        assert_eq!(target.flags, HEADER_FLAGS);
        assert_eq!(target.remain_len as usize, DUMMY_HEADER.len());
        assert_eq!(mfc.read_memory(target.plane0_handle().unwrap()).unwrap(), DUMMY_HEADER);
        assert_eq!(pool.num_free(), 3);

        let frame = next_frame(&session);
        let mut target = output_buffer(2);
        session.copy_output(&frame, &mut target).unwrap();
        assert_eq!(target.timestamp, 10);
        assert_eq!(target.remain_len, DUMMY_FRAME_LEN);
        assert_eq!(pool.num_free(), 4);
    }

    #[test]
    fn flushed_output_restarts_with_header_data() {
        let (session, _mfc) = open_session(&test_config());
        submit(&session, 1, 10, BufferFlags::empty());
        queue_outputs(&session, 1..=3);
        next_frame(&session);

        let returned = session.flush(PortIndex::Output).unwrap();
        let mut ids: Vec<_> = returned.iter().filter_map(|desc| desc.header).collect();
        ids.sort();
        assert_eq!(ids, vec![BufferHeaderId(2), BufferHeaderId(3)]);
        assert!(returned.iter().all(|desc| desc.remain_len == 0));

        queue_outputs(&session, 4..=5);
        submit(&session, 2, 20, BufferFlags::empty());
        assert!(next_frame(&session).flags.contains(BufferFlags::CODEC_CONFIG));
        assert_eq!(next_frame(&session).timestamp, 20);
    }
}
