// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Source side of the pipeline: raw frames into the hardware (SrcIn) and consumed raw frame
//! buffers back out of it (SrcOut).

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::backend::BackendError;
use crate::backend::HwBuffer;
use crate::backend::MfcBackend;
use crate::buffer::BufferDescriptor;
use crate::encoder::bypass::BypassRecord;
use crate::encoder::EncoderSession;
use crate::omx::BufferFlags;
use crate::omx::OmxError;
use crate::omx::OmxResult;
use crate::port::BufferProcessMode;

/// How long SrcIn waits for a free codec buffer in COPY mode.
const CODEC_BUFFER_WAIT: Duration = Duration::from_millis(10);

/// What SrcIn did with its input.
#[derive(Debug, PartialEq, Eq)]
pub enum SrcInOutcome {
    /// The frame was submitted to the hardware. Carries the framework buffer when its data was
    /// copied into a codec buffer, in which case it can be returned right away.
    Queued(Option<BufferDescriptor>),
    /// End of stream without payload. Recorded in the bypass queue; the framework buffer is
    /// returned right away.
    Bypassed(BufferDescriptor),
    /// A resolution change was performed. The input was not consumed and must be submitted
    /// again.
    Reconfigured,
    /// No codec buffer is free. The input was not consumed.
    Busy,
}

impl<B: MfcBackend> EncoderSession<B> {
    /// Submits the raw frame in `input` to the hardware.
    ///
    /// `input` is taken only if the frame was consumed. On error it is left in place if the
    /// framework still owns it.
    pub fn src_in(&self, input: &mut Option<BufferDescriptor>) -> OmxResult<SrcInOutcome> {
        let Some(desc) = input.as_ref() else {
            return Err(OmxError::BadParameter);
        };

        if desc.is_eos_only() {
            let record = BypassRecord {
                flags: desc.flags,
                timestamp: desc.timestamp,
            };
            log::debug!("bypassing empty EOS input timestamp={}", record.timestamp);
            self.bypass.push(record);
            self.dst_in_start.open()?;
            let desc = input.take().ok_or(OmxError::BadParameter)?;
            return Ok(SrcInOutcome::Bypassed(desc));
        }

        if !self.is_input_configured() {
            self.setup_input()?;
        } else if !self.input_streaming.load(Ordering::Acquire) {
            self.start_input_stream()?;
        }
        if !self.is_output_configured() {
            self.setup_output()?;
        }

        if self.apply_dynamic_configs()? {
            return Ok(SrcInOutcome::Reconfigured);
        }

        let codec_buffer = match self.input.pool() {
            Some(pool) => match pool.acquire(CODEC_BUFFER_WAIT)? {
                Some(index) => Some(index),
                None => {
                    log::trace!("no free codec input buffer");
                    return Ok(SrcInOutcome::Busy);
                }
            },
            None => None,
        };

        match self.submit_input(desc, codec_buffer) {
            Ok(()) => (),
            Err(err) => {
                if let (Some(pool), Some(index)) = (self.input.pool(), codec_buffer) {
                    pool.release(index)?;
                }
                return Err(err);
            }
        }

        self.source_start.open()?;
        self.dst_in_start.open()?;

        let desc = input.take().ok_or(OmxError::BadParameter)?;
        Ok(SrcInOutcome::Queued(match self.input.mode() {
            BufferProcessMode::Copy => Some(desc),
            BufferProcessMode::Share => None,
        }))
    }

    fn submit_input(&self, desc: &BufferDescriptor, codec_index: Option<usize>) -> OmxResult<()> {
        let codec_buffer = codec_index.and_then(|index| self.input.pool()?.get(index));
        let (planes, private) = match codec_buffer {
            Some(buffer) => {
                if desc.data_len > buffer.alloc_size {
                    log::error!(
                        "{} bytes of input do not fit in a {} bytes codec buffer",
                        desc.data_len,
                        buffer.alloc_size
                    );
                    return Err(OmxError::BadParameter);
                }
                self.backend
                    .copy_planes(&desc.planes, &buffer.planes, desc.data_len)
                    .map_err(|err| {
                        log::error!("failed to copy input frame: {err}");
                        OmxError::from(err)
                    })?;
                (buffer.planes.clone(), None)
            }
            None => (desc.planes.clone(), desc.header),
        };

        if desc.flags.contains(BufferFlags::EOS) {
            log::debug!("last input frame carries payload, keeping it on output");
            self.expected_eos.store(true, Ordering::Release);
        }

        let tag = self.slots.assign(desc.timestamp, desc.flags);
        let buffer = HwBuffer {
            planes,
            data_size: desc.data_len,
            tag: tag as i32,
            timestamp: desc.timestamp,
            private,
            eos: desc.flags.contains(BufferFlags::EOS),
            ..Default::default()
        };
        log::trace!(
            "enqueueing input tag={tag} timestamp={} len={}",
            desc.timestamp,
            desc.data_len
        );
        if let Err(err) = self.backend.input().enqueue(buffer) {
            log::error!("failed to enqueue input tag={tag}: {err}");
            self.slots.take(tag);
            return Err(OmxError::CodecEncode);
        }

        Ok(())
    }

    /// Retrieves a raw frame buffer the hardware is done with.
    ///
    /// Returns `None` if there is none yet. In COPY mode the codec buffer goes back to its pool
    /// and the returned descriptor carries no framework header.
    pub fn src_out(&self) -> OmxResult<Option<BufferDescriptor>> {
        match self.backend.input().dequeue() {
            Ok(buffer) => self.reclaim_input(buffer).map(Some),
            Err(BackendError::NotReady) => {
                if self.is_reconfiguring() {
                    self.drc_sync.set()?;
                }
                Ok(None)
            }
            Err(err) => {
                log::error!("failed to dequeue input buffer: {err}");
                Err(err.into())
            }
        }
    }

    /// Maps a buffer returned by the input queue back to its origin.
    pub(crate) fn reclaim_input(&self, buffer: HwBuffer) -> OmxResult<BufferDescriptor> {
        let handle = buffer.planes.first().map(|plane| plane.handle).unwrap_or(0);
        match self.input.pool() {
            Some(pool) => {
                let Some(index) = pool.find(handle) else {
                    log::error!("cannot find codec input buffer {handle:#x}");
                    return Err(OmxError::Undefined);
                };
                pool.release(index)?;
                log::trace!("codec input buffer {index} released");
                pool.descriptor(index).ok_or(OmxError::Undefined)
            }
            None => {
                if buffer.private.is_none() {
                    log::warn!("input buffer {handle:#x} returned without its header");
                }
                log::trace!("input buffer {:?} released", buffer.private);
                Ok(BufferDescriptor {
                    alloc_size: buffer.planes.iter().map(|plane| plane.alloc_len).sum(),
                    planes: buffer.planes,
                    header: buffer.private,
                    ..Default::default()
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyEvent;
    use crate::backend::FrameType;
    use crate::buffer::BufferHeaderId;
    use crate::buffer::Plane;
    use crate::encoder::dynamic_config::DynamicConfig;
    use crate::encoder::tests::input_frame;
    use crate::encoder::tests::open_session;
    use crate::encoder::tests::test_config;
    use crate::encoder::QpRange;
    use crate::encoder::Stage;
    use crate::omx::PortIndex;

    #[test]
    fn first_input_configures_both_queues() {
        let (session, mfc) = open_session(&test_config());
        assert!(!session.is_started(Stage::SrcOut));

        let mut input = Some(input_frame(1, 1000, BufferFlags::empty()));
        assert_eq!(session.src_in(&mut input).unwrap(), SrcInOutcome::Queued(None));
        assert!(input.is_none());
        assert!(session.is_input_configured());
        assert!(session.is_output_configured());
        assert!(session.is_started(Stage::SrcOut));
        assert!(session.is_started(Stage::DstIn));

        let events = mfc.events();
        let position = |wanted: &DummyEvent| events.iter().position(|e| e == wanted).unwrap();
        assert!(
            position(&DummyEvent::Run(PortIndex::Input))
                < position(&DummyEvent::InputEnqueue { tag: 0 })
        );
        assert!(events.contains(&DummyEvent::Setup(PortIndex::Output, 4)));
        assert!(!events.contains(&DummyEvent::Run(PortIndex::Output)));
    }

    #[test]
    fn setup_failure_keeps_input() {
        let (session, mfc) = open_session(&test_config());
        mfc.fail_geometry(true);
        let mut input = Some(input_frame(1, 0, BufferFlags::empty()));
        assert_eq!(session.src_in(&mut input), Err(OmxError::InsufficientResources));
        assert!(input.is_some());
        assert!(!session.is_input_configured());

        mfc.fail_geometry(false);
        assert_eq!(session.src_in(&mut input).unwrap(), SrcInOutcome::Queued(None));
    }

    #[test]
    fn eos_only_input_never_reaches_hardware() {
        let (session, mfc) = open_session(&test_config());
        let mut input = Some(
            BufferDescriptor::from_header(BufferHeaderId(9), 0x9000, 4096)
                .with_payload(0, 500, BufferFlags::EOS),
        );
        let outcome = session.src_in(&mut input).unwrap();
        let SrcInOutcome::Bypassed(desc) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(desc.header, Some(BufferHeaderId(9)));
        assert!(input.is_none());
        // Nothing was configured or enqueued.
        assert!(mfc.events().is_empty());
        assert!(!session.is_input_configured());
        assert!(session.is_started(Stage::DstIn));
        assert_eq!(session.slots().num_in_use(), 0);
    }

    #[test]
    fn queued_configs_apply_before_the_next_input() {
        let (session, mfc) = open_session(&test_config());
        session.src_in(&mut Some(input_frame(1, 0, BufferFlags::empty()))).unwrap();

        mfc.clear_events();
        session.queue_config(DynamicConfig::Bitrate(2_000_000));
        session.queue_config(DynamicConfig::QpRange(QpRange::uniform(10, 20)));
        session.queue_config(DynamicConfig::IntraRefresh);
        session.src_in(&mut Some(input_frame(2, 33, BufferFlags::empty()))).unwrap();
        session.src_in(&mut Some(input_frame(3, 66, BufferFlags::empty()))).unwrap();

        assert_eq!(
            mfc.events(),
            vec![
                DummyEvent::Bitrate(2_000_000),
                DummyEvent::QpRange(QpRange::uniform(10, 20)),
                DummyEvent::FrameType(FrameType::I),
                DummyEvent::InputEnqueue { tag: 1 },
                DummyEvent::InputEnqueue { tag: 2 },
            ]
        );
    }

    #[test]
    fn enqueue_failure_is_codec_encode_error() {
        let (session, mfc) = open_session(&test_config());
        session.src_in(&mut Some(input_frame(1, 0, BufferFlags::empty()))).unwrap();

        mfc.fail_next_input_enqueue();
        let mut input = Some(input_frame(2, 33, BufferFlags::empty()));
        assert_eq!(session.src_in(&mut input), Err(OmxError::CodecEncode));
        assert!(input.is_some());
        // The slot was given back.
        assert_eq!(session.slots().num_in_use(), 1);
    }

    #[test]
    fn src_out_returns_framework_buffers() {
        let (session, _mfc) = open_session(&test_config());
        assert_eq!(session.src_out().unwrap(), None);

        session.src_in(&mut Some(input_frame(4, 0, BufferFlags::empty()))).unwrap();
        let desc = session.src_out().unwrap().unwrap();
        assert_eq!(desc.header, Some(BufferHeaderId(4)));
        assert_eq!(desc.plane0_handle(), Some(0x10_0000 + 4 * 0x1000));
        assert_eq!(session.src_out().unwrap(), None);
    }

    #[test]
    fn copy_mode_returns_input_right_away_and_recycles_codec_buffers() {
        let mut config = test_config();
        config.input.mode = BufferProcessMode::Copy;
        config.input.definition.buffer_count_actual = 2;
        let (session, mfc) = open_session(&config);
        let pool = session.input_port().pool().unwrap();

        for id in 1..=2 {
            let outcome = session.src_in(&mut Some(input_frame(id, 0, BufferFlags::empty())));
            let Ok(SrcInOutcome::Queued(Some(desc))) = outcome else {
                panic!("unexpected outcome {outcome:?}");
            };
            assert_eq!(desc.header, Some(BufferHeaderId(id)));
        }
        assert_eq!(pool.num_free(), 0);
        assert_eq!(mfc.num_copies(), 2);

        let mut input = Some(input_frame(3, 0, BufferFlags::empty()));
        assert_eq!(session.src_in(&mut input).unwrap(), SrcInOutcome::Busy);
        assert!(input.is_some());

        let released = session.src_out().unwrap().unwrap();
        assert_eq!(released.header, None);
        assert!(released.codec_index.is_some());
        assert_eq!(pool.num_free(), 1);
        assert!(matches!(session.src_in(&mut input).unwrap(), SrcInOutcome::Queued(Some(_))));
    }

    #[test]
    fn copy_mode_rejects_frames_larger_than_codec_buffers() {
        let mut config = test_config();
        config.input.mode = BufferProcessMode::Copy;
        config.input.definition.buffer_count_actual = 2;
        let (session, mfc) = open_session(&config);
        let pool = session.input_port().pool().unwrap();
        session.src_in(&mut Some(input_frame(1, 0, BufferFlags::empty()))).unwrap();

        // A frame of a larger resolution than the pool was sized for.
        let mut input = Some(
            BufferDescriptor::from_header(BufferHeaderId(2), 0x20_0000, 400_000)
                .with_payload(400_000, 33, BufferFlags::empty()),
        );
        assert_eq!(session.src_in(&mut input), Err(OmxError::BadParameter));
        assert!(input.is_some());
        assert_eq!(pool.num_free(), 1);
        assert_eq!(mfc.num_copies(), 1);
        assert_eq!(session.slots().num_in_use(), 1);
    }

    #[test]
    fn unknown_codec_input_buffer_is_an_error() {
        let mut config = test_config();
        config.input.mode = BufferProcessMode::Copy;
        let (session, mfc) = open_session(&config);
        session.src_in(&mut Some(input_frame(1, 0, BufferFlags::empty()))).unwrap();
        assert!(session.src_out().unwrap().unwrap().codec_index.is_some());

        mfc.inject_done(
            PortIndex::Input,
            HwBuffer {
                planes: vec![Plane::new(0xdead_0000, 4096)],
                ..Default::default()
            },
        );
        assert_eq!(session.src_out(), Err(OmxError::Undefined));
        assert_eq!(session.src_out().unwrap(), None);
    }

    #[test]
    fn eos_with_payload_arms_expected_eos() {
        let (session, _mfc) = open_session(&test_config());
        session.src_in(&mut Some(input_frame(1, 0, BufferFlags::EOS))).unwrap();
        assert!(session.expected_eos.load(Ordering::Acquire));
    }
}
