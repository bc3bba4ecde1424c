// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dynamic resolution change of the input stream.

use std::sync::atomic::Ordering;
use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::MfcBackend;
use crate::encoder::input_geometry;
use crate::encoder::EncoderSession;
use crate::encoder::HeaderMode;
use crate::omx::OmxError;
use crate::omx::OmxResult;
use crate::signal::SignalError;
use crate::Resolution;

/// Number of input buffer slots set up after a reconfiguration, whatever the port count.
pub const MAX_INPUT_BUFFER_COUNT_DYNAMIC: usize = 32;

/// How long a reconfiguration waits for the input queue to drain.
pub const DRC_SYNC_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Error)]
enum DrcError {
    #[error("input queue did not drain in {0:?}")]
    SyncTimeout(Duration),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Signal(#[from] SignalError),
}

impl<B: MfcBackend> EncoderSession<B> {
    /// Changes the input frame size to `resolution`.
    ///
    /// Blocks until SrcOut reports the input queue empty, so it must not be called from the SrcOut
    /// thread. If the input queue is not configured yet, only the port definitions change.
    pub(crate) fn reconfigure(&self, resolution: Resolution) -> OmxResult<()> {
        if resolution.width == 0 || resolution.height == 0 {
            log::error!("invalid target resolution {resolution:?}");
            return Err(OmxError::BadParameter);
        }
        self.update_port_resolution(resolution);
        if !self.is_input_configured() {
            log::debug!("input not configured yet, {resolution:?} will be used at setup");
            return Ok(());
        }

        log::debug!("reconfiguring input to {resolution:?}");
        self.reconfiguring.store(true, Ordering::Release);
        let result = self.run_reconfiguration();
        self.reconfiguring.store(false, Ordering::Release);

        match result {
            Ok(()) => {
                log::debug!("reconfiguration to {resolution:?} done");
                Ok(())
            }
            Err(err) => {
                log::error!("reconfiguration to {resolution:?} failed: {err}");
                Err(OmxError::Undefined)
            }
        }
    }

    pub fn is_reconfiguring(&self) -> bool {
        self.reconfiguring.load(Ordering::Acquire)
    }

    fn update_port_resolution(&self, resolution: Resolution) {
        let input = self.input.update_definition(|def| def.set_resolution(resolution));
        let output_resolution = if input.rotation.is_transposing() {
            resolution.transposed()
        } else {
            resolution
        };
        self.output
            .update_definition(|def| def.set_resolution(output_resolution));
    }

    fn run_reconfiguration(&self) -> Result<(), DrcError> {
        let queue = self.backend.input();

        queue.stop()?;
        self.input_streaming.store(false, Ordering::Release);
        self.drc_sync.reset()?;
        if !self.drc_sync.wait_timeout(DRC_SYNC_TIMEOUT)? {
            return Err(DrcError::SyncTimeout(DRC_SYNC_TIMEOUT));
        }
        self.drc_sync.reset()?;

        let previous = queue.get_geometry()?;
        queue.clear_registered_buffer()?;
        queue.cleanup_buffer()?;

        let geometry = input_geometry(&self.input.definition());
        log::debug!("input geometry {previous:?} -> {geometry:?}");
        queue.set_geometry(&geometry)?;
        queue.setup(MAX_INPUT_BUFFER_COUNT_DYNAMIC)?;
        // Header data is emitted once after the restart, not in front of every IDR.
        self.backend
            .encoder()
            .set_header_mode(HeaderMode::Separate)?;

        queue.run()?;
        self.input_streaming.store(true, Ordering::Release);
        self.slots.clear();

        Ok(())
    }
}
