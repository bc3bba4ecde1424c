// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The OMX component.
//!
//! [`Component`] implements the IL state machine (Loaded, Idle, Executing) on top of an
//! [`EncoderSession`]. While Executing, four worker threads drive the pipeline stages: SrcIn
//! submits raw frames, SrcOut returns them, DstIn hands bitstream buffers to the hardware and
//! DstOut collects coded data. Results go back to the framework through [`Callbacks`].

use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::MfcBackend;
use crate::backend::MfcDevice;
use crate::buffer::BufferDescriptor;
use crate::encoder::bypass::BypassRecord;
use crate::encoder::destination::DstOutput;
use crate::encoder::params::component_role_enum;
use crate::encoder::params::Config;
use crate::encoder::params::ConfigIndex;
use crate::encoder::params::ParamIndex;
use crate::encoder::params::Parameter;
use crate::encoder::source::SrcInOutcome;
use crate::encoder::Codec;
use crate::encoder::EncoderConfig;
use crate::encoder::EncoderSession;
use crate::encoder::Stage;
use crate::omx::BufferFlags;
use crate::omx::Command;
use crate::omx::CommandCompletion;
use crate::omx::Event;
use crate::omx::OmxError;
use crate::omx::OmxResult;
use crate::omx::PortIndex;
use crate::omx::PortSelector;
use crate::omx::State;
use crate::omx::VendorIndex;
use crate::port::BufferProcessMode;
use crate::ColorFormat;
use crate::Resolution;

/// How long an idle worker sleeps before polling again.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Frame size of a freshly created component.
const DEFAULT_RESOLUTION: Resolution = Resolution {
    width: 176,
    height: 144,
};

pub type EventCallback = Arc<Mutex<dyn FnMut(Event) + Send + 'static>>;
pub type BufferDoneCallback = Arc<Mutex<dyn FnMut(BufferDescriptor) + Send + 'static>>;

/// Framework callbacks. They are invoked from the worker threads as well as from the thread
/// calling into the component.
#[derive(Clone)]
pub struct Callbacks {
    pub event: EventCallback,
    /// An input buffer can be reused by the framework.
    pub empty_buffer_done: BufferDoneCallback,
    /// An output buffer has been filled, or is returned empty.
    pub fill_buffer_done: BufferDoneCallback,
}

impl Callbacks {
    fn event(&self, event: Event) {
        (*self.event.lock().unwrap())(event);
    }

    fn empty_buffer_done(&self, desc: BufferDescriptor) {
        (*self.empty_buffer_done.lock().unwrap())(desc);
    }

    fn fill_buffer_done(&self, desc: BufferDescriptor) {
        let flags = desc.flags;
        (*self.fill_buffer_done.lock().unwrap())(desc);
        if flags.contains(BufferFlags::EOS) {
            self.event(Event::BufferFlag(PortIndex::Output, flags));
        }
    }

    fn return_buffers(&self, port: PortIndex, buffers: Vec<BufferDescriptor>) {
        for mut desc in buffers {
            match port {
                PortIndex::Input => self.empty_buffer_done(desc),
                PortIndex::Output => {
                    desc.reset_payload();
                    (*self.fill_buffer_done.lock().unwrap())(desc);
                }
            }
        }
    }
}

/// State shared by one worker thread.
struct Worker<B: MfcBackend> {
    stage: Stage,
    session: Arc<EncoderSession<B>>,
    callbacks: Callbacks,
}

impl<B: MfcBackend> Worker<B> {
    fn run(&self) {
        log::debug!("{:?} worker started", self.stage);
        let result = match self.stage {
            Stage::SrcIn => self.src_in_loop(),
            Stage::SrcOut => self.src_out_loop(),
            Stage::DstIn => self.dst_in_loop(),
            Stage::DstOut => self.dst_out_loop(),
        };
        if let Err(err) = result {
            self.report(err);
        }
        log::debug!("{:?} worker exited", self.stage);
    }

    fn report(&self, err: OmxError) {
        log::error!("{:?} stage failed: {err}", self.stage);
        self.callbacks.event(Event::Error(err));
    }

    fn src_in_loop(&self) -> OmxResult<()> {
        let session = &self.session;
        let mut pending: Option<BufferDescriptor> = None;

        while !session.exit_requested() {
            if pending.is_none() {
                pending = session.input_port().queue().pop_timeout(POLL_INTERVAL)?;
                if pending.is_none() {
                    continue;
                }
            }

            match session.src_in(&mut pending) {
                Ok(SrcInOutcome::Queued(Some(desc))) | Ok(SrcInOutcome::Bypassed(desc)) => {
                    self.callbacks.empty_buffer_done(desc)
                }
                Ok(SrcInOutcome::Queued(None)) => (),
                Ok(SrcInOutcome::Reconfigured) => {
                    self.callbacks.event(Event::PortSettingsChanged(PortIndex::Output))
                }
                Ok(SrcInOutcome::Busy) => (),
                Err(err) => {
                    self.report(err);
                    if let Some(desc) = pending.take() {
                        self.callbacks.empty_buffer_done(desc);
                    }
                }
            }
        }

        if let Some(desc) = pending.take() {
            self.callbacks.empty_buffer_done(desc);
        }
        Ok(())
    }

    fn src_out_loop(&self) -> OmxResult<()> {
        let session = &self.session;
        if !session.wait_for_start(Stage::SrcOut)? {
            return Ok(());
        }

        while !session.exit_requested() {
            match session.src_out() {
                Ok(Some(desc)) => {
                    // Codec buffers of COPY mode carry no header and stay with the pool.
                    if desc.header.is_some() {
                        self.callbacks.empty_buffer_done(desc);
                    }
                }
                Ok(None) => session.idle_wait(POLL_INTERVAL)?,
                Err(err) => {
                    self.report(err);
                    session.idle_wait(POLL_INTERVAL)?;
                }
            }
        }
        Ok(())
    }

    fn is_copy_output(&self) -> bool {
        self.session.output_port().mode() == BufferProcessMode::Copy
    }

    fn pop_framework_output(&self) -> OmxResult<Option<BufferDescriptor>> {
        self.session.output_port().queue().pop_timeout(POLL_INTERVAL)
    }

    /// Returns an output buffer the pipeline could not use.
    fn give_back_output(&self, mut desc: BufferDescriptor) -> OmxResult<()> {
        if desc.header.is_some() {
            desc.reset_payload();
            (*self.callbacks.fill_buffer_done.lock().unwrap())(desc);
            Ok(())
        } else {
            self.session.release_output_codec_buffer(&desc)
        }
    }

    fn deliver_bypass(
        &self,
        record: BypassRecord,
        pending: &mut Option<BufferDescriptor>,
    ) -> OmxResult<bool> {
        let target = match pending.take() {
            Some(desc) if desc.header.is_some() => Some(desc),
            other => {
                *pending = other;
                self.pop_framework_output()?
            }
        };
        let Some(mut desc) = target else {
            return Ok(false);
        };
        record.stamp(&mut desc);
        log::debug!("returning bypassed EOS timestamp={}", desc.timestamp);
        self.callbacks.fill_buffer_done(desc);
        Ok(true)
    }

    fn dst_in_loop(&self) -> OmxResult<()> {
        let session = &self.session;
        if !session.wait_for_start(Stage::DstIn)? {
            return Ok(());
        }

        let copy = self.is_copy_output();
        let mut pending: Option<BufferDescriptor> = None;
        let mut bypass: Option<BypassRecord> = None;

        while !session.exit_requested() {
            if bypass.is_none() {
                bypass = session.pop_bypass();
            }
            if let Some(record) = bypass {
                if self.deliver_bypass(record, &mut pending)? {
                    bypass = None;
                }
                continue;
            }

            if pending.is_none() {
                let next = if copy {
                    session.acquire_output_codec_buffer()
                } else {
                    self.pop_framework_output()
                };
                match next {
                    Ok(Some(desc)) => pending = Some(desc),
                    Ok(None) => continue,
                    Err(err) => {
                        self.report(err);
                        session.idle_wait(POLL_INTERVAL)?;
                        continue;
                    }
                }
            }

            match session.dst_in(&mut pending) {
                Ok(true) => (),
                Ok(false) => session.idle_wait(POLL_INTERVAL)?,
                Err(err) => {
                    self.report(err);
                    if let Some(desc) = pending.take() {
                        self.give_back_output(desc)?;
                    }
                }
            }
        }

        if let Some(desc) = pending.take() {
            self.give_back_output(desc)?;
        }
        Ok(())
    }

    /// Copies a coded codec buffer into the next framework buffer.
    fn deliver_copied(&self, coded: BufferDescriptor) -> OmxResult<()> {
        let session = &self.session;
        loop {
            if session.exit_requested() {
                return session.release_output_codec_buffer(&coded);
            }
            let Some(mut target) = self.pop_framework_output()? else {
                continue;
            };
            if let Err(err) = session.copy_output(&coded, &mut target) {
                self.report(err);
                target.reset_payload();
            }
            self.callbacks.fill_buffer_done(target);
            return Ok(());
        }
    }

    fn dst_out_loop(&self) -> OmxResult<()> {
        let session = &self.session;
        if !session.wait_for_start(Stage::DstOut)? {
            return Ok(());
        }

        let copy = self.is_copy_output();
        while !session.exit_requested() {
            match session.dst_out() {
                Ok(DstOutput::Frame(desc)) if copy => self.deliver_copied(desc)?,
                Ok(DstOutput::Frame(desc)) => self.callbacks.fill_buffer_done(desc),
                Ok(DstOutput::Reuse(desc)) => {
                    let mut reused = Some(desc);
                    match session.reuse_output(&mut reused) {
                        Ok(()) => {
                            if let Some(held) = reused {
                                session.output_port().queue().push(held)?;
                            }
                        }
                        Err(err) => {
                            self.report(err);
                            if let Some(desc) = reused {
                                self.give_back_output(desc)?;
                            }
                        }
                    }
                }
                Ok(DstOutput::Failed(err, desc)) => {
                    self.report(err);
                    self.give_back_output(desc)?;
                }
                Ok(DstOutput::NoData) => session.idle_wait(POLL_INTERVAL)?,
                Err(err) => {
                    self.report(err);
                    session.idle_wait(POLL_INTERVAL)?;
                }
            }
        }
        Ok(())
    }
}

/// An OMX IL video encoder component.
///
/// Commands complete synchronously: the `CmdComplete` event is sent before
/// [`Component::send_command`] returns. Failed commands are reported both as an `Error` event and
/// as the returned error.
pub struct Component<D: MfcDevice> {
    device: D,
    state: State,
    /// Negotiated configuration, authoritative while Loaded.
    config: EncoderConfig,
    session: Option<Arc<EncoderSession<D::Backend>>>,
    callbacks: Callbacks,
    workers: Vec<JoinHandle<()>>,
}

impl<D: MfcDevice> Component<D> {
    pub fn new(device: D, codec: Codec, callbacks: Callbacks) -> Self {
        Self {
            device,
            state: State::Loaded,
            config: EncoderConfig::new(codec, DEFAULT_RESOLUTION, ColorFormat::NV12),
            session: None,
            callbacks,
            workers: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn codec(&self) -> Codec {
        self.config.codec
    }

    fn session(&self) -> OmxResult<&Arc<EncoderSession<D::Backend>>> {
        self.session.as_ref().ok_or(OmxError::IncorrectStateOperation)
    }

    pub fn send_command(&mut self, command: Command) -> OmxResult<()> {
        log::debug!("command {command:?} in state {:?}", self.state);
        let result = match command {
            Command::StateSet(state) => self.set_state(state),
            Command::Flush(ports) => self.flush_ports(ports),
            Command::PortDisable(ports) => self.disable_ports(ports),
            Command::PortEnable(ports) => self.enable_ports(ports),
        };
        if let Err(err) = result {
            log::error!("command {command:?} failed: {err}");
            self.callbacks.event(Event::Error(err));
        }
        result
    }

    fn set_state(&mut self, target: State) -> OmxResult<()> {
        match (self.state, target) {
            (current, target) if current == target => return Err(OmxError::SameState),
            (State::Loaded, State::Idle) => self.open_session()?,
            (State::Idle, State::Executing) => self.start_workers()?,
            (State::Executing, State::Idle) => self.stop_session()?,
            (State::Idle, State::Loaded) => self.close_session()?,
            _ => return Err(OmxError::IncorrectStateTransition),
        }
        log::debug!("state {:?} -> {target:?}", self.state);
        self.state = target;
        self.callbacks
            .event(Event::CmdComplete(CommandCompletion::StateSet(target)));
        Ok(())
    }

    fn open_session(&mut self) -> OmxResult<()> {
        let backend = self.device.open(&self.config.open_params()).map_err(|err| {
            log::error!("failed to open codec: {err}");
            OmxError::InsufficientResources
        })?;
        let session = EncoderSession::open(backend, &self.config)?;
        for port in PortIndex::ALL {
            session.port(port).set_populated(true);
        }
        self.session = Some(Arc::new(session));
        Ok(())
    }

    fn close_session(&mut self) -> OmxResult<()> {
        let session = self.session.take().ok_or(OmxError::IncorrectStateOperation)?;
        self.config = session.current_config();
        for port in PortIndex::ALL {
            session.port(port).set_populated(false);
        }
        session.terminate()
    }

    fn start_workers(&mut self) -> OmxResult<()> {
        let session = Arc::clone(self.session()?);
        session.resume()?;
        for stage in [Stage::SrcIn, Stage::SrcOut, Stage::DstIn, Stage::DstOut] {
            let worker = Worker {
                stage,
                session: Arc::clone(&session),
                callbacks: self.callbacks.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("omx-{stage:?}"))
                .spawn(move || worker.run())
                .map_err(|err| {
                    log::error!("failed to spawn {stage:?} worker: {err}");
                    OmxError::InsufficientResources
                });
            match handle {
                Ok(handle) => self.workers.push(handle),
                Err(err) => {
                    self.stop_workers()?;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn stop_workers(&mut self) -> OmxResult<()> {
        if self.workers.is_empty() {
            return Ok(());
        }
        self.session()?.request_exit()?;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
        Ok(())
    }

    /// Leaves Executing: stops the workers and returns every buffer to the framework.
    fn stop_session(&mut self) -> OmxResult<()> {
        self.stop_workers()?;
        let (inputs, outputs) = self.session()?.stop()?;
        self.callbacks.return_buffers(PortIndex::Input, inputs);
        self.callbacks.return_buffers(PortIndex::Output, outputs);
        Ok(())
    }

    /// Runs `op` on every port of `ports` with the workers paused.
    fn with_workers_paused<F>(&mut self, ports: PortSelector, mut op: F) -> OmxResult<()>
    where
        F: FnMut(&EncoderSession<D::Backend>, &Callbacks, PortIndex) -> OmxResult<()>,
    {
        let executing = self.state == State::Executing;
        if executing {
            self.stop_workers()?;
        }
        let session = Arc::clone(self.session()?);
        for port in ports.ports() {
            op(&session, &self.callbacks, port)?;
        }
        if executing {
            self.start_workers()?;
        }
        Ok(())
    }

    fn flush_ports(&mut self, ports: PortSelector) -> OmxResult<()> {
        self.with_workers_paused(ports, |session, callbacks, port| {
            let returned = session.flush(port)?;
            callbacks.return_buffers(port, returned);
            callbacks.event(Event::CmdComplete(CommandCompletion::Flush(port)));
            Ok(())
        })
    }

    fn disable_ports(&mut self, ports: PortSelector) -> OmxResult<()> {
        if self.session.is_none() {
            self.complete_port_commands(ports, CommandCompletion::PortDisable);
            return Ok(());
        }
        self.with_workers_paused(ports, |session, callbacks, port| {
            let mut returned = session.flush(port)?;
            returned.extend(session.port(port).disable()?);
            callbacks.return_buffers(port, returned);
            callbacks.event(Event::CmdComplete(CommandCompletion::PortDisable(port)));
            Ok(())
        })
    }

    fn enable_ports(&mut self, ports: PortSelector) -> OmxResult<()> {
        if self.session.is_none() {
            self.complete_port_commands(ports, CommandCompletion::PortEnable);
            return Ok(());
        }
        let session = self.session()?;
        for port in ports.ports() {
            session.port(port).enable()?;
            session.port(port).set_populated(true);
            self.callbacks
                .event(Event::CmdComplete(CommandCompletion::PortEnable(port)));
        }
        Ok(())
    }

    /// Port commands in Loaded have no buffers to move and complete right away.
    fn complete_port_commands<F>(&self, ports: PortSelector, completion: F)
    where
        F: Fn(PortIndex) -> CommandCompletion,
    {
        for port in ports.ports() {
            self.callbacks.event(Event::CmdComplete(completion(port)));
        }
    }

    fn queue_buffer(&self, port: PortIndex, desc: BufferDescriptor) -> OmxResult<()> {
        if !matches!(self.state, State::Idle | State::Executing) {
            log::error!("{port:?} buffer queued in state {:?}", self.state);
            return Err(OmxError::IncorrectStateOperation);
        }
        if desc.header.is_none() {
            return Err(OmxError::BadParameter);
        }
        let session = self.session()?;
        let port = session.port(port);
        if !port.is_enabled() {
            return Err(OmxError::IncorrectStateOperation);
        }
        port.queue().push(desc)
    }

    /// Queues a raw frame for encoding.
    pub fn empty_this_buffer(&self, desc: BufferDescriptor) -> OmxResult<()> {
        log::trace!(
            "empty_this_buffer {:?} len={} timestamp={} flags={:?}",
            desc.header,
            desc.data_len,
            desc.timestamp,
            desc.flags
        );
        self.queue_buffer(PortIndex::Input, desc)
    }

    /// Queues a buffer to receive coded data.
    pub fn fill_this_buffer(&self, desc: BufferDescriptor) -> OmxResult<()> {
        log::trace!("fill_this_buffer {:?}", desc.header);
        self.queue_buffer(PortIndex::Output, desc)
    }

    pub fn get_parameter(&self, index: ParamIndex) -> OmxResult<Parameter> {
        match &self.session {
            Some(session) => session.get_parameter(index),
            None => self.config.get_parameter(index),
        }
    }

    /// Parameters can only be changed while Loaded.
    pub fn set_parameter(&mut self, parameter: Parameter) -> OmxResult<()> {
        if self.state != State::Loaded {
            log::error!("cannot set parameter in state {:?}", self.state);
            return Err(OmxError::IncorrectStateOperation);
        }
        self.config.set_parameter(parameter)
    }

    pub fn get_config(&self, index: ConfigIndex) -> OmxResult<Config> {
        match &self.session {
            Some(session) => session.get_config(index),
            None => self.config.get_config(index),
        }
    }

    pub fn set_config(&mut self, config: Config) -> OmxResult<()> {
        match &self.session {
            Some(session) => session.set_config(config),
            None => self.config.set_config(config),
        }
    }

    pub fn get_extension_index(&self, name: &str) -> OmxResult<VendorIndex> {
        VendorIndex::from_extension_name(name)
    }

    pub fn component_role_enum(&self, index: usize) -> OmxResult<&'static str> {
        component_role_enum(self.config.codec, index)
    }
}

impl<D: MfcDevice> Drop for Component<D> {
    fn drop(&mut self) {
        if let Err(err) = self.stop_workers() {
            log::error!("failed to stop workers: {err}");
        }
        if let Some(session) = self.session.take() {
            if let Err(err) = session.terminate() {
                log::error!("failed to terminate session: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::mpsc::Receiver;

    use super::*;
    use crate::backend::dummy::DummyDevice;
    use crate::encoder::tests::output_buffer;

    #[derive(Debug)]
    enum Delivery {
        Event(Event),
        EmptyBufferDone(BufferDescriptor),
        FillBufferDone(BufferDescriptor),
    }

    fn recording_callbacks() -> (Callbacks, Receiver<Delivery>) {
        let (sender, receiver) = mpsc::channel();
        let events = sender.clone();
        let empty_done = sender.clone();
        let callbacks = Callbacks {
            event: Arc::new(Mutex::new(move |event: Event| {
                let _ = events.send(Delivery::Event(event));
            })),
            empty_buffer_done: Arc::new(Mutex::new(move |desc: BufferDescriptor| {
                let _ = empty_done.send(Delivery::EmptyBufferDone(desc));
            })),
            fill_buffer_done: Arc::new(Mutex::new(move |desc: BufferDescriptor| {
                let _ = sender.send(Delivery::FillBufferDone(desc));
            })),
        };
        (callbacks, receiver)
    }

    fn drain(receiver: &Receiver<Delivery>) -> Vec<Delivery> {
        receiver.try_iter().collect()
    }

    fn completed(deliveries: &[Delivery]) -> Vec<CommandCompletion> {
        deliveries
            .iter()
            .filter_map(|delivery| match delivery {
                Delivery::Event(Event::CmdComplete(completion)) => Some(*completion),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn state_transitions_follow_the_il_graph() {
        let (callbacks, receiver) = recording_callbacks();
        let mut component = Component::new(DummyDevice::new(), Codec::Avc, callbacks);

        assert_eq!(
            component.send_command(Command::StateSet(State::Executing)),
            Err(OmxError::IncorrectStateTransition)
        );
        assert_eq!(
            component.send_command(Command::StateSet(State::Loaded)),
            Err(OmxError::SameState)
        );
        let errors: Vec<_> = drain(&receiver)
            .into_iter()
            .filter_map(|delivery| match delivery {
                Delivery::Event(Event::Error(err)) => Some(err),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![OmxError::IncorrectStateTransition, OmxError::SameState]);

        component.send_command(Command::StateSet(State::Idle)).unwrap();
        component.send_command(Command::StateSet(State::Executing)).unwrap();
        component.send_command(Command::StateSet(State::Idle)).unwrap();
        component.send_command(Command::StateSet(State::Loaded)).unwrap();
        assert_eq!(component.state(), State::Loaded);
        assert_eq!(
            completed(&drain(&receiver)),
            vec![
                CommandCompletion::StateSet(State::Idle),
                CommandCompletion::StateSet(State::Executing),
                CommandCompletion::StateSet(State::Idle),
                CommandCompletion::StateSet(State::Loaded),
            ]
        );
    }

    #[test]
    fn failing_device_stays_loaded() {
        let (callbacks, _receiver) = recording_callbacks();
        let mut component = Component::new(DummyDevice::failing(), Codec::Hevc, callbacks);
        assert_eq!(
            component.send_command(Command::StateSet(State::Idle)),
            Err(OmxError::InsufficientResources)
        );
        assert_eq!(component.state(), State::Loaded);
    }

    #[test]
    fn parameters_are_frozen_after_loaded() {
        let (callbacks, _receiver) = recording_callbacks();
        let device = DummyDevice::new();
        let opened = device.opened();
        let mut component = Component::new(device, Codec::Avc, callbacks);
        component.set_parameter(Parameter::VideoBitrate(1_000_000)).unwrap();

        component.send_command(Command::StateSet(State::Idle)).unwrap();
        assert_eq!(
            component.set_parameter(Parameter::VideoBitrate(2_000_000)),
            Err(OmxError::IncorrectStateOperation)
        );
        assert_eq!(
            component.get_parameter(ParamIndex::VideoBitrate),
            Ok(Parameter::VideoBitrate(1_000_000))
        );
        assert_eq!(component.get_parameter(ParamIndex::HeaderData), Err(OmxError::NotReady));

        component.send_command(Command::StateSet(State::Loaded)).unwrap();
        assert!(opened.lock().unwrap().as_ref().unwrap().is_closed());
    }

    #[test]
    fn buffers_are_rejected_while_loaded() {
        let (callbacks, _receiver) = recording_callbacks();
        let component = Component::new(DummyDevice::new(), Codec::Avc, callbacks);
        assert_eq!(
            component.fill_this_buffer(output_buffer(1)),
            Err(OmxError::IncorrectStateOperation)
        );
    }

    #[test]
    fn flush_returns_queued_buffers() {
        let (callbacks, receiver) = recording_callbacks();
        let mut component = Component::new(DummyDevice::new(), Codec::Avc, callbacks);
        component.send_command(Command::StateSet(State::Idle)).unwrap();
        component.send_command(Command::StateSet(State::Executing)).unwrap();
        drain(&receiver);

        // Without input DstIn never starts, so both buffers stay queued.
        component.fill_this_buffer(output_buffer(1)).unwrap();
        component.fill_this_buffer(output_buffer(2)).unwrap();
        component.send_command(Command::Flush(PortSelector::All)).unwrap();

        let deliveries = drain(&receiver);
        let returned: Vec<_> = deliveries
            .iter()
            .filter_map(|delivery| match delivery {
                Delivery::FillBufferDone(desc) => desc.header,
                _ => None,
            })
            .collect();
        let expected: Vec<_> = [1, 2]
            .into_iter()
            .filter_map(|id| output_buffer(id).header)
            .collect();
        assert_eq!(returned, expected);
        assert_eq!(
            completed(&deliveries),
            vec![
                CommandCompletion::Flush(PortIndex::Input),
                CommandCompletion::Flush(PortIndex::Output),
            ]
        );
        assert_eq!(component.state(), State::Executing);
    }

    #[test]
    fn disabled_port_refuses_buffers_until_enabled() {
        let (callbacks, receiver) = recording_callbacks();
        let mut component = Component::new(DummyDevice::new(), Codec::Vp8, callbacks);
        component.send_command(Command::StateSet(State::Idle)).unwrap();
        component.fill_this_buffer(output_buffer(1)).unwrap();

        let output = PortSelector::One(PortIndex::Output);
        component.send_command(Command::PortDisable(output)).unwrap();
        assert_eq!(
            component.fill_this_buffer(output_buffer(2)),
            Err(OmxError::IncorrectStateOperation)
        );
        component.send_command(Command::PortEnable(output)).unwrap();
        component.fill_this_buffer(output_buffer(2)).unwrap();

        let deliveries = drain(&receiver);
        assert!(deliveries.iter().any(|delivery| matches!(
            delivery,
            Delivery::FillBufferDone(desc) if desc.header == output_buffer(1).header
        )));
        assert_eq!(
            completed(&deliveries),
            vec![
                CommandCompletion::StateSet(State::Idle),
                CommandCompletion::PortDisable(PortIndex::Output),
                CommandCompletion::PortEnable(PortIndex::Output),
            ]
        );
    }

    #[test]
    fn extension_names_and_roles() {
        let (callbacks, _receiver) = recording_callbacks();
        let component = Component::new(DummyDevice::new(), Codec::Vp9, callbacks);
        assert_eq!(
            component.get_extension_index("OMX.SEC.index.ExpectedEOS"),
            Ok(VendorIndex::ExpectedEos)
        );
        assert_eq!(
            component.get_extension_index("OMX.SEC.index.Unknown"),
            Err(OmxError::UnsupportedIndex)
        );
        assert_eq!(component.component_role_enum(0), Ok("video_encoder.vp9"));
        assert_eq!(component.component_role_enum(1), Err(OmxError::NoMore));
    }
}
