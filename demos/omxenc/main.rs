// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use omx_mfc::backend::dummy::DummyDevice;
use omx_mfc::buffer::BufferDescriptor;
use omx_mfc::buffer::BufferHeaderId;
use omx_mfc::component::Callbacks;
use omx_mfc::component::Component;
use omx_mfc::encoder::params::GopSettings;
use omx_mfc::encoder::params::ParamIndex;
use omx_mfc::encoder::params::Parameter;
use omx_mfc::omx::BufferFlags;
use omx_mfc::omx::Command;
use omx_mfc::omx::Event;
use omx_mfc::omx::PortIndex;
use omx_mfc::omx::State;
use omx_mfc::port::PortDefinition;
use omx_mfc::Resolution;

mod util;
use util::synthetic_frame;
use util::Args;

const INPUT_HANDLE_BASE: u64 = 0x1000_0000;
const OUTPUT_HANDLE_BASE: u64 = 0x2000_0000;
const OUTPUT_ID_BASE: u64 = 1000;

enum Delivery {
    Event(Event),
    EmptyBufferDone(BufferDescriptor),
    FillBufferDone(BufferDescriptor),
}

fn port_definition(component: &Component<DummyDevice>, port: PortIndex) -> PortDefinition {
    match component.get_parameter(ParamIndex::PortDefinition(port)) {
        Ok(Parameter::PortDefinition(definition)) => definition,
        other => panic!("failed to query {port:?} port definition: {other:?}"),
    }
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let device = DummyDevice::new();
    let opened = device.opened();

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

    let mut component = Component::new(device, args.codec, callbacks);

    let mut input = port_definition(&component, PortIndex::Input);
    input.set_resolution(Resolution::from((args.width, args.height)));
    input.framerate = args.framerate << 16;
    component
        .set_parameter(Parameter::PortDefinition(input))
        .expect("unsupported input format");
    component
        .set_parameter(Parameter::VideoBitrate(args.bitrate))
        .expect("unsupported bitrate");
    component
        .set_parameter(Parameter::Gop(GopSettings {
            b_frames: args.b_frames,
            idr_period: args.idr_period,
        }))
        .expect("unsupported GOP settings");

    let input = port_definition(&component, PortIndex::Input);
    let output = port_definition(&component, PortIndex::Output);

    component
        .send_command(Command::StateSet(State::Idle))
        .expect("failed to open the codec");
    component
        .send_command(Command::StateSet(State::Executing))
        .expect("failed to start encoding");
    let mfc = opened
        .lock()
        .unwrap()
        .clone()
        .expect("codec was not opened");

    for index in 0..output.buffer_count_actual as u64 {
        let handle = OUTPUT_HANDLE_BASE + index * u64::from(output.buffer_size);
        let desc = BufferDescriptor::from_header(
            BufferHeaderId(OUTPUT_ID_BASE + index),
            handle,
            output.buffer_size,
        );
        component.fill_this_buffer(desc).expect("failed to queue output buffer");
    }
    let mut free_inputs: VecDeque<BufferDescriptor> = (0..input.buffer_count_actual as u64)
        .map(|index| {
            let handle = INPUT_HANDLE_BASE + index * u64::from(input.buffer_size);
            BufferDescriptor::from_header(BufferHeaderId(index), handle, input.buffer_size)
        })
        .collect();

    let frame_duration = 1_000_000 / i64::from(args.framerate.max(1));
    let mut next_frame = 0;
    let mut eos_sent = false;
    let mut stream = Vec::new();
    let mut num_coded = 0;

    loop {
        while !eos_sent {
            let Some(desc) = free_inputs.pop_front() else {
                break;
            };
            let timestamp = next_frame as i64 * frame_duration;
            let desc = if next_frame < args.count {
                let last = next_frame + 1 == args.count;
                let flags = if last { BufferFlags::EOS } else { BufferFlags::empty() };
                let data = synthetic_frame(next_frame, args.width, input.buffer_size as usize);
                mfc.write_memory(desc.planes[0].handle, &data);
                eos_sent = last;
                desc.with_payload(input.buffer_size, timestamp, flags)
            } else {
                eos_sent = true;
                desc.with_payload(0, timestamp, BufferFlags::EOS)
            };
            component.empty_this_buffer(desc).expect("failed to queue input frame");
            next_frame += 1;
        }

        let delivery = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("encoder stalled");
        match delivery {
            Delivery::EmptyBufferDone(desc) => free_inputs.push_back(desc),
            Delivery::FillBufferDone(mut desc) => {
                let len = desc.remain_len as usize;
                if len > 0 {
                    let data = mfc.read_memory(desc.planes[0].handle).unwrap_or_default();
                    stream.extend_from_slice(&data[..len.min(data.len())]);
                    num_coded += 1;
                }
                log::debug!(
                    "output timestamp={} len={len} flags={:?}",
                    desc.timestamp,
                    desc.flags
                );
                if desc.flags.contains(BufferFlags::EOS) {
                    break;
                }
                desc.reset_payload();
                component.fill_this_buffer(desc).expect("failed to requeue output buffer");
            }
            Delivery::Event(Event::Error(err)) => panic!("encoder error: {err}"),
            Delivery::Event(event) => log::debug!("event {event:?}"),
        }
    }

    component
        .send_command(Command::StateSet(State::Idle))
        .expect("failed to stop encoding");
    component
        .send_command(Command::StateSet(State::Loaded))
        .expect("failed to release the codec");

    if let Some(path) = &args.output {
        let mut file = File::create(path).expect("error creating output file");
        file.write_all(&stream).expect("error writing output file");
    }
    println!(
        "{num_coded} buffers, {} bytes, md5 {:x}",
        stream.len(),
        md5::compute(&stream)
    );
}
