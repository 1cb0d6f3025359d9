// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Drives a codec against the worker transformer, with completions delivered from the worker
//! thread.

use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use bytes::Bytes;

use codec_base::backend::worker::CommandProcessor;
use codec_base::backend::worker::ProcessOutcome;
use codec_base::backend::worker::WorkerTransformer;
use codec_base::backend::Command;
use codec_base::backend::TransformerCapability;
use codec_base::buffer::pool::BufferPool;
use codec_base::buffer::BufferError;
use codec_base::buffer::BufferFormat;
use codec_base::buffer::BufferHandle;
use codec_base::buffer::BufferStructure;
use codec_base::buffer::Manifestor;
use codec_base::buffer::RingBuffer;
use codec_base::codec::Admission;
use codec_base::codec::CodecBase;
use codec_base::codec::CodecStrategy;
use codec_base::codec::CodedUnit;
use codec_base::codec::DecodeContext;
use codec_base::codec::ParsedFrameParameters;
use codec_base::codec::StreamParameterContext;
use codec_base::config::CodecConfiguration;
use codec_base::ComponentState;

const FRAME_SIZE: usize = 4096;

struct PcmStrategy;

impl CodecStrategy for PcmStrategy {
    /// Sample rate.
    type StreamParameters = u32;
    /// Decode index of the frame.
    type DecodeParameters = u32;
    type ParsedParameters = u32;

    fn fill_out_decode_buffer_request(
        &self,
        _frame_parameters: &ParsedFrameParameters,
        _parsed_parameters: &u32,
        request: &mut BufferStructure,
    ) -> anyhow::Result<()> {
        request.format = BufferFormat::Audio;
        request.size = FRAME_SIZE;
        Ok(())
    }

    fn fill_out_set_stream_parameters_command(
        &self,
        context: &mut StreamParameterContext<Self>,
        sample_rate: &u32,
    ) -> anyhow::Result<()> {
        context.parameters = *sample_rate;
        Ok(())
    }

    fn fill_out_decode_command(
        &self,
        context: &mut DecodeContext<Self>,
        frame_parameters: &ParsedFrameParameters,
        _parsed_parameters: &u32,
    ) -> anyhow::Result<()> {
        context.parameters = frame_parameters.decode_frame_index;
        Ok(())
    }

    fn check_codec_return_parameters(&self, context: &DecodeContext<Self>) -> anyhow::Result<()> {
        if context.header.error != 0 {
            bail!("frame {} failed", context.parameters);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Recording {
    sample_rates: Vec<u32>,
    frames: Vec<u32>,
}

struct RecordingProcessor(Arc<Mutex<Recording>>);

impl CommandProcessor<PcmStrategy> for RecordingProcessor {
    fn process(&mut self, command: &mut Command<PcmStrategy>) -> ProcessOutcome {
        let mut recording = self.0.lock().unwrap();
        match command {
            Command::StreamParameters(context) => recording.sample_rates.push(context.parameters),
            Command::Transform(context) => recording.frames.push(context.parameters),
            Command::SendBuffers(_) => (),
        }
        ProcessOutcome::Completed
    }
}

struct PoolManifestor(BufferPool);

impl Manifestor for PoolManifestor {
    fn get_decode_buffer(&self, structure: &BufferStructure) -> Result<BufferHandle, BufferError> {
        self.0.get_buffer(structure)
    }

    fn decode_buffer_count(&self) -> usize {
        self.0.num_buffers()
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "timed out waiting for completions"
        );
        thread::sleep(Duration::from_millis(1));
    }
}

fn unit(coded_pool: &BufferPool, decode_index: u32, new_stream_parameters: bool) -> CodedUnit<u32> {
    CodedUnit {
        buffer: coded_pool.get_buffer(&Default::default()).unwrap(),
        data: Bytes::from_static(&[0x55; 32]),
        frame_parameters: ParsedFrameParameters {
            decode_frame_index: decode_index,
            new_stream_parameters,
            new_frame_parameters: true,
            ..Default::default()
        },
        parsed_parameters: 48_000,
    }
}

#[test]
fn test_decode_through_worker_thread() {
    let _ = env_logger::try_init();

    let recording = Arc::new(Mutex::new(Recording::default()));
    let worker = WorkerTransformer::new(
        vec![TransformerCapability {
            name: "pcm".into(),
            api_version: 1,
            ..Default::default()
        }],
        RecordingProcessor(recording.clone()),
    )
    .unwrap();

    let manifestor = Arc::new(PoolManifestor(BufferPool::new(4, FRAME_SIZE)));
    let config = CodecConfiguration {
        codec_name: "pcm".into(),
        transformer_names: vec!["pcm".into()],
        ..Default::default()
    };
    let mut codec = CodecBase::new(config, PcmStrategy, manifestor.clone(), Box::new(worker));

    let ring = Arc::new(RingBuffer::new());
    codec.register_output_ring(ring.clone()).unwrap();
    assert_eq!(codec.state(), ComponentState::Running);

    let coded_pool = BufferPool::new(8, 256);
    for i in 0..6 {
        let unit = unit(&coded_pool, i, i == 0);
        let coded = unit.buffer.clone();
        codec.decode(unit).unwrap();
        // The parser is done with the coded buffer, the codec keeps it alive.
        coded.decrement_reference_count();

        wait_until(|| codec.command_counts().outstanding() == 0);
        let decoded = ring.extract().unwrap();
        assert_eq!(decoded.frame_parameters().unwrap().decode_frame_index, i);
        codec.release_decode_buffer(decoded).unwrap();
    }

    let counts = codec.command_counts();
    assert_eq!(counts.prepared, 7);
    assert_eq!(counts.completed, 7);
    assert_eq!(manifestor.0.num_free_buffers(), 4);
    assert_eq!(coded_pool.num_free_buffers(), 8);

    let marker = CodedUnit {
        buffer: coded_pool.get_buffer(&Default::default()).unwrap(),
        data: Bytes::new(),
        frame_parameters: Default::default(),
        parsed_parameters: 0,
    };
    assert_eq!(codec.decode(marker).unwrap(), Admission::MarkerFrame);
    let marker = ring.extract().unwrap();
    assert_eq!(marker.structure().format, BufferFormat::MarkerFrame);
    codec.release_decode_buffer(marker).unwrap();

    codec.halt().unwrap();
    assert_eq!(codec.state(), ComponentState::Halted);

    let recording = recording.lock().unwrap();
    assert_eq!(recording.sample_rates, vec![48_000]);
    assert_eq!(recording.frames, (0..6u32).collect::<Vec<_>>());
}
