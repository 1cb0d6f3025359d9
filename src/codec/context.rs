// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

use bytes::Bytes;

use crate::backend::CommandCode;
use crate::backend::CommandHeader;
use crate::buffer::same_buffer;
use crate::buffer::BufferHandle;
use crate::codec::CodecStrategy;

/// Decode indices of the frames a frame refers to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceFrameList {
    pub entries: Vec<u32>,
}

impl ReferenceFrameList {
    pub fn new(entries: Vec<u32>) -> Self {
        Self { entries }
    }
}

/// Frame-level metadata produced by the stream parser.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedFrameParameters {
    /// Monotonic index assigned by the parser to each decodable unit.
    pub decode_frame_index: u32,
    pub new_stream_parameters: bool,
    pub new_frame_parameters: bool,
    /// The decoded frame will be used as reference by later frames.
    pub reference_frame: bool,
    /// The frame is one field of an interlaced picture.
    pub field_decode: bool,
    /// Offset of the coded payload within the data of the unit.
    pub data_offset: usize,
    pub reference_frame_lists: Vec<ReferenceFrameList>,
}

/// A unit handed to the codec by the parser.
///
/// The caller keeps its own count on `buffer`, the codec takes additional counts as needed.
pub struct CodedUnit<P> {
    pub buffer: BufferHandle,
    pub data: Bytes,
    pub frame_parameters: ParsedFrameParameters,
    pub parsed_parameters: P,
}

/// Carrier of a stream parameters command.
pub struct StreamParameterContext<S: CodecStrategy> {
    pub header: CommandHeader,
    pub parameters: S::StreamParameters,
}

impl<S: CodecStrategy> Default for StreamParameterContext<S> {
    fn default() -> Self {
        Self {
            header: CommandHeader::new(CommandCode::SetGlobalTransformParams),
            parameters: Default::default(),
        }
    }
}

impl<S: CodecStrategy> fmt::Debug for StreamParameterContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamParameterContext")
            .field("header", &self.header)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Carrier of a transform command, tracking the buffers the command holds counts on.
pub struct DecodeContext<S: CodecStrategy> {
    pub header: CommandHeader,
    /// Decode buffer the command writes into.
    pub buffer_index: Option<usize>,
    /// Reference frame lists, translated to decode buffer indices.
    pub reference_frame_lists: Vec<Vec<usize>>,
    /// Whether the decode buffer counts this command among its decodes in progress.
    pub decode_in_progress: bool,
    /// Time at which the command was sent, in microseconds.
    pub decode_commence_time: u64,
    pub parameters: S::DecodeParameters,
    coded_buffers: Vec<BufferHandle>,
}

impl<S: CodecStrategy> DecodeContext<S> {
    /// Keeps `buffer` alive until the command completes.
    pub fn attach_coded_buffer(&mut self, buffer: BufferHandle) {
        if self.coded_buffers.iter().any(|b| same_buffer(b, &buffer)) {
            return;
        }
        buffer.increment_reference_count();
        self.coded_buffers.push(buffer);
    }

    pub fn coded_buffers(&self) -> &[BufferHandle] {
        &self.coded_buffers
    }

    /// Drops the counts held on coded buffers, shrinking them first if `shrink` is set.
    pub(crate) fn detach_coded_buffers(&mut self, codec_name: &str, shrink: bool) {
        for buffer in self.coded_buffers.drain(..) {
            if shrink {
                buffer.set_used_data_size(0);
                if let Err(e) = buffer.shrink(0) {
                    log::info!(
                        "{}: failed to shrink coded buffer {}: {}",
                        codec_name,
                        buffer.index(),
                        e
                    );
                }
            }
            buffer.decrement_reference_count();
        }
    }
}

impl<S: CodecStrategy> Default for DecodeContext<S> {
    fn default() -> Self {
        Self {
            header: CommandHeader::new(CommandCode::Transform),
            buffer_index: None,
            reference_frame_lists: Vec::new(),
            decode_in_progress: false,
            decode_commence_time: 0,
            parameters: Default::default(),
            coded_buffers: Vec::new(),
        }
    }
}

impl<S: CodecStrategy> fmt::Debug for DecodeContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeContext")
            .field("header", &self.header)
            .field("buffer_index", &self.buffer_index)
            .field("reference_frame_lists", &self.reference_frame_lists)
            .field("decode_in_progress", &self.decode_in_progress)
            .field("parameters", &self.parameters)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyStrategy;
    use crate::buffer::pool::BufferPool;

    #[test]
    fn test_detach_coded_buffers() {
        let _ = env_logger::try_init();

        let pool = BufferPool::new(2, 256);
        let coded = pool.get_buffer(&Default::default()).unwrap();
        coded.set_used_data_size(100);

        let mut context = DecodeContext::<DummyStrategy>::default();
        context.attach_coded_buffer(coded.clone());
        context.attach_coded_buffer(coded.clone());
        assert_eq!(context.coded_buffers().len(), 1);
        assert_eq!(coded.owner_count(), 2);

        context.detach_coded_buffers("test", true);
        assert!(context.coded_buffers().is_empty());
        assert_eq!(coded.owner_count(), 1);
        assert_eq!(coded.used_data_size(), 0);
        assert_eq!(coded.data_len(), 0);

        coded.decrement_reference_count();
        assert_eq!(pool.num_free_buffers(), 2);
    }
}
