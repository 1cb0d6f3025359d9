// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The buffer and command lifecycle manager.
//!
//! [`CodecBase`] admits coded units from the parser, obtains decode buffers from the
//! [`Manifestor`], and submits two kinds of commands to a [`Transformer`]: stream parameter
//! updates and per-frame transforms. Completions arrive on the engine's own execution context,
//! where buffers are released to the output ring and reference frame counts dropped. The
//! achievable decode rate is measured there as well.
//!
//! Decode buffers are tracked in a fixed table indexed by their pool index, and the parser's
//! decode indices are translated to those buffer indices through a bounded map. A decode buffer
//! may be held at the same time by the codec, by in-flight commands, by later frames using it as
//! reference and by the presentation pipeline; it is only forgotten when the codec drops the last
//! count.
//!
//! Codec-specific behavior is provided by a [`CodecStrategy`].

mod buffer_state;
mod context;
mod index_map;
pub mod rate;
mod shared;

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;

pub use buffer_state::BufferStateSnapshot;
pub use context::CodedUnit;
pub use context::DecodeContext;
pub use context::ParsedFrameParameters;
pub use context::ReferenceFrameList;
pub use context::StreamParameterContext;
pub use index_map::IndexBufferMap;
pub use shared::CommandCounts;

use crate::backend::Command;
use crate::backend::CommandCode;
use crate::backend::CommandHeader;
use crate::backend::SendError;
use crate::backend::Transformer;
use crate::backend::TransformerCapability;
use crate::backend::TransformerError;
use crate::backend::TransformerInitParams;
use crate::buffer::pool::ContextPool;
use crate::buffer::pool::PoolError;
use crate::buffer::pool::Pooled;
use crate::buffer::BufferError;
use crate::buffer::BufferFormat;
use crate::buffer::BufferHandle;
use crate::buffer::BufferStructure;
use crate::buffer::Manifestor;
use crate::buffer::OutputRing;
use crate::config::CodecConfiguration;
use crate::config::CodecParameterBlock;
use crate::config::ParameterBlockError;
use crate::config::RuntimeParameters;
use crate::config::TrickModeParameters;
use crate::config::CODEC_MAX_DECODE_BUFFERS;
use crate::config::CODEC_MAX_TRANSFORMERS;
use crate::config::PARTITION_NAME_SIZE;
use crate::ComponentState;
use shared::Shared;

/// Interval between two checks for outstanding commands while halting.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown frame with decode index {0}")]
    UnknownFrame(u32),
    #[error("decode index translation table is full")]
    IndexMapFull,
    #[error("decode index {index} does not follow the current decode index {current}")]
    NonMonotonicDecodeIndex { index: u32, current: u32 },
    #[error("decode buffer index {0} is out of range")]
    BufferIndexOutOfRange(usize),
    #[error("no decode buffer is tracked at index {0}")]
    NoDecodeBuffer(usize),
    #[error("the manifestor has no decode buffers, decoding without output is not supported")]
    NoOutputBuffers,
    #[error("the manifestor advertises {0} decode buffers, more than supported")]
    TooManyDecodeBuffers(usize),
    #[error("data offset {offset} is beyond the {len} bytes of the coded unit")]
    InvalidDataOffset { offset: usize, len: usize },
    #[error("invalid transformer index {0}")]
    InvalidTransformer(usize),
    #[error("none of the configured transformers is capable")]
    NoCapableTransformer,
    #[error("operation not permitted in state {0:?}")]
    InvalidState(ComponentState),
    #[error("no coded unit is being processed")]
    NoCodedUnit,
    #[error("no decode context is held")]
    NoDecodeContext,
    #[error("no stream parameter context is held")]
    NoStreamParameterContext,
    #[error("no decode buffer is current")]
    NoCurrentDecodeBuffer,
    #[error("invalid parameter block: {0}")]
    ParameterBlock(#[from] ParameterBlockError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Transformer(#[from] TransformerError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CodecError {
    /// Errors revealing a capacity or configuration defect, after which the codec cannot
    /// continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CodecError::IndexMapFull | CodecError::BufferIndexOutOfRange(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Codec-specific behavior plugged into a [`CodecBase`].
///
/// All hooks are called from the submitting context except [`validate_decode_context`],
/// [`check_codec_return_parameters`] and [`boost_callback_priority`], which run in the completion
/// context of the transform engine.
///
/// [`validate_decode_context`]: CodecStrategy::validate_decode_context
/// [`check_codec_return_parameters`]: CodecStrategy::check_codec_return_parameters
/// [`boost_callback_priority`]: CodecStrategy::boost_callback_priority
pub trait CodecStrategy: Send + Sync + Sized + 'static {
    /// Payload of stream parameter commands.
    type StreamParameters: Default + Send + fmt::Debug + 'static;
    /// Payload of transform commands.
    type DecodeParameters: Default + Send + fmt::Debug + 'static;
    /// Stream-specific metadata produced by the parser. A copy is kept with each decode buffer.
    type ParsedParameters: Clone + Send + fmt::Debug + 'static;

    /// Checks that a transformer can perform the transforms of this codec.
    fn handle_capabilities(&self, _capability: &TransformerCapability) -> anyhow::Result<()> {
        Ok(())
    }

    fn fill_out_transformer_initialization_parameters(
        &self,
        _params: &mut TransformerInitParams,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Describes the decode buffer needed for the frame.
    fn fill_out_decode_buffer_request(
        &self,
        frame_parameters: &ParsedFrameParameters,
        parsed_parameters: &Self::ParsedParameters,
        request: &mut BufferStructure,
    ) -> anyhow::Result<()>;

    fn fill_out_set_stream_parameters_command(
        &self,
        context: &mut StreamParameterContext<Self>,
        parsed_parameters: &Self::ParsedParameters,
    ) -> anyhow::Result<()>;

    fn fill_out_decode_command(
        &self,
        context: &mut DecodeContext<Self>,
        frame_parameters: &ParsedFrameParameters,
        parsed_parameters: &Self::ParsedParameters,
    ) -> anyhow::Result<()>;

    fn validate_decode_context(&self, _context: &DecodeContext<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    fn check_codec_return_parameters(&self, _context: &DecodeContext<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once, on the first stream parameters completion, to raise the priority of the
    /// thread delivering completions.
    fn boost_callback_priority(&self) {}
}

/// How a coded unit was admitted by [`CodecBase::input`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// A unit without payload, relayed to the output ring once all previous commands finished.
    MarkerFrame,
    Coded {
        new_stream_parameters: bool,
        new_frame: bool,
    },
}

impl Admission {
    /// A further slice (or field) of the frame being decoded.
    pub fn is_continuation_slice(&self) -> bool {
        matches!(
            self,
            Admission::Coded {
                new_stream_parameters: false,
                new_frame: false
            }
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReleaseTarget {
    All,
    /// The reference held on the frame with this decode index.
    Index(u32),
}

struct CurrentUnit<P> {
    coded_buffer: BufferHandle,
    data: Bytes,
    frame_parameters: Arc<ParsedFrameParameters>,
    parsed_parameters: P,
}

pub struct CodecBase<S: CodecStrategy> {
    config: CodecConfiguration,
    runtime: RuntimeParameters,
    state: ComponentState,
    strategy: Arc<S>,
    manifestor: Arc<dyn Manifestor>,
    transformer: Box<dyn Transformer<S>>,
    transformer_initialized: bool,
    shared: Option<Arc<Shared<S>>>,
    stream_parameter_context_pool: Option<ContextPool<StreamParameterContext<S>>>,
    decode_context_pool: Option<ContextPool<DecodeContext<S>>>,
    stream_parameter_context: Option<Pooled<StreamParameterContext<S>>>,
    decode_context: Option<Pooled<DecodeContext<S>>>,
    current_unit: Option<CurrentUnit<S::ParsedParameters>>,
    current_decode_index: Option<u32>,
}

impl<S: CodecStrategy> CodecBase<S> {
    pub fn new(
        config: CodecConfiguration,
        strategy: S,
        manifestor: Arc<dyn Manifestor>,
        transformer: Box<dyn Transformer<S>>,
    ) -> Self {
        if config.transformer_names.len() > CODEC_MAX_TRANSFORMERS {
            log::warn!(
                "{}: only the first {} transformers can be selected",
                config.codec_name,
                CODEC_MAX_TRANSFORMERS
            );
        }

        Self {
            config,
            runtime: Default::default(),
            state: ComponentState::Idle,
            strategy: Arc::new(strategy),
            manifestor,
            transformer,
            transformer_initialized: false,
            shared: None,
            stream_parameter_context_pool: None,
            decode_context_pool: None,
            stream_parameter_context: None,
            decode_context: None,
            current_unit: None,
            current_decode_index: None,
        }
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    pub fn configuration(&self) -> &CodecConfiguration {
        &self.config
    }

    pub fn runtime_parameters(&self) -> &RuntimeParameters {
        &self.runtime
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn command_counts(&self) -> CommandCounts {
        self.shared
            .as_ref()
            .map(|shared| shared.counters.snapshot())
            .unwrap_or_default()
    }

    fn shared(&self) -> Result<Arc<Shared<S>>> {
        self.shared
            .clone()
            .ok_or(CodecError::InvalidState(self.state))
    }

    /// Moves to the error state if `error` is fatal.
    fn check_fatal(&mut self, error: CodecError) -> CodecError {
        if error.is_fatal() {
            log::error!("{}: fatal error: {}", self.config.codec_name, error);
            self.state = ComponentState::InError;
        }
        error
    }

    /// Freezes the configuration, creates the context pools and instantiates the selected
    /// transformer. Completed buffers will be inserted into `ring`.
    pub fn register_output_ring(&mut self, ring: Arc<dyn OutputRing>) -> Result<()> {
        if self.state != ComponentState::Idle {
            return Err(CodecError::InvalidState(self.state));
        }

        match self.initialize(ring) {
            Ok(()) => {
                self.state = ComponentState::Running;
                Ok(())
            }
            Err(e) => {
                log::error!("{}: registration failed: {}", self.config.codec_name, e);
                self.state = ComponentState::InError;
                Err(e)
            }
        }
    }

    fn initialize(&mut self, ring: Arc<dyn OutputRing>) -> Result<()> {
        let decode_buffer_count = self.manifestor.decode_buffer_count();
        if decode_buffer_count == 0 {
            return Err(CodecError::NoOutputBuffers);
        }
        if decode_buffer_count > CODEC_MAX_DECODE_BUFFERS {
            return Err(CodecError::TooManyDecodeBuffers(decode_buffer_count));
        }

        let selected = self.runtime.selected_transformer;
        self.verify_capabilities(selected)?;
        let name = self
            .config
            .transformer_names
            .get(selected)
            .cloned()
            .ok_or(CodecError::InvalidTransformer(selected))?;

        let shared = Arc::new(Shared::new(
            self.config.clone(),
            Arc::clone(&self.strategy),
            Arc::clone(&self.manifestor),
            ring,
            decode_buffer_count * self.config.max_decode_indices_per_buffer,
        ));

        let mut params = TransformerInitParams::default();
        self.strategy
            .fill_out_transformer_initialization_parameters(&mut params)?;
        self.transformer
            .init(&name, params, shared.completion_callback())?;
        self.transformer_initialized = true;

        self.stream_parameter_context_pool =
            Some(ContextPool::new(self.config.stream_parameter_context_count));
        self.decode_context_pool = Some(ContextPool::new(self.config.decode_context_count));
        self.shared = Some(shared);
        self.current_decode_index = None;

        log::debug!(
            "{}: running with transformer {} and {} decode buffers",
            self.config.codec_name,
            name,
            decode_buffer_count
        );

        Ok(())
    }

    /// Checks that the transformer at index `transformer` of the configuration is capable.
    pub fn verify_capabilities(&self, transformer: usize) -> Result<()> {
        let name = self
            .config
            .transformer_names
            .get(transformer)
            .ok_or(CodecError::InvalidTransformer(transformer))?;

        let capability = self.transformer.capability(name)?;
        self.strategy.handle_capabilities(&capability)?;

        Ok(())
    }

    /// Checks that at least one of the configured transformers is capable.
    pub fn globally_verify_capabilities(&self) -> Result<()> {
        let names = &self.config.transformer_names;
        for (i, name) in names.iter().enumerate().take(CODEC_MAX_TRANSFORMERS) {
            if names[..i].contains(name) {
                break;
            }

            match self.verify_capabilities(i) {
                Ok(()) => return Ok(()),
                Err(e) => log::debug!("{}: transformer {}: {}", self.config.codec_name, name, e),
            }
        }

        Err(CodecError::NoCapableTransformer)
    }

    /// Admits one coded unit.
    ///
    /// The caller keeps its own count on the unit's buffer. Units without payload and without new
    /// stream or frame parameters are marker frames. Otherwise the decode index must be after the
    /// one of the previous unit, or equal to it if slice decoding is permitted, and the contexts
    /// needed for new stream parameters and new frames are acquired.
    pub fn input(&mut self, unit: CodedUnit<S::ParsedParameters>) -> Result<Admission> {
        if self.state != ComponentState::Running {
            return Err(CodecError::InvalidState(self.state));
        }
        let shared = self.shared()?;
        self.current_unit = None;

        let CodedUnit {
            buffer,
            data,
            mut frame_parameters,
            parsed_parameters,
        } = unit;

        let data = if self.config.ignore_find_coded_data_buffer {
            Bytes::new()
        } else {
            data
        };

        if data.is_empty()
            && !frame_parameters.new_stream_parameters
            && !frame_parameters.new_frame_parameters
        {
            self.input_marker_frame(&shared, buffer, frame_parameters)?;
            return Ok(Admission::MarkerFrame);
        }

        let data = if self.config.ignore_find_coded_data_buffer {
            data
        } else {
            let offset = frame_parameters.data_offset;
            if offset > data.len() {
                return Err(CodecError::InvalidDataOffset {
                    offset,
                    len: data.len(),
                });
            }
            data.slice(offset..)
        };

        let decode_index = frame_parameters.decode_frame_index;
        if let Some(current) = self.current_decode_index {
            if decode_index < current
                || (decode_index == current && !self.config.slice_decode_permitted)
            {
                log::error!(
                    "{}: decode index {} received after {}",
                    self.config.codec_name,
                    decode_index,
                    current
                );
                return Err(CodecError::NonMonotonicDecodeIndex {
                    index: decode_index,
                    current,
                });
            }
        }

        if self.runtime.force_stream_parameter_reload {
            self.runtime.force_stream_parameter_reload = false;
            frame_parameters.new_stream_parameters = true;
        }

        if frame_parameters.new_stream_parameters {
            if self.stream_parameter_context.is_some() {
                // The held context is kept and the new parameters are applied through it.
                log::error!(
                    "{}: stream parameter context already held",
                    self.config.codec_name
                );
            } else {
                let pool = self
                    .stream_parameter_context_pool
                    .as_ref()
                    .ok_or(CodecError::InvalidState(self.state))?;
                self.stream_parameter_context = Some(pool.get()?);
            }
        }

        if frame_parameters.new_frame_parameters {
            if self.decode_context.is_some() {
                log::error!("{}: decode context already held", self.config.codec_name);
            } else {
                let pool = self
                    .decode_context_pool
                    .as_ref()
                    .ok_or(CodecError::InvalidState(self.state))?;
                self.decode_context = Some(pool.get()?);
            }
        }

        self.current_decode_index = Some(decode_index);
        let admission = Admission::Coded {
            new_stream_parameters: frame_parameters.new_stream_parameters,
            new_frame: frame_parameters.new_frame_parameters,
        };

        self.current_unit = Some(CurrentUnit {
            coded_buffer: buffer,
            data,
            frame_parameters: Arc::new(frame_parameters),
            parsed_parameters,
        });

        Ok(admission)
    }

    fn input_marker_frame(
        &self,
        shared: &Shared<S>,
        coded_buffer: BufferHandle,
        frame_parameters: ParsedFrameParameters,
    ) -> Result<()> {
        if let Some(previous) = shared.take_marker() {
            log::error!(
                "{}: new marker frame while one is still held",
                self.config.codec_name
            );
            previous.decrement_reference_count();
        }

        let structure = BufferStructure {
            format: BufferFormat::MarkerFrame,
            ..Default::default()
        };
        let marker = self.manifestor.get_decode_buffer(&structure)?;
        marker.attach_frame_parameters(Arc::new(frame_parameters));
        marker.attach_buffer(coded_buffer);

        shared.hold_marker(marker);
        Ok(())
    }

    /// Payload of the unit being processed, past its data offset.
    pub fn coded_data(&self) -> Option<&Bytes> {
        self.current_unit.as_ref().map(|unit| &unit.data)
    }

    /// Obtains a decode buffer for the unit being processed and makes it current.
    pub fn get_decode_buffer(&mut self) -> Result<usize> {
        let shared = self.shared()?;
        let unit = self.current_unit.as_ref().ok_or(CodecError::NoCodedUnit)?;
        let frame_parameters = Arc::clone(&unit.frame_parameters);
        let parsed_parameters = unit.parsed_parameters.clone();
        let coded_buffer = Arc::clone(&unit.coded_buffer);

        let mut structure = BufferStructure::default();
        self.strategy.fill_out_decode_buffer_request(
            &frame_parameters,
            &parsed_parameters,
            &mut structure,
        )?;

        let buffer = self.manifestor.get_decode_buffer(&structure)?;
        let index = match shared.map_decode_buffer(&buffer, &frame_parameters, &parsed_parameters)
        {
            Ok(index) => index,
            Err(e) => {
                buffer.decrement_reference_count();
                return Err(self.check_fatal(e));
            }
        };

        buffer.attach_frame_parameters(frame_parameters);
        buffer.attach_buffer(coded_buffer);

        Ok(index)
    }

    pub fn current_decode_buffer_index(&self) -> Option<usize> {
        self.shared
            .as_ref()
            .and_then(|shared| shared.current_decode_buffer_index())
    }

    /// Translates the reference frame lists of the unit being processed into the held decode
    /// context. If `increment_current` is set and the frame is a reference frame, the current
    /// decode buffer is kept as reference.
    pub fn translate_reference_frame_lists(&mut self, increment_current: bool) -> Result<()> {
        let shared = self.shared()?;
        let unit = self.current_unit.as_ref().ok_or(CodecError::NoCodedUnit)?;
        let current = shared
            .current_decode_buffer_index()
            .ok_or(CodecError::NoCurrentDecodeBuffer)?;
        let context = self
            .decode_context
            .as_mut()
            .ok_or(CodecError::NoDecodeContext)?;

        context.reference_frame_lists = shared.translate_reference_frame_lists(
            &unit.frame_parameters.reference_frame_lists,
            current,
            increment_current && unit.frame_parameters.reference_frame,
        );

        Ok(())
    }

    /// Checks that every entry of `lists` refers to a known frame.
    pub fn check_reference_frame_list(&self, lists: &[ReferenceFrameList]) -> Result<()> {
        self.shared()?.check_reference_frame_list(lists)
    }

    pub fn translate_decode_index(&self, decode_index: u32) -> Result<usize> {
        self.shared()?.translate_decode_index(decode_index)
    }

    pub fn release_reference_frame(&self, target: ReleaseTarget) -> Result<()> {
        self.shared()?.release_reference_frame(target)
    }

    /// Gives back a buffer previously inserted in the output ring.
    pub fn release_decode_buffer(&self, buffer: BufferHandle) -> Result<()> {
        match &self.shared {
            Some(shared) => shared.release_decode_buffer(&buffer),
            None => buffer.decrement_reference_count(),
        }

        Ok(())
    }

    /// Discards the buffers of every command prepared so far instead of outputting them.
    pub fn discard_queued_decodes(&self) {
        if let Some(shared) = &self.shared {
            shared.discard_queued_decodes();
        }
    }

    pub fn set_output_on_decodes_complete(
        &self,
        buffer_index: usize,
        test_for_immediate_output: bool,
    ) -> Result<()> {
        self.shared()?
            .set_output_on_decodes_complete(buffer_index, test_for_immediate_output)
    }

    /// Outputs the current decode buffer as soon as its decodes complete.
    pub fn output_partial_decode_buffers(&self) {
        if let Some(shared) = &self.shared {
            shared.output_partial_decode_buffers();
        }
    }

    /// Attaches an auxiliary structure to the decode buffer at `buffer_index`. The count owned by
    /// the caller on `auxiliary` is transferred to the codec.
    pub fn attach_auxiliary_structure(
        &self,
        buffer_index: usize,
        auxiliary: BufferHandle,
    ) -> Result<()> {
        self.shared()?
            .attach_auxiliary_structure(buffer_index, auxiliary)
    }

    pub fn buffer_state(&self, buffer_index: usize) -> Option<BufferStateSnapshot> {
        self.shared
            .as_ref()
            .and_then(|shared| shared.buffer_state(buffer_index))
    }

    pub fn stream_parameter_context_mut(&mut self) -> Option<&mut StreamParameterContext<S>> {
        self.stream_parameter_context.as_deref_mut()
    }

    pub fn decode_context_mut(&mut self) -> Option<&mut DecodeContext<S>> {
        self.decode_context.as_deref_mut()
    }

    /// Lets the strategy fill the held stream parameter context.
    pub fn fill_out_stream_parameters(&mut self) -> Result<()> {
        let unit = self.current_unit.as_ref().ok_or(CodecError::NoCodedUnit)?;
        let context = self
            .stream_parameter_context
            .as_mut()
            .ok_or(CodecError::NoStreamParameterContext)?;

        self.strategy
            .fill_out_set_stream_parameters_command(context, &unit.parsed_parameters)?;
        Ok(())
    }

    /// Lets the strategy fill the held decode context.
    pub fn fill_out_decode_command(&mut self) -> Result<()> {
        let unit = self.current_unit.as_ref().ok_or(CodecError::NoCodedUnit)?;
        let context = self
            .decode_context
            .as_mut()
            .ok_or(CodecError::NoDecodeContext)?;

        self.strategy.fill_out_decode_command(
            context,
            &unit.frame_parameters,
            &unit.parsed_parameters,
        )?;
        Ok(())
    }

    /// Points the held decode context at the current decode buffer and counts it among the
    /// decodes in progress on that buffer.
    pub fn begin_decode(&mut self, output_on_decodes_complete: bool) -> Result<()> {
        let shared = self.shared()?;
        let index = shared
            .current_decode_buffer_index()
            .ok_or(CodecError::NoCurrentDecodeBuffer)?;
        let context = self
            .decode_context
            .as_mut()
            .ok_or(CodecError::NoDecodeContext)?;

        context.buffer_index = Some(index);
        if !context.decode_in_progress {
            shared.begin_decode(index, output_on_decodes_complete)?;
            context.decode_in_progress = true;
        }

        Ok(())
    }

    /// Keeps the coded buffer of the unit being processed alive until the held decode context
    /// completes.
    pub fn attach_coded_frame_buffer(&mut self) -> Result<()> {
        let unit = self.current_unit.as_ref().ok_or(CodecError::NoCodedUnit)?;
        let context = self
            .decode_context
            .as_mut()
            .ok_or(CodecError::NoDecodeContext)?;

        context.attach_coded_buffer(Arc::clone(&unit.coded_buffer));
        Ok(())
    }

    /// Marks the end of the commands writing into the current decode buffer.
    pub fn finish_decode(&mut self) {
        if let Some(shared) = &self.shared {
            shared.clear_current_decode_buffer();
        }
    }

    /// Releases the held decode context without sending it.
    pub fn release_current_decode_context(&mut self) {
        if let (Some(context), Some(shared)) = (self.decode_context.take(), &self.shared) {
            shared.release_decode_context(context);
        }
    }

    /// Sends the held stream parameter context to the transformer.
    pub fn send_stream_parameters(&mut self) -> Result<()> {
        let shared = self.shared()?;
        let mut context = self
            .stream_parameter_context
            .take()
            .ok_or(CodecError::NoStreamParameterContext)?;

        context.header.code = CommandCode::SetGlobalTransformParams;
        context.header.notify_on_completion = true;
        context.header.due_time = 0;

        shared.counters.prepare();
        if self.state == ComponentState::Halted {
            shared.counters.abort();
            return Ok(());
        }

        log::trace!("{}: sending {:?}", self.config.codec_name, *context);
        if let Err(SendError { error, command }) = self
            .transformer
            .send_command(Command::StreamParameters(context))
        {
            log::error!(
                "{}: unable to send stream parameters: {}",
                self.config.codec_name,
                error
            );
            drop(command);
            shared.counters.abort();
            return Err(error.into());
        }

        Ok(())
    }

    /// Sends the held decode context to the transformer.
    pub fn send_decode_command(&mut self) -> Result<()> {
        let shared = self.shared()?;
        let mut context = self
            .decode_context
            .take()
            .ok_or(CodecError::NoDecodeContext)?;

        context.header.code = CommandCode::Transform;
        context.header.notify_on_completion = true;
        context.header.due_time = 0;

        shared.counters.prepare();
        if self.state == ComponentState::Halted {
            shared.release_decode_context(context);
            shared.counters.abort();
            return Ok(());
        }

        context.decode_commence_time = shared.now_us();
        log::trace!("{}: sending {:?}", self.config.codec_name, *context);
        if let Err(SendError { error, command }) =
            self.transformer.send_command(Command::Transform(context))
        {
            log::error!(
                "{}: unable to send decode command: {}",
                self.config.codec_name,
                error
            );
            if let Command::Transform(context) = command {
                shared.release_decode_context(context);
            }
            shared.counters.abort();
            return Err(error.into());
        }

        Ok(())
    }

    /// Sends a buffer-only command to the transformer.
    pub fn send_buffers(&mut self, input_buffer_count: u32, output_buffer_count: u32) -> Result<()> {
        let shared = self.shared()?;
        let header = CommandHeader {
            input_buffer_count,
            output_buffer_count,
            ..CommandHeader::new(CommandCode::SendBuffers)
        };

        shared.counters.prepare();
        if self.state == ComponentState::Halted {
            shared.counters.abort();
            return Ok(());
        }

        if let Err(SendError { error, .. }) =
            self.transformer.send_command(Command::SendBuffers(header))
        {
            log::error!("{}: unable to send buffers: {}", self.config.codec_name, error);
            shared.counters.abort();
            return Err(error.into());
        }

        Ok(())
    }

    /// Runs the whole sequence for one coded unit: admission, stream parameters, decode buffer,
    /// reference translation, transform command. Each frame goes out in a single command.
    pub fn decode(&mut self, unit: CodedUnit<S::ParsedParameters>) -> Result<Admission> {
        let admission = self.input(unit)?;
        let Admission::Coded {
            new_stream_parameters,
            new_frame,
        } = admission
        else {
            return Ok(admission);
        };

        if new_stream_parameters && self.stream_parameter_context.is_some() {
            let result = self
                .fill_out_stream_parameters()
                .and_then(|()| self.send_stream_parameters());
            if let Err(e) = result {
                self.stream_parameter_context = None;
                self.release_current_decode_context();
                return Err(e);
            }
        }

        if new_frame {
            if let Err(e) = self.decode_frame() {
                self.release_current_decode_context();
                return Err(e);
            }
        }

        Ok(admission)
    }

    fn decode_frame(&mut self) -> Result<()> {
        if self.current_decode_buffer_index().is_none() {
            self.get_decode_buffer()?;
        }

        self.translate_reference_frame_lists(true)?;
        self.begin_decode(true)?;
        self.fill_out_decode_command()?;
        self.attach_coded_frame_buffer()?;
        self.send_decode_command()?;
        self.finish_decode();

        Ok(())
    }

    pub fn get_trick_mode_parameters(&self) -> TrickModeParameters {
        match &self.shared {
            Some(shared) => shared.trick_mode_parameters(),
            None => self.config.trick_mode_parameters.clone(),
        }
    }

    /// Treats the next coded unit as carrying new stream parameters.
    pub fn force_stream_parameter_reload(&mut self) {
        self.runtime.force_stream_parameter_reload = true;
    }

    /// Applies an administrative reconfiguration. Partition names take effect on the next
    /// registration.
    pub fn set_module_parameters(&mut self, block: CodecParameterBlock) -> Result<()> {
        match block {
            CodecParameterBlock::SelectTransformer(transformer) => {
                if transformer >= self.config.available_transformers() {
                    log::error!(
                        "{}: transformer {} is not available ({} configured)",
                        self.config.codec_name,
                        transformer,
                        self.config.available_transformers()
                    );
                    return Err(CodecError::InvalidTransformer(transformer));
                }
                self.runtime.selected_transformer = transformer;
            }
            CodecParameterBlock::TranscodedMemoryPartition(name) => {
                check_partition_name(&name)?;
                self.config.transcoded_memory_partition_name = name;
            }
            CodecParameterBlock::AncillaryMemoryPartition(name) => {
                check_partition_name(&name)?;
                self.config.ancillary_memory_partition_name = name;
            }
        }

        Ok(())
    }

    /// Parses `block` with [`CodecParameterBlock::parse`] and applies it.
    pub fn set_module_parameters_raw(&mut self, block: &[u8]) -> Result<()> {
        let block = CodecParameterBlock::parse(block).map_err(|e| {
            log::error!("{}: {}", self.config.codec_name, e);
            e
        })?;
        self.set_module_parameters(block)
    }

    /// Stops submitting work and tears down the transformer binding.
    ///
    /// Outstanding commands are waited for, up to the configured drain time, and abandoned after
    /// that. Completed buffers may still be given back afterwards.
    pub fn halt(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            ComponentState::Running | ComponentState::InError
        ) {
            return Ok(());
        }
        self.state = ComponentState::Halted;

        let Some(shared) = self.shared.clone() else {
            return Ok(());
        };

        shared.output_partial_decode_buffers();
        let result = self.terminate_transformer(&shared);

        if let Some(marker) = shared.take_marker() {
            marker.decrement_reference_count();
        }

        result
    }

    fn terminate_transformer(&mut self, shared: &Shared<S>) -> Result<()> {
        if !self.transformer_initialized {
            return Ok(());
        }
        self.transformer_initialized = false;

        let max_drain_time = shared.config.max_drain_time();
        let start = Instant::now();
        while shared.counters.snapshot().outstanding() > 0 && start.elapsed() < max_drain_time {
            thread::sleep(DRAIN_POLL_INTERVAL);
        }

        let counts = shared.counters.snapshot();
        if counts.outstanding() > 0 {
            log::error!(
                "{}: {} commands still outstanding after {:?} ({:?})",
                self.config.codec_name,
                counts.outstanding(),
                max_drain_time,
                counts
            );
        }

        self.transformer.terminate().map_err(|e| {
            log::error!("{}: failed to terminate transformer: {}", self.config.codec_name, e);
            CodecError::from(e)
        })
    }

    /// Returns to the state preceding registration, halting first if needed.
    pub fn reset(&mut self) -> Result<()> {
        if matches!(
            self.state,
            ComponentState::Running | ComponentState::InError
        ) {
            if let Err(e) = self.halt() {
                log::error!("{}: halt during reset: {}", self.config.codec_name, e);
            }
        }

        self.release_current_decode_context();
        self.stream_parameter_context = None;
        self.current_unit = None;
        self.current_decode_index = None;
        self.stream_parameter_context_pool = None;
        self.decode_context_pool = None;
        self.shared = None;
        self.runtime.force_stream_parameter_reload = false;
        self.state = ComponentState::Idle;

        Ok(())
    }
}

fn check_partition_name(name: &str) -> Result<()> {
    if name.len() >= PARTITION_NAME_SIZE {
        return Err(ParameterBlockError::InvalidPartitionName.into());
    }
    Ok(())
}
