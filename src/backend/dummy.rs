// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dummy collaborators used to exercise a codec without a transform engine.
//!
//! The dummy transformer keeps every command it receives until the test explicitly completes
//! it, which lets tests decide the interleaving of submissions and completions.

use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::bail;

use crate::backend::Command;
use crate::backend::CommandState;
use crate::backend::CompletionCallback;
use crate::backend::Event;
use crate::backend::SendError;
use crate::backend::Transformer;
use crate::backend::TransformerCapability;
use crate::backend::TransformerError;
use crate::backend::TransformerInitParams;
use crate::buffer::pool::BufferPool;
use crate::buffer::BufferError;
use crate::buffer::BufferFormat;
use crate::buffer::BufferHandle;
use crate::buffer::BufferStructure;
use crate::buffer::Manifestor;
use crate::codec::CodecStrategy;
use crate::codec::DecodeContext;
use crate::codec::ParsedFrameParameters;
use crate::codec::StreamParameterContext;

/// Size of the decode buffers requested by [`DummyStrategy`].
pub(crate) const DUMMY_DECODE_BUFFER_SIZE: usize = 1024;

#[derive(Default)]
pub(crate) struct DummyStrategy {
    /// Transformers reporting an older API version are not capable.
    pub(crate) min_api_version: u32,
    pub(crate) boosts: AtomicUsize,
}

impl CodecStrategy for DummyStrategy {
    type StreamParameters = u32;
    type DecodeParameters = u32;
    type ParsedParameters = u32;

    fn handle_capabilities(&self, capability: &TransformerCapability) -> anyhow::Result<()> {
        if capability.api_version < self.min_api_version {
            bail!(
                "transformer {} has API version {}, {} needed",
                capability.name,
                capability.api_version,
                self.min_api_version
            );
        }
        Ok(())
    }

    fn fill_out_decode_buffer_request(
        &self,
        _frame_parameters: &ParsedFrameParameters,
        _parsed_parameters: &u32,
        request: &mut BufferStructure,
    ) -> anyhow::Result<()> {
        request.format = BufferFormat::Audio;
        request.size = DUMMY_DECODE_BUFFER_SIZE;
        Ok(())
    }

    fn fill_out_set_stream_parameters_command(
        &self,
        context: &mut StreamParameterContext<Self>,
        parsed_parameters: &u32,
    ) -> anyhow::Result<()> {
        context.parameters = *parsed_parameters;
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

    fn boost_callback_priority(&self) {
        self.boosts.fetch_add(1, Ordering::AcqRel);
    }
}

struct DummyEngine<S: CodecStrategy> {
    capabilities: Vec<TransformerCapability>,
    callback: Option<CompletionCallback<S>>,
    initialized: Option<String>,
    init_params: Option<TransformerInitParams>,
    pending: VecDeque<Command<S>>,
    reject: bool,
    terminations: usize,
}

/// A transformer whose commands are completed on request of the test.
///
/// Clones share the same engine, so a test can keep one to drive completions while the codec
/// owns another.
pub(crate) struct DummyTransformer<S: CodecStrategy>(Arc<Mutex<DummyEngine<S>>>);

impl<S: CodecStrategy> Clone for DummyTransformer<S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<S: CodecStrategy> DummyTransformer<S> {
    pub(crate) fn new(capabilities: Vec<TransformerCapability>) -> Self {
        Self(Arc::new(Mutex::new(DummyEngine {
            capabilities,
            callback: None,
            initialized: None,
            init_params: None,
            pending: VecDeque::new(),
            reject: false,
            terminations: 0,
        })))
    }

    /// Pops the oldest pending command together with the callback to report it to. The engine
    /// lock is released before the callback runs.
    fn pop_pending(&self) -> Option<(CompletionCallback<S>, Command<S>)> {
        let mut engine = self.0.lock().unwrap();
        let callback = engine.callback.clone()?;
        let command = engine.pending.pop_front()?;
        Some((callback, command))
    }

    /// Completes the oldest pending command. Returns `false` if there was none.
    pub(crate) fn complete_next(&self) -> bool {
        let Some((callback, mut command)) = self.pop_pending() else {
            return false;
        };

        command.header_mut().state = CommandState::Completed;
        if command.header().notify_on_completion {
            callback(Event::CommandCompleted(command));
        }
        true
    }

    pub(crate) fn complete_all(&self) -> usize {
        let mut completed = 0;
        while self.complete_next() {
            completed += 1;
        }
        completed
    }

    /// Completes the oldest pending command with `error`.
    pub(crate) fn fail_next(&self, error: u32) -> bool {
        let Some((callback, mut command)) = self.pop_pending() else {
            return false;
        };

        let header = command.header_mut();
        header.state = CommandState::Failed;
        header.error = error;
        callback(Event::CommandCompleted(command));
        true
    }

    /// Reports progress on the oldest pending command, which stays pending.
    pub(crate) fn report_incomplete_next(&self) -> bool {
        let Some((callback, mut command)) = self.pop_pending() else {
            return false;
        };

        command.header_mut().state = CommandState::Executing;
        callback(Event::TransformIncomplete(&command));
        self.0.lock().unwrap().pending.push_front(command);
        true
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.0.lock().unwrap().pending.len()
    }

    /// Makes subsequent sends fail.
    pub(crate) fn set_reject(&self, reject: bool) {
        self.0.lock().unwrap().reject = reject;
    }

    pub(crate) fn initialized_name(&self) -> Option<String> {
        self.0.lock().unwrap().initialized.clone()
    }

    pub(crate) fn init_params(&self) -> Option<TransformerInitParams> {
        self.0.lock().unwrap().init_params.clone()
    }

    pub(crate) fn terminations(&self) -> usize {
        self.0.lock().unwrap().terminations
    }

    /// Runs `f` on the payload of the oldest pending transform command.
    pub(crate) fn with_next_transform<R>(
        &self,
        f: impl FnOnce(&DecodeContext<S>) -> R,
    ) -> Option<R> {
        let engine = self.0.lock().unwrap();
        match engine.pending.front() {
            Some(Command::Transform(context)) => Some(f(context)),
            _ => None,
        }
    }
}

impl<S: CodecStrategy> Transformer<S> for DummyTransformer<S> {
    fn capability(&self, name: &str) -> Result<TransformerCapability, TransformerError> {
        self.0
            .lock()
            .unwrap()
            .capabilities
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| TransformerError::UnknownTransformer(name.into()))
    }

    fn init(
        &mut self,
        name: &str,
        params: TransformerInitParams,
        callback: CompletionCallback<S>,
    ) -> Result<(), TransformerError> {
        self.capability(name)?;

        let mut engine = self.0.lock().unwrap();
        if engine.initialized.is_some() {
            return Err(TransformerError::AlreadyInitialized);
        }
        engine.initialized = Some(name.into());
        engine.init_params = Some(params);
        engine.callback = Some(callback);

        Ok(())
    }

    fn send_command(&mut self, mut command: Command<S>) -> Result<(), SendError<S>> {
        let mut engine = self.0.lock().unwrap();
        if engine.initialized.is_none() {
            return Err(SendError {
                error: TransformerError::NotInitialized,
                command,
            });
        }
        if engine.reject {
            return Err(SendError {
                error: TransformerError::Rejected("dummy rejection".into()),
                command,
            });
        }

        command.header_mut().state = CommandState::Pending;
        engine.pending.push_back(command);
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), TransformerError> {
        let abandoned = {
            let mut engine = self.0.lock().unwrap();
            engine
                .initialized
                .take()
                .ok_or(TransformerError::NotInitialized)?;
            engine.callback = None;
            engine.terminations += 1;
            std::mem::take(&mut engine.pending)
        };

        if !abandoned.is_empty() {
            log::debug!("dummy: abandoning {} commands", abandoned.len());
        }

        Ok(())
    }
}

/// A manifestor handing out buffers of its own pool, which may advertise a different number of
/// buffers than it really has.
pub(crate) struct DummyManifestor {
    pool: BufferPool,
    advertised: usize,
}

impl DummyManifestor {
    pub(crate) fn new(count: usize, advertised: usize) -> Self {
        Self {
            pool: BufferPool::new(count, DUMMY_DECODE_BUFFER_SIZE),
            advertised,
        }
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

impl Manifestor for DummyManifestor {
    fn get_decode_buffer(&self, structure: &BufferStructure) -> Result<BufferHandle, BufferError> {
        self.pool.get_buffer(structure)
    }

    fn decode_buffer_count(&self) -> usize {
        self.advertised
    }
}
