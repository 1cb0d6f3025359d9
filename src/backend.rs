// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the transform engines executing the commands of a codec.
//!
//! A transform engine (usually a hardware accelerator behind a firmware interface) accepts
//! commands asynchronously and reports their completion through a callback invoked from its own
//! execution context. A command owns its context for its whole flight: sending it moves the
//! context into the engine, and the completion hands it back.

#[cfg(test)]
pub(crate) mod dummy;
pub mod worker;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use nix::errno::Errno;
use thiserror::Error;

use crate::buffer::pool::Pooled;
use crate::codec::CodecStrategy;
use crate::codec::DecodeContext;
use crate::codec::StreamParameterContext;

/// Kind of a command sent to a transform engine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CommandCode {
    #[default]
    Transform,
    SetGlobalTransformParams,
    SendBuffers,
}

/// Execution state reported by the engine for a command.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CommandState {
    #[default]
    Idle,
    Pending,
    Executing,
    Completed,
    Failed,
}

/// Common header of every command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandHeader {
    pub code: CommandCode,
    /// Ask the engine to invoke the completion callback for this command.
    pub notify_on_completion: bool,
    /// Time at which the command should be executed, 0 meaning immediately.
    pub due_time: u64,
    pub input_buffer_count: u32,
    pub output_buffer_count: u32,
    /// Filled by the engine.
    pub state: CommandState,
    /// Engine-specific error code, 0 on success.
    pub error: u32,
}

impl CommandHeader {
    pub fn new(code: CommandCode) -> Self {
        Self {
            code,
            notify_on_completion: true,
            ..Default::default()
        }
    }

    /// Whether the engine reported a failure for this command.
    pub fn failed(&self) -> bool {
        self.state == CommandState::Failed || self.error != 0
    }
}

/// A command in flight, together with the context it owns.
pub enum Command<S: CodecStrategy> {
    StreamParameters(Pooled<StreamParameterContext<S>>),
    Transform(Pooled<DecodeContext<S>>),
    SendBuffers(CommandHeader),
}

impl<S: CodecStrategy> Command<S> {
    pub fn header(&self) -> &CommandHeader {
        match self {
            Command::StreamParameters(context) => &context.header,
            Command::Transform(context) => &context.header,
            Command::SendBuffers(header) => header,
        }
    }

    pub fn header_mut(&mut self) -> &mut CommandHeader {
        match self {
            Command::StreamParameters(context) => &mut context.header,
            Command::Transform(context) => &mut context.header,
            Command::SendBuffers(header) => header,
        }
    }
}

impl<S: CodecStrategy> fmt::Debug for Command<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::StreamParameters(context) => {
                f.debug_tuple("StreamParameters").field(&**context).finish()
            }
            Command::Transform(context) => f.debug_tuple("Transform").field(&**context).finish(),
            Command::SendBuffers(header) => f.debug_tuple("SendBuffers").field(header).finish(),
        }
    }
}

/// Notification delivered by the engine through the completion callback.
pub enum Event<'a, S: CodecStrategy> {
    /// The command has finished executing and its context is handed back.
    CommandCompleted(Command<S>),
    /// The command has made progress but is not finished. The engine keeps ownership of it and
    /// will report its completion later.
    TransformIncomplete(&'a Command<S>),
}

/// Callback invoked by the engine from its own execution context.
pub type CompletionCallback<S> = Arc<dyn Fn(Event<'_, S>) + Send + Sync>;

/// Wraps `f` into a [`CompletionCallback`].
pub fn completion_callback<S, F>(f: F) -> CompletionCallback<S>
where
    S: CodecStrategy,
    F: Fn(Event<'_, S>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Description of a transformer, as reported by its engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransformerCapability {
    pub name: String,
    pub api_version: u32,
    /// Transformer-specific capability payload, interpreted by the codec strategy.
    pub transformer_info: Bytes,
}

/// Parameters used to instantiate a transformer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransformerInitParams {
    pub priority: u32,
    /// Transformer-specific global parameters, filled by the codec strategy.
    pub global_params: Bytes,
}

#[derive(Debug, Error)]
pub enum TransformerError {
    #[error("unknown transformer {0}")]
    UnknownTransformer(String),
    #[error("transformer is not initialized")]
    NotInitialized,
    #[error("transformer is already initialized")]
    AlreadyInitialized,
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("failed to create the event fd: {0}")]
    EventFd(Errno),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A command the engine refused, handed back to the sender together with the reason.
pub struct SendError<S: CodecStrategy> {
    pub error: TransformerError,
    pub command: Command<S>,
}

impl<S: CodecStrategy> fmt::Debug for SendError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError")
            .field("error", &self.error)
            .field("command", &self.command)
            .finish()
    }
}

/// An asynchronous transform engine.
pub trait Transformer<S: CodecStrategy>: Send {
    /// Queries the capabilities of the transformer called `name`.
    fn capability(&self, name: &str) -> Result<TransformerCapability, TransformerError>;

    /// Instantiates the transformer called `name`. Completions are reported to `callback` until
    /// [`Transformer::terminate`] returns.
    fn init(
        &mut self,
        name: &str,
        params: TransformerInitParams,
        callback: CompletionCallback<S>,
    ) -> Result<(), TransformerError>;

    /// Queues `command` for execution. On failure the command is handed back untouched.
    fn send_command(&mut self, command: Command<S>) -> Result<(), SendError<S>>;

    /// Tears down the transformer. Commands still in flight are abandoned.
    fn terminate(&mut self) -> Result<(), TransformerError>;
}
