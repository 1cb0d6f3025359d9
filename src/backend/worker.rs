// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A software transform engine executing commands on a dedicated thread.
//!
//! Commands are queued by the submitter and picked up by the worker thread, which is woken up
//! through an event fd. Completions are reported from the worker thread, so users of this engine
//! see the same concurrency as with a hardware accelerator.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use crate::backend::Command;
use crate::backend::CommandState;
use crate::backend::CompletionCallback;
use crate::backend::Event;
use crate::backend::SendError;
use crate::backend::Transformer;
use crate::backend::TransformerCapability;
use crate::backend::TransformerError;
use crate::backend::TransformerInitParams;
use crate::codec::CodecStrategy;

/// Result of one processing pass over a command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    /// More passes are needed. The command is processed again right away.
    Incomplete,
}

/// The actual work performed for each command by a [`WorkerTransformer`].
pub trait CommandProcessor<S: CodecStrategy>: Send + 'static {
    /// Called once when the transformer is instantiated.
    fn init(&mut self, _name: &str, _params: &TransformerInitParams) -> anyhow::Result<()> {
        Ok(())
    }

    /// Executes `command`, updating its header status and payload.
    fn process(&mut self, command: &mut Command<S>) -> ProcessOutcome;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum WorkerState {
    Stopped,
    Running,
}

pub struct WorkerTransformer<S: CodecStrategy, P: CommandProcessor<S>> {
    capabilities: Vec<TransformerCapability>,
    processor: Arc<Mutex<P>>,
    awaiting_command_event: Arc<EventFd>,
    command_queue: Arc<Mutex<VecDeque<Command<S>>>>,
    state: Arc<Mutex<WorkerState>>,
    worker_thread: Option<JoinHandle<()>>,
}

impl<S: CodecStrategy, P: CommandProcessor<S>> WorkerTransformer<S, P> {
    /// Creates an engine exposing one transformer per entry of `capabilities`, all backed by
    /// `processor`.
    pub fn new(
        capabilities: Vec<TransformerCapability>,
        processor: P,
    ) -> Result<Self, TransformerError> {
        let awaiting_command_event = EventFd::from_flags(EfdFlags::EFD_SEMAPHORE)
            .map_err(TransformerError::EventFd)?;

        Ok(Self {
            capabilities,
            processor: Arc::new(Mutex::new(processor)),
            awaiting_command_event: Arc::new(awaiting_command_event),
            command_queue: Arc::new(Mutex::new(VecDeque::new())),
            state: Arc::new(Mutex::new(WorkerState::Stopped)),
            worker_thread: None,
        })
    }

    pub fn is_alive(&self) -> bool {
        match &self.worker_thread {
            Some(worker_thread) => !worker_thread.is_finished(),
            None => false,
        }
    }

    fn process_loop(
        processor: Arc<Mutex<P>>,
        awaiting_command_event: Arc<EventFd>,
        command_queue: Arc<Mutex<VecDeque<Command<S>>>>,
        state: Arc<Mutex<WorkerState>>,
        callback: CompletionCallback<S>,
    ) {
        loop {
            if let Err(e) = awaiting_command_event.read() {
                log::error!("worker: failed to wait for commands: {}", e);
                break;
            }

            if *state.lock().unwrap() != WorkerState::Running {
                break;
            }

            loop {
                let next = command_queue.lock().unwrap().pop_front();
                let Some(mut command) = next else {
                    break;
                };

                command.header_mut().state = CommandState::Executing;
                loop {
                    let outcome = processor.lock().unwrap().process(&mut command);
                    match outcome {
                        ProcessOutcome::Incomplete => {
                            callback(Event::TransformIncomplete(&command));
                        }
                        ProcessOutcome::Completed => {
                            let header = command.header_mut();
                            if header.state == CommandState::Executing {
                                header.state = CommandState::Completed;
                            }
                            if header.notify_on_completion {
                                callback(Event::CommandCompleted(command));
                            }
                            break;
                        }
                    }
                }
            }
        }

        log::debug!("worker: leaving process loop");
    }
}

impl<S: CodecStrategy, P: CommandProcessor<S>> Transformer<S> for WorkerTransformer<S, P> {
    fn capability(&self, name: &str) -> Result<TransformerCapability, TransformerError> {
        self.capabilities
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
        if self.worker_thread.is_some() {
            return Err(TransformerError::AlreadyInitialized);
        }
        self.capability(name)?;
        self.processor.lock().unwrap().init(name, &params)?;

        *self.state.lock().unwrap() = WorkerState::Running;

        let processor = self.processor.clone();
        let awaiting_command_event = self.awaiting_command_event.clone();
        let command_queue = self.command_queue.clone();
        let state = self.state.clone();
        self.worker_thread = Some(thread::spawn(move || {
            Self::process_loop(
                processor,
                awaiting_command_event,
                command_queue,
                state,
                callback,
            )
        }));

        Ok(())
    }

    fn send_command(&mut self, mut command: Command<S>) -> Result<(), SendError<S>> {
        if *self.state.lock().unwrap() != WorkerState::Running {
            return Err(SendError {
                error: TransformerError::NotInitialized,
                command,
            });
        }

        command.header_mut().state = CommandState::Pending;
        self.command_queue.lock().unwrap().push_back(command);

        if let Err(e) = self.awaiting_command_event.write(1) {
            // The worker never saw the command, hand it back.
            let command = self.command_queue.lock().unwrap().pop_back();
            if let Some(command) = command {
                return Err(SendError {
                    error: TransformerError::Rejected(e.to_string()),
                    command,
                });
            }
        }

        Ok(())
    }

    fn terminate(&mut self) -> Result<(), TransformerError> {
        let worker_thread = self
            .worker_thread
            .take()
            .ok_or(TransformerError::NotInitialized)?;

        *self.state.lock().unwrap() = WorkerState::Stopped;
        self.awaiting_command_event
            .write(1)
            .map_err(|e| TransformerError::Rejected(e.to_string()))?;

        if worker_thread.join().is_err() {
            log::error!("worker: worker thread panicked");
        }

        let abandoned = self.command_queue.lock().unwrap().drain(..).count();
        if abandoned != 0 {
            log::warn!("worker: abandoned {} queued commands", abandoned);
        }

        Ok(())
    }
}

impl<S: CodecStrategy, P: CommandProcessor<S>> Drop for WorkerTransformer<S, P> {
    fn drop(&mut self) {
        if self.worker_thread.is_some() {
            let _ = self.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::backend::completion_callback;
    use crate::backend::dummy::DummyStrategy;
    use crate::backend::CommandCode;
    use crate::backend::CommandHeader;

    struct CountingProcessor {
        passes: usize,
        incomplete_passes: usize,
    }

    impl CommandProcessor<DummyStrategy> for CountingProcessor {
        fn process(&mut self, command: &mut Command<DummyStrategy>) -> ProcessOutcome {
            self.passes += 1;
            if self.incomplete_passes > 0 {
                self.incomplete_passes -= 1;
                return ProcessOutcome::Incomplete;
            }
            command.header_mut().error = 0;
            ProcessOutcome::Completed
        }
    }

    fn capability(name: &str) -> TransformerCapability {
        TransformerCapability {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_before_init() {
        let mut worker = WorkerTransformer::new(
            vec![capability("t0")],
            CountingProcessor {
                passes: 0,
                incomplete_passes: 0,
            },
        )
        .unwrap();

        let err = worker
            .send_command(Command::SendBuffers(CommandHeader::new(
                CommandCode::SendBuffers,
            )))
            .unwrap_err();
        assert!(matches!(err.error, TransformerError::NotInitialized));
        assert_eq!(err.command.header().code, CommandCode::SendBuffers);

        assert!(matches!(
            worker.init("t9", Default::default(), completion_callback(|_| ())),
            Err(TransformerError::UnknownTransformer(_))
        ));
    }

    #[test]
    fn test_completions_from_worker_thread() {
        let mut worker = WorkerTransformer::new(
            vec![capability("t0")],
            CountingProcessor {
                passes: 0,
                incomplete_passes: 1,
            },
        )
        .unwrap();

        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        worker
            .init(
                "t0",
                Default::default(),
                completion_callback(move |event| {
                    let report = match event {
                        Event::CommandCompleted(command) => (true, command.header().state),
                        Event::TransformIncomplete(command) => (false, command.header().state),
                    };
                    sender.lock().unwrap().send(report).unwrap();
                }),
            )
            .unwrap();
        assert!(worker.is_alive());

        worker
            .send_command(Command::SendBuffers(CommandHeader::new(
                CommandCode::SendBuffers,
            )))
            .unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(
            receiver.recv_timeout(timeout).unwrap(),
            (false, CommandState::Executing)
        );
        assert_eq!(
            receiver.recv_timeout(timeout).unwrap(),
            (true, CommandState::Completed)
        );

        worker.terminate().unwrap();
        assert!(!worker.is_alive());
        assert_eq!(worker.processor.lock().unwrap().passes, 2);
    }
}
