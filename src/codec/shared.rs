// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! State shared between the submitting side of a codec and its completion handler.
//!
//! The completion callback runs in the execution context of the transform engine, concurrently
//! with the submitter. Everything it touches lives here: the buffer state table, the index
//! translation table, the current decode buffer index and the held marker frame are guarded by a
//! single lock, the command counters and watermarks are atomics.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Instant;

use crate::backend::completion_callback;
use crate::backend::Command;
use crate::backend::CompletionCallback;
use crate::backend::Event;
use crate::buffer::pool::Pooled;
use crate::buffer::same_buffer;
use crate::buffer::BufferHandle;
use crate::buffer::Manifestor;
use crate::buffer::OutputRing;
use crate::codec::buffer_state::BufferStateSnapshot;
use crate::codec::buffer_state::BufferStateTable;
use crate::codec::index_map::IndexBufferMap;
use crate::codec::rate::DecodeRateEstimator;
use crate::codec::CodecError;
use crate::codec::CodecStrategy;
use crate::codec::DecodeContext;
use crate::codec::ParsedFrameParameters;
use crate::codec::ReferenceFrameList;
use crate::codec::ReleaseTarget;
use crate::config::CodecConfiguration;
use crate::config::TrickModeParameters;
use crate::config::CODEC_MAX_DECODE_BUFFERS;

/// Snapshot of the command accounting of a codec.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandCounts {
    pub prepared: u64,
    pub aborted: u64,
    pub completed: u64,
}

impl CommandCounts {
    pub fn finished(&self) -> u64 {
        self.aborted + self.completed
    }

    /// Commands sent and not completed yet.
    pub fn outstanding(&self) -> u64 {
        self.prepared.saturating_sub(self.finished())
    }
}

#[derive(Default)]
pub(crate) struct CommandCounters {
    prepared: AtomicU64,
    aborted: AtomicU64,
    completed: AtomicU64,
}

impl CommandCounters {
    pub(crate) fn prepare(&self) {
        self.prepared.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn abort(&self) {
        self.aborted.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn complete(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn prepared(&self) -> u64 {
        self.prepared.load(Ordering::Acquire)
    }

    pub(crate) fn finished(&self) -> u64 {
        self.aborted.load(Ordering::Acquire) + self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn snapshot(&self) -> CommandCounts {
        CommandCounts {
            prepared: self.prepared.load(Ordering::Acquire),
            aborted: self.aborted.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
        }
    }
}

pub(crate) struct Tables<P> {
    pub(crate) buffer_states: BufferStateTable<P>,
    pub(crate) index_map: IndexBufferMap,
    pub(crate) current_decode_buffer_index: Option<usize>,
    marker_buffer: Option<BufferHandle>,
}

struct RateState {
    estimator: Option<DecodeRateEstimator>,
    trick_mode: TrickModeParameters,
}

pub(crate) struct Shared<S: CodecStrategy> {
    pub(crate) config: CodecConfiguration,
    strategy: Arc<S>,
    manifestor: Arc<dyn Manifestor>,
    output_ring: Arc<dyn OutputRing>,
    tables: Mutex<Tables<S::ParsedParameters>>,
    pub(crate) counters: CommandCounters,
    discard_decodes_until: AtomicU64,
    pass_on_marker_at: AtomicU64,
    rate: Mutex<RateState>,
    callback_priority_boosted: AtomicBool,
    epoch: Instant,
}

impl<S: CodecStrategy> Shared<S> {
    pub(crate) fn new(
        config: CodecConfiguration,
        strategy: Arc<S>,
        manifestor: Arc<dyn Manifestor>,
        output_ring: Arc<dyn OutputRing>,
        index_map_capacity: usize,
    ) -> Self {
        let trick_mode = config.trick_mode_parameters.clone();

        Self {
            config,
            strategy,
            manifestor,
            output_ring,
            tables: Mutex::new(Tables {
                buffer_states: BufferStateTable::new(CODEC_MAX_DECODE_BUFFERS),
                index_map: IndexBufferMap::new(index_map_capacity),
                current_decode_buffer_index: None,
                marker_buffer: None,
            }),
            counters: Default::default(),
            discard_decodes_until: AtomicU64::new(0),
            pass_on_marker_at: AtomicU64::new(0),
            rate: Mutex::new(RateState {
                estimator: None,
                trick_mode,
            }),
            callback_priority_boosted: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    fn name(&self) -> &str {
        &self.config.codec_name
    }

    pub(crate) fn lock_tables(&self) -> MutexGuard<'_, Tables<S::ParsedParameters>> {
        self.tables.lock().unwrap()
    }

    /// Microseconds elapsed since registration.
    pub(crate) fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Builds the callback handed to the transform engine.
    pub(crate) fn completion_callback(self: &Arc<Self>) -> CompletionCallback<S> {
        let shared = Arc::clone(self);
        completion_callback(move |event| shared.handle_event(event))
    }

    fn handle_event(&self, event: Event<'_, S>) {
        match event {
            Event::TransformIncomplete(command) => {
                log::trace!("{}: incomplete {:?}", self.name(), command.header());
            }
            Event::CommandCompleted(command) => self.command_completed(command),
        }

        self.test_marker_frame_pass_on();
    }

    fn command_completed(&self, command: Command<S>) {
        match command {
            Command::StreamParameters(context) => {
                if context.header.failed() {
                    log::error!(
                        "{}: stream parameters command failed ({:#x})",
                        self.name(),
                        context.header.error
                    );
                }
                drop(context);
                self.counters.complete();

                if !self.callback_priority_boosted.swap(true, Ordering::AcqRel) {
                    self.strategy.boost_callback_priority();
                }
            }
            Command::Transform(context) => {
                if let Err(e) = self.strategy.validate_decode_context(&context) {
                    log::error!("{}: invalid decode context: {:#}", self.name(), e);
                }
                if context.header.failed() {
                    log::error!(
                        "{}: transform command failed ({:#x})",
                        self.name(),
                        context.header.error
                    );
                }
                if let Err(e) = self.strategy.check_codec_return_parameters(&context) {
                    log::error!("{}: bad return parameters: {:#}", self.name(), e);
                }

                self.calculate_decode_rate(&context);
                self.release_decode_context(context);
                self.counters.complete();
            }
            Command::SendBuffers(_) => self.counters.complete(),
        }
    }

    fn calculate_decode_rate(&self, context: &DecodeContext<S>) {
        let now = self.now_us();
        let field_decode = context
            .buffer_index
            .and_then(|index| {
                self.lock_tables()
                    .buffer_states
                    .get(index)
                    .map(|state| state.field_decode)
            })
            .unwrap_or(false);

        let mut rate = self.rate.lock().unwrap();
        let RateState {
            estimator,
            trick_mode,
        } = &mut *rate;

        let estimator = estimator.get_or_insert_with(|| {
            let factor = if field_decode { 2 } else { 1 };
            DecodeRateEstimator::new(
                self.config.decode_time_short_integration_period * factor,
                self.manifestor.decode_buffer_count() * factor,
            )
        });

        let rates = estimator.record(context.decode_commence_time, now, field_decode);
        if let Some(short) = rates.short_integration {
            trick_mode.empirical_max_decode_frame_rate_short_integration = short;
        }
        if let Some(long) = rates.long_integration {
            trick_mode.empirical_max_decode_frame_rate_long_integration = long;
        }

        log::trace!(
            "{}: decode rate short {} long {}",
            self.name(),
            trick_mode.empirical_max_decode_frame_rate_short_integration,
            trick_mode.empirical_max_decode_frame_rate_long_integration
        );
    }

    pub(crate) fn trick_mode_parameters(&self) -> TrickModeParameters {
        self.rate.lock().unwrap().trick_mode.clone()
    }

    /// Returns the counts held by `context` and hands it back to its pool.
    pub(crate) fn release_decode_context(&self, mut context: Pooled<DecodeContext<S>>) {
        if context.decode_in_progress {
            context.decode_in_progress = false;
            if let Some(index) = context.buffer_index {
                let mut guard = self.lock_tables();
                self.decode_finished_locked(&mut guard, index);
            }
        }

        context.detach_coded_buffers(
            &self.config.codec_name,
            self.config.shrink_coded_data_buffers_after_decode,
        );

        let reference_frame_lists = std::mem::take(&mut context.reference_frame_lists);
        if !reference_frame_lists.is_empty() {
            let mut guard = self.lock_tables();
            let tables = &mut *guard;
            for index in reference_frame_lists.into_iter().flatten() {
                if let Some(auxiliary) = tables
                    .buffer_states
                    .get(index)
                    .and_then(|state| state.auxiliary.as_ref())
                {
                    auxiliary.decrement_reference_count();
                }
                if let Err(e) = self.decrement_reference_count_locked(tables, index) {
                    log::error!("{}: releasing reference: {}", self.name(), e);
                }
            }
        }
    }

    fn decode_finished_locked(&self, tables: &mut Tables<S::ParsedParameters>, index: usize) {
        let Some(state) = tables.buffer_states.get_mut(index) else {
            log::error!("{}: decode finished on invalid buffer {}", self.config.codec_name, index);
            return;
        };

        match state.decodes_in_progress.checked_sub(1) {
            Some(count) => state.decodes_in_progress = count,
            None => log::error!(
                "{}: no decode in progress on buffer {}",
                self.config.codec_name,
                index
            ),
        }

        if !state.output_on_decodes_complete {
            return;
        }

        let complete_buffer = if state.decodes_in_progress == 0 {
            state.buffer.clone()
        } else {
            None
        };

        if let Some(buffer) = complete_buffer {
            if self.counters.finished() < self.discard_decodes_until.load(Ordering::Acquire) {
                log::debug!("{}: discarding buffer {}", self.name(), index);
                self.release_decode_buffer_locked(tables, &buffer);
            } else {
                self.output(buffer);
            }
        }

        // A context released on failure may orphan the current buffer.
        if tables.current_decode_buffer_index == Some(index) {
            tables.current_decode_buffer_index = None;
        }
    }

    /// Drops one count on the buffer at `index`, forgetting everything about it if the codec was
    /// its last holder.
    pub(crate) fn decrement_reference_count_locked(
        &self,
        tables: &mut Tables<S::ParsedParameters>,
        index: usize,
    ) -> Result<(), CodecError> {
        let state = tables
            .buffer_states
            .get(index)
            .ok_or(CodecError::BufferIndexOutOfRange(index))?;
        let buffer = state
            .buffer
            .clone()
            .ok_or(CodecError::NoDecodeBuffer(index))?;

        if buffer.owner_count() == 1 {
            if state.reference_frame_count != 0 || state.decodes_in_progress != 0 {
                log::error!(
                    "{}: releasing buffer {} with {} references and {} decodes in progress",
                    self.name(),
                    index,
                    state.reference_frame_count,
                    state.decodes_in_progress
                );
            }

            tables.index_map.unmap_buffer(index);
            tables.buffer_states.reset(index);
        }

        buffer.decrement_reference_count();
        Ok(())
    }

    fn release_decode_buffer_locked(
        &self,
        tables: &mut Tables<S::ParsedParameters>,
        buffer: &BufferHandle,
    ) {
        let index = buffer.index();
        let tracked = tables
            .buffer_states
            .get(index)
            .and_then(|state| state.buffer.as_ref())
            .is_some_and(|b| same_buffer(b, buffer));

        if tracked {
            if let Err(e) = self.decrement_reference_count_locked(tables, index) {
                log::error!("{}: releasing buffer {}: {}", self.name(), index, e);
            }
        } else {
            buffer.decrement_reference_count();
        }
    }

    pub(crate) fn release_decode_buffer(&self, buffer: &BufferHandle) {
        let mut guard = self.lock_tables();
        self.release_decode_buffer_locked(&mut guard, buffer);
    }

    /// Records `buffer` as the decode buffer of `frame_parameters` and makes it current.
    pub(crate) fn map_decode_buffer(
        &self,
        buffer: &BufferHandle,
        frame_parameters: &ParsedFrameParameters,
        parsed_parameters: &S::ParsedParameters,
    ) -> Result<usize, CodecError> {
        let index = buffer.index();
        let mut guard = self.lock_tables();
        let tables = &mut *guard;

        if index >= tables.buffer_states.len() {
            return Err(CodecError::BufferIndexOutOfRange(index));
        }
        tables
            .index_map
            .map(frame_parameters.decode_frame_index, index)?;

        tables.buffer_states.reset(index);
        let state = tables
            .buffer_states
            .get_mut(index)
            .ok_or(CodecError::BufferIndexOutOfRange(index))?;
        state.buffer = Some(buffer.clone());
        state.buffer_length = buffer.data_len();
        state.structure = buffer.structure();
        state.field_decode = frame_parameters.field_decode;
        state.parsed_parameters = Some(parsed_parameters.clone());

        tables.current_decode_buffer_index = Some(index);
        Ok(index)
    }

    pub(crate) fn current_decode_buffer_index(&self) -> Option<usize> {
        self.lock_tables().current_decode_buffer_index
    }

    pub(crate) fn clear_current_decode_buffer(&self) {
        self.lock_tables().current_decode_buffer_index = None;
    }

    /// Accounts for one more decode writing into the buffer at `index`.
    pub(crate) fn begin_decode(
        &self,
        index: usize,
        output_on_decodes_complete: bool,
    ) -> Result<(), CodecError> {
        let mut tables = self.lock_tables();
        let state = tables
            .buffer_states
            .get_mut(index)
            .ok_or(CodecError::BufferIndexOutOfRange(index))?;
        state.decodes_in_progress += 1;
        state.output_on_decodes_complete |= output_on_decodes_complete;
        Ok(())
    }

    /// Copies `lists` with every decode index translated to a buffer index, taking one count on
    /// each referenced buffer. Unknown references resolve to the `current` buffer.
    pub(crate) fn translate_reference_frame_lists(
        &self,
        lists: &[ReferenceFrameList],
        current: usize,
        increment_current: bool,
    ) -> Vec<Vec<usize>> {
        let mut guard = self.lock_tables();
        let tables = &mut *guard;

        if increment_current {
            if let Some(state) = tables.buffer_states.get_mut(current) {
                if let Some(buffer) = &state.buffer {
                    buffer.increment_reference_count();
                    state.reference_frame_count += 1;
                }
            }
        }

        lists
            .iter()
            .map(|list| {
                list.entries
                    .iter()
                    .map(|&decode_index| {
                        let index = match tables.index_map.translate(decode_index) {
                            Ok(index) => index,
                            Err(e) => {
                                log::error!(
                                    "{}: {}, substituting the current buffer {}",
                                    self.name(),
                                    e,
                                    current
                                );
                                current
                            }
                        };

                        if let Some(state) = tables.buffer_states.get(index) {
                            if let Some(buffer) = &state.buffer {
                                buffer.increment_reference_count();
                            }
                            if let Some(auxiliary) = &state.auxiliary {
                                auxiliary.increment_reference_count();
                            }
                        }

                        index
                    })
                    .collect()
            })
            .collect()
    }

    pub(crate) fn check_reference_frame_list(
        &self,
        lists: &[ReferenceFrameList],
    ) -> Result<(), CodecError> {
        let tables = self.lock_tables();
        for decode_index in lists.iter().flat_map(|list| list.entries.iter()) {
            tables.index_map.translate(*decode_index)?;
        }

        Ok(())
    }

    pub(crate) fn translate_decode_index(&self, decode_index: u32) -> Result<usize, CodecError> {
        self.lock_tables().index_map.translate(decode_index)
    }

    pub(crate) fn release_reference_frame(&self, target: ReleaseTarget) -> Result<(), CodecError> {
        let mut guard = self.lock_tables();
        let tables = &mut *guard;

        match target {
            ReleaseTarget::All => {
                for index in 0..tables.buffer_states.len() {
                    let Some(state) = tables.buffer_states.get_mut(index) else {
                        continue;
                    };
                    if state.reference_frame_count == 0 {
                        continue;
                    }

                    if let Some(auxiliary) = &state.auxiliary {
                        auxiliary.decrement_reference_count();
                    }

                    let references = std::mem::take(&mut state.reference_frame_count);
                    for _ in 0..references {
                        if let Err(e) = self.decrement_reference_count_locked(tables, index) {
                            log::error!("{}: releasing all references: {}", self.name(), e);
                            break;
                        }
                    }
                }

                Ok(())
            }
            ReleaseTarget::Index(decode_index) => {
                let index = tables.index_map.translate(decode_index)?;
                let state = tables
                    .buffer_states
                    .get_mut(index)
                    .filter(|state| state.reference_frame_count != 0)
                    .ok_or(CodecError::UnknownFrame(decode_index))?;

                state.reference_frame_count -= 1;
                if state.reference_frame_count == 0 {
                    if let Some(auxiliary) = &state.auxiliary {
                        auxiliary.decrement_reference_count();
                    }
                }

                self.decrement_reference_count_locked(tables, index)
            }
        }
    }

    pub(crate) fn set_output_on_decodes_complete(
        &self,
        index: usize,
        test_for_immediate_output: bool,
    ) -> Result<(), CodecError> {
        let mut tables = self.lock_tables();
        let state = tables
            .buffer_states
            .get_mut(index)
            .ok_or(CodecError::BufferIndexOutOfRange(index))?;

        state.output_on_decodes_complete = true;
        if test_for_immediate_output && state.decodes_in_progress == 0 {
            if let Some(buffer) = state.buffer.clone() {
                self.output(buffer);
            }
        }

        Ok(())
    }

    /// Pushes out the buffer currently being decoded, if any.
    pub(crate) fn output_partial_decode_buffers(&self) {
        let current = self.lock_tables().current_decode_buffer_index.take();
        if let Some(index) = current {
            if let Err(e) = self.set_output_on_decodes_complete(index, true) {
                log::error!("{}: {}", self.name(), e);
            }
        }
    }

    pub(crate) fn attach_auxiliary_structure(
        &self,
        index: usize,
        auxiliary: BufferHandle,
    ) -> Result<(), CodecError> {
        let mut tables = self.lock_tables();
        let state = tables
            .buffer_states
            .get_mut(index)
            .filter(|state| state.buffer.is_some())
            .ok_or(CodecError::NoDecodeBuffer(index))?;

        if let Some(previous) = state.auxiliary.replace(auxiliary) {
            previous.decrement_reference_count();
        }

        Ok(())
    }

    pub(crate) fn buffer_state(&self, index: usize) -> Option<BufferStateSnapshot> {
        self.lock_tables()
            .buffer_states
            .get(index)
            .map(BufferStateSnapshot::from)
    }

    pub(crate) fn discard_queued_decodes(&self) {
        self.discard_decodes_until
            .store(self.counters.prepared(), Ordering::Release);
    }

    /// Holds `marker` until every command prepared so far has finished.
    pub(crate) fn hold_marker(&self, marker: BufferHandle) {
        let previous = {
            let mut tables = self.lock_tables();
            self.pass_on_marker_at
                .store(self.counters.prepared(), Ordering::Release);
            tables.marker_buffer.replace(marker)
        };

        if let Some(previous) = previous {
            log::error!("{}: replacing a held marker frame", self.name());
            previous.decrement_reference_count();
        }

        self.test_marker_frame_pass_on();
    }

    pub(crate) fn take_marker(&self) -> Option<BufferHandle> {
        self.lock_tables().marker_buffer.take()
    }

    fn output(&self, buffer: BufferHandle) {
        log::trace!("{}: outputting buffer {}", self.name(), buffer.index());
        self.output_ring.insert(buffer);
    }

    pub(crate) fn test_marker_frame_pass_on(&self) {
        let mut tables = self.lock_tables();
        if tables.marker_buffer.is_none()
            || self.counters.finished() < self.pass_on_marker_at.load(Ordering::Acquire)
        {
            return;
        }

        if let Some(marker) = tables.marker_buffer.take() {
            log::debug!("{}: passing on marker frame", self.name());
            self.output_ring.insert(marker);
        }
    }
}
