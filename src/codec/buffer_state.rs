// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::buffer::BufferHandle;
use crate::buffer::BufferStructure;

/// Bookkeeping of one decode buffer slot.
#[derive(Debug)]
pub struct BufferState<P> {
    pub buffer: Option<BufferHandle>,
    /// Allocated length of the buffer when it was obtained.
    pub buffer_length: usize,
    pub structure: BufferStructure,
    /// Release the buffer to the output ring once no decode is in progress anymore.
    pub output_on_decodes_complete: bool,
    pub decodes_in_progress: u32,
    /// Number of references the codec holds on the buffer on behalf of later frames.
    pub reference_frame_count: u32,
    pub field_decode: bool,
    /// Auxiliary per-buffer structure (e.g. macroblock data) supplied by the codec.
    pub auxiliary: Option<BufferHandle>,
    pub parsed_parameters: Option<P>,
}

impl<P> Default for BufferState<P> {
    fn default() -> Self {
        Self {
            buffer: None,
            buffer_length: 0,
            structure: Default::default(),
            output_on_decodes_complete: false,
            decodes_in_progress: 0,
            reference_frame_count: 0,
            field_decode: false,
            auxiliary: None,
            parsed_parameters: None,
        }
    }
}

/// Public view of a [`BufferState`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferStateSnapshot {
    pub buffer_index: Option<usize>,
    pub output_on_decodes_complete: bool,
    pub decodes_in_progress: u32,
    pub reference_frame_count: u32,
    pub field_decode: bool,
    pub has_auxiliary: bool,
}

impl<P> From<&BufferState<P>> for BufferStateSnapshot {
    fn from(state: &BufferState<P>) -> Self {
        Self {
            buffer_index: state.buffer.as_ref().map(|b| b.index()),
            output_on_decodes_complete: state.output_on_decodes_complete,
            decodes_in_progress: state.decodes_in_progress,
            reference_frame_count: state.reference_frame_count,
            field_decode: state.field_decode,
            has_auxiliary: state.auxiliary.is_some(),
        }
    }
}

/// Fixed array of buffer states, indexed by decode buffer index.
#[derive(Debug)]
pub struct BufferStateTable<P> {
    states: Vec<BufferState<P>>,
}

impl<P> BufferStateTable<P> {
    pub fn new(capacity: usize) -> Self {
        Self {
            states: (0..capacity).map(|_| Default::default()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BufferState<P>> {
        self.states.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut BufferState<P>> {
        self.states.get_mut(index)
    }

    /// Zeroes the slot at `index`.
    pub fn reset(&mut self, index: usize) {
        if let Some(state) = self.states.get_mut(index) {
            *state = Default::default();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferState<P>> {
        self.states.iter()
    }
}
