// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces of the buffer collaborators used by the codec.
//!
//! Buffers are reference counted by their pool: every holder (the codec, an in-flight command,
//! a frame using the buffer as reference, the presentation pipeline) owns one count, and the
//! buffer returns to its pool when the last count is dropped. The codec does not allocate
//! buffers itself, it obtains decode buffers from a [`Manifestor`] and hands completed ones to
//! an [`OutputRing`].

pub mod pool;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;

use crate::codec::ParsedFrameParameters;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("no free buffer available in the pool")]
    NoFreeBuffer,
    #[error("buffer is not attached")]
    NotAttached,
    #[error("cannot shrink buffer to {0} bytes")]
    ShrinkFailed(usize),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Layout of the content of a buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BufferFormat {
    #[default]
    Unknown,
    /// A buffer without payload that only carries metadata downstream.
    MarkerFrame,
    Audio,
    Video420Planar,
    Video420MacroBlock,
}

/// Shape of a buffer requested from, or described by, the buffer collaborators.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferStructure {
    pub format: BufferFormat,
    pub dimensions: [u32; 2],
    pub size: usize,
}

/// A reference counted buffer handed out by a buffer pool.
pub trait Buffer: Send + Sync + fmt::Debug {
    /// Index of the buffer within its pool.
    fn index(&self) -> usize;

    /// Number of holders currently owning a count on this buffer.
    fn owner_count(&self) -> u32;

    fn increment_reference_count(&self);

    /// Drops one count. The buffer returns to its pool when the count reaches zero.
    fn decrement_reference_count(&self);

    fn structure(&self) -> BufferStructure;

    /// Allocated length of the buffer, in bytes.
    fn data_len(&self) -> usize;

    fn used_data_size(&self) -> usize;

    fn set_used_data_size(&self, size: usize);

    /// Shrinks the allocation of the buffer to `size` bytes.
    fn shrink(&self, size: usize) -> Result<(), BufferError>;

    /// Attaches `buffer` for the lifetime of `self`. The attached buffer gains one count,
    /// which is dropped on detach or when `self` returns to its pool.
    fn attach_buffer(&self, buffer: BufferHandle);

    fn detach_buffer(&self, buffer: &BufferHandle) -> Result<(), BufferError>;

    fn attached_buffers(&self) -> Vec<BufferHandle>;

    /// Attaches a reference to the parsed parameters of the frame this buffer carries.
    fn attach_frame_parameters(&self, parameters: Arc<ParsedFrameParameters>);

    fn frame_parameters(&self) -> Option<Arc<ParsedFrameParameters>>;
}

pub type BufferHandle = Arc<dyn Buffer>;

/// Returns `true` if both handles designate the same buffer.
pub fn same_buffer(a: &BufferHandle, b: &BufferHandle) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// The output presentation pipeline, supplying decode buffers of a requested shape.
pub trait Manifestor: Send + Sync {
    /// Returns a buffer matching `structure`, with one count owned by the caller.
    fn get_decode_buffer(&self, structure: &BufferStructure) -> Result<BufferHandle, BufferError>;

    /// Number of decode buffers the manifestor can hand out.
    fn decode_buffer_count(&self) -> usize;
}

/// FIFO through which completed buffers travel downstream.
///
/// Inserting a buffer transfers the count owned by the inserter.
pub trait OutputRing: Send + Sync {
    fn insert(&self, buffer: BufferHandle);
}

/// Simple in-memory [`OutputRing`].
#[derive(Default)]
pub struct RingBuffer {
    queue: Mutex<VecDeque<BufferHandle>>,
}

impl RingBuffer {
    pub fn new() -> Self {
        Default::default()
    }

    /// Removes the oldest buffer from the ring.
    pub fn extract(&self) -> Option<BufferHandle> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutputRing for RingBuffer {
    fn insert(&self, buffer: BufferHandle) {
        self.queue.lock().unwrap().push_back(buffer);
    }
}
