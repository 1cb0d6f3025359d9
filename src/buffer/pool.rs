// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use thiserror::Error;

use crate::buffer::same_buffer;
use crate::buffer::Buffer;
use crate::buffer::BufferError;
use crate::buffer::BufferHandle;
use crate::buffer::BufferStructure;
use crate::codec::ParsedFrameParameters;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("all {0} entries of the pool are in use")]
    Exhausted(usize),
}

#[derive(Default)]
struct PoolBufferState {
    structure: BufferStructure,
    used: usize,
    size: usize,
    attached: Vec<BufferHandle>,
    frame_parameters: Option<Arc<ParsedFrameParameters>>,
}

/// A buffer of a [`BufferPool`].
///
/// The buffer goes back to the free list of its pool when its count drops to zero, dropping all
/// the buffers attached to it on the way.
pub struct PoolBuffer {
    index: usize,
    capacity: usize,
    count: AtomicU32,
    free_list: Weak<Mutex<VecDeque<usize>>>,
    state: Mutex<PoolBufferState>,
}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("index", &self.index)
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish()
    }
}

impl PoolBuffer {
    fn release(&self) {
        let attached = {
            let mut state = self.state.lock().unwrap();
            state.frame_parameters = None;
            state.used = 0;
            std::mem::take(&mut state.attached)
        };

        for buffer in attached {
            buffer.decrement_reference_count();
        }

        if let Some(free_list) = self.free_list.upgrade() {
            free_list.lock().unwrap().push_back(self.index);
        }
    }
}

impl Buffer for PoolBuffer {
    fn index(&self) -> usize {
        self.index
    }

    fn owner_count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    fn increment_reference_count(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement_reference_count(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));

        match previous {
            Ok(1) => self.release(),
            Ok(_) => (),
            Err(_) => log::error!("buffer {}: reference count underflow", self.index),
        }
    }

    fn structure(&self) -> BufferStructure {
        self.state.lock().unwrap().structure.clone()
    }

    fn data_len(&self) -> usize {
        self.state.lock().unwrap().size
    }

    fn used_data_size(&self) -> usize {
        self.state.lock().unwrap().used
    }

    fn set_used_data_size(&self, size: usize) {
        self.state.lock().unwrap().used = size;
    }

    fn shrink(&self, size: usize) -> Result<(), BufferError> {
        let mut state = self.state.lock().unwrap();
        if size < state.used {
            return Err(BufferError::ShrinkFailed(size));
        }

        state.size = size;
        Ok(())
    }

    fn attach_buffer(&self, buffer: BufferHandle) {
        buffer.increment_reference_count();
        self.state.lock().unwrap().attached.push(buffer);
    }

    fn detach_buffer(&self, buffer: &BufferHandle) -> Result<(), BufferError> {
        let detached = {
            let mut state = self.state.lock().unwrap();
            let position = state
                .attached
                .iter()
                .position(|b| same_buffer(b, buffer))
                .ok_or(BufferError::NotAttached)?;
            state.attached.remove(position)
        };

        detached.decrement_reference_count();
        Ok(())
    }

    fn attached_buffers(&self) -> Vec<BufferHandle> {
        self.state.lock().unwrap().attached.clone()
    }

    fn attach_frame_parameters(&self, parameters: Arc<ParsedFrameParameters>) {
        self.state.lock().unwrap().frame_parameters = Some(parameters);
    }

    fn frame_parameters(&self) -> Option<Arc<ParsedFrameParameters>> {
        self.state.lock().unwrap().frame_parameters.clone()
    }
}

/// A fixed-size pool of counted buffers.
pub struct BufferPool {
    buffers: Vec<Arc<PoolBuffer>>,
    free_list: Arc<Mutex<VecDeque<usize>>>,
}

impl BufferPool {
    /// Creates a pool of `count` buffers of `capacity` bytes each.
    pub fn new(count: usize, capacity: usize) -> Self {
        let free_list = Arc::new(Mutex::new((0..count).collect::<VecDeque<_>>()));
        let buffers = (0..count)
            .map(|index| {
                Arc::new(PoolBuffer {
                    index,
                    capacity,
                    count: AtomicU32::new(0),
                    free_list: Arc::downgrade(&free_list),
                    state: Default::default(),
                })
            })
            .collect();

        Self { buffers, free_list }
    }

    /// Takes a free buffer, shaped after `structure`. The caller owns its only count.
    pub fn get_buffer(&self, structure: &BufferStructure) -> Result<BufferHandle, BufferError> {
        let index = self
            .free_list
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(BufferError::NoFreeBuffer)?;

        let buffer = Arc::clone(&self.buffers[index]);
        {
            let mut state = buffer.state.lock().unwrap();
            state.structure = structure.clone();
            state.size = buffer.capacity;
            state.used = 0;
        }
        buffer.count.store(1, Ordering::Release);

        Ok(buffer)
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn num_free_buffers(&self) -> usize {
        self.free_list.lock().unwrap().len()
    }
}

/// A context obtained from a [`ContextPool`].
///
/// The context goes back to its pool when dropped, provided the pool still exists.
pub struct Pooled<T> {
    inner: Option<Box<T>>,
    pool: Weak<Mutex<VecDeque<Box<T>>>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // `inner` is only taken on drop.
        self.inner.as_ref().unwrap()
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().unwrap()
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let (Some(inner), Some(pool)) = (self.inner.take(), self.pool.upgrade()) {
            pool.lock().unwrap().push_back(inner);
        }
    }
}

/// A fixed-size pool of command-carrier contexts.
///
/// Contexts are reset to their default value every time they are handed out.
pub struct ContextPool<T> {
    capacity: usize,
    free: Arc<Mutex<VecDeque<Box<T>>>>,
}

impl<T: Default> ContextPool<T> {
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity).map(|_| Box::<T>::default()).collect();

        Self {
            capacity,
            free: Arc::new(Mutex::new(free)),
        }
    }

    pub fn get(&self) -> Result<Pooled<T>, PoolError> {
        let mut context = self
            .free
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(PoolError::Exhausted(self.capacity))?;
        *context = T::default();

        Ok(Pooled {
            inner: Some(context),
            pool: Arc::downgrade(&self.free),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_free(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
