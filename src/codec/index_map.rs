// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::CodecError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct IndexMapEntry {
    decode_index: u32,
    buffer_index: usize,
}

/// Bounded association of parser decode indices to decode buffer indices.
///
/// Several decode indices may map onto the same buffer (e.g. the two fields of a frame).
#[derive(Clone, Debug)]
pub struct IndexBufferMap {
    entries: Vec<Option<IndexMapEntry>>,
}

impl IndexBufferMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records that `decode_index` is decoded into `buffer_index`, in the first free slot.
    ///
    /// An index that is already mapped keeps its earlier entry, which [`Self::translate`]
    /// continues to return.
    pub fn map(&mut self, decode_index: u32, buffer_index: usize) -> Result<(), CodecError> {
        let entry = IndexMapEntry {
            decode_index,
            buffer_index,
        };

        let slot = self
            .entries
            .iter_mut()
            .find(|e| e.is_none())
            .ok_or(CodecError::IndexMapFull)?;
        *slot = Some(entry);

        Ok(())
    }

    pub fn translate(&self, decode_index: u32) -> Result<usize, CodecError> {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.decode_index == decode_index)
            .map(|e| e.buffer_index)
            .ok_or(CodecError::UnknownFrame(decode_index))
    }

    /// Removes every decode index mapped onto `buffer_index`.
    pub fn unmap_buffer(&mut self, buffer_index: usize) {
        for slot in self.entries.iter_mut() {
            if matches!(slot, Some(e) if e.buffer_index == buffer_index) {
                *slot = None;
            }
        }
    }

    pub fn is_buffer_mapped(&self, buffer_index: usize) -> bool {
        self.entries
            .iter()
            .flatten()
            .any(|e| e.buffer_index == buffer_index)
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
    }
}
